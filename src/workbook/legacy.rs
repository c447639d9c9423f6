//! Legacy BIFF (`.xls`) workbooks via calamine.

use super::{CellValue, OpenError, Sheet, Workbook, WorkbookFormat};
use calamine::{DataType, Reader, Xls};
use std::io::Cursor;

pub(super) fn read_xls(bytes: &[u8], password: Option<&str>) -> Result<Workbook, OpenError> {
    let mut xls: Xls<_> = Xls::new(Cursor::new(bytes.to_vec())).map_err(|err| {
        let message = err.to_string();
        if message.to_lowercase().contains("password") {
            match password {
                None => OpenError::NeedsPassword,
                Some(_) => OpenError::OpenFailed(
                    "password-protected .xls workbooks are not supported; save as .xlsx".into(),
                ),
            }
        } else {
            OpenError::OpenFailed(message)
        }
    })?;

    let names = xls.sheet_names().to_owned();
    let mut sheets = Vec::with_capacity(names.len());
    for name in names {
        let mut sheet = Sheet::new(name.clone());
        match xls.worksheet_range(&name) {
            Some(Ok(range)) => {
                let (row0, col0) = range.start().unwrap_or((0, 0));
                for (row, col, value) in range.used_cells() {
                    if let Some(cell) = convert(value) {
                        sheet.set_cell(row0 + row as u32, col0 + col as u32, cell);
                    }
                }
            }
            Some(Err(err)) => {
                return Err(OpenError::OpenFailed(format!(
                    "failed to read sheet '{name}': {err}"
                )));
            }
            None => {}
        }
        sheets.push(sheet);
    }

    Ok(Workbook::from_sheets(WorkbookFormat::Xls, sheets))
}

fn convert(value: &DataType) -> Option<CellValue> {
    match value {
        DataType::Empty => None,
        DataType::String(text) if text.is_empty() => None,
        DataType::String(text) => Some(CellValue::Text(text.clone())),
        DataType::Int(n) => Some(CellValue::Number(*n as f64)),
        DataType::Float(n) => Some(CellValue::Number(*n)),
        DataType::Bool(b) => Some(CellValue::Bool(*b)),
        other => Some(CellValue::Text(other.to_string())),
    }
}

//! Turns an extracted JSON value into a table and writes it as a one-sheet workbook.

use crate::utils::column_number_to_name;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::io::Cursor;

pub const SHEET_NAME: &str = "Sheet1";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const VALUE_COLUMN: &str = "value";
const MAX_COLUMN_WIDTH: f64 = 80.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Cell::Text(String::new()),
            Some(Value::Bool(b)) => Cell::Bool(*b),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Cell::Number)
                .unwrap_or_else(|| Cell::Text(n.to_string())),
            Some(Value::String(s)) => Cell::Text(s.clone()),
            Some(nested) => Cell::Text(nested.to_string()),
        }
    }

    fn display_width(&self) -> usize {
        match self {
            Cell::Text(s) => s.chars().count(),
            Cell::Number(n) => crate::utils::format_number(*n).len(),
            Cell::Bool(b) => b.to_string().len(),
        }
    }
}

/// A rendered workbook ready for download.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetArtifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub used_remote_model: bool,
}

/// Headers plus rows aligned with them. An empty header list means a single
/// raw cell with no header row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    /// The cell under `header` in row `row`.
    pub fn get(&self, row: usize, header: &str) -> Option<&Cell> {
        let col = self.headers.iter().position(|h| h == header)?;
        self.rows.get(row)?.get(col)
    }
}

enum Shape<'a> {
    Records(Vec<&'a Map<String, Value>>),
    Values(&'a [Value]),
    Record(&'a Map<String, Value>),
    Raw(Option<&'a Value>),
}

fn classify(value: Option<&Value>) -> Shape<'_> {
    match value {
        Some(Value::Array(items)) => {
            let records: Vec<_> = items.iter().filter_map(Value::as_object).collect();
            if records.is_empty() {
                Shape::Values(items)
            } else {
                Shape::Records(records)
            }
        }
        Some(Value::Object(map)) => Shape::Record(map),
        other => Shape::Raw(other),
    }
}

pub fn to_table(value: Option<&Value>) -> Table {
    match classify(value) {
        Shape::Records(records) => tabulate(&records),
        Shape::Record(record) => tabulate(&[record]),
        Shape::Values(items) => Table {
            headers: vec![VALUE_COLUMN.to_string()],
            rows: items
                .iter()
                .map(|item| vec![Cell::from_json(Some(item))])
                .collect(),
        },
        Shape::Raw(raw) => {
            let text = match raw {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            Table {
                headers: Vec::new(),
                rows: vec![vec![Cell::Text(text)]],
            }
        }
    }
}

fn tabulate(records: &[&Map<String, Value>]) -> Table {
    let mut headers: indexmap::IndexSet<&str> = indexmap::IndexSet::new();
    for record in records {
        for key in record.keys() {
            headers.insert(key.as_str());
        }
    }
    let rows = records
        .iter()
        .map(|record| {
            headers
                .iter()
                .map(|header| Cell::from_json(record.get(*header)))
                .collect()
        })
        .collect();
    Table {
        headers: headers.into_iter().map(str::to_string).collect(),
        rows,
    }
}

/// Writes `table` into a single `Sheet1` workbook and returns the xlsx bytes.
pub fn write_xlsx(table: &Table) -> Result<Vec<u8>> {
    let mut book = umya_spreadsheet::new_file();
    let sheet = book
        .get_sheet_by_name_mut(SHEET_NAME)
        .context("new workbook has no default sheet")?;

    let mut widths: Vec<usize> = table.headers.iter().map(|h| h.chars().count()).collect();
    let mut row_num: u32 = 1;
    if !table.headers.is_empty() {
        for (idx, header) in table.headers.iter().enumerate() {
            sheet
                .get_cell_mut((idx as u32 + 1, row_num))
                .set_value(header.clone());
        }
        row_num += 1;
    }
    for row in &table.rows {
        for (idx, cell) in row.iter().enumerate() {
            let target = sheet.get_cell_mut((idx as u32 + 1, row_num));
            match cell {
                Cell::Text(text) => {
                    target.set_value(text.clone());
                }
                Cell::Number(n) => {
                    target.set_value_number(*n);
                }
                Cell::Bool(b) => {
                    target.set_value_bool(*b);
                }
            }
            if widths.len() <= idx {
                widths.resize(idx + 1, 0);
            }
            widths[idx] = widths[idx].max(cell.display_width());
        }
        row_num += 1;
    }

    for (idx, width) in widths.iter().enumerate() {
        let letter = column_number_to_name(idx as u32 + 1);
        sheet
            .get_column_dimension_mut(&letter)
            .set_width((*width as f64 + 2.0).min(MAX_COLUMN_WIDTH));
    }

    let mut cursor = Cursor::new(Vec::new());
    umya_spreadsheet::writer::xlsx::write_writer(&book, &mut cursor)
        .context("failed to write workbook")?;
    Ok(cursor.into_inner())
}

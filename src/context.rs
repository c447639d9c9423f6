//! Serializes selected worksheet ranges into the tab-separated text block that
//! is handed to the model as context.

use crate::config::LimitsConfig;
use crate::utils::truncate_chars;
use crate::workbook::Workbook;
use serde::Serialize;
use std::fmt::Write as _;

/// One serialized row: `(file key, sheet name, 0-based row index, TSV text)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRecord {
    pub file_name: String,
    pub sheet_name: String,
    pub row_index: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_rows_per_sheet: usize,
    pub max_cols_per_row: usize,
    pub max_chars: usize,
}

impl From<&LimitsConfig> for ContextLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_rows_per_sheet: limits.max_rows_per_sheet,
            max_cols_per_row: limits.max_cols_per_row,
            max_chars: limits.max_context_chars,
        }
    }
}

/// A workbook plus the sheets of it that may be serialized.
#[derive(Debug, Clone, Copy)]
pub struct ContextSource<'a> {
    pub key: &'a str,
    pub workbook: &'a Workbook,
    /// `None` serializes every sheet; `Some` restricts to exact names.
    pub allowed_sheets: Option<&'a [String]>,
}

#[derive(Debug, Clone, Default)]
pub struct SerializedContext {
    pub rows: Vec<RowRecord>,
    pub text: String,
    pub truncated: bool,
}

pub fn serialize(sources: &[ContextSource<'_>], limits: &ContextLimits) -> SerializedContext {
    let mut rows = Vec::new();
    let mut text = String::new();

    for source in sources {
        for sheet in source.workbook.sheets() {
            if let Some(allowed) = source.allowed_sheets
                && !allowed.iter().any(|name| name == sheet.name())
            {
                continue;
            }
            let _ = writeln!(text, "File: {}", source.key);
            let _ = writeln!(text, "Sheet: {}", sheet.name());
            text.push_str("Data (TSV):\n");

            if limits.max_rows_per_sheet > 0
                && limits.max_cols_per_row > 0
                && let Some(last_row) = sheet.last_row()
            {
                let row_cap = u32::try_from(limits.max_rows_per_sheet - 1).unwrap_or(u32::MAX);
                let col_cap = u32::try_from(limits.max_cols_per_row - 1).unwrap_or(u32::MAX);
                for row_index in 0..=last_row.min(row_cap) {
                    let Some(cells) = sheet.row(row_index) else {
                        continue;
                    };
                    let Some(&last_col) = cells.keys().next_back() else {
                        continue;
                    };
                    let line = (0..=last_col.min(col_cap))
                        .map(|col| sheet.cell_text(row_index, col))
                        .collect::<Vec<_>>()
                        .join("\t");
                    text.push_str(&line);
                    text.push('\n');
                    rows.push(RowRecord {
                        file_name: source.key.to_string(),
                        sheet_name: sheet.name().to_string(),
                        row_index,
                        text: line,
                    });
                }
            }
            text.push('\n');
        }
    }

    let kept = truncate_chars(&text, limits.max_chars).len();
    let truncated = kept < text.len();
    if truncated {
        tracing::debug!(
            kept_bytes = kept,
            total_bytes = text.len(),
            "context truncated to character cap"
        );
        text.truncate(kept);
    }

    SerializedContext {
        rows,
        text,
        truncated,
    }
}

//! `{Sheet}` and `{Sheet:Column}` placeholders in prompt templates.
//!
//! Tokens are matched case- and whitespace-insensitively against the sheets and
//! header columns of the uploaded workbooks, then rewritten into quoted names
//! before the prompt is sent to the model.

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// both ASCII and full-width colons separate sheet from column
static COLUMN_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([^{}]+?)[：:]\s*([^{}]+?)\}").expect("column token pattern compiles")
});
static SHEET_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^:{}]+)\}").expect("sheet token pattern compiles"));
static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

const PREVIEW_LIMIT: usize = 5;

/// Trim, collapse whitespace runs, lower-case.
pub fn canonicalize(text: &str) -> String {
    WHITESPACE
        .replace_all(text.trim(), " ")
        .to_lowercase()
}

/// Canonical tokens referenced by a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptTokens {
    /// Colon-form references: canonical sheet to canonical columns.
    pub columns_by_sheet: IndexMap<String, IndexSet<String>>,
    /// Plain `{Sheet}` references.
    pub sheets: IndexSet<String>,
}

impl PromptTokens {
    pub fn is_empty(&self) -> bool {
        self.columns_by_sheet.is_empty() && self.sheets.is_empty()
    }
}

pub fn extract_tokens(prompt: &str) -> PromptTokens {
    let mut tokens = PromptTokens::default();
    for caps in COLUMN_TOKEN.captures_iter(prompt) {
        let sheet = canonicalize(&caps[1]);
        let column = canonicalize(&caps[2]);
        if sheet.is_empty() || column.is_empty() {
            continue;
        }
        tokens
            .columns_by_sheet
            .entry(sheet)
            .or_default()
            .insert(column);
    }
    let without_columns = COLUMN_TOKEN.replace_all(prompt, "");
    for caps in SHEET_TOKEN.captures_iter(&without_columns) {
        let sheet = canonicalize(&caps[1]);
        if !sheet.is_empty() {
            tokens.sheets.insert(sheet);
        }
    }
    tokens
}

/// Canonical sheet name to canonical header columns, unioned across files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableColumns {
    by_sheet: HashMap<String, HashSet<String>>,
}

impl AvailableColumns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sheet<I, S>(&mut self, sheet: &str, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.by_sheet.entry(canonicalize(sheet)).or_default();
        for column in columns {
            let column = canonicalize(column.as_ref());
            if !column.is_empty() {
                entry.insert(column);
            }
        }
    }

    pub fn has_sheet(&self, sheet: &str) -> bool {
        self.by_sheet.contains_key(&canonicalize(sheet))
    }

    pub fn has_column(&self, sheet: &str, column: &str) -> bool {
        self.by_sheet
            .get(&canonicalize(sheet))
            .is_some_and(|columns| columns.contains(&canonicalize(column)))
    }

    pub fn is_empty(&self) -> bool {
        self.by_sheet.is_empty()
    }
}

impl<S, C> FromIterator<(S, Vec<C>)> for AvailableColumns
where
    S: AsRef<str>,
    C: AsRef<str>,
{
    fn from_iter<T: IntoIterator<Item = (S, Vec<C>)>>(iter: T) -> Self {
        let mut available = AvailableColumns::new();
        for (sheet, columns) in iter {
            available.add_sheet(sheet.as_ref(), columns);
        }
        available
    }
}

/// Colon-form tokens that did not match any uploaded sheet/column.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.message())]
pub struct UnresolvedTokens {
    /// `sheet:column` entries in prompt order.
    pub missing: Vec<String>,
}

impl UnresolvedTokens {
    fn message(&self) -> String {
        let preview = self
            .missing
            .iter()
            .take(PREVIEW_LIMIT)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let rest = self.missing.len().saturating_sub(PREVIEW_LIMIT);
        if rest > 0 {
            format!(
                "prompt references sheets/columns missing from the uploaded files: {preview} and {rest} more"
            )
        } else {
            format!("prompt references sheets/columns missing from the uploaded files: {preview}")
        }
    }
}

/// Every colon-form token must name an existing sheet and one of its columns.
/// Columns the prompt does not mention are fine.
pub fn validate(tokens: &PromptTokens, available: &AvailableColumns) -> Result<(), UnresolvedTokens> {
    let missing: Vec<String> = tokens
        .columns_by_sheet
        .iter()
        .flat_map(|(sheet, columns)| {
            columns
                .iter()
                .filter(|column| !available.has_column(sheet, column))
                .map(move |column| format!("{sheet}:{column}"))
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(UnresolvedTokens { missing })
    }
}

/// Extract and validate in one step.
pub fn resolve(prompt: &str, available: &AvailableColumns) -> Result<PromptTokens, UnresolvedTokens> {
    let tokens = extract_tokens(prompt);
    validate(&tokens, available)?;
    Ok(tokens)
}

/// Rewrites `{Sheet:Column}` to `'Column'` and `{Sheet}` to `'Sheet'`.
pub fn substitute(prompt: &str) -> String {
    let columns = COLUMN_TOKEN.replace_all(prompt, |caps: &Captures<'_>| quote(&caps[2]));
    SHEET_TOKEN
        .replace_all(&columns, |caps: &Captures<'_>| quote(&caps[1]))
        .into_owned()
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "\\'"))
}

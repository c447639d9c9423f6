use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

pub fn column_number_to_name(column: u32) -> String {
    let mut column = column;
    let mut name = String::new();
    while column > 0 {
        let rem = ((column - 1) % 26) as u8;
        name.insert(0, (b'A' + rem) as char);
        column = (column - 1) / 26;
    }
    name
}

/// Returns the prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Decimal text for a numeric cell: integral values print without a fraction.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

const RFC5987_ATTR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// `attachment; filename="<ascii name>"; filename*=UTF-8''<pct-encoded name>`.
/// Non-ASCII characters in the plain parameter become `_` so the value stays a valid header.
pub fn content_disposition(filename: &str) -> String {
    let ascii_name: String = filename
        .chars()
        .map(|c| {
            if c == '"' || c == '\\' || !(c == ' ' || c.is_ascii_graphic()) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let encoded = utf8_percent_encode(filename, RFC5987_ATTR).to_string();
    format!("attachment; filename=\"{ascii_name}\"; filename*=UTF-8''{encoded}")
}

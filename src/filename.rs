//! Canonical keys for uploaded file names.
//!
//! Browsers and multipart encoders disagree about how non-ASCII file names
//! travel: some send backslash-octal escapes, some percent-encode, and some
//! hand over UTF-8 bytes that were decoded as Latin-1. Every display name and
//! every key of the caller's password / sheet-selection maps is passed through
//! [`normalize`] so that lookups match.

use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

/// Normalizes a possibly mis-encoded file name into its canonical key.
///
/// Stages are re-applied until the name stops changing, so the result is a
/// fixed point and `normalize(normalize(x)) == normalize(x)`. Every decoding
/// round shortens the name, which bounds the loop by the input length.
pub fn normalize(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..=raw.len() {
        let next = normalize_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Normalizes every key of `map`. On key collisions the last entry wins.
pub fn normalize_keys<V>(map: HashMap<String, V>) -> HashMap<String, V> {
    map.into_iter().map(|(k, v)| (normalize(&k), v)).collect()
}

fn normalize_once(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let mut candidate = raw.to_string();

    if let Some(decoded) = decode_octal_escapes(&candidate) {
        candidate = decoded;
    }

    if candidate.contains('%')
        && let Ok(decoded) = percent_decode_str(&candidate).decode_utf8()
        && !decoded.trim().is_empty()
    {
        candidate = decoded.into_owned();
    }

    if let Some(decoded) = redecode_latin1(&candidate) {
        candidate = decoded;
    }

    candidate.nfc().collect()
}

/// Decodes `\ddd` octal triplets into raw bytes. Returns `None` when no
/// triplet is present or the resulting bytes are not UTF-8.
fn decode_octal_escapes(input: &str) -> Option<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut bytes = Vec::with_capacity(input.len());
    let mut found = false;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '\\'
            && i + 3 < chars.len()
            && let Some(byte) = octal_byte(&chars[i + 1..i + 4])
        {
            bytes.push(byte);
            found = true;
            i += 4;
            continue;
        }
        push_char_bytes(&mut bytes, ch);
        i += 1;
    }
    if !found {
        return None;
    }
    String::from_utf8(bytes).ok()
}

fn octal_byte(digits: &[char]) -> Option<u8> {
    let mut value: u32 = 0;
    for d in digits {
        value = value * 8 + d.to_digit(8)?;
    }
    u8::try_from(value).ok()
}

/// Treats U+0080..=U+00FF as raw bytes and re-decodes the sequence as UTF-8.
fn redecode_latin1(input: &str) -> Option<String> {
    if !input.chars().any(|c| ('\u{80}'..='\u{ff}').contains(&c)) {
        return None;
    }
    let mut bytes = Vec::with_capacity(input.len());
    for ch in input.chars() {
        push_char_bytes(&mut bytes, ch);
    }
    String::from_utf8(bytes)
        .ok()
        .filter(|decoded| !decoded.trim().is_empty())
}

fn push_char_bytes(bytes: &mut Vec<u8>, ch: char) {
    let code = ch as u32;
    if code <= 0xff {
        bytes.push(code as u8);
    } else {
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    }
}

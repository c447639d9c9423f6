use std::collections::HashMap;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use proptest::prelude::*;
use sheet_prompt::filename::{normalize, normalize_keys};

const NAME: &str = "[a-zA-Z0-9가-힣][a-zA-Z0-9가-힣 ._-]{0,20}";

fn as_latin1(name: &str) -> String {
    name.bytes().map(char::from).collect()
}

fn as_octal(name: &str) -> String {
    name.bytes()
        .map(|b| {
            if b.is_ascii() {
                char::from(b).to_string()
            } else {
                format!("\\{b:03o}")
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn clean_names_are_fixed_points(name in NAME) {
        prop_assert_eq!(normalize(&name), name);
    }

    #[test]
    fn percent_encoded_names_decode(name in NAME) {
        let encoded = utf8_percent_encode(&name, NON_ALPHANUMERIC).to_string();
        prop_assert_eq!(normalize(&encoded), name);
    }

    #[test]
    fn latin1_mojibake_is_repaired(name in NAME) {
        prop_assert_eq!(normalize(&as_latin1(&name)), name);
    }

    #[test]
    fn octal_escapes_are_decoded(name in NAME) {
        prop_assert_eq!(normalize(&as_octal(&name)), name);
    }

    #[test]
    fn normalize_is_idempotent(raw in "[a-zA-Z0-9%가-힣 .\\\\_-]{0,24}") {
        let once = normalize(&raw);
        prop_assert_eq!(normalize(&once), once);
    }
}

#[test]
fn korean_name_in_every_encoding() {
    let expected = "매출 보고서.xlsx";
    assert_eq!(normalize("%EB%A7%A4%EC%B6%9C%20%EB%B3%B4%EA%B3%A0%EC%84%9C.xlsx"), expected);
    assert_eq!(normalize(&as_latin1(expected)), expected);
    assert_eq!(normalize(&as_octal(expected)), expected);
}

#[test]
fn double_percent_encoding_is_unwound() {
    assert_eq!(normalize("%25EB%25A7%25A4.xlsx"), "매.xlsx");
    // one round would leave "%EB%A7%A4.xlsx", which a second call still changes
    assert_eq!(normalize("%EB%A7%A4.xlsx"), "매.xlsx");
    assert_eq!(normalize("%252525EB%252525A7%252525A4.xlsx"), "매.xlsx");
    let deep = format!("%{}41.xlsx", "25".repeat(12));
    assert_eq!(normalize(&deep), "A.xlsx");
    assert_eq!(normalize(&normalize(&deep)), normalize(&deep));
}

#[test]
fn map_keys_are_normalized() {
    let mut map = HashMap::new();
    map.insert("%EB%A7%A4%EC%B6%9C.xlsx".to_string(), 1);
    map.insert("plain.xlsx".to_string(), 2);
    let normalized = normalize_keys(map);
    assert_eq!(normalized.get("매출.xlsx"), Some(&1));
    assert_eq!(normalized.get("plain.xlsx"), Some(&2));
}

use assert_matches::assert_matches;
use sheet_prompt::prompts::{
    JsonFilePromptStore, NewPrompt, PromptStore, StoreError, ValidatedPrompt,
};

fn prompt(text: &str, kind: Option<&str>) -> ValidatedPrompt {
    ValidatedPrompt::from_request(NewPrompt {
        prompt: Some(text.to_string()),
        kind: kind.map(str::to_string),
        name: None,
    })
    .expect("valid prompt")
}

#[test]
fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("prompts.json");

    let store = JsonFilePromptStore::open(&path).expect("open");
    assert!(store.is_empty());
    store.save(prompt("first", None)).expect("save");
    store.save(prompt("second", Some("json"))).expect("save");
    drop(store);

    let reopened = JsonFilePromptStore::open(&path).expect("reopen");
    assert_eq!(reopened.len(), 2);
    let listed = reopened.list(None).expect("list");
    assert_eq!(listed[0].prompt, "second");
    assert_eq!(listed[0].kind, "JSON");
    assert_eq!(listed[1].id, 1);

    let next = reopened.save(prompt("third", None)).expect("save");
    assert_eq!(next.id, 3);
}

#[test]
fn list_filters_by_type_case_insensitively() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonFilePromptStore::open(dir.path().join("prompts.json")).expect("open");
    store.save(prompt("a", Some("SHEET"))).expect("save");
    store.save(prompt("b", Some("JSON"))).expect("save");
    store.save(prompt("c", None)).expect("save");

    let sheets: Vec<String> = store
        .list(Some("sheet"))
        .expect("list")
        .into_iter()
        .map(|r| r.prompt)
        .collect();
    assert_eq!(sheets, vec!["c", "a"]);
    assert_eq!(store.list(Some("  ")).expect("list").len(), 3);
    assert!(store.list(Some("other")).expect("list").is_empty());
}

#[test]
fn records_serialize_with_wire_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonFilePromptStore::open(dir.path().join("prompts.json")).expect("open");
    let record = store.save(prompt("x", None)).expect("save");
    let value = serde_json::to_value(&record).expect("serialize");
    assert_eq!(value["type"], "SHEET");
    assert!(value.get("createdAt").is_some());
    assert!(value["name"].is_null());
}

#[test]
fn empty_file_opens_as_empty_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("prompts.json");
    std::fs::write(&path, "  \n").expect("write");
    let store = JsonFilePromptStore::open(&path).expect("open");
    assert!(store.is_empty());
}

#[test]
fn corrupt_file_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("prompts.json");
    std::fs::write(&path, "{not an array").expect("write");
    assert_matches!(
        JsonFilePromptStore::open(&path),
        Err(StoreError::Corrupt { .. })
    );
}

#[test]
fn failed_write_leaves_records_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("prompts.json");
    let store = JsonFilePromptStore::open(&path).expect("open without file");
    assert_matches!(store.save(prompt("x", None)), Err(StoreError::Write { .. }));
    assert!(store.is_empty());
}

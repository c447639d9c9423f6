mod support;

use std::collections::HashMap;

use serde_json::json;
use sheet_prompt::ErrorCode;
use sheet_prompt::service::{OutputMode, ProcessMeta, UploadedFile};
use support::{FAKE_MODEL_ID, FakeBackend, encrypt, linked_workbook, sales_workbook, service};

fn latin1(name: &str) -> String {
    name.bytes().map(char::from).collect()
}

#[tokio::test]
async fn serializes_context_and_substitutes_tokens() {
    let backend = FakeBackend::replying(r#"{"C1": "Seoul"}"#);
    let service = service(backend.clone());

    let result = service
        .process_multi(
            vec![UploadedFile::new("고객.xlsx", linked_workbook())],
            "Find {Customers:City} for each {Orders : id}",
            ProcessMeta::default(),
        )
        .await
        .expect("process");

    assert_eq!(result.model_id, FAKE_MODEL_ID);
    assert!(result.used_bedrock);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].scope, "ALL_FILES");
    assert_eq!(result.output_text(), r#"{"C1": "Seoul"}"#);
    assert_eq!(result.results[0].rows.len(), 5);
    assert_eq!(result.results[0].rows[0].file_name, "고객.xlsx");

    let user_text = backend.user_text(0);
    assert!(user_text.starts_with("Find 'City' for each 'id'"));
    assert!(user_text.contains("\n\nContext:\nFile: 고객.xlsx\nSheet: Customers\nData (TSV):\nID\tCity\nC1\tSeoul"));
    assert!(user_text.contains("Sheet: Orders\nData (TSV):\nID\tTotal\nC1\t30"));

    let body = &backend.requests()[0];
    assert!(body["system"].as_str().unwrap().contains("정보 없음"));
    assert_eq!(body["max_tokens"], json!(1024));
    assert_eq!(body["anthropic_version"], json!("bedrock-2023-05-31"));
}

#[tokio::test]
async fn unresolved_tokens_stop_before_the_model() {
    let backend = FakeBackend::replying("unused");
    let err = service(backend.clone())
        .process_multi(
            vec![UploadedFile::new("a.xlsx", linked_workbook())],
            "Show {Customers:Phone} and {Invoices:Total}",
            ProcessMeta::default(),
        )
        .await
        .expect_err("unresolved");

    assert_eq!(err.code, ErrorCode::UnresolvedTokens);
    assert!(err.message.contains("customers:phone"));
    assert!(err.message.contains("invoices:total"));
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn meta_selects_sheets_and_caps_rows() {
    let backend = FakeBackend::replying("ok");
    let meta = ProcessMeta {
        sheet_names: HashMap::from([("a.xlsx".to_string(), vec!["Orders".to_string()])]),
        max_rows_per_sheet: Some(1),
        ..ProcessMeta::default()
    };
    let result = service(backend.clone())
        .process_multi(
            vec![UploadedFile::new("a.xlsx", linked_workbook())],
            "summarize",
            meta,
        )
        .await
        .expect("process");

    let rows = &result.results[0].rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sheet_name, "Orders");
    assert_eq!(rows[0].text, "ID\tTotal");
    assert!(!backend.user_text(0).contains("Customers"));
}

#[tokio::test]
async fn column_cap_truncates_rows() {
    let backend = FakeBackend::replying("ok");
    let meta = ProcessMeta {
        max_cols_per_row: Some(1),
        ..ProcessMeta::default()
    };
    let result = service(backend)
        .process_multi(vec![UploadedFile::new("s.xlsx", sales_workbook())], "p", meta)
        .await
        .expect("process");
    let texts: Vec<&str> = result.results[0].rows.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["Name", "Kim", "Lee"]);
}

#[tokio::test]
async fn passwords_match_across_name_encodings() {
    let backend = FakeBackend::replying("ok");
    let meta = ProcessMeta {
        passwords: HashMap::from([("%EB%A7%A4%EC%B6%9C.xlsx".to_string(), "pw".to_string())]),
        ..ProcessMeta::default()
    };
    let result = service(backend)
        .process_multi(
            vec![UploadedFile::new(latin1("매출.xlsx"), encrypt(&sales_workbook(), "pw"))],
            "total {Sales:Amount}",
            meta,
        )
        .await
        .expect("decrypted");
    assert_eq!(result.results[0].rows[0].file_name, "매출.xlsx");
}

#[tokio::test]
async fn locked_workbook_without_password_is_rejected() {
    let err = service(FakeBackend::replying("unused"))
        .process_multi(
            vec![UploadedFile::new("매출.xlsx", encrypt(&sales_workbook(), "pw"))],
            "p",
            ProcessMeta::default(),
        )
        .await
        .expect_err("locked");
    assert_eq!(err.code, ErrorCode::PasswordRequiredOrInvalid);
    assert_eq!(err.context.file_name.as_deref(), Some("매출.xlsx"));
    assert!(err.message.contains("provide correct password"));
}

#[tokio::test]
async fn request_validation_codes() {
    let service = service(FakeBackend::replying("unused"));

    let err = service
        .process_multi(Vec::new(), "p", ProcessMeta::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::FilesEmpty);

    let err = service
        .process_multi(
            vec![UploadedFile::new("a.xlsx", sales_workbook())],
            "   ",
            ProcessMeta::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PromptEmpty);

    let err = service
        .process_multi(
            vec![
                UploadedFile::new("a.xlsx", sales_workbook()),
                UploadedFile::new("b.xlsx", Vec::new()),
            ],
            "p",
            ProcessMeta::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::FileEmpty);

    let err = service
        .process_multi(
            vec![UploadedFile::new("notes.txt", b"plain text".to_vec())],
            "p",
            ProcessMeta::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::FailedToOpen);
}

#[tokio::test]
async fn unnamed_uploads_get_positional_keys() {
    let backend = FakeBackend::replying("ok");
    let files = vec![
        UploadedFile {
            name: None,
            bytes: sales_workbook(),
        },
        UploadedFile {
            name: Some(String::new()),
            bytes: sales_workbook(),
        },
    ];
    let result = service(backend.clone())
        .process_multi(files, "p", ProcessMeta::default())
        .await
        .expect("process");
    let keys: Vec<&str> = result.results[0]
        .rows
        .iter()
        .map(|r| r.file_name.as_str())
        .collect();
    assert_eq!(keys, vec!["file0", "file0", "file0", "file1", "file1", "file1"]);
    assert!(backend.user_text(0).contains("File: file1"));
}

#[tokio::test]
async fn backend_failure_falls_back_to_echo() {
    let result = service(FakeBackend::failing())
        .process_multi(
            vec![UploadedFile::new("a.xlsx", sales_workbook())],
            "  list sales  ",
            ProcessMeta::default(),
        )
        .await
        .expect("fallback still succeeds");

    assert!(!result.used_bedrock);
    let text = result.output_text();
    assert!(text.starts_with("[FALLBACK] Unable to reach Bedrock."));
    assert!(text.contains("Prompt: list sales"));
    assert!(text.contains("Context (truncated):\nFile: a.xlsx"));
}

#[tokio::test]
async fn json_mode_extracts_model_json() {
    let backend = FakeBackend::replying("Here you go:\n```json\n{\"C1\": \"Seoul\"}\n```");
    let result = service(backend)
        .process_multi(
            vec![UploadedFile::new("a.xlsx", linked_workbook())],
            "p",
            ProcessMeta::default(),
        )
        .await
        .expect("process");
    assert_eq!(result.to_mode_value(OutputMode::Json), json!({"C1": "Seoul"}));

    let detail = result.to_mode_value(OutputMode::Detail);
    assert_eq!(detail["usedBedrock"], json!(true));
    assert_eq!(detail["results"][0]["rows"][0]["sheetName"], json!("Customers"));
}

#[tokio::test]
async fn json_mode_wraps_plain_text() {
    let result = service(FakeBackend::replying("no structured answer"))
        .process_multi(
            vec![UploadedFile::new("a.xlsx", sales_workbook())],
            "p",
            ProcessMeta::default(),
        )
        .await
        .expect("process");
    assert_eq!(
        result.to_mode_value(OutputMode::Json),
        json!({"result": "no structured answer"})
    );
}

mod support;

use serde_json::json;
use sheet_prompt::ErrorCode;
use sheet_prompt::service::JsonToSheetRequest;
use support::{FakeBackend, read_sheet, service};

fn request(json: &str, prompt: &str) -> JsonToSheetRequest {
    JsonToSheetRequest {
        json: Some(json.to_string()),
        prompt: Some(prompt.to_string()),
        ..JsonToSheetRequest::default()
    }
}

#[tokio::test]
async fn renders_model_rows_with_union_headers() {
    let backend = FakeBackend::replying(
        "```json\n[{\"name\": \"Kim\", \"age\": 30}, {\"name\": \"Lee\", \"city\": \"Busan\"}]\n```",
    );
    let artifact = service(backend.clone())
        .json_to_sheet(JsonToSheetRequest {
            sheet_name: Some("people".into()),
            ..request(r#"{"people": []}"#, "one row per person")
        })
        .await
        .expect("artifact");

    assert_eq!(artifact.file_name, "people.xlsx");
    assert!(artifact.used_remote_model);
    let (sheet, rows) = read_sheet(&artifact.bytes);
    assert_eq!(sheet, "Sheet1");
    assert_eq!(rows[0], vec!["name", "age", "city"]);
    assert_eq!(rows[1], vec!["Kim", "30", ""]);
    assert_eq!(rows[2], vec!["Lee", "", "Busan"]);

    let user_text = backend.user_text(0);
    assert!(user_text.contains("User instruction: \none row per person"));
    assert!(user_text.ends_with("Context (JSON):\n{\"people\": []}"));
}

#[tokio::test]
async fn backend_failure_tabulates_the_input() {
    let artifact = service(FakeBackend::failing())
        .json_to_sheet(request(
            r#"{"data": [{"sku": "A1", "qty": 2}, {"sku": "B7", "qty": 5}]}"#,
            "flatten",
        ))
        .await
        .expect("artifact");

    assert!(!artifact.used_remote_model);
    assert_eq!(artifact.file_name, "json_to_sheet.xlsx");
    let (_, rows) = read_sheet(&artifact.bytes);
    assert_eq!(
        rows,
        vec![
            vec!["sku".to_string(), "qty".to_string()],
            vec!["A1".to_string(), "2".to_string()],
            vec!["B7".to_string(), "5".to_string()],
        ]
    );
}

#[tokio::test]
async fn unparseable_model_output_uses_the_input() {
    let artifact = service(FakeBackend::replying("Sorry, I cannot help with that."))
        .json_to_sheet(request(r#"[{"k": "v"}]"#, "table"))
        .await
        .expect("artifact");
    let (_, rows) = read_sheet(&artifact.bytes);
    assert_eq!(rows, vec![vec!["k".to_string()], vec!["v".to_string()]]);
}

#[tokio::test]
async fn blank_model_output_counts_as_fallback() {
    let artifact = service(FakeBackend::replying("   "))
        .json_to_sheet(request(r#"{"only": true}"#, "table"))
        .await
        .expect("artifact");
    assert!(!artifact.used_remote_model);
    let (_, rows) = read_sheet(&artifact.bytes);
    assert_eq!(rows[0], vec!["only"]);
    assert_eq!(rows[1], vec!["TRUE"]);
}

#[tokio::test]
async fn scalar_arrays_get_a_value_column() {
    let artifact = service(FakeBackend::failing())
        .json_to_sheet(request("[1, 2.5, \"x\"]", "table"))
        .await
        .expect("artifact");
    let (_, rows) = read_sheet(&artifact.bytes);
    assert_eq!(
        rows,
        vec![
            vec!["value".to_string()],
            vec!["1".to_string()],
            vec!["2.5".to_string()],
            vec!["x".to_string()],
        ]
    );
}

#[tokio::test]
async fn request_overrides_reach_the_model() {
    let backend = FakeBackend::replying("[]");
    service(backend.clone())
        .json_to_sheet(JsonToSheetRequest {
            max_tokens: Some(300),
            temperature: Some(0.7),
            ..request("[]", "table")
        })
        .await
        .expect("artifact");
    let body = &backend.requests()[0];
    assert_eq!(body["max_tokens"], json!(300));
    assert_eq!(body["temperature"], json!(0.7));
    assert!(body["system"].as_str().unwrap().contains("tabular dataset"));
}

#[tokio::test]
async fn blank_inputs_are_rejected() {
    let service = service(FakeBackend::failing());
    let err = service
        .json_to_sheet(request("  ", "table"))
        .await
        .expect_err("json");
    assert_eq!(err.code, ErrorCode::JsonEmpty);

    let err = service
        .json_to_sheet(JsonToSheetRequest {
            json: Some("[]".into()),
            ..JsonToSheetRequest::default()
        })
        .await
        .expect_err("prompt");
    assert_eq!(err.code, ErrorCode::PromptEmpty);
}

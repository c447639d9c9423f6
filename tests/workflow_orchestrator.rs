use async_trait::async_trait;
use parking_lot::Mutex;
use sheet_prompt::render::SheetArtifact;
use sheet_prompt::tokens::AvailableColumns;
use sheet_prompt::workflow::{
    Orchestrator, SHEET_MARKER, SheetInputStatus, StepConfig, StepExecutor, StepKind, StepStatus,
    StepTransition, WorkflowStep, can_run, is_step_ready,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Tabular(String),
    Sheet {
        prompt: String,
        json: String,
        sheet_name: Option<String>,
    },
}

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    fail_on_call: Option<usize>,
}

impl RecordingExecutor {
    fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    fn record(&self, call: Call) -> anyhow::Result<()> {
        let mut calls = self.calls.lock();
        let index = calls.len();
        calls.push(call);
        if self.fail_on_call == Some(index) {
            anyhow::bail!("executor failure at call {index}");
        }
        Ok(())
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn run_tabular(&self, prompt: &str) -> anyhow::Result<String> {
        self.record(Call::Tabular(prompt.to_string()))?;
        Ok(format!("[{{\"answer\": \"{}\"}}]", prompt.len()))
    }

    async fn run_json_to_sheet(
        &self,
        prompt: &str,
        json_input: &str,
        sheet_name: Option<&str>,
    ) -> anyhow::Result<SheetArtifact> {
        self.record(Call::Sheet {
            prompt: prompt.to_string(),
            json: json_input.to_string(),
            sheet_name: sheet_name.map(str::to_string),
        })?;
        Ok(SheetArtifact {
            file_name: format!("{}.xlsx", sheet_name.unwrap_or("json_to_sheet")),
            bytes: vec![1, 2, 3],
            used_remote_model: true,
        })
    }
}

fn sales_columns() -> AvailableColumns {
    [("Sales", vec!["Name", "Amount"])].into_iter().collect()
}

fn transition(index: usize, from: StepStatus, to: StepStatus) -> StepTransition {
    StepTransition { index, from, to }
}

#[tokio::test]
async fn chains_outputs_into_the_next_step() {
    let executor = RecordingExecutor::default();
    let available = sales_columns();
    let steps = vec![
        WorkflowStep::new(StepKind::TabularPrompt, "Sum {Sales:Amount} by {Sales:name}"),
        WorkflowStep::new(StepKind::JsonToSheet, "one row per name | totals"),
    ];

    let run = Orchestrator::new(&executor, &available).run(&steps).await;

    assert!(run.succeeded());
    assert_eq!(run.failed_step(), None);
    let first_output = run.steps[0].output.clone().expect("first output");
    assert_eq!(run.steps[1].input_preview.as_deref(), Some(first_output.as_str()));
    assert_eq!(run.steps[1].output.as_deref(), Some(SHEET_MARKER));
    assert_eq!(
        executor.calls(),
        vec![
            Call::Tabular("Sum 'Amount' by 'name'".into()),
            Call::Sheet {
                prompt: "one row per name".into(),
                json: first_output,
                sheet_name: Some("totals".into()),
            },
        ]
    );
    assert_eq!(run.artifacts.len(), 1);
    assert_eq!(run.artifacts[0].0, 1);
    assert_eq!(run.artifacts[0].1.file_name, "totals.xlsx");
    assert_eq!(
        run.transitions,
        vec![
            transition(0, StepStatus::Idle, StepStatus::Running),
            transition(0, StepStatus::Running, StepStatus::Done),
            transition(1, StepStatus::Idle, StepStatus::Running),
            transition(1, StepStatus::Running, StepStatus::Done),
        ]
    );
}

#[tokio::test]
async fn failure_stops_the_run() {
    let executor = RecordingExecutor::failing_on(1);
    let available = sales_columns();
    let steps = vec![
        WorkflowStep::new(StepKind::TabularPrompt, "first"),
        WorkflowStep::new(StepKind::TabularPrompt, "second"),
        WorkflowStep::new(StepKind::TabularPrompt, "third"),
    ];

    let run = Orchestrator::new(&executor, &available).run(&steps).await;

    assert!(!run.succeeded());
    assert_eq!(run.failed_step(), Some(1));
    assert_eq!(run.steps[0].status, StepStatus::Done);
    assert_eq!(run.steps[1].status, StepStatus::Error);
    assert!(run.steps[1].error.as_deref().unwrap().contains("executor failure"));
    assert_eq!(run.steps[2].status, StepStatus::Idle);
    assert_eq!(executor.calls().len(), 2);
    assert_eq!(run.transitions.len(), 4);
}

#[tokio::test]
async fn unresolved_tokens_fail_the_step_without_calling_out() {
    let executor = RecordingExecutor::default();
    let available = sales_columns();
    let steps = vec![
        WorkflowStep::new(StepKind::TabularPrompt, "first"),
        WorkflowStep::new(StepKind::TabularPrompt, "use {Sales:Region}"),
    ];

    let run = Orchestrator::new(&executor, &available).run(&steps).await;

    assert_eq!(run.failed_step(), Some(1));
    assert!(run.steps[1].error.as_deref().unwrap().contains("sales:region"));
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn json_first_step_uses_configured_input() {
    let executor = RecordingExecutor::default();
    let available = AvailableColumns::new();
    let steps = vec![
        WorkflowStep::new(StepKind::JsonToSheet, "flatten").with_config(StepConfig {
            json_text: Some(r#"{"a": 1}"#.into()),
            sheet_name: Some(" export ".into()),
        }),
        WorkflowStep::new(StepKind::JsonToSheet, "again"),
    ];

    let run = Orchestrator::new(&executor, &available).run(&steps).await;

    assert!(run.succeeded());
    assert_eq!(
        executor.calls(),
        vec![
            Call::Sheet {
                prompt: "flatten".into(),
                json: r#"{"a": 1}"#.into(),
                sheet_name: Some("export".into()),
            },
            Call::Sheet {
                prompt: "again".into(),
                json: r#"{"a": 1}"#.into(),
                sheet_name: None,
            },
        ]
    );
    assert_eq!(run.steps[0].input_preview, None);
    assert_eq!(run.steps[1].input_preview.as_deref(), Some(r#"{"a": 1}"#));
    assert_eq!(run.artifacts.len(), 2);
}

#[tokio::test]
async fn previous_run_state_is_reset() {
    let executor = RecordingExecutor::default();
    let available = AvailableColumns::new();
    let mut stale = WorkflowStep::new(StepKind::TabularPrompt, "p");
    stale.status = StepStatus::Error;
    stale.error = Some("old failure".into());
    let steps = vec![stale, WorkflowStep::new(StepKind::TabularPrompt, "q")];

    let run = Orchestrator::new(&executor, &available).run(&steps).await;

    assert!(run.succeeded());
    assert_eq!(run.steps[0].error, None);
    assert_eq!(run.transitions[0].from, StepStatus::Idle);
}

#[test]
fn steps_deserialize_from_wire_names() {
    let steps: Vec<WorkflowStep> = serde_json::from_str(
        r#"[
            {"type": "SHEET", "prompt": "p", "name": "first"},
            {"id": 7, "type": "JSONTOSHEET", "prompt": "q", "config": {"jsonText": "[]", "sheetName": "s"}}
        ]"#,
    )
    .expect("steps");
    assert_eq!(steps[0].kind, StepKind::TabularPrompt);
    assert_eq!(steps[0].status, StepStatus::Idle);
    assert_eq!(steps[1].id, Some(7));
    assert_eq!(steps[1].config.json_text.as_deref(), Some("[]"));

    let value = serde_json::to_value(&steps[1]).expect("serialize");
    assert_eq!(value["type"], "JSONTOSHEET");
    assert_eq!(value["status"], "idle");
    assert!(value.get("output").is_none());
}

const OPENED: SheetInputStatus = SheetInputStatus {
    opened: true,
    password_locked: false,
};
const LOCKED: SheetInputStatus = SheetInputStatus {
    opened: false,
    password_locked: true,
};

#[test]
fn readiness_of_first_steps() {
    let sheet = WorkflowStep::new(StepKind::TabularPrompt, "total {Sales:Amount}");
    let json = WorkflowStep::new(StepKind::JsonToSheet, "flatten");

    assert!(can_run(&[sheet.clone(), json.clone()], &[OPENED]));
    assert!(!can_run(&[sheet.clone()], &[OPENED]));
    assert!(!can_run(&[sheet.clone(), json.clone()], &[]));
    assert!(!can_run(&[sheet.clone(), json.clone()], &[OPENED, LOCKED]));
    assert!(!can_run(&[json.clone(), sheet.clone()], &[OPENED]));

    let configured = json.clone().with_config(StepConfig {
        json_text: Some("[]".into()),
        sheet_name: None,
    });
    assert!(can_run(&[configured, sheet.clone()], &[]));
}

#[test]
fn step_readiness_checks_tokens() {
    let available = sales_columns();
    let good = WorkflowStep::new(StepKind::TabularPrompt, "total {Sales:Amount}");
    let bad = WorkflowStep::new(StepKind::TabularPrompt, "total {Sales:Region}");
    let json = WorkflowStep::new(StepKind::JsonToSheet, "flatten");

    assert!(is_step_ready(&good, 0, &[OPENED], &available));
    assert!(!is_step_ready(&bad, 0, &[OPENED], &available));
    assert!(!is_step_ready(&good, 1, &[LOCKED], &available));
    assert!(!is_step_ready(&json, 0, &[OPENED], &available));
    assert!(is_step_ready(&json, 1, &[], &available));
}

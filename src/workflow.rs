//! Sequential multi-step prompt pipelines.
//!
//! A run resets every step to `idle` and advances them strictly in order, each
//! step receiving the previous step's resolved output. Steps are immutable
//! snapshots: every state change produces a new `WorkflowStep`, and the run
//! keeps the full list of transitions it made.

use crate::render::SheetArtifact;
use crate::tokens::{self, AvailableColumns};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;

/// Output recorded for a spreadsheet-producing step.
pub const SHEET_MARKER: &str = "[Excel generated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    /// Prompt over the uploaded workbooks.
    #[serde(rename = "SHEET")]
    TabularPrompt,
    /// JSON flattened into a spreadsheet.
    #[serde(rename = "JSONTOSHEET")]
    JsonToSheet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Idle, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Done)
                | (StepStatus::Running, StepStatus::Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid step transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: StepStatus,
    pub to: StepStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// JSON input of a first-position JSONTOSHEET step.
    #[serde(default)]
    pub json_text: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub prompt: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn new(kind: StepKind, prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            prompt: prompt.into(),
            name: None,
            config: StepConfig::default(),
            status: StepStatus::Idle,
            input_preview: None,
            output: None,
            error: None,
        }
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    /// Idle copy with the run-specific error cleared.
    pub fn reset(&self) -> Self {
        Self {
            status: StepStatus::Idle,
            error: None,
            ..self.clone()
        }
    }

    fn transition(&self, to: StepStatus) -> Result<Self, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        Ok(Self {
            status: to,
            ..self.clone()
        })
    }

    pub fn start(&self, input_preview: Option<String>) -> Result<Self, TransitionError> {
        let mut next = self.transition(StepStatus::Running)?;
        if input_preview.is_some() {
            next.input_preview = input_preview;
        }
        Ok(next)
    }

    pub fn finish(&self, output: String) -> Result<Self, TransitionError> {
        let mut next = self.transition(StepStatus::Done)?;
        next.output = Some(output);
        next.error = None;
        Ok(next)
    }

    pub fn fail(&self, error: String) -> Result<Self, TransitionError> {
        let mut next = self.transition(StepStatus::Error)?;
        next.error = Some(error);
        Ok(next)
    }
}

/// Splits `"<prompt>|<file name>"` on the first `|`.
pub fn split_prompt_and_file_name(raw: &str) -> (String, Option<String>) {
    match raw.split_once('|') {
        Some((prompt, rest)) => {
            let name = rest.trim();
            (
                prompt.trim().to_string(),
                (!name.is_empty()).then(|| name.to_string()),
            )
        }
        None => (raw.trim().to_string(), None),
    }
}

/// Per-file readiness of the uploaded workbooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetInputStatus {
    pub opened: bool,
    pub password_locked: bool,
}

impl SheetInputStatus {
    fn ready(&self) -> bool {
        self.opened && !self.password_locked
    }
}

/// At least two steps and a first step whose input is present.
pub fn can_run(steps: &[WorkflowStep], inputs: &[SheetInputStatus]) -> bool {
    if steps.len() < 2 {
        return false;
    }
    match steps[0].kind {
        StepKind::TabularPrompt => !inputs.is_empty() && inputs.iter().all(SheetInputStatus::ready),
        StepKind::JsonToSheet => has_json_text(&steps[0]),
    }
}

pub fn is_step_ready(
    step: &WorkflowStep,
    index: usize,
    inputs: &[SheetInputStatus],
    available: &AvailableColumns,
) -> bool {
    match step.kind {
        StepKind::TabularPrompt => {
            !inputs.is_empty()
                && inputs.iter().all(SheetInputStatus::ready)
                && tokens::resolve(&step.prompt, available).is_ok()
        }
        StepKind::JsonToSheet => index > 0 || has_json_text(step),
    }
}

fn has_json_text(step: &WorkflowStep) -> bool {
    step.config
        .json_text
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty())
}

/// Performs the side effects of individual steps.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs a prompt over the uploaded workbooks; tokens are already substituted.
    async fn run_tabular(&self, prompt: &str) -> anyhow::Result<String>;

    async fn run_json_to_sheet(
        &self,
        prompt: &str,
        json_input: &str,
        sheet_name: Option<&str>,
    ) -> anyhow::Result<SheetArtifact>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTransition {
    pub index: usize,
    pub from: StepStatus,
    pub to: StepStatus,
}

#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub steps: Vec<WorkflowStep>,
    pub transitions: Vec<StepTransition>,
    /// Artifacts of spreadsheet steps, by step index.
    pub artifacts: Vec<(usize, SheetArtifact)>,
}

impl WorkflowRun {
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Done)
    }

    pub fn failed_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status == StepStatus::Error)
    }
}

pub struct Orchestrator<'a, E: StepExecutor + ?Sized> {
    executor: &'a E,
    available: &'a AvailableColumns,
}

impl<'a, E: StepExecutor + ?Sized> Orchestrator<'a, E> {
    pub fn new(executor: &'a E, available: &'a AvailableColumns) -> Self {
        Self {
            executor,
            available,
        }
    }

    pub async fn run(&self, steps: &[WorkflowStep]) -> WorkflowRun {
        let span = crate::logging::workflow_span(steps.len());
        self.run_steps(steps).instrument(span).await
    }

    async fn run_steps(&self, steps: &[WorkflowStep]) -> WorkflowRun {
        let mut run = WorkflowRun {
            steps: steps.iter().map(WorkflowStep::reset).collect(),
            transitions: Vec::new(),
            artifacts: Vec::new(),
        };

        let mut prev_output: Option<String> = None;
        for index in 0..run.steps.len() {
            let preview = if index > 0 { prev_output.clone() } else { None };
            if let Err(err) = self.advance(&mut run, index, |s| s.start(preview)) {
                tracing::error!(index, error = %err, "workflow state machine rejected start");
                break;
            }

            let step = run.steps[index].clone();
            let outcome = self.execute(&step, index, prev_output.as_deref()).await;
            let kind_label = kind_label(step.kind);
            match outcome {
                Ok((output, next_input, artifact)) => {
                    if let Some(artifact) = artifact {
                        run.artifacts.push((index, artifact));
                    }
                    prev_output = Some(next_input);
                    crate::metrics::METRICS.record_workflow_step(kind_label, "done");
                    if let Err(err) = self.advance(&mut run, index, |s| s.finish(output)) {
                        tracing::error!(index, error = %err, "workflow state machine rejected finish");
                        break;
                    }
                }
                Err(message) => {
                    tracing::warn!(index, kind = kind_label, error = %message, "workflow step failed");
                    crate::metrics::METRICS.record_workflow_step(kind_label, "error");
                    if let Err(err) = self.advance(&mut run, index, |s| s.fail(message)) {
                        tracing::error!(index, error = %err, "workflow state machine rejected failure");
                    }
                    break;
                }
            }
        }
        run
    }

    fn advance<F>(&self, run: &mut WorkflowRun, index: usize, change: F) -> Result<(), TransitionError>
    where
        F: FnOnce(&WorkflowStep) -> Result<WorkflowStep, TransitionError>,
    {
        let current = &run.steps[index];
        let next = change(current)?;
        run.transitions.push(StepTransition {
            index,
            from: current.status,
            to: next.status,
        });
        run.steps[index] = next;
        Ok(())
    }

    /// Returns `(output, input for the next step, artifact)`.
    async fn execute(
        &self,
        step: &WorkflowStep,
        index: usize,
        prev_output: Option<&str>,
    ) -> Result<(String, String, Option<SheetArtifact>), String> {
        match step.kind {
            StepKind::TabularPrompt => {
                tokens::resolve(&step.prompt, self.available).map_err(|err| err.to_string())?;
                let prompt = tokens::substitute(&step.prompt);
                let output = self
                    .executor
                    .run_tabular(&prompt)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok((output.clone(), output, None))
            }
            StepKind::JsonToSheet => {
                let json_input = if index == 0 {
                    step.config.json_text.clone().unwrap_or_default()
                } else {
                    prev_output.unwrap_or_default().to_string()
                };
                let (prompt, file_name) = split_prompt_and_file_name(&step.prompt);
                let sheet_name = file_name.or_else(|| {
                    step.config
                        .sheet_name
                        .as_deref()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                });
                let artifact = self
                    .executor
                    .run_json_to_sheet(&prompt, &json_input, sheet_name.as_deref())
                    .await
                    .map_err(|err| err.to_string())?;
                Ok((SHEET_MARKER.to_string(), json_input, Some(artifact)))
            }
        }
    }
}

fn kind_label(kind: StepKind) -> &'static str {
    match kind {
        StepKind::TabularPrompt => "SHEET",
        StepKind::JsonToSheet => "JSONTOSHEET",
    }
}

//! Outcome model shared by every prober.
//!
//! An [`Outcome`] carries one [`ResultCode`] plus two independent
//! [`Feedback`] channels: one shown to the participating team and one kept
//! for competition staff.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Result of a single check execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "SUC")]
    Pass,
    #[serde(rename = "FAL")]
    Fail,
    #[serde(rename = "PAR")]
    Warn,
    #[serde(rename = "TIM")]
    Timeout,
    #[serde(rename = "UNK")]
    Unknown,
    #[serde(rename = "ERR")]
    Error,
}

impl ResultCode {
    /// Short code used when persisting results
    pub fn as_code(&self) -> &'static str {
        match self {
            ResultCode::Pass => "SUC",
            ResultCode::Fail => "FAL",
            ResultCode::Warn => "PAR",
            ResultCode::Timeout => "TIM",
            ResultCode::Unknown => "UNK",
            ResultCode::Error => "ERR",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Pass => write!(f, "pass"),
            ResultCode::Fail => write!(f, "fail"),
            ResultCode::Warn => write!(f, "warn"),
            ResultCode::Timeout => write!(f, "timeout"),
            ResultCode::Unknown => write!(f, "unknown"),
            ResultCode::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutcomeError {
    #[error("result code read before any terminal operation was called")]
    Unset,
}

/// Summary string plus an append-only list of structured details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    feedback: String,
    details: Vec<Value>,
}

impl Feedback {
    pub fn summary(&self) -> &str {
        &self.feedback
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.feedback = summary.into();
    }

    pub fn details(&self) -> &[Value] {
        &self.details
    }

    /// Append a detail. Arrays are flattened into the list.
    pub fn append_detail(&mut self, detail: Value) {
        match detail {
            Value::Array(values) => self.details.extend(values),
            other => self.details.push(other),
        }
    }
}

/// Feedback attached to a terminal operation
#[derive(Debug, Clone, Default)]
pub struct Report {
    feedback: Option<String>,
    details: Option<Value>,
    staff_feedback: Option<String>,
    staff_details: Option<Value>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report with participant-facing feedback
    pub fn feedback(feedback: impl Into<String>) -> Self {
        Self { feedback: Some(feedback.into()), ..Self::default() }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.details = Some(detail);
        self
    }

    pub fn with_staff_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.staff_feedback = Some(feedback.into());
        self
    }

    pub fn with_staff_detail(mut self, detail: Value) -> Self {
        self.staff_details = Some(detail);
        self
    }
}

/// Terminal result of one check execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    code: Option<ResultCode>,
    participant: Feedback,
    staff: Feedback,
}

impl Outcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded result code
    pub fn code(&self) -> Result<ResultCode, OutcomeError> {
        self.code.ok_or(OutcomeError::Unset)
    }

    pub fn is_set(&self) -> bool {
        self.code.is_some()
    }

    pub fn participant(&self) -> &Feedback {
        &self.participant
    }

    pub fn staff(&self) -> &Feedback {
        &self.staff
    }

    pub fn participant_mut(&mut self) -> &mut Feedback {
        &mut self.participant
    }

    pub fn staff_mut(&mut self) -> &mut Feedback {
        &mut self.staff
    }

    pub fn success(&mut self, report: Report) {
        self.finish(ResultCode::Pass, report);
    }

    pub fn warn(&mut self, report: Report) {
        self.finish(ResultCode::Warn, report);
    }

    pub fn fail(&mut self, report: Report) {
        self.finish(ResultCode::Fail, report);
    }

    pub fn unknown(&mut self, report: Report) {
        self.finish(ResultCode::Unknown, report);
    }

    pub fn timeout(&mut self, report: Report) {
        self.finish(ResultCode::Timeout, report);
    }

    pub fn error(&mut self, report: Report) {
        self.finish(ResultCode::Error, report);
    }

    /// Set the code and fold the report into both channels.
    /// A second call overwrites the code.
    pub fn finish(&mut self, code: ResultCode, report: Report) {
        if let Some(previous) = self.code {
            warn!("Outcome overwritten: {} -> {}", previous, code);
        }
        self.code = Some(code);

        if let Some(feedback) = report.feedback {
            self.participant.set_summary(feedback);
        }
        if let Some(detail) = report.details {
            self.participant.append_detail(detail);
        }
        if let Some(feedback) = report.staff_feedback {
            self.staff.set_summary(feedback);
        }
        if let Some(detail) = report.staff_details {
            self.staff.append_detail(detail);
        }
    }
}

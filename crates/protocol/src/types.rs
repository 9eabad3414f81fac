//! Core types shared across the pipeline

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one edit-session emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// No observable change; nothing to apply.
    #[default]
    None,
    /// The batch may be applied to the running process.
    Ready,
    /// A rude edit or a hard compilation error; the session must be discarded.
    Blocked,
}

/// One incremental change to a loaded module: opaque metadata and
/// intermediate-code bytes keyed by the module's 128-bit version ID.
///
/// The delta bytes are produced by the edit-continuation compiler and consumed
/// verbatim by the runtime; the tool copies them into owned buffers before
/// serialization so the compiler's buffers may be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleUpdate {
    pub module_id: Uuid,
    pub metadata_delta: Vec<u8>,
    pub il_delta: Vec<u8>,
}

/// Everything one emit produced: a status, zero or more module updates, and
/// any diagnostics the compiler raised along the way.
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    pub status: UpdateStatus,
    pub updates: Vec<ModuleUpdate>,
    pub diagnostics: Vec<Diagnostic>,
}

impl UpdateBatch {
    /// A batch carrying no change.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn ready(updates: Vec<ModuleUpdate>) -> Self {
        Self {
            status: UpdateStatus::Ready,
            updates,
            diagnostics: Vec::new(),
        }
    }

    pub fn blocked(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            status: UpdateStatus::Blocked,
            updates: Vec::new(),
            diagnostics,
        }
    }

    /// True when the batch carries nothing to apply, regardless of status.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Diagnostic severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Hidden,
    Info,
    Warning,
    Error,
}

/// A compiler or edit-continuation diagnostic, already formatted for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub project_id: String,
    pub severity: DiagnosticSeverity,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        project_id: impl Into<String>,
        severity: DiagnosticSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            severity,
            message: message.into(),
        }
    }

    pub fn error(project_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(project_id, DiagnosticSeverity::Error, message)
    }

    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            DiagnosticSeverity::Hidden => "hidden",
            DiagnosticSeverity::Info => "info",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Error => "error",
        };
        write!(f, "{}: {}: {}", self.project_id, severity, self.message)
    }
}

/// The agent's one-byte reply to an update payload, plus the code the tool
/// synthesizes when no byte arrives in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum AckCode {
    /// Never sent on the wire; synthesized tool-side on ack timeout or I/O
    /// failure.
    TimedOut = -1,
    Failed = 0,
    Success = 1,
    SuccessAndRefresh = 2,
}

impl AckCode {
    /// Parse a byte read off the wire. Unknown values are a protocol fault.
    pub fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AckCode::Failed),
            1 => Some(AckCode::Success),
            2 => Some(AckCode::SuccessAndRefresh),
            _ => None,
        }
    }

    /// The byte the agent writes. `TimedOut` has no wire form.
    pub fn wire_byte(self) -> Option<u8> {
        match self {
            AckCode::TimedOut => None,
            other => Some(other as i8 as u8),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, AckCode::Success | AckCode::SuccessAndRefresh)
    }
}

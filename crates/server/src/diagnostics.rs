//! Diagnostics routing
//!
//! Edit-continuation diagnostics and standalone compiler diagnostics funnel
//! through one router: error-severity entries are formatted to plain strings,
//! logged, and shipped to the browser overlay when a refresh channel is
//! attached; everything else is logged only.

use cinder_protocol::{Diagnostic, DiagnosticsMessage};
use tracing::{debug, warn};

use crate::refresh::RefreshServer;

pub struct DiagnosticsRouter {
    refresh: Option<RefreshServer>,
}

impl DiagnosticsRouter {
    pub fn new(refresh: Option<RefreshServer>) -> Self {
        Self { refresh }
    }

    /// Route a set of diagnostics. Returns the formatted error strings that
    /// were forwarded.
    pub fn route(&self, diagnostics: &[Diagnostic]) -> Vec<String> {
        let mut errors = Vec::new();
        for diagnostic in diagnostics {
            let formatted = diagnostic.to_string();
            if diagnostic.is_error() {
                warn!(
                    component = "diagnostics",
                    event = "diagnostics.error",
                    project_id = %diagnostic.project_id,
                    message = %formatted,
                    "Compilation error"
                );
                errors.push(formatted);
            } else {
                debug!(
                    component = "diagnostics",
                    event = "diagnostics.info",
                    project_id = %diagnostic.project_id,
                    message = %formatted,
                    "Compilation diagnostic"
                );
            }
        }

        if !errors.is_empty() {
            if let Some(refresh) = &self.refresh {
                refresh.send_json(&DiagnosticsMessage::new(errors.clone()));
            }
        }

        errors
    }
}

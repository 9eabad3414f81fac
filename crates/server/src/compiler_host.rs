//! Edit-continuation compiler host connector
//!
//! The compiler runs out-of-process: a host binary is spawned once per
//! workspace and driven over NDJSON on stdin/stdout. The connector sends only
//! the documents that changed since the last committed solution, asks for an
//! emit, and maps the host's reply onto an `UpdateBatch`. Requests and
//! responses alternate strictly, matching the serialized change handling
//! upstream.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use anyhow::{bail, Context};
use async_trait::async_trait;
use cinder_protocol::{Diagnostic, ModuleUpdate, UpdateBatch, UpdateDelta, UpdateStatus};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compile::{EditContinuationService, LoadedWorkspace, ProjectLoader};
use crate::solution::{Document, Project, Solution};

/// Names the compiler host binary. The loader fails (degrading the iteration)
/// when it is unset.
pub const ENV_COMPILER_HOST: &str = "CINDER_COMPILER_HOST";

// ---------------------------------------------------------------------------
// Host protocol (tool -> host on stdin, host -> tool on stdout)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostRequest<'a> {
    OpenProject { project_path: &'a Path },
    DocumentChanged { path: &'a Path, text: &'a str },
    Emit,
    Diagnostics { project: &'a str },
    Commit,
    Discard,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostResponse {
    Project { projects: Vec<ProjectManifest> },
    Emitted {
        status: UpdateStatus,
        #[serde(default)]
        deltas: Vec<UpdateDelta>,
        #[serde(default)]
        diagnostics: Vec<Diagnostic>,
    },
    Diagnostics {
        #[serde(default)]
        diagnostics: Vec<Diagnostic>,
    },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct ProjectManifest {
    name: String,
    #[serde(default)]
    documents: Vec<PathBuf>,
    #[serde(default)]
    additional_documents: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Spawns the compiler host and opens the project through it.
pub struct CompilerHostLoader {
    program: PathBuf,
}

impl CompilerHostLoader {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Loader configured from `CINDER_COMPILER_HOST`.
    pub fn from_env() -> anyhow::Result<Self> {
        let program = std::env::var(ENV_COMPILER_HOST)
            .with_context(|| format!("{ENV_COMPILER_HOST} is not set"))?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl ProjectLoader for CompilerHostLoader {
    async fn load(
        &self,
        project_path: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<LoadedWorkspace> {
        info!(
            component = "compiler_host",
            event = "compiler_host.spawn",
            program = %self.program.display(),
            project_path = %project_path.display(),
            "Spawning compiler host"
        );

        let mut child = tokio::process::Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn compiler host {}", self.program.display()))?;

        let stdin = child.stdin.take().context("compiler host stdin")?;
        let stdout = child.stdout.take().context("compiler host stdout")?;

        // Writer task: serialized request lines onto the host's stdin.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = writer_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: one parsed response per line.
        let (response_tx, response_rx) = mpsc::unbounded_channel::<HostResponse>();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<HostResponse>(trimmed) {
                    Ok(response) => {
                        if response_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            component = "compiler_host",
                            event = "compiler_host.bad_response",
                            error = %err,
                            "Unparseable compiler host response"
                        );
                    }
                }
            }
        });

        let host = CompilerHost {
            writer_tx,
            responses: Mutex::new(response_rx),
            last: Mutex::new(Solution::default()),
            pending: Mutex::new(None),
            child: StdMutex::new(Some(child)),
        };

        host.send(&HostRequest::OpenProject { project_path })?;
        let manifests = match host.next_response(cancel).await? {
            HostResponse::Project { projects } => projects,
            HostResponse::Error { message } => bail!("compiler host rejected project: {message}"),
            other => bail!("unexpected compiler host response: {other:?}"),
        };

        // Warm every document text up front.
        let mut projects = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let mut project = Project::new(manifest.name);
            for path in manifest.documents {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("read {}", path.display()))?;
                project.documents.push(Document::new(path, text));
            }
            for path in manifest.additional_documents {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("read {}", path.display()))?;
                project.additional_documents.push(Document::new(path, text));
            }
            projects.push(project);
        }
        let solution = Solution::new(projects);
        *host.last.lock().await = solution.clone();

        Ok(LoadedWorkspace {
            solution,
            service: std::sync::Arc::new(host),
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct CompilerHost {
    writer_tx: mpsc::UnboundedSender<String>,
    responses: Mutex<mpsc::UnboundedReceiver<HostResponse>>,
    /// The last committed solution; emits send the documents that differ.
    last: Mutex<Solution>,
    /// The solution of the in-flight edit session, promoted to `last` on
    /// commit.
    pending: Mutex<Option<Solution>>,
    child: StdMutex<Option<tokio::process::Child>>,
}

impl CompilerHost {
    fn send(&self, request: &HostRequest<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(request).context("encode host request")?;
        line.push('\n');
        self.writer_tx
            .send(line)
            .map_err(|_| anyhow::anyhow!("compiler host exited"))
    }

    async fn next_response(&self, cancel: &CancellationToken) -> anyhow::Result<HostResponse> {
        let mut responses = self.responses.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => bail!("compiler host request cancelled"),
            response = responses.recv() => {
                response.context("compiler host closed its output")
            }
        }
    }
}

#[async_trait]
impl EditContinuationService for CompilerHost {
    async fn emit_update(
        &self,
        solution: &Solution,
        cancel: &CancellationToken,
    ) -> anyhow::Result<UpdateBatch> {
        {
            let last = self.last.lock().await;
            for document in changed_documents(&last, solution) {
                self.send(&HostRequest::DocumentChanged {
                    path: &document.path,
                    text: &document.text,
                })?;
            }
        }
        self.send(&HostRequest::Emit)?;

        match self.next_response(cancel).await? {
            HostResponse::Emitted {
                status,
                deltas,
                diagnostics,
            } => {
                *self.pending.lock().await = Some(solution.clone());
                Ok(UpdateBatch {
                    status,
                    updates: deltas.into_iter().map(ModuleUpdate::from).collect(),
                    diagnostics,
                })
            }
            HostResponse::Error { message } => bail!("compiler host emit failed: {message}"),
            other => bail!("unexpected compiler host response: {other:?}"),
        }
    }

    async fn compilation_diagnostics(
        &self,
        _solution: &Solution,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Diagnostic>> {
        self.send(&HostRequest::Diagnostics {
            project: project_id,
        })?;
        match self.next_response(cancel).await? {
            HostResponse::Diagnostics { diagnostics } => Ok(diagnostics),
            HostResponse::Error { message } => bail!("compiler host diagnostics failed: {message}"),
            other => bail!("unexpected compiler host response: {other:?}"),
        }
    }

    fn begin_session(&self) {
        debug!(
            component = "compiler_host",
            event = "compiler_host.session_begin",
            "Edit session opened"
        );
    }

    fn commit_session(&self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            if let Some(solution) = pending.take() {
                if let Ok(mut last) = self.last.try_lock() {
                    *last = solution;
                }
            }
        }
        let _ = self.send(&HostRequest::Commit);
    }

    fn discard_session(&self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.take();
        }
        let _ = self.send(&HostRequest::Discard);
    }

    fn dispose(&self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.start_kill();
            info!(
                component = "compiler_host",
                event = "compiler_host.disposed",
                "Compiler host stopped"
            );
        }
    }
}

/// Documents of `next` whose text differs from `last`. Texts are shared
/// pointers, so comparison is by identity first and content second.
fn changed_documents<'a>(last: &Solution, next: &'a Solution) -> Vec<&'a Document> {
    let mut changed = Vec::new();
    for project in &next.projects {
        for document in project
            .documents
            .iter()
            .chain(project.additional_documents.iter())
        {
            let prior = last.document_text(&document.id);
            let same = prior.is_some_and(|text| {
                std::sync::Arc::ptr_eq(text, &document.text) || **text == *document.text
            });
            if !same {
                changed.push(document);
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_documents_finds_only_the_edit() {
        let mut project = Project::new("WebApp");
        project
            .documents
            .push(Document::new("/app/A.cs", "class A {}"));
        project
            .documents
            .push(Document::new("/app/B.cs", "class B {}"));
        let last = Solution::new(vec![project]);
        let edited_id = last.projects[0].documents[0].id.clone();

        let next = last.with_document_text(&edited_id, "class A { int f; }");
        let changed = changed_documents(&last, &next);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, edited_id);
    }

    #[test]
    fn unchanged_solutions_report_nothing() {
        let mut project = Project::new("WebApp");
        project
            .documents
            .push(Document::new("/app/A.cs", "class A {}"));
        let last = Solution::new(vec![project]);
        let next = last.clone();

        assert!(changed_documents(&last, &next).is_empty());
    }

    #[test]
    fn requests_serialize_with_snake_case_tags() {
        let request = HostRequest::DocumentChanged {
            path: Path::new("/app/A.cs"),
            text: "class A {}",
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "document_changed");
        assert_eq!(value["path"], "/app/A.cs");

        let emit = serde_json::to_value(HostRequest::Emit).unwrap();
        assert_eq!(emit["type"], "emit");
    }

    #[test]
    fn emitted_response_parses_with_defaults() {
        let response: HostResponse =
            serde_json::from_str(r#"{"type":"emitted","status":"none"}"#).unwrap();
        match response {
            HostResponse::Emitted {
                status,
                deltas,
                diagnostics,
            } => {
                assert_eq!(status, UpdateStatus::None);
                assert!(deltas.is_empty());
                assert!(diagnostics.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

//! Cinder Watch Server
//!
//! Watches a project for source changes, drives incremental edit-continuation
//! compilation, and streams binary module deltas to the agent loaded inside
//! the running application. Blocked edits restart the target and begin a new
//! iteration.

mod applier;
mod compile;
mod compiler_host;
mod context;
mod diagnostics;
mod driver;
mod fs_read;
mod logging;
mod pipe;
mod refresh;
mod solution;
mod watch;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::applier::create_applier;
use crate::compiler_host::CompilerHostLoader;
use crate::context::{ProcessSpec, TargetRuntime, WatchContext};
use crate::diagnostics::DiagnosticsRouter;
use crate::driver::EditSessionDriver;
use crate::logging::init_logging;
use crate::pipe::PipeServer;
use crate::refresh::RefreshServer;
use crate::watch::ChangeWatcher;
use crate::workspace::WorkspaceHolder;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span = tracing::info_span!("cinder_watch", service = "cinder-server", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    let project_path = match std::env::var("CINDER_PROJECT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => std::env::current_dir().context("resolve working directory")?,
    };
    let target_runtime = match std::env::var("CINDER_TARGET_RUNTIME").as_deref() {
        Ok("browser") => TargetRuntime::Browser,
        _ => TargetRuntime::Process,
    };

    info!(
        component = "server",
        event = "server.starting",
        run_id = %run_id,
        pid = std::process::id(),
        project_path = %project_path.display(),
        target_runtime = ?target_runtime,
        "Starting cinder watch"
    );

    // Browser refresh channel; the WebSocket endpoint is served only when an
    // address is configured.
    let refresh = RefreshServer::new();
    let refresh_enabled = match std::env::var("CINDER_REFRESH_ADDR") {
        Ok(addr) => {
            let app = refresh
                .router()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("bind refresh endpoint on {addr}"))?;
            info!(
                component = "server",
                event = "server.refresh_listening",
                bind_address = %addr,
                "Browser refresh endpoint listening"
            );
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app).await {
                    warn!(
                        component = "server",
                        event = "server.refresh_stopped",
                        error = %err,
                        "Refresh endpoint stopped"
                    );
                }
            });
            true
        }
        Err(_) => target_runtime == TargetRuntime::Browser,
    };

    let pipe_path = std::env::var("CINDER_PIPE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PipeServer::default_path());

    let mut ctx = WatchContext::new(project_path.clone(), process_spec_from_env(&project_path));
    if refresh_enabled {
        ctx = ctx.with_browser_refresh(refresh.clone());
    }

    // Iteration-0 initialization: seed the launch environment once; later
    // iterations reuse the spec untouched.
    let base_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    ctx.process_spec.seed_hot_reload_env(&base_dir, &pipe_path);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let mut watcher = ChangeWatcher::start(&project_path)?;

    loop {
        let loader = Arc::new(CompilerHostLoader::from_env()?);
        let holder = Arc::new(WorkspaceHolder::new(loader, &project_path));
        let pipe = Arc::new(PipeServer::bind(&pipe_path)?);
        let applier = create_applier(
            target_runtime,
            pipe.clone(),
            refresh_enabled.then(|| refresh.clone()),
        );
        applier.initialize(&ctx).await;
        let diagnostics = DiagnosticsRouter::new(refresh_enabled.then(|| refresh.clone()));
        let driver = EditSessionDriver::new(holder.clone(), applier, diagnostics);
        let driver = match std::env::var("CINDER_SOURCE_EXTENSIONS") {
            Ok(raw) => {
                let extensions: Vec<&str> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|ext| !ext.is_empty())
                    .collect();
                driver.with_extensions(&extensions)
            }
            Err(_) => driver,
        };

        let mut child = launch_target(&ctx);

        info!(
            component = "server",
            event = "server.iteration_started",
            iteration = ctx.iteration,
            project_path = %ctx.project_path.display(),
            pipe_state = ?pipe.state(),
            "Watching for changes"
        );

        let restart = loop {
            tokio::select! {
                _ = cancel.cancelled() => break false,
                changed = watcher.next() => match changed {
                    Some(path) if driver.is_supported(&path) => {
                        info!(
                            component = "server",
                            event = "server.change_detected",
                            path = %path.display(),
                            "Source change detected"
                        );
                        if !driver.handle_file_change(&ctx, &path, &cancel).await {
                            break true;
                        }
                    }
                    Some(_) => {}
                    None => break false,
                },
            }
        };

        pipe.close().await;
        holder.dispose();
        if let Some(child) = child.as_mut() {
            let _ = child.start_kill();
        }

        if !restart || cancel.is_cancelled() {
            break;
        }
        ctx.next_iteration();
        info!(
            component = "server",
            event = "server.restarting",
            iteration = ctx.iteration,
            "Restarting target after blocked update"
        );
    }

    info!(
        component = "server",
        event = "server.stopped",
        "Watch loop stopped"
    );
    Ok(())
}

/// Target launch command from `CINDER_COMMAND` (program plus arguments,
/// whitespace-separated). Without it the tool orchestrates for an externally
/// launched target.
fn process_spec_from_env(project_path: &std::path::Path) -> ProcessSpec {
    let raw = std::env::var("CINDER_COMMAND").unwrap_or_default();
    let mut parts = raw.split_whitespace();
    let program = parts.next().unwrap_or_default();
    let mut spec = ProcessSpec::new(program, project_path);
    spec.args = parts.map(str::to_string).collect();
    spec
}

fn launch_target(ctx: &WatchContext) -> Option<tokio::process::Child> {
    let spec = &ctx.process_spec;
    if spec.program.as_os_str().is_empty() {
        return None;
    }

    match tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => {
            info!(
                component = "server",
                event = "server.target_launched",
                program = %spec.program.display(),
                iteration = ctx.iteration,
                "Target process launched"
            );
            Some(child)
        }
        Err(err) => {
            warn!(
                component = "server",
                event = "server.target_launch_failed",
                program = %spec.program.display(),
                error = %err,
                "Failed to launch target process"
            );
            None
        }
    }
}

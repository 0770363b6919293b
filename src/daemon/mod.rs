//! Daemon mode for bgmix: hosts one engine behind the IPC server.

pub mod handler;

use crate::config::Config;
use crate::engine::AudioEngine;
use crate::error::{BgmixError, Result};
use crate::events::{EngineEvent, EventSender};
use crate::ipc::server::IpcServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

/// Run the daemon: build the engine, start IPC server, wait for shutdown.
///
/// Returns once SIGINT, SIGTERM or a `shutdown` command arrives, after the
/// engine has stopped every process it started.
pub async fn run_daemon(
    config: Config,
    socket_path: Option<PathBuf>,
    quiet: bool,
    events: EventSender,
) -> Result<()> {
    let autostart = config.stream.autostart && config.track.path.is_some();
    let engine = Arc::new(AudioEngine::new(config, events.clone())?);

    if autostart {
        let starting = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || starting.start()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => events.emit(EngineEvent::warning(format!(
                "Continuous stream not started: {}",
                e
            ))),
            Err(e) => events.emit(EngineEvent::warning(format!(
                "Continuous stream start failed: {}",
                e
            ))),
        }
    }

    let socket_path = socket_path.unwrap_or_else(IpcServer::default_socket_path);
    let server = Arc::new(IpcServer::new(socket_path)?.with_events(events.clone()));

    if !quiet {
        eprintln!(
            "IPC server listening at: {}",
            server.socket_path().display()
        );
        eprintln!("Daemon ready.");
    }

    let shutdown = Arc::new(Notify::new());
    let handler = handler::DaemonCommandHandler::new(Arc::clone(&engine), Arc::clone(&shutdown));

    let server_clone = Arc::clone(&server);
    let mut server_handle = tokio::spawn(async move { server_clone.start(handler).await });

    let mut server_result = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            if !quiet {
                eprintln!("\nReceived SIGINT, shutting down...");
            }
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                eprintln!("Error setting up signal handler: {}", e);
            }
            if !quiet {
                eprintln!("\nReceived SIGTERM, shutting down...");
            }
        }
        _ = shutdown.notified() => {
            if !quiet {
                eprintln!("Shutdown requested, shutting down...");
            }
        }
        res = &mut server_handle => {
            server_result = Some(res);
        }
    }

    let stopping = Arc::clone(&engine);
    if tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .is_err()
    {
        events.emit(EngineEvent::warning("engine shutdown panicked"));
    }

    server.stop().await?;

    let server_result = match server_result {
        Some(res) => res,
        None => server_handle.await,
    };
    match server_result {
        Ok(res) => res?,
        Err(e) => eprintln!("bgmix: daemon server task failed: {e}"),
    }

    if !quiet {
        eprintln!("Daemon stopped.");
    }

    Ok(())
}

/// Wait for SIGTERM signal (used by service managers).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| BgmixError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // On non-Unix, just wait forever (Ctrl+C will still work)
    std::future::pending::<()>().await
}

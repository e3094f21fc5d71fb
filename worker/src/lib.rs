//! The nimbus worker: the host UI spawns this process and exchanges
//! newline-delimited JSON frames over its standard streams. stdout carries
//! exactly one JSON object per line; logs go to stderr.

mod context;
mod handlers;
mod outgoing;
mod processor;
mod remote_port;
mod telemetry;

pub use context::WorkerContext;
pub use outgoing::OutboundFrame;
pub use outgoing::OutgoingSender;
pub use processor::MessageProcessor;

use std::io::Result as IoResult;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use nimbus_core::NimbusHome;
use nimbus_protocol::Request;

/// Size of the bounded channels between the reader, processor and writer
/// tasks. 128 frames is plenty for an interactive host.
const CHANNEL_CAPACITY: usize = 128;

pub async fn run_main() -> IoResult<()> {
    let home = NimbusHome::resolve()?;
    let ctx = WorkerContext::new(home).map_err(std::io::Error::other)?;

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);
    let outgoing = OutgoingSender::new(outgoing_tx);

    startup_side_effects(&ctx);

    // Task: write outgoing frames to stdout, one JSON object per line. This
    // single consumer is the writer mutex: frames never interleave.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(frame) = outgoing_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize outbound frame: {e}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // Task: periodic telemetry under the reserved id.
    let telemetry_handle = tokio::spawn(telemetry::run(
        Arc::clone(&ctx.monitor),
        outgoing.clone(),
        ctx.shutdown.clone(),
    ));

    // Task: read requests from stdin until EOF.
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<Request>(CHANNEL_CAPACITY);
    let stdin_reader_handle = tokio::spawn(async move {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Request>(line) {
                Ok(request) => {
                    if incoming_tx.send(request).await.is_err() {
                        break;
                    }
                }
                // Malformed lines are logged, never fatal.
                Err(e) => warn!("discarding malformed request line: {e}"),
            }
        }
        debug!("stdin reader finished (EOF)");
    });

    // The dispatcher loop: runs until stdin EOF or an explicit shutdown.
    let processor = MessageProcessor::new(Arc::clone(&ctx), outgoing.clone());
    loop {
        tokio::select! {
            request = incoming_rx.recv() => {
                match request {
                    Some(request) => processor.process_request(request).await,
                    None => break,
                }
            }
            () = ctx.shutdown.cancelled() => break,
        }
    }

    info!("worker shutting down");
    ctx.shutdown.cancel();
    ctx.cancel_active_chat();
    ctx.airllm.disable().await;
    ctx.remote.stop().await;

    stdin_reader_handle.abort();
    let _ = telemetry_handle.await;
    drop(processor);
    drop(outgoing);
    let _ = stdout_writer_handle.await;
    Ok(())
}

/// Best-effort startup work: bring up the local model runtime and, when the
/// user opted in, refresh installed models in the background.
fn startup_side_effects(ctx: &Arc<WorkerContext>) {
    match tokio::process::Command::new("ollama")
        .arg("serve")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => info!("spawned ollama serve"),
        Err(e) => debug!("could not spawn ollama serve: {e}"),
    }

    let settings = ctx.settings.load();
    if settings.auto_update && settings.internet_access {
        let ollama = Arc::clone(&ctx.ollama);
        let monitor = Arc::clone(&ctx.monitor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let models = match nimbus_ollama::list_models_cli().await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("auto-update: listing failed: {e}");
                    return;
                }
            };
            for entry in models {
                monitor.add_log(&format!("AUTO-UPDATE: refreshing {}", entry.name));
                match ollama.pull_model_stream(&entry.name).await {
                    Ok(mut stream) => {
                        use futures::StreamExt;
                        while stream.next().await.is_some() {}
                    }
                    Err(e) => debug!("auto-update: pull {} failed: {e}", entry.name),
                }
            }
        });
    }
}

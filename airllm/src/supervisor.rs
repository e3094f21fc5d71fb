use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use strum_macros::Display;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;

use crate::wire::GenerateResponse;
use crate::wire::SidecarFrame;
use crate::wire::generate_request;

const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(180);
const GEN_LOCK_WAIT: Duration = Duration::from_secs(1);
const PROCESS_EXITED: &str = "AirLLM process exited";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum SidecarStatus {
    Off,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CuratedModel {
    pub id: String,
    pub label: String,
    pub provider: String,
}

fn curated_models() -> Vec<CuratedModel> {
    [
        ("meta-llama/Llama-2-7b-chat-hf", "Llama-2-7B-Chat (HF)"),
        ("mistralai/Mistral-7B-Instruct-v0.2", "Mistral-7B-Instruct v0.2"),
        ("Qwen/Qwen2.5-7B-Instruct", "Qwen2.5-7B-Instruct"),
    ]
    .iter()
    .map(|(id, label)| CuratedModel {
        id: (*id).to_string(),
        label: (*label).to_string(),
        provider: "airllm".to_string(),
    })
    .collect()
}

/// How to launch the sidecar. `--model <id>` is appended at enable time.
#[derive(Debug, Clone)]
pub struct SidecarCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SidecarCommand {
    fn default() -> Self {
        let program = std::env::var("NIMBUS_AIRLLM_SIDECAR")
            .unwrap_or_else(|_| "airllm-sidecar".to_string());
        Self {
            program,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub command: SidecarCommand,
    pub load_timeout: Duration,
    pub generation_timeout: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            command: SidecarCommand::default(),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }
}

struct State {
    status: SidecarStatus,
    model_id: Option<String>,
    last_error: Option<String>,
    loading_since: Option<Instant>,
    ready_since: Option<Instant>,
    pid: Option<u32>,
    /// Incremented on every enable/disable so stale reader and watcher
    /// tasks can tell they belong to a previous generation of the child.
    epoch: u64,
}

/// Lifecycle and request broker for the sidecar process.
pub struct AirLlmSupervisor {
    config: SidecarConfig,
    state: Mutex<State>,
    child: Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<GenerateResponse>>>,
    status_tx: watch::Sender<SidecarStatus>,
    gen_lock: tokio::sync::Mutex<()>,
}

impl Default for AirLlmSupervisor {
    fn default() -> Self {
        Self::new(SidecarConfig::default())
    }
}

impl AirLlmSupervisor {
    pub fn new(config: SidecarConfig) -> Self {
        let (status_tx, _) = watch::channel(SidecarStatus::Off);
        Self {
            config,
            state: Mutex::new(State {
                status: SidecarStatus::Off,
                model_id: None,
                last_error: None,
                loading_since: None,
                ready_since: None,
                pid: None,
                epoch: 0,
            }),
            child: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            status_tx,
            gen_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn list_models(&self) -> JsonValue {
        let state = self.lock_state();
        json!({
            "models": curated_models(),
            "active": state.model_id,
            "status": state.status,
        })
    }

    pub fn status(&self) -> JsonValue {
        let state = self.lock_state();
        json!({
            "status": state.status,
            "model": state.model_id,
            "error": state.last_error,
            "pid": state.pid,
            "loading_seconds": state.loading_since.map(|t| t.elapsed().as_secs()),
            "ready_seconds": state.ready_since.map(|t| t.elapsed().as_secs()),
            "inflight": self.lock_pending().len(),
        })
    }

    /// Spawns the sidecar for `model` (or the current/default model).
    /// An already-loading sidecar is left alone; a READY sidecar on the same
    /// model is a no-op; anything else is torn down first.
    pub async fn enable(self: Arc<Self>, model: Option<String>) -> JsonValue {
        let model_to_load = {
            let state = self.lock_state();
            model
                .or_else(|| state.model_id.clone())
                .unwrap_or_else(|| curated_models()[0].id.clone())
        };
        {
            let state = self.lock_state();
            if state.status == SidecarStatus::Loading {
                return json!({"success": false, "error": "Already loading", "status": state.status});
            }
            if state.status == SidecarStatus::Ready
                && state.model_id.as_deref() == Some(model_to_load.as_str())
            {
                return json!({"success": true, "status": state.status, "model": state.model_id});
            }
        }

        // Single-instance invariant.
        self.disable().await;

        let mut command = Command::new(&self.config.command.program);
        command
            .args(&self.config.command.args)
            .arg("--model")
            .arg(&model_to_load)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn sidecar: {e}");
                warn!("airllm: {message}");
                let mut state = self.lock_state();
                state.status = SidecarStatus::Error;
                state.last_error = Some(message.clone());
                let _ = self.status_tx.send(SidecarStatus::Error);
                return json!({"success": false, "error": message});
            }
        };

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        let pid = child.id();

        let epoch = {
            let mut state = self.lock_state();
            state.epoch += 1;
            state.status = SidecarStatus::Loading;
            state.model_id = Some(model_to_load.clone());
            state.last_error = None;
            state.loading_since = Some(Instant::now());
            state.ready_since = None;
            state.pid = pid;
            state.epoch
        };
        let _ = self.status_tx.send(SidecarStatus::Loading);
        *self.lock_child() = Some(child);
        *self.stdin.lock().await = stdin;

        info!("airllm: loading model {model_to_load} (pid {pid:?})");

        if let Some(stdout) = stdout {
            let supervisor = Arc::clone(&self);
            tokio::spawn(async move {
                supervisor.reader_loop(stdout, epoch).await;
            });
        }
        {
            let supervisor = Arc::clone(&self);
            let model = model_to_load.clone();
            tokio::spawn(async move {
                supervisor.load_timeout_watcher(epoch, model).await;
            });
        }

        json!({"success": true, "status": SidecarStatus::Loading, "model": model_to_load, "pid": pid})
    }

    pub async fn reload(self: Arc<Self>, model: Option<String>) -> JsonValue {
        self.enable(model).await
    }

    /// Selects the model to use on the next enable; a running sidecar is
    /// reloaded onto it immediately.
    pub async fn set_active_model(self: Arc<Self>, model: String) -> JsonValue {
        let running = {
            let mut state = self.lock_state();
            let running = matches!(state.status, SidecarStatus::Ready | SidecarStatus::Loading);
            if !running {
                state.model_id = Some(model.clone());
            }
            running
        };
        if running {
            self.enable(Some(model)).await
        } else {
            json!({"success": true, "status": SidecarStatus::Off, "model": model})
        }
    }

    /// Terminates the sidecar and fails everything in flight.
    pub async fn disable(&self) -> JsonValue {
        {
            let mut state = self.lock_state();
            state.epoch += 1;
            state.status = SidecarStatus::Off;
            state.model_id = None;
            state.last_error = None;
            state.loading_since = None;
            state.ready_since = None;
            state.pid = None;
        }
        let _ = self.status_tx.send(SidecarStatus::Off);
        *self.stdin.lock().await = None;

        let child = self.lock_child().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                warn!("airllm: kill failed: {e}");
            }
            let _ = child.wait().await;
        }
        // Dropping the senders resolves every pending receiver with an
        // error, which generate() reports as a process exit.
        self.lock_pending().clear();
        info!("airllm: sidecar stopped");
        json!({"success": true, "status": SidecarStatus::Off})
    }

    /// Synchronous generation through the sidecar. At most one request is in
    /// flight; a second caller gets a busy error after a short wait.
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> GenerateResponse {
        {
            let state = self.lock_state();
            if state.status != SidecarStatus::Ready {
                return GenerateResponse::failure(
                    None,
                    format!("AirLLM not ready (status={})", state.status),
                );
            }
        }

        let Ok(_gen_guard) = tokio::time::timeout(GEN_LOCK_WAIT, self.gen_lock.lock()).await
        else {
            return GenerateResponse::failure(None, "AirLLM is busy");
        };

        let req_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(req_id.clone(), tx);

        let line = generate_request(&req_id, prompt, max_tokens, temperature).to_string();
        if let Err(e) = self.send_line(&line).await {
            self.lock_pending().remove(&req_id);
            return GenerateResponse::failure(Some(req_id), format!("send failed: {e}"));
        }

        match tokio::time::timeout(self.config.generation_timeout, rx).await {
            Ok(Ok(response)) => response,
            // Sender dropped: the process went away under us.
            Ok(Err(_)) => GenerateResponse::failure(Some(req_id), PROCESS_EXITED),
            Err(_) => {
                // Timed out: drop the correlation entry, keep READY status.
                self.lock_pending().remove(&req_id);
                warn!("airllm: generation timeout");
                GenerateResponse::failure(Some(req_id), "Generation timeout")
            }
        }
    }

    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(std::io::Error::other("sidecar stdin closed"));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn reader_loop(&self, stdout: tokio::process::ChildStdout, epoch: u64) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            match SidecarFrame::parse(&line) {
                Ok(SidecarFrame::Status(frame)) => self.handle_status(frame, epoch),
                Ok(SidecarFrame::Response(response)) => {
                    let id = response.id.clone().unwrap_or_default();
                    if let Some(tx) = self.lock_pending().remove(&id) {
                        let _ = tx.send(response);
                    } else {
                        warn!("airllm: response for unknown correlation id {id}");
                    }
                }
                Ok(SidecarFrame::Unknown) => warn!("airllm: unrecognized frame: {line}"),
                Err(e) => warn!("airllm: unparseable output ({e}): {line}"),
            }
        }
        self.handle_process_exit(epoch);
    }

    fn handle_status(&self, frame: crate::wire::StatusFrame, epoch: u64) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return;
        }
        match frame.status.to_ascii_uppercase().as_str() {
            "READY" => {
                state.status = SidecarStatus::Ready;
                state.ready_since = Some(Instant::now());
                info!("airllm: model ready ({:?})", frame.model);
                let _ = self.status_tx.send(SidecarStatus::Ready);
            }
            "ERROR" => {
                state.status = SidecarStatus::Error;
                state.last_error = frame.error.clone();
                warn!("airllm: load error: {:?}", frame.error);
                let _ = self.status_tx.send(SidecarStatus::Error);
            }
            other => warn!("airllm: unknown status {other}"),
        }
    }

    fn handle_process_exit(&self, epoch: u64) {
        let failed: Vec<oneshot::Sender<GenerateResponse>> = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.status == SidecarStatus::Off {
                // Deliberate disable already handled cleanup.
                return;
            }
            let error = state.last_error.clone().unwrap_or_else(|| PROCESS_EXITED.to_string());
            state.status = SidecarStatus::Error;
            state.last_error = Some(error);
            state.pid = None;
            let _ = self.status_tx.send(SidecarStatus::Error);
            self.lock_pending().drain().map(|(_, tx)| tx).collect()
        };
        warn!("airllm: process exited, failing {} pending request(s)", failed.len());
        for tx in failed {
            let _ = tx.send(GenerateResponse::failure(None, PROCESS_EXITED));
        }
    }

    async fn load_timeout_watcher(&self, epoch: u64, model: String) {
        let mut rx = self.status_tx.subscribe();
        let became_terminal = tokio::time::timeout(self.config.load_timeout, async {
            loop {
                if matches!(
                    *rx.borrow(),
                    SidecarStatus::Ready | SidecarStatus::Error | SidecarStatus::Off
                ) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if became_terminal.is_err() {
            let still_loading = {
                let state = self.lock_state();
                state.epoch == epoch && state.status == SidecarStatus::Loading
            };
            if still_loading {
                warn!(
                    "airllm: load timeout after {}s for {model}",
                    self.config.load_timeout.as_secs()
                );
                self.disable().await;
                let mut state = self.lock_state();
                state.status = SidecarStatus::Error;
                state.last_error = Some(format!("Load timeout for {model}"));
                let _ = self.status_tx.send(SidecarStatus::Error);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_child(&self) -> std::sync::MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<GenerateResponse>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

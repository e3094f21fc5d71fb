use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use strum_macros::Display;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const CHECKSUM_TIMEOUT: Duration = Duration::from_secs(30);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const GRACEFUL_STOP: Duration = Duration::from_secs(5);
const URL_WAIT: Duration = Duration::from_secs(3);

const RELEASE_ROOT: &str =
    "https://github.com/cloudflare/cloudflared/releases/latest/download";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct ProcessState {
    state: TunnelState,
    last_error: Option<String>,
}

/// Lifecycle of the external cloudflared binary: locate, download+verify,
/// start (scanning stdout/stderr for the public URL), stop.
pub struct TunnelRuntime {
    dir: PathBuf,
    state: std::sync::Arc<Mutex<ProcessState>>,
    child: tokio::sync::Mutex<Option<Child>>,
    url_tx: watch::Sender<Option<String>>,
    install: Mutex<(bool, u8)>,
}

impl TunnelRuntime {
    pub fn new(dir: PathBuf) -> Self {
        let (url_tx, _) = watch::channel(None);
        Self {
            dir,
            state: std::sync::Arc::new(Mutex::new(ProcessState {
                state: TunnelState::Stopped,
                last_error: None,
            })),
            child: tokio::sync::Mutex::new(None),
            url_tx,
            install: Mutex::new((false, 0)),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.lock_state().state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), TunnelState::Running | TunnelState::Starting)
    }

    /// The exit cause of the last failed start, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn public_url(&self) -> Option<String> {
        self.url_tx.borrow().clone()
    }

    fn local_binary(&self) -> PathBuf {
        if cfg!(windows) {
            self.dir.join("cloudflared.exe")
        } else {
            self.dir.join("cloudflared")
        }
    }

    fn find_binary(&self) -> Option<PathBuf> {
        let local = self.local_binary();
        if local.exists() {
            return Some(local);
        }
        which::which("cloudflared").ok()
    }

    pub async fn check_installed(&self) -> JsonValue {
        let Some(path) = self.find_binary() else {
            return json!({
                "installed": false,
                "path": JsonValue::Null,
                "version": JsonValue::Null,
                "can_auto_install": true,
            });
        };
        let version = match tokio::time::timeout(
            VERSION_TIMEOUT,
            Command::new(&path).arg("version").output(),
        )
        .await
        {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let version = stdout.trim();
                if version.is_empty() {
                    stderr.trim().to_string()
                } else {
                    version.to_string()
                }
            }
            _ => "unknown".to_string(),
        };
        json!({
            "installed": true,
            "path": path.display().to_string(),
            "version": version,
            "can_auto_install": true,
        })
    }

    pub fn install_progress(&self) -> JsonValue {
        let (installing, progress) = *self.lock_install();
        json!({"installing": installing, "progress": progress})
    }

    /// Downloads the platform binary, verifies it against an adjacent
    /// `.sha256` when one is published, and installs it under the per-user
    /// tunnel directory.
    pub async fn install(&self) -> JsonValue {
        if let Some(existing) = self.find_binary() {
            return json!({
                "success": true,
                "message": "cloudflared is already installed",
                "path": existing.display().to_string(),
            });
        }
        let Some(url) = platform_download_url() else {
            return json!({
                "success": false,
                "error": format!("Unsupported platform: {} {}", std::env::consts::OS, std::env::consts::ARCH),
            });
        };
        self.install_from(&url).await
    }

    pub async fn install_from(&self, url: &str) -> JsonValue {
        {
            let mut install = self.lock_install();
            if install.0 {
                return json!({"success": false, "error": "Installation already in progress", "progress": install.1});
            }
            *install = (true, 0);
        }
        let result = self.download_and_place(url).await;
        *self.lock_install() = (false, if result["success"] == true { 100 } else { 0 });
        result
    }

    async fn download_and_place(&self, url: &str) -> JsonValue {
        use futures::StreamExt;

        info!("tunnel: downloading cloudflared from {url}");
        self.lock_install().1 = 10;

        let client = match reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => return json!({"success": false, "error": format!("HTTP client error: {e}")}),
        };
        let response = match client.get(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => return json!({"success": false, "error": format!("Download failed: {e}")}),
        };

        let total = response.content_length().unwrap_or(0);
        let mut downloaded: u64 = 0;
        let mut hasher = Sha256::new();
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return json!({"success": false, "error": format!("Download failed: {e}")}),
            };
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
            downloaded += chunk.len() as u64;
            if total > 0 {
                self.lock_install().1 = 10 + ((downloaded * 80) / total) as u8;
            }
        }
        self.lock_install().1 = 90;

        let actual_sha256 = hex::encode(hasher.finalize());
        match fetch_expected_sha256(&client, url).await {
            Some(expected) if !expected.eq_ignore_ascii_case(&actual_sha256) => {
                return json!({
                    "success": false,
                    "error": "Checksum verification failed for downloaded cloudflared",
                });
            }
            Some(_) => {}
            None => warn!("tunnel: no checksum available; proceeding without verification"),
        }

        let target = self.local_binary();
        let placed = if url.ends_with(".tgz") {
            extract_tgz_binary(&body, &target)
        } else {
            std::fs::write(&target, &body).map_err(|e| e.to_string())
        };
        if let Err(e) = placed {
            return json!({"success": false, "error": format!("Installation failed: {e}")});
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
            {
                return json!({"success": false, "error": format!("chmod failed: {e}")});
            }
        }

        info!("tunnel: cloudflared installed at {}", target.display());
        json!({
            "success": true,
            "message": "cloudflared installed successfully",
            "path": target.display().to_string(),
        })
    }

    /// Starts cloudflared (quick tunnel, or a named tunnel when a token is
    /// configured) and scans its output for the public URL.
    pub async fn start(&self, port: u16, named_token: Option<String>) -> JsonValue {
        if self.is_running() {
            return json!({
                "success": false,
                "error": "Tunnel already running",
                "url": self.public_url(),
            });
        }
        let Some(binary) = self.find_binary() else {
            return json!({
                "success": false,
                "error": "cloudflared not installed",
                "can_auto_install": true,
            });
        };

        let mut command = Command::new(&binary);
        match &named_token {
            Some(token) => command.args(["tunnel", "run", "--token", token]),
            None => command.args([
                "tunnel",
                "--url",
                &format!("http://localhost:{port}"),
                "--no-autoupdate",
            ]),
        };
        command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return json!({"success": false, "error": format!("failed to start cloudflared: {e}")});
            }
        };

        {
            let mut state = self.lock_state();
            state.state = TunnelState::Starting;
            state.last_error = None;
        }
        let _ = self.url_tx.send(None);

        if let Some(stdout) = child.stdout.take() {
            self.spawn_scanner(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_scanner(stderr);
        }
        *self.child.lock().await = Some(child);

        // Give the quick tunnel a moment to print its URL.
        let mut rx = self.url_tx.subscribe();
        let _ = tokio::time::timeout(URL_WAIT, async {
            loop {
                if rx.borrow().is_some() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        json!({
            "success": true,
            "url": self.public_url().unwrap_or_else(|| "starting...".to_string()),
            "http_port": port,
            "message": "Tunnel started",
        })
    }

    fn spawn_scanner<R>(&self, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let url_tx = self.url_tx.clone();
        let state = std::sync::Arc::clone(&self.state);
        tokio::spawn(async move {
            let url_re = match Regex::new(r"https://\S+") {
                Ok(re) => re,
                Err(_) => return,
            };
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if (line.contains("trycloudflare.com") || line.contains(".cloudflare.dev"))
                    && let Some(found) = url_re.find(&line)
                {
                    let url = found.as_str().trim_end_matches('|').trim().to_string();
                    if url_tx.borrow().is_none() {
                        info!("tunnel: public URL {url}");
                        let _ = url_tx.send(Some(url));
                    }
                }
            }
            // The stream closes when cloudflared exits. Dying before it
            // published a URL means startup failed.
            if url_tx.borrow().is_none() {
                let mut state = match state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if state.state == TunnelState::Starting {
                    warn!("tunnel: cloudflared exited before publishing a URL");
                    state.state = TunnelState::Stopped;
                    state.last_error =
                        Some("cloudflared exited before publishing a URL".to_string());
                }
            }
        });
    }

    /// Marks the tunnel Running once the URL is known. Called by the owner
    /// after `start` so the state machine reflects reality.
    pub fn mark_running_if_url(&self) {
        if self.public_url().is_some() {
            self.lock_state().state = TunnelState::Running;
        }
    }

    /// Graceful stop, escalating to kill after five seconds.
    pub async fn stop(&self) -> JsonValue {
        self.lock_state().state = TunnelState::Stopping;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            terminate(&mut child).await;
        }

        {
            let mut state = self.lock_state();
            state.state = TunnelState::Stopped;
        }
        let _ = self.url_tx.send(None);
        json!({"success": true, "message": "Tunnel stopped"})
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_install(&self) -> std::sync::MutexGuard<'_, (bool, u8)> {
        match self.install.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM first; cloudflared cleans up its edge connection.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(GRACEFUL_STOP, child.wait()).await.is_ok() {
            return;
        }
        warn!("tunnel: graceful stop timed out, killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn platform_download_url() -> Option<String> {
    let file = match (std::env::consts::OS, std::env::consts::ARCH) {
        ("windows", "x86_64") => "cloudflared-windows-amd64.exe",
        ("windows", _) => "cloudflared-windows-386.exe",
        ("macos", "aarch64") => "cloudflared-darwin-arm64.tgz",
        ("macos", _) => "cloudflared-darwin-amd64.tgz",
        ("linux", "x86_64") => "cloudflared-linux-amd64",
        ("linux", "aarch64") => "cloudflared-linux-arm64",
        _ => return None,
    };
    Some(format!("{RELEASE_ROOT}/{file}"))
}

/// Best-effort fetch of the `.sha256` file published next to the binary.
async fn fetch_expected_sha256(client: &reqwest::Client, url: &str) -> Option<String> {
    let sha_url = format!("{url}.sha256");
    let response = tokio::time::timeout(CHECKSUM_TIMEOUT, client.get(&sha_url).send())
        .await
        .ok()?
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body = response.text().await.ok()?;
    body.split_whitespace().next().map(str::to_string)
}

fn extract_tgz_binary(body: &[u8], target: &PathBuf) -> Result<(), String> {
    let gz = flate2::read::GzDecoder::new(body);
    let mut archive = tar::Archive::new(gz);
    let entries = archive.entries().map_err(|e| e.to_string())?;
    for entry in entries {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path().map_err(|e| e.to_string())?;
        if path.file_name().and_then(|n| n.to_str()) == Some("cloudflared") {
            entry.unpack(target).map_err(|e| e.to_string())?;
            return Ok(());
        }
    }
    Err("archive did not contain a cloudflared binary".to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn runtime() -> (tempfile::TempDir, TunnelRuntime) {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = TunnelRuntime::new(tmp.path().to_path_buf());
        (tmp, runtime)
    }

    #[tokio::test]
    async fn install_verifies_published_checksum() {
        let (_tmp, runtime) = runtime();
        let server = MockServer::start().await;
        let body = b"#!/bin/sh\necho fake cloudflared\n".to_vec();
        let digest = hex::encode(Sha256::digest(&body));

        Mock::given(method("GET"))
            .and(path("/cloudflared-linux-amd64"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudflared-linux-amd64.sha256"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("{digest}  cloudflared-linux-amd64")))
            .mount(&server)
            .await;

        let result = runtime
            .install_from(&format!("{}/cloudflared-linux-amd64", server.uri()))
            .await;
        assert_eq!(result["success"], true, "{result}");
        assert!(runtime.local_binary().exists());
        assert_eq!(runtime.install_progress()["progress"], 100);
    }

    #[tokio::test]
    async fn install_aborts_on_checksum_mismatch() {
        let (_tmp, runtime) = runtime();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bin.sha256"))
            .respond_with(ResponseTemplate::new(200).set_body_string("deadbeef"))
            .mount(&server)
            .await;

        let result = runtime.install_from(&format!("{}/bin", server.uri())).await;
        assert_eq!(result["success"], false);
        assert!(
            result["error"]
                .as_str()
                .unwrap()
                .contains("Checksum verification failed")
        );
        assert!(!runtime.local_binary().exists());
    }

    #[tokio::test]
    async fn install_without_checksum_proceeds() {
        let (_tmp, runtime) = runtime();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bin.sha256"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = runtime.install_from(&format!("{}/bin", server.uri())).await;
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn missing_binary_reports_auto_install() {
        let (_tmp, runtime) = runtime();
        // The local dir is empty; PATH may still carry a system cloudflared,
        // so only assert when it does not.
        if which::which("cloudflared").is_err() {
            let checked = runtime.check_installed().await;
            assert_eq!(checked["installed"], false);
            assert_eq!(checked["can_auto_install"], true);

            let started = runtime.start(8765, None).await;
            assert_eq!(started["success"], false);
            assert_eq!(started["can_auto_install"], true);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_scans_output_for_the_public_url() {
        let (tmp, runtime) = runtime();
        // Fake cloudflared: prints the URL banner on stderr like the real
        // binary, then idles.
        let script = "#!/bin/sh\n\
                      echo 'INF +  https://witty-crab.trycloudflare.com  +' >&2\n\
                      sleep 30\n";
        let binary = tmp.path().join("cloudflared");
        std::fs::write(&binary, script).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let started = runtime.start(8765, None).await;
        assert_eq!(started["success"], true);
        assert_eq!(
            runtime.public_url().as_deref(),
            Some("https://witty-crab.trycloudflare.com")
        );
        runtime.mark_running_if_url();
        assert_eq!(runtime.state(), TunnelState::Running);

        let stopped = runtime.stop().await;
        assert_eq!(stopped["success"], true);
        assert_eq!(runtime.state(), TunnelState::Stopped);
        assert!(runtime.public_url().is_none());
    }
}

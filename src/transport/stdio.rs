//! Line-delimited JSON over a child process's stdin/stdout

use crate::config::StdioConfig;
use crate::core::framing::{Decoded, JsonLineDecoder, LineFormat};
use crate::core::pending::{Dispatch, PendingRequests};
use crate::core::protocol::{AdapterRequest, AdapterResponse};
use crate::core::RequestIdGenerator;
use crate::transport::traits::{
    AdapterEvent, AdapterHealth, AdapterStatus, ChunkStream, Protocol, ProtocolAdapter,
};
use crate::transport::single_chunk;
use crate::utils::errors::{HubError, HubResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stdio adapter for process-backed servers
pub struct StdioAdapter {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    server_id: String,
    config: StdioConfig,
    pending: PendingRequests,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    /// Serializes spawn/kill so a restart can never race a stop or start
    lifecycle: Mutex<()>,
    status: RwLock<AdapterStatus>,
    /// Bumped on every spawn and every stop; readers of an older process
    /// compare against it and bow out
    generation: AtomicU64,
    restarts: AtomicU32,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<AdapterEvent>,
    request_ids: RequestIdGenerator,
}

impl StdioAdapter {
    pub fn new(server_id: impl Into<String>, config: StdioConfig) -> Self {
        let server_id = server_id.into();
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(StdioInner {
                request_ids: RequestIdGenerator::with_prefix(server_id.clone()),
                server_id,
                config,
                pending: PendingRequests::new(),
                stdin: Mutex::new(None),
                child: Mutex::new(None),
                lifecycle: Mutex::new(()),
                status: RwLock::new(AdapterStatus::Disconnected),
                generation: AtomicU64::new(0),
                restarts: AtomicU32::new(0),
                last_error: RwLock::new(None),
                events,
            }),
        }
    }

    /// Number of automatic restarts since the last `start`
    pub fn restart_count(&self) -> u32 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

impl StdioInner {
    fn set_status(&self, status: AdapterStatus) {
        let changed = {
            let mut current = self.status.write();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            let _ = self.events.send(AdapterEvent::StatusChanged(status));
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    /// Spawn a fresh process and install its stdin/child handles. The caller
    /// owns the returned stdout and must hold the lifecycle lock.
    async fn spawn_process(&self) -> HubResult<(ChildStdout, u64)> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            HubError::Connection(format!(
                "failed to spawn '{}' for server {}: {}",
                self.config.command, self.server_id, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::Connection("Failed to open stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::Connection("Failed to open stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(self.server_id.clone(), stderr));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        info!(
            "Spawned '{}' for server {} (generation {})",
            self.config.command, self.server_id, generation
        );
        Ok((stdout, generation))
    }

    /// Drives one process after another until the adapter is stopped, the
    /// process exits cleanly, or the restart budget is spent.
    async fn supervise(self: Arc<Self>, stdout: ChildStdout, generation: u64) {
        let mut stdout = stdout;
        let mut generation = generation;

        loop {
            self.pump_stdout(stdout, generation).await;

            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Reader for stale process of {} finished", self.server_id);
                return;
            }

            let code = self.reap_child().await;
            *self.stdin.lock().await = None;
            self.pending.fail_all("backend process exited");
            let _ = self.events.send(AdapterEvent::ProcessExited { code });

            if code == Some(0) {
                info!("Process for server {} exited cleanly", self.server_id);
                self.set_status(AdapterStatus::Disconnected);
                return;
            }

            warn!(
                "Process for server {} exited unexpectedly (code {:?})",
                self.server_id, code
            );
            *self.last_error.write() = Some(format!("process exited with code {:?}", code));

            match self.restart_after_exit(generation).await {
                Some((next_stdout, next_generation)) => {
                    stdout = next_stdout;
                    generation = next_generation;
                }
                None => return,
            }
        }
    }

    async fn restart_after_exit(&self, exited_generation: u64) -> Option<(ChildStdout, u64)> {
        loop {
            let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_restarts {
                let message = format!(
                    "server {} exceeded {} restart attempts",
                    self.server_id, self.config.max_restarts
                );
                error!("{}", message);
                *self.last_error.write() = Some(message.clone());
                self.set_status(AdapterStatus::Error);
                let _ = self.events.send(AdapterEvent::Fatal(message));
                return None;
            }

            self.set_status(AdapterStatus::Reconnecting);
            let _ = self.events.send(AdapterEvent::Restarting { attempt });
            tokio::time::sleep(Duration::from_millis(self.config.restart_delay_ms)).await;

            let _guard = self.lifecycle.lock().await;
            if self.generation.load(Ordering::SeqCst) != exited_generation {
                // stopped or restarted by someone else while we slept
                return None;
            }
            match self.spawn_process().await {
                Ok(spawned) => {
                    info!("Restarted server {} (attempt {})", self.server_id, attempt);
                    self.set_status(AdapterStatus::Connected);
                    return Some(spawned);
                }
                Err(e) => {
                    warn!("Restart attempt {} for {} failed: {}", attempt, self.server_id, e);
                    *self.last_error.write() = Some(e.to_string());
                }
            }
        }
    }

    async fn pump_stdout(&self, mut stdout: ChildStdout, generation: u64) {
        let mut decoder = JsonLineDecoder::new(LineFormat::JsonLines);
        let mut buf = vec![0u8; 8192];

        loop {
            let read = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error on stdout of {}: {}", self.server_id, e);
                    break;
                }
            };
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            for decoded in decoder.feed(&buf[..read]) {
                self.handle_decoded(decoded);
            }
        }

        if self.generation.load(Ordering::SeqCst) == generation {
            for decoded in decoder.finish() {
                self.handle_decoded(decoded);
            }
        }
    }

    fn handle_decoded(&self, decoded: Decoded) {
        match decoded {
            Decoded::Message(message) => {
                debug!("Received from {}: {}", self.server_id, message);
                if let Dispatch::Notification(message) = self.pending.dispatch(message) {
                    let _ = self.events.send(AdapterEvent::Notification(message));
                }
            }
            Decoded::Malformed { line, error } => {
                warn!("Unparseable line from {}: {}", self.server_id, error);
                let _ = self.events.send(AdapterEvent::ParseError { line, error });
            }
        }
    }

    async fn reap_child(&self) -> Option<i32> {
        let child = self.child.lock().await.take();
        let mut child = child?;
        match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                error!("Failed to wait for child of {}: {}", self.server_id, e);
                None
            }
            Err(_) => {
                warn!("Child of {} closed stdout but did not exit, killing", self.server_id);
                let _ = child.start_kill();
                None
            }
        }
    }

    async fn kill_child(&self) {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };

        if let Err(e) = child.start_kill() {
            warn!("Failed to kill child process of {}: {}", self.server_id, e);
        }
        match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!("Child process of {} exited with: {:?}", self.server_id, status),
            Ok(Err(e)) => error!("Failed to wait for child of {}: {}", self.server_id, e),
            Err(_) => warn!("Timeout waiting for child process of {}", self.server_id),
        }
    }
}

async fn log_stderr(server_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{} stderr] {}", server_id, line);
    }
}

#[async_trait]
impl ProtocolAdapter for StdioAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Stdio
    }

    fn status(&self) -> AdapterStatus {
        *self.inner.status.read()
    }

    async fn start(&self) -> HubResult<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        if *inner.status.read() == AdapterStatus::Connected {
            return Ok(());
        }

        inner.set_status(AdapterStatus::Initializing);
        inner.restarts.store(0, Ordering::SeqCst);

        match inner.spawn_process().await {
            Ok((stdout, generation)) => {
                *inner.last_error.write() = None;
                inner.set_status(AdapterStatus::Connected);
                tokio::spawn(inner.clone().supervise(stdout, generation));
                Ok(())
            }
            Err(e) => {
                *inner.last_error.write() = Some(e.to_string());
                inner.set_status(AdapterStatus::Error);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> HubResult<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.pending.fail_all("adapter stopped");
        *inner.stdin.lock().await = None;
        inner.kill_child().await;
        inner.set_status(AdapterStatus::Disconnected);
        info!("Stopped stdio adapter for {}", inner.server_id);
        Ok(())
    }

    async fn send_request(&self, request: AdapterRequest) -> HubResult<AdapterResponse> {
        let inner = &self.inner;
        let status = *inner.status.read();
        if status != AdapterStatus::Connected {
            return Err(HubError::Connection(format!(
                "stdio adapter for {} is {}",
                inner.server_id, status
            )));
        }

        let mut request = request;
        let id = inner.request_ids.assign(&mut request);
        let line = request.to_line()?;

        let waiter = inner.pending.register(id, inner.request_timeout())?;
        debug!("Sending to {}: {}", inner.server_id, line.trim_end());

        {
            let mut stdin = inner.stdin.lock().await;
            let Some(stdin) = stdin.as_mut() else {
                waiter.cancel();
                return Err(HubError::Connection("Transport not connected".to_string()));
            };
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                waiter.cancel();
                return Err(HubError::Connection(format!("write to stdin failed: {}", e)));
            }
        }

        waiter.wait().await
    }

    async fn stream_request(&self, request: AdapterRequest) -> HubResult<ChunkStream> {
        let response = self.send_request(request).await?;
        single_chunk(response)
    }

    async fn health(&self) -> AdapterHealth {
        match *self.inner.status.read() {
            AdapterStatus::Connected => AdapterHealth::healthy(),
            AdapterStatus::Initializing | AdapterStatus::Reconnecting => {
                AdapterHealth::unknown(Some("process is starting".to_string()))
            }
            AdapterStatus::Disconnected => AdapterHealth::unhealthy("process not running"),
            AdapterStatus::Error => AdapterHealth::unhealthy(
                self.inner
                    .last_error
                    .read()
                    .clone()
                    .unwrap_or_else(|| "adapter in error state".to_string()),
            ),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
}

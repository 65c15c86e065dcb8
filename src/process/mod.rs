//! Process - supervises one backend server
//!
//! A [`Process`] owns the OS child for a single model and walks it through the lifecycle described
//! by [`ProcessState`]:
//! - Launching the configured command with its environment and an assigned port
//! - Polling the health check endpoint until it passes, the child dies, or the timeout expires
//! - Tracking in-flight requests so a stop waits for them to finish
//! - Stopping the child with SIGTERM, escalating to SIGKILL after a grace period
//!
//! Deciding *when* to start or stop is the job of [`crate::process_group::ProcessGroup`].

pub mod health;
pub mod ports;
pub mod shutdown;
mod state;

pub use state::ProcessState;

use crate::config::{ModelConfig, PORT_MACRO};
use health::{HealthClient, PollOutcome};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Errors from process lifecycle operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("{model} is already being started or stopped")]
    AlreadyInProgress { model: String },

    #[error("failed to launch {model}: {reason}")]
    Launch { model: String, reason: String },

    #[error("health check for {model} timed out after {timeout:?}")]
    HealthCheckTimeout { model: String, timeout: Duration },

    #[error("{model} exited before becoming healthy: {status}")]
    ExitedEarly { model: String, status: String },

    #[error("health check interrupted due to shutdown")]
    ShutdownInterrupted,

    #[error("invalid state transition for {model}: {from} -> {to}")]
    InvalidTransition {
        model: String,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("{model} is not ready")]
    NotReady { model: String },

    #[error("{model} is not a member of group {group}")]
    NotMember { model: String, group: String },
}

struct ProcessInner {
    child: Option<Child>,
}

/// Set while the process is `Ready`.
#[derive(Clone)]
struct ReadyInfo {
    address: Url,
    /// Cancelled when the process leaves `Ready`.
    token: CancellationToken,
}

/// Supervisor for one model's backend server.
pub struct Process {
    id: String,
    config: ModelConfig,
    health_check_timeout: Duration,
    state: AtomicU8,
    /// Held for the whole of a start or stop sequence
    inner: Mutex<ProcessInner>,
    ready: RwLock<Option<ReadyInfo>>,
    epoch: Instant,
    last_activity_ms: AtomicU64,
    in_flight: AtomicUsize,
    drained: Notify,
    shutdown: CancellationToken,
    health_client: HealthClient,
}

enum StartOutcome {
    Healthy,
    Exited(std::process::ExitStatus),
    TimedOut,
    Interrupted,
}

impl Process {
    pub fn new(
        id: impl Into<String>,
        config: ModelConfig,
        health_check_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            health_check_timeout,
            state: AtomicU8::new(ProcessState::Stopped as u8),
            inner: Mutex::new(ProcessInner { child: None }),
            ready: RwLock::new(None),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown,
            health_client: health::health_client(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Snapshot of the lifecycle state. Never blocks.
    pub fn current_state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, next: ProcessState) -> Result<ProcessState, ProcessError> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = ProcessState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(ProcessError::InvalidTransition {
                    model: self.id.clone(),
                    from,
                    to: next,
                });
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(model = %self.id, %from, to = %next, "State transition");
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Address of the backend while it is `Ready`.
    pub fn address(&self) -> Option<Url> {
        self.read_ready().map(|info| info.address)
    }

    /// Token cancelled when the current `Ready` period ends.
    pub fn ready_token(&self) -> Option<CancellationToken> {
        self.read_ready().map(|info| info.token)
    }

    fn read_ready(&self) -> Option<ReadyInfo> {
        self.ready
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_ready(&self, info: Option<ReadyInfo>) {
        let previous = std::mem::replace(
            &mut *self.ready.write().unwrap_or_else(PoisonError::into_inner),
            info,
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Launch the backend and wait for it to become healthy.
    ///
    /// Returns immediately if the process is already `Ready`.
    pub async fn start(&self) -> Result<(), ProcessError> {
        if self.current_state() == ProcessState::Ready {
            return Ok(());
        }

        let mut inner = self
            .inner
            .try_lock()
            .map_err(|_| ProcessError::AlreadyInProgress {
                model: self.id.clone(),
            })?;

        if self.current_state() == ProcessState::Ready {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(ProcessError::ShutdownInterrupted);
        }

        self.transition(ProcessState::Starting)?;

        let (address, mut child) = match self.spawn() {
            Ok(spawned) => spawned,
            Err(e) => {
                self.transition(ProcessState::Failed)?;
                warn!(model = %self.id, error = %e, "Failed to launch process");
                return Err(e);
            }
        };

        let health_url = if self.config.health_check_enabled() {
            match self.health_url(&address) {
                Ok(url) => Some(url),
                Err(e) => {
                    kill(&self.id, &mut child).await;
                    self.transition(ProcessState::Failed)?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let outcome = if let Some(health_url) = health_url {
            debug!(model = %self.id, url = %health_url, "Waiting for health check");

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => StartOutcome::Interrupted,
                polled = tokio::time::timeout(
                    self.health_check_timeout,
                    health::poll_until_healthy(&self.health_client, &health_url, &mut child, &self.id),
                ) => match polled {
                    Ok(PollOutcome::Healthy) => StartOutcome::Healthy,
                    Ok(PollOutcome::Exited(status)) => StartOutcome::Exited(status),
                    Err(_) => StartOutcome::TimedOut,
                },
            }
        } else {
            StartOutcome::Healthy
        };

        match outcome {
            StartOutcome::Healthy => {
                inner.child = Some(child);
                self.set_ready(Some(ReadyInfo {
                    address: address.clone(),
                    token: CancellationToken::new(),
                }));
                self.touch();
                self.transition(ProcessState::Ready)?;
                info!(model = %self.id, address = %address, "Process is ready");
                Ok(())
            }
            StartOutcome::Exited(status) => {
                self.transition(ProcessState::Failed)?;
                warn!(model = %self.id, %status, "Process exited before becoming healthy");
                Err(ProcessError::ExitedEarly {
                    model: self.id.clone(),
                    status: status.to_string(),
                })
            }
            StartOutcome::TimedOut => {
                kill(&self.id, &mut child).await;
                self.transition(ProcessState::Failed)?;
                warn!(model = %self.id, timeout = ?self.health_check_timeout, "Health check timed out");
                Err(ProcessError::HealthCheckTimeout {
                    model: self.id.clone(),
                    timeout: self.health_check_timeout,
                })
            }
            StartOutcome::Interrupted => {
                kill(&self.id, &mut child).await;
                self.transition(ProcessState::Stopped)?;
                info!(model = %self.id, "Start interrupted by shutdown");
                Err(ProcessError::ShutdownInterrupted)
            }
        }
    }

    /// Pick the address and launch the command.
    fn spawn(&self) -> Result<(Url, Child), ProcessError> {
        let launch_error = |reason: String| ProcessError::Launch {
            model: self.id.clone(),
            reason,
        };

        let (address, port) = match &self.config.proxy {
            Some(proxy) => {
                let port = proxy
                    .port_or_known_default()
                    .ok_or_else(|| launch_error(format!("proxy {proxy} has no port")))?;
                (proxy.clone(), port)
            }
            None => {
                let port = ports::free_port().map_err(|e| launch_error(e.to_string()))?;
                let address = Url::parse(&format!("http://127.0.0.1:{port}/"))
                    .map_err(|e| launch_error(e.to_string()))?;
                (address, port)
            }
        };

        let port = port.to_string();
        let args: Vec<String> = self
            .config
            .sanitized_command()
            .map_err(|e| launch_error(e.to_string()))?
            .into_iter()
            .map(|arg| arg.replace(PORT_MACRO, &port))
            .collect();
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| launch_error("empty command".to_string()))?;

        info!(model = %self.id, %program, args = ?rest, "Launching process");

        let mut child = Command::new(program)
            .args(rest)
            .envs(self.config.env_pairs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_error(e.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.id.clone(), "stderr", stderr);
        }

        Ok((address, child))
    }

    fn health_url(&self, address: &Url) -> Result<Url, ProcessError> {
        let endpoint = self.config.check_endpoint.trim_start_matches('/');
        let url = format!("{}/{}", address.as_str().trim_end_matches('/'), endpoint);
        Url::parse(&url).map_err(|e| ProcessError::Launch {
            model: self.id.clone(),
            reason: format!("invalid health check url {url}: {e}"),
        })
    }

    /// Stop the backend.
    ///
    /// Waits for in-flight requests to finish unless shutdown has been signalled, then sends
    /// SIGTERM and escalates to SIGKILL after the grace period. A no-op when already stopped or
    /// failed.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock().await;

        if matches!(
            self.current_state(),
            ProcessState::Stopped | ProcessState::Failed
        ) {
            return Ok(());
        }

        self.transition(ProcessState::Stopping)?;
        self.set_ready(None);
        info!(model = %self.id, "Stopping process");

        self.drain_in_flight().await;

        if let Some(child) = inner.child.take() {
            match shutdown::shutdown_child(child, shutdown::STOP_GRACE_PERIOD).await {
                Ok(status) => debug!(model = %self.id, %status, "Process exited"),
                Err(e) => warn!(model = %self.id, error = %e, "Failed to stop process cleanly"),
            }
        }

        self.transition(ProcessState::Stopped)?;
        info!(model = %self.id, "Process stopped");
        Ok(())
    }

    async fn drain_in_flight(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let count = self.in_flight();
            if count == 0 || self.shutdown.is_cancelled() {
                return;
            }

            debug!(model = %self.id, in_flight = count, "Waiting for in-flight requests");
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Mark a request as in flight against the ready backend.
    ///
    /// Returns `None` if the process is not `Ready`.
    pub fn acquire_in_flight(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let address = if self.current_state() == ProcessState::Ready {
            self.address()
        } else {
            None
        };

        match address {
            Some(address) => {
                self.touch();
                Some(InFlightGuard {
                    process: Arc::clone(self),
                    address,
                })
            }
            None => {
                self.release_in_flight();
                None
            }
        }
    }

    fn release_in_flight(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Detect a `Ready` backend whose child has died and move it to `Stopped`.
    ///
    /// Callers hold the group slot, so no start or stop can be running. Returns true if the
    /// process was reaped.
    pub fn reap_if_exited(&self) -> bool {
        if self.current_state() != ProcessState::Ready {
            return false;
        }
        let Ok(mut inner) = self.inner.try_lock() else {
            return false;
        };

        let status = match inner.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => status,
            _ => return false,
        };

        warn!(model = %self.id, %status, "Process exited unexpectedly");
        inner.child = None;
        self.set_ready(None);
        self.transition(ProcessState::Stopped).is_ok()
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("state", &self.current_state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Keeps a request counted against its process until dropped.
pub struct InFlightGuard {
    process: Arc<Process>,
    address: Url,
}

impl InFlightGuard {
    pub fn address(&self) -> &Url {
        &self.address
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn touch(&self) {
        self.process.touch();
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.process.touch();
        self.process.release_in_flight();
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("model", &self.process.id)
            .field("address", &self.address.as_str())
            .finish()
    }
}

async fn kill(model: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(model = %model, error = %e, "Failed to kill process");
    }
}

/// Re-emit a child's output as tracing events.
fn forward_output<R>(model: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(model = %model, stream, "{line}");
        }
    });
}

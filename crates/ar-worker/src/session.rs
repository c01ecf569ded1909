// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! One long-lived worker child process per conversation context.
//!
//! The session wraps the worker binary in stream-JSON mode and drives a
//! small state machine over its stdout:
//!
//! ```text
//! initializing ──init──▶ idle ◀──result──┐
//!                         │              │
//!                         └──send──▶ processing
//!        any ──close/destroy/release/overflow──▶ dead
//! ```
//!
//! At most one message is pending at a time; the caller-side timeout
//! returns the session to idle without killing the process, and a late
//! result is silently discarded so the process stays usable.

use crate::content::{UserFrame, WorkerContent};
use crate::error::{WorkerError, WorkerResult};
use crate::process;
use crate::wire::{self, WorkerFrame};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default stdout line-buffer cap before the session is destroyed.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;
/// Default SIGTERM→SIGKILL grace period.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
/// Bytes of stderr kept for diagnosis.
const STDERR_TAIL_BYTES: usize = 4096;

/// Everything needed to spawn one worker process.
#[derive(Debug, Clone)]
pub struct WorkerLaunchSpec {
    pub binary: PathBuf,
    pub model: Option<String>,
    pub settings_file: Option<PathBuf>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_cost_usd: Option<f64>,
    pub system_prompt_suffix: Option<String>,
    pub working_dir: PathBuf,
    /// Prior worker-session id to resume (recovery path).
    pub resume_session_id: Option<String>,
    pub max_buffer_bytes: usize,
    pub kill_grace: Duration,
}

impl WorkerLaunchSpec {
    pub fn new(binary: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model: None,
            settings_file: None,
            permission_mode: None,
            allowed_tools: Vec::new(),
            max_cost_usd: None,
            system_prompt_suffix: None,
            working_dir: working_dir.into(),
            resume_session_id: None,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Command-line arguments derived from this spec.
    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--input-format".into(),
            "stream-json".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--print".into(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(settings) = &self.settings_file {
            args.push("--settings".into());
            args.push(settings.to_string_lossy().into_owned());
        }
        if let Some(mode) = &self.permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(self.allowed_tools.join(","));
        }
        if let Some(cap) = self.max_cost_usd {
            args.push("--max-cost-usd".into());
            args.push(format!("{cap}"));
        }
        if let Some(suffix) = &self.system_prompt_suffix {
            args.push("--append-system-prompt".into());
            args.push(suffix.clone());
        }
        if let Some(resume) = &self.resume_session_id {
            args.push("--resume".into());
            args.push(resume.clone());
        }
        args
    }
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Idle,
    Processing,
    Dead,
}

/// Everything the worker reports for one completed turn.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    pub text: String,
    pub session_id: String,
    pub is_error: bool,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    pub usage: wire::TokenUsage,
    pub permission_denials: Vec<Value>,
    pub model: Option<String>,
}

type Pending = oneshot::Sender<WorkerResult<WorkerReply>>;

/// Invoked once with the context id when the session dies. Carries no
/// back-reference to the pool.
pub type DeathCallback = Box<dyn Fn(&str) + Send + Sync>;

struct SessionState {
    phase: SessionPhase,
    worker_session_id: Option<String>,
    model: Option<String>,
    pending: Option<Pending>,
    init_waiters: Vec<oneshot::Sender<()>>,
    released: bool,
}

struct Shared {
    context_id: String,
    agent_name: String,
    pid: Option<u32>,
    max_buffer_bytes: usize,
    kill_grace: Duration,
    state: Mutex<SessionState>,
    stderr_tail: Mutex<Vec<u8>>,
    on_death: Mutex<Option<DeathCallback>>,
}

/// Handle to one live worker process.
pub struct WorkerSession {
    shared: Arc<Shared>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Option<Child>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSession {
    /// Spawn the worker process. The child is detached into its own
    /// process group so it can outlive the server, and `CLAUDECODE` is
    /// stripped from the environment so a nested worker does not refuse
    /// to start.
    pub fn spawn(
        spec: &WorkerLaunchSpec,
        context_id: &str,
        agent_name: &str,
        on_death: Option<DeathCallback>,
    ) -> WorkerResult<Arc<Self>> {
        let mut cmd = Command::new(&spec.binary);
        cmd.args(spec.build_args())
            .current_dir(&spec.working_dir)
            .env_remove("CLAUDECODE")
            .env_remove("CLAUDE_CODE_ENTRYPOINT")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false)
            .process_group(0);

        let mut child = cmd.spawn().map_err(WorkerError::SpawnFailed)?;
        let pid = child.id();
        debug!(context_id, agent = agent_name, pid, "spawned worker");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            WorkerError::SpawnFailed(std::io::Error::other("worker stdout not captured"))
        })?;
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            context_id: context_id.to_string(),
            agent_name: agent_name.to_string(),
            pid,
            max_buffer_bytes: spec.max_buffer_bytes,
            kill_grace: spec.kill_grace,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Initializing,
                worker_session_id: spec.resume_session_id.clone(),
                model: spec.model.clone(),
                pending: None,
                init_waiters: Vec::new(),
                released: false,
            }),
            stderr_tail: Mutex::new(Vec::new()),
            on_death: Mutex::new(on_death),
        });

        let child = Arc::new(Mutex::new(Some(child)));
        let reader = tokio::spawn(read_stdout(stdout, Arc::clone(&shared), Arc::clone(&child)));
        let stderr_task = stderr.map(|pipe| tokio::spawn(read_stderr(pipe, Arc::clone(&shared))));

        Ok(Arc::new(Self {
            shared,
            stdin: tokio::sync::Mutex::new(stdin),
            child,
            reader: Mutex::new(Some(reader)),
            stderr_task: Mutex::new(stderr_task),
        }))
    }

    /// Send one user turn and wait for the worker's result.
    ///
    /// Fails fast with [`WorkerError::SessionBusy`] when a message is
    /// already pending and with [`WorkerError::SessionDead`] once the
    /// session has died. On timeout the session returns to idle and the
    /// process is left running; a late result is consumed silently.
    pub async fn send_message(
        &self,
        content: &WorkerContent,
        timeout: Duration,
    ) -> WorkerResult<WorkerReply> {
        let rx = {
            let mut st = self.lock_state();
            match st.phase {
                SessionPhase::Dead => {
                    return Err(if st.released {
                        WorkerError::SessionReleased
                    } else {
                        WorkerError::SessionDead
                    });
                }
                SessionPhase::Processing => return Err(WorkerError::SessionBusy),
                SessionPhase::Initializing | SessionPhase::Idle => {}
            }
            if st.pending.is_some() {
                return Err(WorkerError::SessionBusy);
            }
            let (tx, rx) = oneshot::channel();
            st.pending = Some(tx);
            if st.phase == SessionPhase::Idle {
                st.phase = SessionPhase::Processing;
            }
            // While initializing, the phase flips on the init frame:
            // the worker only emits init after its first stdin bytes.
            rx
        };

        let line = UserFrame::new(content).to_line()?;
        {
            let mut guard = self.stdin.lock().await;
            let Some(stdin) = guard.as_mut() else {
                self.clear_pending();
                return Err(WorkerError::SessionDead);
            };
            let write = async {
                stdin.write_all(&line).await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                // A broken stdin pipe means the process is gone.
                let mut st = self.lock_state();
                st.pending = None;
                st.phase = SessionPhase::Dead;
                return Err(WorkerError::Io(e));
            }
        }

        let secs = timeout.as_secs().max(1);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a reply: the session died between
            // the write and the result.
            Ok(Err(_)) => Err(WorkerError::SessionDead),
            Err(_) => {
                let mut st = self.lock_state();
                st.pending = None;
                if st.phase == SessionPhase::Processing {
                    st.phase = SessionPhase::Idle;
                }
                Err(WorkerError::Timeout(secs))
            }
        }
    }

    /// Terminate the worker: SIGTERM to the process group now, SIGKILL
    /// after the grace period. Idempotent.
    pub async fn destroy(&self) {
        let first = {
            let mut st = self.lock_state();
            if st.phase == SessionPhase::Dead {
                false
            } else {
                st.phase = SessionPhase::Dead;
                if let Some(tx) = st.pending.take() {
                    let _ = tx.send(Err(WorkerError::SessionDead));
                }
                st.init_waiters.clear();
                true
            }
        };
        if !first {
            return;
        }

        debug!(context_id = %self.shared.context_id, "destroying worker session");
        if let Some(pid) = self.shared.pid {
            process::terminate_group_with_escalation(pid as i64, self.shared.kill_grace);
        }
        // Closing stdin lets a well-behaved worker exit before the
        // signals land; the reader task reaps on EOF.
        self.stdin.lock().await.take();
    }

    /// Detach from the worker without killing it. The process keeps
    /// running as an orphan and may keep persisting its conversation;
    /// the parent can exit immediately. Idempotent.
    pub async fn release(&self) {
        {
            let mut st = self.lock_state();
            if st.released {
                return;
            }
            st.released = true;
            st.phase = SessionPhase::Dead;
            if let Some(tx) = st.pending.take() {
                let _ = tx.send(Err(WorkerError::SessionReleased));
            }
            st.init_waiters.clear();
        }

        debug!(context_id = %self.shared.context_id, pid = self.shared.pid, "releasing worker");
        // The pool must not be re-entered for a release.
        self.shared.on_death.lock().unwrap().take();
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_task.lock().unwrap().take() {
            handle.abort();
        }
        // EOF on stdin, then drop the handle entirely: the child is
        // not killed on drop, so this is a plain detach.
        self.stdin.lock().await.take();
        self.child.lock().unwrap().take();
    }

    /// Wait until the worker has reported its init frame. Returns
    /// immediately when the id is already known.
    pub async fn wait_ready(&self, timeout: Duration) -> WorkerResult<()> {
        let rx = {
            let mut st = self.lock_state();
            if st.worker_session_id.is_some() || st.phase == SessionPhase::Dead {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            st.init_waiters.push(tx);
            rx
        };
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| WorkerError::Timeout(timeout.as_secs().max(1)))?
            .map_err(|_| WorkerError::SessionDead)
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    pub fn is_alive(&self) -> bool {
        self.phase() != SessionPhase::Dead
    }

    /// Worker-assigned session identifier, known after init.
    pub fn worker_session_id(&self) -> Option<String> {
        self.lock_state().worker_session_id.clone()
    }

    pub fn model(&self) -> Option<String> {
        self.lock_state().model.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn context_id(&self) -> &str {
        &self.shared.context_id
    }

    pub fn agent_name(&self) -> &str {
        &self.shared.agent_name
    }

    /// Last captured stderr, truncated to `limit` bytes.
    pub fn stderr_tail(&self, limit: usize) -> String {
        let tail = self.shared.stderr_tail.lock().unwrap();
        let start = tail.len().saturating_sub(limit);
        String::from_utf8_lossy(&tail[start..]).into_owned()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.shared.state.lock().unwrap()
    }

    fn clear_pending(&self) {
        self.lock_state().pending = None;
    }
}

/// Consume worker stdout: accumulate a line buffer, dispatch complete
/// frames, and destroy the session when the buffer exceeds its cap
/// without a newline.
async fn read_stdout(mut stdout: ChildStdout, shared: Arc<Shared>, child: Arc<Mutex<Option<Child>>>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    handle_line(&shared, &line[..line.len() - 1]);
                }
                if buf.len() > shared.max_buffer_bytes {
                    on_buffer_overflow(&shared);
                    reap(&child);
                    return;
                }
            }
            Err(e) => {
                debug!(context_id = %shared.context_id, error = %e, "worker stdout read failed");
                break;
            }
        }
    }

    on_process_closed(&shared);
    reap(&child);
}

/// Keep the last few KiB of stderr for failure diagnosis.
async fn read_stderr(mut stderr: ChildStderr, shared: Arc<Shared>) {
    let mut chunk = [0u8; 2048];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut tail = shared.stderr_tail.lock().unwrap();
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
}

fn handle_line(shared: &Arc<Shared>, line: &[u8]) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    match wire::parse_line(line) {
        None => {
            warn!(context_id = %shared.context_id, "discarding non-JSON worker output line");
        }
        Some(WorkerFrame::Ignored) => {}
        Some(WorkerFrame::Malformed(reason)) => {
            warn!(context_id = %shared.context_id, %reason, "discarding malformed worker frame");
        }
        Some(WorkerFrame::Init(init)) => {
            let mut st = shared.state.lock().unwrap();
            if st.phase == SessionPhase::Dead {
                return;
            }
            debug!(context_id = %shared.context_id, session_id = %init.session_id, "worker init");
            st.worker_session_id = Some(init.session_id);
            if init.model.is_some() {
                st.model = init.model;
            }
            if st.phase == SessionPhase::Initializing {
                // A send issued during initialization is already
                // pending; the init frame moves us straight into
                // processing in that case.
                st.phase = if st.pending.is_some() {
                    SessionPhase::Processing
                } else {
                    SessionPhase::Idle
                };
            }
            for waiter in st.init_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        Some(WorkerFrame::Result(frame)) => {
            let (pending, model) = {
                let mut st = shared.state.lock().unwrap();
                if st.phase == SessionPhase::Dead {
                    return;
                }
                if !frame.session_id.is_empty() {
                    st.worker_session_id = Some(frame.session_id.clone());
                }
                st.phase = SessionPhase::Idle;
                (st.pending.take(), st.model.clone())
            };
            match pending {
                Some(tx) => {
                    let reply = WorkerReply {
                        text: frame.result.unwrap_or_default(),
                        session_id: frame.session_id,
                        is_error: frame.is_error,
                        duration_ms: frame.duration_ms,
                        duration_api_ms: frame.duration_api_ms,
                        num_turns: frame.num_turns,
                        total_cost_usd: frame.total_cost_usd,
                        usage: frame.usage,
                        permission_denials: frame.permission_denials,
                        model,
                    };
                    let _ = tx.send(Ok(reply));
                }
                None => {
                    debug!(context_id = %shared.context_id, "late result discarded");
                }
            }
        }
    }
}

fn on_buffer_overflow(shared: &Arc<Shared>) {
    warn!(
        context_id = %shared.context_id,
        limit = shared.max_buffer_bytes,
        "worker stdout exceeded buffer cap, destroying session"
    );
    {
        let mut st = shared.state.lock().unwrap();
        st.phase = SessionPhase::Dead;
        if let Some(tx) = st.pending.take() {
            let _ = tx.send(Err(WorkerError::BufferOverflow(shared.max_buffer_bytes)));
        }
        st.init_waiters.clear();
    }
    if let Some(pid) = shared.pid {
        process::terminate_group_with_escalation(pid as i64, shared.kill_grace);
    }
    fire_death_callback(shared);
}

fn on_process_closed(shared: &Arc<Shared>) {
    {
        let mut st = shared.state.lock().unwrap();
        if st.released {
            return;
        }
        if st.phase != SessionPhase::Dead {
            debug!(context_id = %shared.context_id, "worker process closed");
        }
        st.phase = SessionPhase::Dead;
        if let Some(tx) = st.pending.take() {
            let _ = tx.send(Err(WorkerError::ProcessExited));
        }
        st.init_waiters.clear();
    }
    fire_death_callback(shared);
}

fn fire_death_callback(shared: &Arc<Shared>) {
    if let Some(callback) = shared.on_death.lock().unwrap().take() {
        callback(&shared.context_id);
    }
}

fn reap(child: &Arc<Mutex<Option<Child>>>) {
    if let Some(mut child) = child.lock().unwrap().take() {
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }
}

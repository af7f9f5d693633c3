//! PTY session management.
//!
//! This module provides the core PTY spawning and I/O functionality.
//! A session owns a single shell process attached to a pseudo-terminal and
//! belongs to exactly one client connection.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::Dimensions;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::SessionConfig;

/// Identity of the client connection a session belongs to.
pub type ConnectionId = String;

/// Output chunks produced by a session, in the order the process wrote them.
pub type OutputStream = mpsc::Receiver<Vec<u8>>;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session exists for the connection.
    #[error("session not found: {0}")]
    NotFound(ConnectionId),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(ConnectionId),

    /// Failed to allocate the pty or spawn the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// The configured session limit is reached.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    /// The session was removed while it was being created.
    #[error("session creation cancelled: {0}")]
    Cancelled(ConnectionId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// The process is being spawned.
    Starting = 0,
    /// The process is running and its output is being read.
    Running = 1,
    /// Termination is in progress.
    Closing = 2,
    /// The process has exited or was killed.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Starting,
            1 => SessionState::Running,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Whether the session can still accept input.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }
}

/// Snapshot of a session for listing and logging.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Connection the session belongs to.
    pub id: ConnectionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current pty size.
    pub dimensions: Dimensions,
    /// Lifecycle state.
    pub state: SessionState,
    /// When the session was created.
    pub created_at: SystemTime,
    /// Time since the last input or output.
    pub idle: Duration,
}

/// A shell process attached to a pseudo-terminal.
///
/// Implementations must be safe to share between the connection handler,
/// the output pump and the registry reaper.
pub trait ProcessSession: Send + Sync + 'static {
    /// Connection this session belongs to.
    fn id(&self) -> &ConnectionId;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Current pty size.
    fn dimensions(&self) -> Dimensions;

    /// Queues bytes for the process input. Never blocks on the process.
    fn write_input(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Applies new pty dimensions.
    ///
    /// Returns `Ok(false)` without touching the pty when the size is unchanged.
    fn resize(&self, dims: Dimensions) -> Result<bool, SessionError>;

    /// Takes the output stream. Only the first call returns `Some`.
    fn take_output(&self) -> Option<OutputStream>;

    /// Kills the process and releases the pty. Safe to call repeatedly.
    fn terminate(&self) -> Result<(), SessionError>;

    /// Exit code of the process, if it has exited.
    fn exit_code(&self) -> Option<i32>;

    /// Time since the last input or output.
    fn idle_for(&self) -> Duration;

    /// Snapshot for listing.
    fn info(&self) -> SessionInfo;
}

/// Creates sessions for the registry.
pub trait SessionFactory: Send + Sync + 'static {
    /// Session type produced by this factory.
    type Session: ProcessSession;

    /// Spawns a session. May block; the registry calls it off the async runtime.
    fn spawn(&self, id: ConnectionId, dims: Dimensions) -> Result<Self::Session, SessionError>;
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Default number of output chunks buffered before the reader blocks.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 64;

/// Input chunks queued for a process that is not reading.
const INPUT_QUEUE_CAPACITY: usize = 256;

/// How often the shell is checked for having exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time left to leftover jobs between SIGHUP and SIGKILL.
const HANGUP_GRACE: Duration = Duration::from_millis(200);

/// The program, arguments and environment used to start a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Shell program path or name.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory. Inherited when unset.
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    /// Creates a command for the given program with no extra arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Builds the shell command described by the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            program: config.default_shell.clone(),
            args: config.shell_args.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: config.cwd.clone(),
        }
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }

        // Browser terminals speak xterm; configured env may still override it.
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

/// A PTY session with a shell process.
pub struct PtySession {
    /// Connection this session belongs to.
    id: ConnectionId,

    /// The PTY master handle. Taken on termination to release the device.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// Input queue drained by the writer task.
    input_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,

    /// The child process, shared with the exit watcher.
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,

    /// Output receiver, handed out once.
    output_rx: Mutex<Option<OutputStream>>,

    /// Lifecycle state, shared with the reader task.
    state: Arc<AtomicU8>,

    /// Set once termination has started.
    terminated: Arc<AtomicBool>,

    /// Current terminal size.
    dims: Mutex<Dimensions>,

    /// Last input or output (Unix epoch milliseconds).
    last_activity: Arc<AtomicU64>,

    /// Exit code once the process has been reaped.
    exit_code: Arc<Mutex<Option<i32>>>,

    /// Process ID.
    pid: Option<u32>,

    /// Creation time.
    created_at: SystemTime,
}

impl PtySession {
    /// Spawns a shell on a fresh pty and starts reading its output.
    ///
    /// Must be called from within a Tokio runtime; the reader runs on the
    /// blocking pool.
    pub fn spawn(
        id: ConnectionId,
        command: &ShellCommand,
        dims: Dimensions,
        output_capacity: usize,
    ) -> Result<Self, SessionError> {
        // An exec failure after fork would only surface as output, so check first.
        let program = resolve_program(command)?;
        tracing::debug!(program = %program.display(), "Resolved shell");

        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(dims))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| {
                SessionError::SpawnFailed(format!("{}: {}", command.program, e))
            })?;

        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(output_capacity.max(1));
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

        let session = PtySession {
            id,
            master: Mutex::new(Some(pair.master)),
            input_tx: Mutex::new(Some(input_tx)),
            child: Arc::new(Mutex::new(child)),
            output_rx: Mutex::new(Some(output_rx)),
            state: Arc::new(AtomicU8::new(SessionState::Starting as u8)),
            terminated: Arc::new(AtomicBool::new(false)),
            dims: Mutex::new(dims),
            last_activity: Arc::new(AtomicU64::new(now_millis())),
            exit_code: Arc::new(Mutex::new(None)),
            pid,
            created_at: SystemTime::now(),
        };

        session.start_read_loop(reader, output_tx);
        session.start_write_loop(writer, input_rx);
        session.start_exit_watch();
        session
            .state
            .store(SessionState::Running as u8, Ordering::SeqCst);

        tracing::info!(
            connection_id = %session.id,
            pid = ?pid,
            cols = dims.cols(),
            rows = dims.rows(),
            shell = %command.program,
            "Spawned shell"
        );

        Ok(session)
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Starts the blocking read loop that feeds the output channel.
    ///
    /// The channel is bounded: when the consumer falls behind, the loop
    /// blocks and the pty stops being drained, which in turn stalls the
    /// process once the kernel buffer fills.
    fn start_read_loop(&self, mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
        let state = Arc::clone(&self.state);
        let last_activity = Arc::clone(&self.last_activity);
        let connection_id = self.id.clone();

        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::info!(connection_id = %connection_id, "PTY EOF - process exited");
                        break;
                    }
                    Ok(n) => {
                        last_activity.store(now_millis(), Ordering::Relaxed);
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            tracing::debug!(
                                connection_id = %connection_id,
                                "Output receiver dropped, stopping reader"
                            );
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO on the master once the child is gone.
                        tracing::debug!(
                            connection_id = %connection_id,
                            error = %e,
                            "PTY read ended"
                        );
                        break;
                    }
                }
            }

            let _ = state.compare_exchange(
                SessionState::Running as u8,
                SessionState::Closed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        });
    }

    /// Starts the blocking loop that drains queued input into the pty.
    ///
    /// A process that stops reading only stalls this loop; callers of
    /// `write_input` keep returning immediately.
    fn start_write_loop(
        &self,
        mut writer: Box<dyn Write + Send>,
        mut input_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let connection_id = self.id.clone();

        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    tracing::debug!(connection_id = %connection_id, error = %e, "PTY write ended");
                    break;
                }
            }
        });
    }

    /// Watches for the shell exiting on its own.
    ///
    /// Jobs the shell left running keep the pty open, so the reader would
    /// never see EOF. Once the shell is gone they are hung up.
    fn start_exit_watch(&self) {
        let child = Arc::clone(&self.child);
        let exit_code = Arc::clone(&self.exit_code);
        let terminated = Arc::clone(&self.terminated);
        let connection_id = self.id.clone();
        let pid = self.pid;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if terminated.load(Ordering::SeqCst) {
                    return;
                }

                let status = lock(&child).try_wait();
                match status {
                    Ok(Some(status)) => {
                        *lock(&exit_code) = Some(status.exit_code() as i32);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "Exit watch failed");
                        return;
                    }
                }
            }

            let Some(pid) = pid else {
                return;
            };
            if signal_session(pid, false) > 0 {
                tracing::debug!(connection_id = %connection_id, pid, "Hung up jobs left by the shell");
                tokio::time::sleep(HANGUP_GRACE).await;
                signal_session(pid, true);
            }
        });
    }

    fn record_exit(&self, code: u32) -> i32 {
        let code = code as i32;
        *lock(&self.exit_code) = Some(code);
        code
    }
}

impl ProcessSession for PtySession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn dimensions(&self) -> Dimensions {
        *lock(&self.dims)
    }

    fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.state().is_live() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let guard = lock(&self.input_tx);
        let input = guard
            .as_ref()
            .ok_or_else(|| SessionError::AlreadyTerminated(self.id.clone()))?;
        input.try_send(data.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => {
                SessionError::WriteFailed("process is not reading its input".to_string())
            }
            TrySendError::Closed(_) => SessionError::AlreadyTerminated(self.id.clone()),
        })?;

        self.last_activity.store(now_millis(), Ordering::Relaxed);
        Ok(())
    }

    fn resize(&self, dims: Dimensions) -> Result<bool, SessionError> {
        let mut current = lock(&self.dims);
        if *current == dims {
            return Ok(false);
        }

        let master = lock(&self.master);
        let master = match master.as_ref() {
            Some(master) if self.state().is_live() => master,
            _ => return Err(SessionError::AlreadyTerminated(self.id.clone())),
        };
        master
            .resize(pty_size(dims))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *current = dims;

        tracing::debug!(
            connection_id = %self.id,
            cols = dims.cols(),
            rows = dims.rows(),
            "Resized PTY"
        );

        Ok(true)
    }

    fn take_output(&self) -> Option<OutputStream> {
        lock(&self.output_rx).take()
    }

    fn terminate(&self) -> Result<(), SessionError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state
            .store(SessionState::Closing as u8, Ordering::SeqCst);

        // Background jobs live in their own groups but share the session.
        if let Some(pid) = self.pid {
            signal_session(pid, false);
        }

        let result = {
            let mut child = lock(&self.child);
            let already_exited = matches!(child.try_wait(), Ok(Some(_)));
            if !already_exited {
                if let Err(e) = child.kill() {
                    tracing::debug!(connection_id = %self.id, error = %e, "Kill failed");
                }
            }
            child
                .wait()
                .map(|status| self.record_exit(status.exit_code()))
                .map_err(|e| SessionError::KillFailed(e.to_string()))
        };

        if let Some(pid) = self.pid {
            let killed = signal_session(pid, true);
            if killed > 0 {
                tracing::debug!(connection_id = %self.id, killed, "Killed leftover jobs");
            }
        }

        lock(&self.input_tx).take();
        lock(&self.master).take();
        lock(&self.output_rx).take();
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);

        match result {
            Ok(code) => {
                tracing::info!(connection_id = %self.id, exit_code = code, "Session terminated");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Session terminated uncleanly");
                Err(e)
            }
        }
    }

    fn exit_code(&self) -> Option<i32> {
        if let Some(code) = *lock(&self.exit_code) {
            return Some(code);
        }

        let status = lock(&self.child).try_wait().ok().flatten()?;
        Some(self.record_exit(status.exit_code()))
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.pid,
            dimensions: self.dimensions(),
            state: self.state(),
            created_at: self.created_at,
            idle: self.idle_for(),
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            tracing::warn!(connection_id = %self.id, error = %e, "Failed to terminate session on drop");
        }
    }
}

/// Spawns [`PtySession`]s with a fixed shell command.
#[derive(Debug, Clone)]
pub struct PtySpawner {
    command: ShellCommand,
    output_capacity: usize,
}

impl PtySpawner {
    /// Creates a spawner for the given command.
    pub fn new(command: ShellCommand) -> Self {
        Self {
            command,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }

    /// Builds a spawner from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(ShellCommand::from_config(config)).with_output_capacity(config.output_capacity)
    }

    /// Sets how many output chunks may be buffered per session.
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// The command this spawner runs.
    pub fn command(&self) -> &ShellCommand {
        &self.command
    }
}

impl SessionFactory for PtySpawner {
    type Session = PtySession;

    fn spawn(&self, id: ConnectionId, dims: Dimensions) -> Result<PtySession, SessionError> {
        PtySession::spawn(id, &self.command, dims, self.output_capacity)
    }
}

/// Finds the program the way exec would and checks it can run.
fn resolve_program(command: &ShellCommand) -> Result<PathBuf, SessionError> {
    let failed =
        |reason: String| SessionError::SpawnFailed(format!("{}: {}", command.program, reason));

    let cwd = match command.cwd {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| failed(e.to_string()))?,
    };
    let paths = command
        .env
        .iter()
        .rev()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| OsString::from(value))
        .or_else(|| std::env::var_os("PATH"));

    let program =
        which::which_in(&command.program, paths, &cwd).map_err(|e| failed(e.to_string()))?;

    let is_file = std::fs::metadata(&program)
        .map(|meta| meta.is_file())
        .map_err(|e| failed(e.to_string()))?;
    if !is_file {
        return Err(failed("not an executable file".to_string()));
    }
    Ok(program)
}

/// Signals every process in the session led by `leader`, returning how many
/// were reached. Sends SIGKILL when `force` is set and SIGHUP otherwise.
#[cfg(unix)]
fn signal_session(leader: u32, force: bool) -> usize {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getsid, Pid};

    let Ok(raw) = i32::try_from(leader) else {
        return 0;
    };
    let leader = Pid::from_raw(raw);
    let signal = if force { Signal::SIGKILL } else { Signal::SIGHUP };

    let mut reached = usize::from(killpg(leader, signal).is_ok());

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return reached;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
            continue;
        };
        let pid = Pid::from_raw(pid);
        if pid == leader || getsid(Some(pid)) != Ok(leader) {
            continue;
        }
        if kill(pid, signal).is_ok() {
            reached += 1;
        }
    }
    reached
}

#[cfg(not(unix))]
fn signal_session(_leader: u32, _force: bool) -> usize {
    0
}

fn pty_size(dims: Dimensions) -> PtySize {
    PtySize {
        rows: dims.rows(),
        cols: dims.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the current Unix timestamp in milliseconds.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh() -> ShellCommand {
        ShellCommand::new("/bin/sh")
    }

    fn dims(cols: i64, rows: i64) -> Dimensions {
        Dimensions::new(cols, rows).unwrap()
    }

    fn spawn_sh(id: &str) -> PtySession {
        PtySession::spawn(id.to_string(), &sh(), dims(80, 24), DEFAULT_OUTPUT_CAPACITY).unwrap()
    }

    async fn read_until(output: &mut OutputStream, marker: &str) -> bool {
        let mut seen = Vec::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), output.recv()).await {
                Ok(Some(data)) => {
                    seen.extend_from_slice(&data);
                    if String::from_utf8_lossy(&seen).contains(marker) {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_shell_command_from_config() {
        let mut config = SessionConfig::default();
        config.default_shell = "/bin/bash".to_string();
        config.shell_args = vec!["--noprofile".to_string()];
        config.env.insert("FOO".to_string(), "bar".to_string());
        config.cwd = Some(PathBuf::from("/tmp"));

        let cmd = ShellCommand::from_config(&config);
        assert_eq!(cmd.program, "/bin/bash");
        assert_eq!(cmd.args, vec!["--noprofile"]);
        assert_eq!(cmd.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_session_state_liveness() {
        assert!(SessionState::Starting.is_live());
        assert!(SessionState::Running.is_live());
        assert!(!SessionState::Closing.is_live());
        assert!(!SessionState::Closed.is_live());
    }

    #[tokio::test]
    async fn test_session_spawn() {
        let session = spawn_sh("conn-spawn");

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.dimensions(), dims(80, 24));
        assert!(session.pid().is_some());

        session.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_shell_fails() {
        let result = PtySession::spawn(
            "conn-missing".to_string(),
            &ShellCommand::new("/nonexistent/shell"),
            dims(80, 24),
            DEFAULT_OUTPUT_CAPACITY,
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_directory_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = PtySession::spawn(
            "conn-dir".to_string(),
            &ShellCommand::new(dir.path().display().to_string()),
            dims(80, 24),
            DEFAULT_OUTPUT_CAPACITY,
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_non_executable_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("not-a-shell");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        let result = PtySession::spawn(
            "conn-noexec".to_string(),
            &ShellCommand::new(script.display().to_string()),
            dims(80, 24),
            DEFAULT_OUTPUT_CAPACITY,
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[test]
    fn test_resolve_program_uses_path() {
        let mut command = ShellCommand::new("sh");
        command.env.push(("PATH".to_string(), "/bin:/usr/bin".to_string()));
        let program = resolve_program(&command).unwrap();
        assert!(program.is_absolute());
        assert!(program.ends_with("sh"));
    }

    #[tokio::test]
    async fn test_session_output_roundtrip() {
        let session = spawn_sh("conn-output");
        let mut output = session.take_output().unwrap();

        session.write_input(b"echo test_output_marker\n").unwrap();
        assert!(read_until(&mut output, "test_output_marker").await);

        session.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_take_output_only_once() {
        let session = spawn_sh("conn-take");
        assert!(session.take_output().is_some());
        assert!(session.take_output().is_none());
        session.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_session_env_vars() {
        let mut command = sh();
        command.env.push(("TEST_VAR".to_string(), "test_value".to_string()));
        let session =
            PtySession::spawn("conn-env".to_string(), &command, dims(80, 24), 16).unwrap();
        let mut output = session.take_output().unwrap();

        session.write_input(b"echo $TEST_VAR $TERM\n").unwrap();
        assert!(read_until(&mut output, "test_value xterm-256color").await);

        session.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_session_resize() {
        let session = spawn_sh("conn-resize");

        assert!(session.resize(dims(120, 40)).unwrap());
        assert_eq!(session.dimensions(), dims(120, 40));

        // Same size again is a no-op.
        assert!(!session.resize(dims(120, 40)).unwrap());

        session.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let session = spawn_sh("conn-kill");

        session.terminate().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        session.terminate().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_write_after_terminate_fails() {
        let session = spawn_sh("conn-write-dead");
        session.terminate().unwrap();

        let result = session.write_input(b"hello\n");
        assert!(matches!(result, Err(SessionError::AlreadyTerminated(_))));
    }

    #[tokio::test]
    async fn test_resize_after_terminate_fails() {
        let session = spawn_sh("conn-resize-dead");
        session.terminate().unwrap();

        let result = session.resize(dims(100, 50));
        assert!(matches!(result, Err(SessionError::AlreadyTerminated(_))));
        assert_eq!(session.dimensions(), dims(80, 24));
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let session = spawn_sh("conn-exit");
        let mut output = session.take_output().unwrap();

        session.write_input(b"exit 42\n").unwrap();

        // Drain until the reader reports EOF.
        let drained = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream did not end");

        session.terminate().unwrap();
        assert_eq!(session.exit_code(), Some(42));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_write_does_not_wait_for_reader() {
        let session = spawn_sh("conn-busy");
        let mut output = session.take_output().unwrap();

        session.write_input(b"sleep 30; echo WOKE\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Far more than the pty input buffer holds while nothing reads it.
        let line = format!("{}\n", "x".repeat(1023));
        let started = std::time::Instant::now();
        for _ in 0..64 {
            session.write_input(line.as_bytes()).unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        let started = std::time::Instant::now();
        tokio::task::spawn_blocking(move || session.terminate())
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let drained = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream did not end");
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        // Killed jobs may linger as zombies when nothing reaps orphans.
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn background_pid(output: &mut OutputStream) -> u32 {
        let mut seen = String::new();
        timeout(Duration::from_secs(5), async {
            loop {
                let data = output.recv().await.expect("output ended");
                seen.push_str(&String::from_utf8_lossy(&data));
                let pid = seen.split("BGPID=").nth(1).and_then(|rest| {
                    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                    rest[digits.len()..].starts_with(|c: char| c.is_whitespace()).then_some(digits)
                });
                if let Some(pid) = pid.and_then(|d| d.parse().ok()) {
                    return pid;
                }
            }
        })
        .await
        .expect("background job did not report its pid")
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_background_jobs() {
        let session = spawn_sh("conn-bg");
        let mut output = session.take_output().unwrap();

        session.write_input(b"sleep 4242 & echo BG\"PID=\"$!\n").unwrap();
        let pid = background_pid(&mut output).await;
        assert!(is_running(pid));

        session.terminate().unwrap();

        assert!(wait_until_gone(pid).await, "background job {} survived", pid);
        let drained = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream did not end");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_exit_with_background_job_ends_output() {
        let session = spawn_sh("conn-bg-exit");
        let mut output = session.take_output().unwrap();

        session.write_input(b"sleep 4243 & echo BG\"PID=\"$!\n").unwrap();
        let pid = background_pid(&mut output).await;
        session.write_input(b"exit 3\n").unwrap();

        let drained = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream did not end");
        assert!(wait_until_gone(pid).await, "background job {} survived", pid);

        session.terminate().unwrap();
        assert_eq!(session.exit_code(), Some(3));
    }
}

//! In-memory sessions for exercising the registry and relay without a pty.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use protocol::Dimensions;
use tokio::sync::mpsc;

use super::pty::{
    lock, ConnectionId, OutputStream, ProcessSession, SessionError, SessionFactory, SessionInfo,
    SessionState,
};

/// Records what the relay did to the sessions a [`MockFactory`] produced.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    spawned: AtomicUsize,
    terminated: AtomicUsize,
    resizes: Mutex<Vec<Dimensions>>,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    pub(crate) fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn resizes(&self) -> Vec<Dimensions> {
        lock(&self.resizes).clone()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }
}

/// A fake shell that echoes its input back as output.
pub(crate) struct MockSession {
    id: ConnectionId,
    recorder: Arc<Recorder>,
    dims: Mutex<Dimensions>,
    exited: AtomicBool,
    terminated: AtomicBool,
    output_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_rx: Mutex<Option<OutputStream>>,
    exit_code: Mutex<Option<i32>>,
    idle: Mutex<Duration>,
    created_at: SystemTime,
}

impl MockSession {
    /// Pretends nothing has happened on the session for `idle`.
    pub(crate) fn set_idle(&self, idle: Duration) {
        *lock(&self.idle) = idle;
    }

    /// Queues output as if the process had written it.
    pub(crate) fn emit(&self, data: &[u8]) -> bool {
        match lock(&self.output_tx).as_ref() {
            Some(tx) => tx.try_send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulates the process exiting on its own.
    pub(crate) fn exit(&self, code: i32) {
        *lock(&self.exit_code) = Some(code);
        self.exited.store(true, Ordering::SeqCst);
        lock(&self.output_tx).take();
    }
}

impl ProcessSession for MockSession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> SessionState {
        if self.exited.load(Ordering::SeqCst) || self.terminated.load(Ordering::SeqCst) {
            SessionState::Closed
        } else {
            SessionState::Running
        }
    }

    fn dimensions(&self) -> Dimensions {
        *lock(&self.dims)
    }

    fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.state().is_live() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        lock(&self.recorder.writes).push(data.to_vec());
        self.emit(data);
        Ok(())
    }

    fn resize(&self, dims: Dimensions) -> Result<bool, SessionError> {
        if !self.state().is_live() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        let mut current = lock(&self.dims);
        if *current == dims {
            return Ok(false);
        }
        *current = dims;
        lock(&self.recorder.resizes).push(dims);
        Ok(true)
    }

    fn take_output(&self) -> Option<OutputStream> {
        lock(&self.output_rx).take()
    }

    fn terminate(&self) -> Result<(), SessionError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.recorder.terminated.fetch_add(1, Ordering::SeqCst);
        lock(&self.output_tx).take();
        lock(&self.exit_code).get_or_insert(0);
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    fn idle_for(&self) -> Duration {
        *lock(&self.idle)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: None,
            dimensions: self.dimensions(),
            state: self.state(),
            created_at: self.created_at,
            idle: self.idle_for(),
        }
    }
}

/// Produces [`MockSession`]s and counts spawns.
#[derive(Debug, Default)]
pub(crate) struct MockFactory {
    recorder: Arc<Recorder>,
    fail: bool,
    delay: Duration,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every spawn fails as if the shell binary were missing.
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Blocks each spawn for `delay` of wall-clock time.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }
}

impl SessionFactory for MockFactory {
    type Session = MockSession;

    fn spawn(&self, id: ConnectionId, dims: Dimensions) -> Result<MockSession, SessionError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(SessionError::SpawnFailed("/nonexistent/shell: not found".to_string()));
        }
        self.recorder.spawned.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        Ok(MockSession {
            id,
            recorder: Arc::clone(&self.recorder),
            dims: Mutex::new(dims),
            exited: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            output_tx: Mutex::new(Some(tx)),
            output_rx: Mutex::new(Some(rx)),
            exit_code: Mutex::new(None),
            idle: Mutex::new(Duration::ZERO),
            created_at: SystemTime::now(),
        })
    }
}

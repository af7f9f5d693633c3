//! Registry of live sessions, keyed by connection.
//!
//! Each connection owns at most one session. Creation for a given id goes
//! through a per-id [`OnceCell`] so that concurrent requests spawn a single
//! process and all observe the same instance.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::Dimensions;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pty::{ConnectionId, ProcessSession, SessionError, SessionFactory, SessionInfo};

/// One registry entry. Holds a capacity permit for as long as it exists.
struct Slot<S> {
    cell: OnceCell<Arc<S>>,
    _permit: OwnedSemaphorePermit,
}

/// Thread-safe map from connection id to its session.
pub struct SessionRegistry<F: SessionFactory> {
    factory: Arc<F>,
    sessions: DashMap<ConnectionId, Arc<Slot<F::Session>>>,
    capacity: Arc<Semaphore>,
    max_sessions: usize,
}

impl<F: SessionFactory> SessionRegistry<F> {
    /// Creates an empty registry that admits at most `max_sessions` entries.
    pub fn new(factory: F, max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            factory: Arc::new(factory),
            sessions: DashMap::new(),
            capacity: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        }
    }

    /// Returns the live session for `id`, spawning one if there is none.
    ///
    /// Concurrent calls for the same id wait on the same creation. A session
    /// that has already closed is discarded and replaced.
    pub async fn get_or_create(
        &self,
        id: &ConnectionId,
        dims: Dimensions,
    ) -> Result<Arc<F::Session>, SessionError> {
        loop {
            let slot = self.slot(id)?;

            let created = slot
                .cell
                .get_or_try_init(|| self.spawn(id.clone(), dims))
                .await;

            let session = match created {
                Ok(session) => Arc::clone(session),
                Err(e) => {
                    self.sessions
                        .remove_if(id, |_, s| Arc::ptr_eq(s, &slot) && !s.cell.initialized());
                    return Err(e);
                }
            };

            if !self.is_current(id, &slot) {
                // Removed while the process was starting.
                terminate(session).await;
                return Err(SessionError::Cancelled(id.clone()));
            }

            if session.state().is_live() {
                return Ok(session);
            }

            tracing::debug!(connection_id = %id, "Replacing closed session");
            self.sessions.remove_if(id, |_, s| Arc::ptr_eq(s, &slot));
            terminate(session).await;
        }
    }

    /// Terminates and forgets the session for `id`.
    ///
    /// Returns whether an entry existed. Calling it again is a no-op. An entry
    /// whose process is still starting is dropped here and terminated by the
    /// creator once the spawn completes.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let Some((_, slot)) = self.sessions.remove(id) else {
            return false;
        };

        if let Some(session) = slot.cell.get() {
            terminate(Arc::clone(session)).await;
        }
        tracing::debug!(connection_id = %id, "Removed session");
        true
    }

    /// Looks up the session for `id`.
    pub fn find(&self, id: &ConnectionId) -> Result<Arc<F::Session>, SessionError> {
        self.sessions
            .get(id)
            .and_then(|slot| slot.cell.get().cloned())
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Number of sessions whose process has been spawned.
    pub fn count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().cell.initialized())
            .count()
    }

    /// Configured session limit.
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Snapshots of every spawned session.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.spawned()
            .into_iter()
            .map(|(_, _, session)| session.info())
            .collect()
    }

    /// Reaps sessions whose process has exited, and sessions idle for longer
    /// than `idle_timeout` when one is given. Returns how many were removed.
    pub async fn cleanup(&self, idle_timeout: Option<Duration>) -> usize {
        let mut removed = 0;

        for (id, slot, session) in self.spawned() {
            let exited = !session.state().is_live();
            let idle = idle_timeout.is_some_and(|limit| session.idle_for() > limit);
            if !exited && !idle {
                continue;
            }

            if self
                .sessions
                .remove_if(&id, |_, s| Arc::ptr_eq(s, &slot))
                .is_some()
            {
                terminate(session).await;
                removed += 1;
                tracing::info!(connection_id = %id, exited, idle, "Reaped session");
            }
        }

        removed
    }

    /// Runs [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.cleanup(idle_timeout).await;
                        if removed > 0 {
                            tracing::debug!(removed, remaining = registry.count(), "Cleanup pass");
                        }
                    }
                }
            }
            tracing::debug!("Session cleanup task stopped");
        })
    }

    /// Terminates every session. Returns how many entries were dropped.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let removed = join_all(ids.iter().map(|id| self.remove(id)))
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count();
        if removed > 0 {
            tracing::info!(removed, "Terminated all sessions");
        }
        removed
    }

    fn slot(&self, id: &ConnectionId) -> Result<Arc<Slot<F::Session>>, SessionError> {
        if let Some(slot) = self.sessions.get(id) {
            return Ok(Arc::clone(slot.value()));
        }

        let permit = Arc::clone(&self.capacity)
            .try_acquire_owned()
            .map_err(|_| SessionError::LimitReached(self.max_sessions))?;

        let slot = self.sessions.entry(id.clone()).or_insert_with(|| {
            Arc::new(Slot {
                cell: OnceCell::new(),
                _permit: permit,
            })
        });
        Ok(Arc::clone(slot.value()))
    }

    fn is_current(&self, id: &ConnectionId, slot: &Arc<Slot<F::Session>>) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Collects spawned entries without holding map guards afterwards.
    #[allow(clippy::type_complexity)]
    fn spawned(&self) -> Vec<(ConnectionId, Arc<Slot<F::Session>>, Arc<F::Session>)> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().cell.get()?;
                Some((
                    entry.key().clone(),
                    Arc::clone(entry.value()),
                    Arc::clone(session),
                ))
            })
            .collect()
    }

    async fn spawn(
        &self,
        id: ConnectionId,
        dims: Dimensions,
    ) -> Result<Arc<F::Session>, SessionError> {
        let factory = Arc::clone(&self.factory);
        let session = tokio::task::spawn_blocking(move || factory.spawn(id, dims))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))??;
        Ok(Arc::new(session))
    }
}

/// Terminates on the blocking pool; killing and reaping a shell can take a while.
async fn terminate<S: ProcessSession>(session: Arc<S>) {
    let id = session.id().clone();
    let result = tokio::task::spawn_blocking(move || session.terminate()).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(connection_id = %id, error = %e, "Failed to terminate session");
        }
        Err(e) => {
            tracing::error!(connection_id = %id, error = %e, "Terminate task failed");
        }
    }
}

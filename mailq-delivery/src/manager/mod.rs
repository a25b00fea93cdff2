//! Lifecycle and control surface of the delivery queue.
//!
//! ```text
//! Stopped -> Starting -> Running -> Draining -> Stopped
//! ```
//!
//! `start` launches the poll loop (see [`poll`]); `stop` asks it to drain and
//! waits for the drain to finish. A store failure while polling also drains
//! the queue, and the error is handed to whoever is blocked in `wait`; so
//! does a panic in the poll loop itself.

mod poll;

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use mailq_common::{Signal, internal};
use mailq_store::{NewQueueItem, PayloadRef, QueueItem, QueueStore};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    sync::{Semaphore, broadcast, watch},
    task::JoinHandle,
};

use crate::{
    Event, EventBus, EventSink, EventType, MailTransport, ManagerError, QueueConfig, SystemError,
    Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Draining,
}

impl Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
        })
    }
}

/// How a drain ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Deliveries that finished while draining
    pub completed: usize,
    /// Deliveries cut off at the deadline; their leases are left to expire
    pub abandoned: usize,
}

/// State shared between the control surface and the poll loop
struct Shared {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    worker: Worker,
    events: EventBus,
    owner: String,
    state: watch::Sender<ManagerState>,
    slots: Arc<Semaphore>,
    fatal: Mutex<Option<ManagerError>>,
    drain_timeout: Mutex<Duration>,
}

impl Shared {
    /// Atomic `from -> to`; fails with the state actually found.
    fn transition(
        &self,
        operation: &'static str,
        from: ManagerState,
        to: ManagerState,
    ) -> Result<(), ManagerError> {
        let mut found = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                found = *state;
                false
            }
        });

        if changed {
            Ok(())
        } else {
            Err(ManagerError::InvalidState {
                operation,
                state: found,
            })
        }
    }
}

struct Control {
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<DrainReport>,
}

/// Polls a [`QueueStore`] for due items and delivers them through a bounded
/// pool of [`Worker`]s.
///
/// At most `num_workers` items are in flight at any time. Items are only
/// ever touched under a lease owned by this manager, so several managers
/// (in one process or many) may share a store.
pub struct QueueManager {
    shared: Arc<Shared>,
    control: Mutex<Option<Control>>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("owner", &self.shared.owner)
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// # Errors
    /// If `config` fails validation
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        let owner = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("mailq-{}", ulid::Ulid::new()));
        let rng = config
            .retry_seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        let events = EventBus::new(sink, config.emit_events);
        let worker = Worker::new(
            Arc::clone(&store),
            transport,
            events.clone(),
            config.retry_policy(),
            rng,
        );

        internal!(
            level = DEBUG,
            "Queue manager {owner} configured with {} workers",
            config.num_workers
        );

        Ok(Self {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(config.num_workers)),
                drain_timeout: Mutex::new(config.shutdown_timeout()),
                state: watch::Sender::new(ManagerState::Stopped),
                fatal: Mutex::new(None),
                config,
                store,
                worker,
                events,
                owner,
            }),
            control: Mutex::new(None),
        })
    }

    /// Reclaim abandoned leases and start polling.
    ///
    /// # Errors
    /// `InvalidState` unless stopped, or the store error that prevented the
    /// initial reclaim (the manager is then left stopped)
    pub async fn start(&self) -> Result<(), ManagerError> {
        let shared = &self.shared;
        shared.transition("start", ManagerState::Stopped, ManagerState::Starting)?;
        shared.fatal.lock().take();
        *shared.drain_timeout.lock() = shared.config.shutdown_timeout();

        if let Err(err) = shared.reclaim().await {
            shared.state.send_replace(ManagerState::Stopped);
            return Err(err.into());
        }

        shared
            .events
            .emit_with(|| Event::new(EventType::QueueStarted).with_metadata("owner", &shared.owner));

        let (shutdown, receiver) = broadcast::channel(4);
        let handle = tokio::spawn(Arc::clone(shared).supervise(receiver));
        *self.control.lock() = Some(Control { shutdown, handle });

        // The loop may already have failed and stopped on its own.
        let _ = shared.transition("start", ManagerState::Starting, ManagerState::Running);
        internal!(level = INFO, "Queue manager {} started", shared.owner);

        Ok(())
    }

    /// Stop polling and wait up to `timeout` for in-flight deliveries.
    ///
    /// Deliveries still running at the deadline are reported as abandoned
    /// and left to finish in the background. Each records its own outcome
    /// under its lease and holds its worker slot until it does.
    ///
    /// # Errors
    /// `InvalidState` unless running. A poll loop that panicked is reported
    /// through [`wait`](Self::wait) instead.
    pub async fn stop(&self, timeout: Duration) -> Result<DrainReport, ManagerError> {
        self.shared
            .transition("stop", ManagerState::Running, ManagerState::Draining)?;
        *self.shared.drain_timeout.lock() = timeout;

        let control = self.control.lock().take();
        let Some(Control { shutdown, handle }) = control else {
            // Unreachable while the state machine holds: `Running` is only
            // entered with a poll loop in place.
            return Ok(DrainReport::default());
        };

        // The loop may have exited already after a store failure.
        let _ = shutdown.send(Signal::Shutdown);

        handle
            .await
            .map_err(|err| ManagerError::System(SystemError::Task(err)))
    }

    /// Wait until the manager is stopped.
    ///
    /// Returns immediately when it has not been started.
    ///
    /// # Errors
    /// The store failure that stopped the queue, if that is why it stopped.
    /// It is reported once.
    pub async fn wait(&self) -> Result<(), ManagerError> {
        let mut state = self.shared.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = state
            .wait_for(|state| *state == ManagerState::Stopped)
            .await;

        self.shared.fatal.lock().take().map_or(Ok(()), Err)
    }

    /// Add a message to the queue with the configured retry budget.
    ///
    /// # Errors
    /// If the store rejects the item
    pub async fn enqueue(&self, payload_ref: impl Into<PayloadRef>) -> Result<QueueItem, ManagerError> {
        let item = NewQueueItem::new(payload_ref, self.shared.config.max_retries);
        Ok(self.shared.store.enqueue(item).await?)
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Deliveries currently holding a worker slot
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.config.num_workers - self.shared.slots.available_permits()
    }

    /// Lease owner identity used for every claim
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.shared.owner
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.shared.store
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if let Some(control) = self.control.get_mut().take() {
            let _ = control.shutdown.send(Signal::Shutdown);
        }
    }
}

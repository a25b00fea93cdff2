//! The poll loop: claim due items, hand them to workers, reclaim abandoned
//! leases, and drain on the way out.

use std::{sync::Arc, time::Duration};

use mailq_common::{Signal, internal};
use mailq_store::StoreError;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::{JoinError, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, warn};

use super::{DrainReport, ManagerState, Shared};
use crate::{Event, EventType, SystemError, WorkOutcome};

/// Roughly thirty years from now, for timers whose period overflows `Instant`.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

impl Shared {
    /// Run the poll loop on a task of its own, so that the manager still
    /// reaches `Stopped` and reports the failure if the loop panics.
    pub(super) async fn supervise(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) -> DrainReport {
        match tokio::spawn(Arc::clone(&self).run(shutdown)).await {
            Ok(report) => report,
            Err(err) => {
                error!("Poll loop for {} failed: {err}", self.owner);
                *self.fatal.lock() = Some(SystemError::Task(err).into());

                let report = DrainReport::default();
                self.stopped(report);
                report
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) -> DrainReport {
        internal!("Poll loop for {} starting", self.owner);

        let mut workers = JoinSet::new();

        let mut poll_timer = tokio::time::interval(self.config.poll_interval());
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reclaim_interval = self.config.reclaim_interval();
        let first_reclaim = Instant::now()
            .checked_add(reclaim_interval)
            .unwrap_or_else(far_future);
        let mut reclaim_timer = tokio::time::interval_at(first_reclaim, reclaim_interval);
        reclaim_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let drain_timeout = 'poll: loop {
            tokio::select! {
                biased;

                sig = shutdown.recv() => break 'poll self.shutdown_requested(sig),
                _ = poll_timer.tick() => {
                    // A fetch may be cut short by shutdown; anything it had
                    // already claimed stays leased until reclaimed.
                    let dispatched = tokio::select! {
                        biased;

                        sig = shutdown.recv() => break 'poll self.shutdown_requested(sig),
                        dispatched = self.dispatch(&mut workers) => dispatched,
                    };

                    if let Err(err) = dispatched {
                        self.fail(err);
                        break 'poll self.config.shutdown_timeout();
                    }
                }
                _ = reclaim_timer.tick() => {
                    let reclaimed = tokio::select! {
                        biased;

                        sig = shutdown.recv() => break 'poll self.shutdown_requested(sig),
                        reclaimed = self.reclaim() => reclaimed,
                    };

                    if let Err(err) = reclaimed {
                        self.fail(err);
                        break 'poll self.config.shutdown_timeout();
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    Self::finished(joined);
                }
            }
        };

        let report = self.drain(workers, drain_timeout).await;
        self.stopped(report);

        report
    }

    /// Log the shutdown request and return the drain deadline `stop` set.
    fn shutdown_requested(&self, signal: Result<Signal, RecvError>) -> Duration {
        match signal {
            Ok(Signal::Shutdown) => {
                internal!(level = INFO, "Queue manager {} received shutdown signal", self.owner);
            }
            Err(e) => {
                warn!("Queue manager shutdown channel error: {e}");
            }
        }

        *self.drain_timeout.lock()
    }

    fn stopped(&self, report: DrainReport) {
        self.events.emit_with(|| {
            Event::new(EventType::QueueStopped)
                .with_metadata("owner", &self.owner)
                .with_metadata("completed", report.completed)
                .with_metadata("abandoned", report.abandoned)
        });
        self.state.send_replace(ManagerState::Stopped);
        internal!(level = INFO, "Queue manager {} stopped", self.owner);
    }

    /// Claim as much due work as there are free slots.
    ///
    /// Keeps fetching while every fetch comes back full and slots remain, so
    /// a backlog does not wait a poll interval per batch.
    async fn dispatch(&self, workers: &mut JoinSet<WorkOutcome>) -> Result<(), StoreError> {
        loop {
            let free = self.slots.available_permits();
            if free == 0 {
                return Ok(());
            }

            let limit = free.min(self.config.batch_size);
            let items = self.store.fetch_due(limit, &self.owner).await?;
            let fetched = items.len();

            if fetched > 0 {
                debug!(fetched, limit, "Dispatching due items");
            }

            for item in items {
                // Only this loop takes slots, and it counted them above.
                let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                    error!(id = %item.id, "No free worker slot for a claimed item; leaving it to be reclaimed");
                    continue;
                };

                let worker = self.worker.clone();
                workers.spawn(async move {
                    let outcome = worker.process(item).await;
                    drop(permit);
                    outcome
                });
            }

            if fetched < limit {
                return Ok(());
            }
        }
    }

    pub(super) async fn reclaim(&self) -> Result<(), StoreError> {
        let released = self
            .store
            .release_stale_claims(self.config.lease_timeout())
            .await?;

        if !released.is_empty() {
            internal!(
                level = INFO,
                "Reclaimed {} abandoned lease(s): {released:?}",
                released.len()
            );
        }

        Ok(())
    }

    fn fail(&self, err: StoreError) {
        error!("Queue store failed, stopping queue manager {}: {err}", self.owner);
        *self.fatal.lock() = Some(err.into());
        self.state.send_replace(ManagerState::Draining);
    }

    fn finished(joined: Result<WorkOutcome, JoinError>) {
        match joined {
            Ok(outcome) => internal!("Worker finished: {outcome:?}"),
            Err(err) if err.is_panic() => error!("Worker task panicked: {err}"),
            Err(_) => {}
        }
    }

    /// Wait up to `timeout` for in-flight deliveries.
    ///
    /// Deliveries still running at the deadline are detached rather than
    /// cancelled: each one finishes its transport call and records the
    /// outcome under its own lease, and keeps its worker slot until then.
    async fn drain(&self, mut workers: JoinSet<WorkOutcome>, timeout: Duration) -> DrainReport {
        let mut report = DrainReport::default();

        if workers.is_empty() {
            return report;
        }

        internal!(
            level = INFO,
            "Waiting up to {timeout:?} for {} in-flight deliveries",
            workers.len()
        );

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = workers.join_next().await {
                Self::finished(joined);
                report.completed += 1;
            }
        })
        .await;

        if drained.is_err() {
            report.abandoned = workers.len();
            warn!(
                abandoned = report.abandoned,
                "Drain timeout exceeded; remaining deliveries will finish in the background"
            );
            workers.detach_all();
        } else {
            internal!(level = INFO, "All in-flight deliveries completed");
        }

        report
    }
}

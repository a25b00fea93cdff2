//! One delivery attempt for one claimed item.

use std::{panic::AssertUnwindSafe, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use mailq_common::{internal, outgoing};
use mailq_store::{ItemStatus, Lease, QueueItem, QueueStore, StoreError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use tracing::warn;

use crate::{
    Event, EventBus, EventType, MailTransport, RetryDecision, RetryPolicy, TransportError,
};

/// What happened to an item handed to [`Worker::process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Sent,
    Deferred { next_attempt_at: DateTime<Utc> },
    DeadLettered,
    /// Nothing could be recorded for this attempt. Any lease still held is
    /// left to expire and be reclaimed.
    Abandoned,
}

/// Runs delivery attempts and records their outcome.
///
/// Every failure that concerns a single item (transport errors, a lost
/// lease, a panicking transport) ends up as a state transition or a
/// `worker_error` event; nothing is returned as an error.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    events: EventBus,
    policy: RetryPolicy,
    rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("store", &self.store)
            .field("events", &self.events)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        events: EventBus,
        policy: RetryPolicy,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            policy,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Attempt delivery of a claimed item and record the result.
    #[tracing::instrument(skip_all, fields(id = %item.id, attempt = item.attempt_count.saturating_add(1)))]
    pub async fn process(&self, mut item: QueueItem) -> WorkOutcome {
        let Some(lease) = item.lease() else {
            self.worker_error(&item, "item was dispatched without a lease");
            return WorkOutcome::Abandoned;
        };

        if let Err(err) = self.store.mark_sending(&item.id, &lease).await {
            self.store_failure(&item, "begin sending", &err);
            return WorkOutcome::Abandoned;
        }

        outgoing!("Sending {} ({})", item.id, item.payload_ref);
        let sent = AssertUnwindSafe(self.transport.send(&item.payload_ref))
            .catch_unwind()
            .await;

        match sent {
            Ok(Ok(())) => self.sent(&mut item, &lease).await,
            Ok(Err(err)) => self.failed(&mut item, &lease, &err).await,
            Err(_) => {
                internal!(
                    level = ERROR,
                    "Transport panicked while sending {}; leaving the lease to expire",
                    item.id
                );
                self.worker_error(&item, "transport panicked");
                WorkOutcome::Abandoned
            }
        }
    }

    async fn sent(&self, item: &mut QueueItem, lease: &Lease) -> WorkOutcome {
        if let Err(err) = self.store.mark_sent(&item.id, lease).await {
            self.store_failure(item, "mark sent", &err);
            return WorkOutcome::Abandoned;
        }

        item.status = ItemStatus::Sent;
        item.attempt_count = item.attempt_count.saturating_add(1);
        outgoing!(level = INFO, "Delivered {} after {} attempt(s)", item.id, item.attempt_count);
        self.events
            .emit_with(|| Event::for_item(EventType::MessageSent, item));

        WorkOutcome::Sent
    }

    async fn failed(&self, item: &mut QueueItem, lease: &Lease, error: &TransportError) -> WorkOutcome {
        let decision = {
            let mut rng = self.rng.lock();
            self.policy
                .for_item(item.max_retries)
                .decide(item.attempt_count, error.class(), &mut *rng)
        };
        let reason = error.to_string();

        match decision {
            RetryDecision::Retry(delay) => {
                let next_attempt_at = TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
                    .max(item.next_attempt_at);

                if let Err(err) = self
                    .store
                    .mark_deferred(&item.id, lease, next_attempt_at, &reason)
                    .await
                {
                    self.store_failure(item, "mark deferred", &err);
                    return WorkOutcome::Abandoned;
                }

                item.status = ItemStatus::Pending;
                item.attempt_count = item.attempt_count.saturating_add(1);
                item.next_attempt_at = next_attempt_at;
                item.last_error = Some(reason);

                outgoing!(
                    level = INFO,
                    "Deferred {} until {next_attempt_at}: {error}",
                    item.id
                );
                self.events.emit_with(|| {
                    Event::for_item(EventType::MessageDeferred, item)
                        .with_error(error)
                        .with_metadata("next_attempt_at", next_attempt_at.to_rfc3339())
                });

                WorkOutcome::Deferred { next_attempt_at }
            }
            RetryDecision::DeadLetterNow => {
                if let Err(err) = self.store.mark_dead_letter(&item.id, lease, &reason).await {
                    self.store_failure(item, "mark dead letter", &err);
                    return WorkOutcome::Abandoned;
                }

                item.status = ItemStatus::DeadLetter;
                item.attempt_count = item.attempt_count.saturating_add(1);
                item.last_error = Some(reason);

                warn!(
                    id = %item.id,
                    attempts = item.attempt_count,
                    error = %error,
                    "Dead-lettered message"
                );
                self.events.emit_with(|| {
                    Event::for_item(EventType::MessageDeadLetter, item).with_error(error)
                });

                WorkOutcome::DeadLettered
            }
        }
    }

    fn store_failure(&self, item: &QueueItem, operation: &str, error: &StoreError) {
        match error {
            StoreError::LeaseLost(_) | StoreError::Terminal { .. } => {
                warn!(id = %item.id, "Lease lost before {operation}: {error}");
            }
            _ => {
                warn!(id = %item.id, error = %error, "Failed to {operation}");
            }
        }

        self.worker_error(item, format_args!("failed to {operation}: {error}"));
    }

    fn worker_error(&self, item: &QueueItem, error: impl std::fmt::Display) {
        self.events.emit_with(|| {
            Event::for_item(EventType::WorkerError, item).with_error(error)
        });
    }
}

//! Scripted mail transport for delivery tests
//!
//! Each payload can be given a script of replies, consumed one per attempt;
//! once a script runs out (or for payloads without one) the default reply is
//! used. The transport also tracks how many sends are running at once.
//!
//! ```rust,ignore
//! let transport = MockTransport::builder()
//!     .with_script("msg-1", [Reply::Transient("421 busy"), Reply::Success])
//!     .with_default(Reply::Permanent("550 no such user"))
//!     .with_delay(Duration::from_millis(20))
//!     .build();
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use mailq_delivery::{MailTransport, PayloadRef, PermanentError, TemporaryError, TransportError};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Success,
    Transient(&'static str),
    Permanent(&'static str),
    /// Never returns; only cancellation ends the attempt
    Hang,
}

#[derive(Debug)]
pub struct MockTransport {
    scripts: Mutex<AHashMap<String, VecDeque<Reply>>>,
    default: Reply,
    delay: Duration,
    attempts: Mutex<AHashMap<String, u32>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

pub struct MockTransportBuilder {
    scripts: AHashMap<String, VecDeque<Reply>>,
    default: Reply,
    delay: Duration,
}

impl MockTransportBuilder {
    #[must_use]
    pub fn with_script(mut self, payload: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.scripts
            .insert(payload.to_string(), replies.into_iter().collect());
        self
    }

    #[must_use]
    pub const fn with_default(mut self, reply: Reply) -> Self {
        self.default = reply;
        self
    }

    /// Time each send takes before replying
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            scripts: Mutex::new(self.scripts),
            default: self.default,
            delay: self.delay,
            attempts: Mutex::new(AHashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder {
            scripts: AHashMap::new(),
            default: Reply::Success,
            delay: Duration::ZERO,
        }
    }

    /// Sends attempted for `payload`
    pub fn attempts(&self, payload: &str) -> u32 {
        self.attempts.lock().get(payload).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().values().sum()
    }

    /// Most sends observed running at the same time
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, payload: &str) -> Reply {
        *self.attempts.lock().entry(payload.to_string()).or_default() += 1;

        self.scripts
            .lock()
            .get_mut(payload)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send(&self, payload_ref: &PayloadRef) -> Result<(), TransportError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let reply = self.next_reply(payload_ref.as_str());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match reply {
            Reply::Success => Ok(()),
            Reply::Transient(reason) => {
                Err(TemporaryError::SmtpTemporary(reason.to_string()).into())
            }
            Reply::Permanent(reason) => {
                Err(PermanentError::MessageRejected(reason.to_string()).into())
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

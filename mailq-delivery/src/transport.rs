//! The boundary between the queue and whatever actually moves bytes.

use async_trait::async_trait;
use mailq_common::outgoing;
use mailq_store::PayloadRef;

use crate::TransportError;

/// Delivers one message.
///
/// The queue knows nothing about SMTP. It hands the transport a payload
/// reference and acts on the classified result:
/// - `Ok(())`: the message was accepted by the next hop
/// - `Err(TransportError::Transient(_))`: defer and retry with backoff
/// - `Err(TransportError::Permanent(_))`: dead-letter
///
/// Delivery is at-least-once: an attempt interrupted by shutdown or a crash
/// is repeated after its lease expires, so implementations should tolerate
/// (or deduplicate) a repeated send of the same payload.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Attempt delivery of the referenced message.
    ///
    /// # Errors
    /// A classified failure, see [`TransportError`]
    async fn send(&self, payload_ref: &PayloadRef) -> Result<(), TransportError>;
}

/// Transport that accepts every message without sending it.
///
/// Useful when exercising the queue without a relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunTransport;

#[async_trait]
impl MailTransport for DryRunTransport {
    async fn send(&self, payload_ref: &PayloadRef) -> Result<(), TransportError> {
        outgoing!(level = INFO, "Dry run: not sending {payload_ref}");
        Ok(())
    }
}

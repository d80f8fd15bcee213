//! Pub/sub bus contract consumed by the coherence layer
//!
//! The coherence protocol does not care how messages move, only that
//! some bus delivers them with these properties:
//!
//! - prefix-matched subscriptions (`starts_with` on the topic),
//! - per-subscription serialized dispatch, FIFO from any one source,
//! - a single elected broker at any time, announced through
//!   [`BusEvent::EnterBroker`] / [`BusEvent::LeaveBroker`],
//! - acknowledged publish: a broker handler returning
//!   [`Dispatch::Reply`] gets its bytes routed back to the
//!   originating endpoint as an [`BusEvent::UpdateAcknowledged`]
//!   delivery carrying both the original request and the reply.
//!
//! No ordering is guaranteed across subscriptions, and delivery is
//! best-effort: the protocol layer treats lost messages as timeouts.
//!
//! [`memory::MemoryBusHub`] implements the contract in-process for
//! single-process clusters and tests; network implementations live
//! outside this crate.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

pub mod memory;

pub use memory::{MemoryBus, MemoryBusHub};

/// Kinds of deliveries a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEvent {
    /// A published message arrived
    IncomingUpdate,
    /// The broker acknowledged one of our publishes with a reply
    UpdateAcknowledged,
    /// This endpoint was just elected broker
    EnterBroker,
    /// This endpoint just lost the broker role
    LeaveBroker,
}

/// Handler verdict after a delivery
pub enum Dispatch {
    /// Stay subscribed
    Continue,
    /// Auto-unsubscribe this listener
    Unsubscribe,
    /// Stay subscribed and, when running on the broker, send these
    /// bytes back to the originating endpoint as an acknowledged
    /// reply.
    Reply(Vec<u8>),
}

/// One delivery
pub struct BusMessage<'a> {
    /// Full topic the message was published on
    pub prefix: &'a str,
    /// Delivery kind
    pub event: BusEvent,
    /// Published bytes (for acknowledgements: the original request)
    pub payload: &'a [u8],
    /// Broker reply bytes, present on acknowledgements only
    pub reply: Option<&'a [u8]>,
}

/// Subscription callback. Dispatch to any one handler is serialized
/// by the bus; a handler must not publish on a topic it is itself
/// subscribed to.
pub type BusHandler = Box<dyn FnMut(&BusMessage<'_>) -> Dispatch + Send>;

/// Opaque subscription handle; pass back to
/// [`CoherenceBus::unlisten`] to unsubscribe deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerToken(pub(crate) u64);

/// The bus interface the coherence layer consumes
pub trait CoherenceBus: Send + Sync {
    /// Fire-and-forget publish
    fn publish(&self, prefix: &str, payload: &[u8]) -> CacheResult<()>;

    /// Subscribe `handler` to deliveries of `event` on topics
    /// starting with `prefix` (empty prefix matches everything).
    fn listen(&self, prefix: &str, event: BusEvent, handler: BusHandler) -> ListenerToken;

    /// Remove a subscription
    fn unlisten(&self, token: &ListenerToken);

    /// Is this endpoint the currently elected broker?
    fn is_broker(&self) -> bool;

    /// Stable identity of this endpoint on the bus
    fn identity(&self) -> String;

    /// The bus heartbeat interval; the default protocol timeout
    fn heartbeat_push_timeout(&self) -> Duration;
}

/// Wire encodings for control payloads
///
/// Json is the default: self-describing and safe to evolve. Bincode
/// is available for chattier deployments. One tag byte makes decoding
/// self-describing either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// Self-describing JSON (default)
    #[default]
    Json,
    /// Compact bincode
    Bincode,
}

const TAG_JSON: u8 = b'J';
const TAG_BINCODE: u8 = b'B';

/// Encode a control payload with the given encoding, tag included.
pub fn encode_payload<T: Serialize>(encoding: PayloadEncoding, value: &T) -> CacheResult<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        PayloadEncoding::Json => {
            out.push(TAG_JSON);
            serde_json::to_writer(&mut out, value)
                .map_err(|e| CacheError::Codec(e.to_string()))?;
        }
        PayloadEncoding::Bincode => {
            out.push(TAG_BINCODE);
            let body = bincode::serialize(value).map_err(|e| CacheError::Codec(e.to_string()))?;
            out.extend_from_slice(&body);
        }
    }
    Ok(out)
}

/// Decode a tagged control payload, whatever encoding produced it.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> CacheResult<T> {
    match bytes.split_first() {
        Some((&TAG_JSON, body)) => {
            serde_json::from_slice(body).map_err(|e| CacheError::Codec(e.to_string()))
        }
        Some((&TAG_BINCODE, body)) => {
            bincode::deserialize(body).map_err(|e| CacheError::Codec(e.to_string()))
        }
        _ => Err(CacheError::Codec("empty or untagged payload".to_string())),
    }
}

// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the publisher,
//! the topology manager and the delivery loop. It names broker concepts
//! (exchanges, queues, routing keys, acknowledgments) but no concrete client
//! library.
//!
//! The transport is responsible only for topology, delivery of opaque
//! envelopes, and the acknowledgment primitives. Payload typing and the
//! mapping of business outcomes to acknowledgments live in `pubsub` and
//! `ack`.
//!
//! Concrete implementations live under `src/transport/`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{PerilError, Result};

/// Wire encoding tag carried with every published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Structured text (`application/json`).
    Json,
    /// Binary-tagged, self-describing CBOR (`application/cbor`).
    Binary,
}

impl ContentType {
    /// MIME type placed in the broker's content-type property.
    pub fn as_mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Binary => "application/cbor",
        }
    }

    /// Parse a broker content-type property.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/json" => Some(ContentType::Json),
            "application/cbor" => Some(ContentType::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// An encoded message as it travels through the broker.
///
/// Produced by the publisher, consumed by the delivery loop. Immutable once
/// constructed; cloning only bumps the payload's reference count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    content_type: ContentType,
    payload: Bytes,
}

impl Envelope {
    pub fn new(content_type: ContentType, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            content_type,
            payload: payload.into(),
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Queue lifetime requested at declaration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Durability {
    /// Survives broker restart; named and shareable; never auto-deleted.
    Durable,
    /// Exclusive to the declaring connection, auto-deleted, not persisted.
    Transient,
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding key is a pattern with `*` and `#` wildcards.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

/// Where a subscription's queue lives and what it receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingTarget {
    pub exchange: String,
    pub queue_name: String,
    /// Binding pattern; may contain `*` (one token) and `#` (any tokens).
    pub binding_key: String,
    pub durability: Durability,
}

impl RoutingTarget {
    pub fn new(
        exchange: impl Into<String>,
        queue_name: impl Into<String>,
        binding_key: impl Into<String>,
        durability: Durability,
    ) -> Self {
        // ---
        Self {
            exchange: exchange.into(),
            queue_name: queue_name.into(),
            binding_key: binding_key.into(),
            durability,
        }
    }
}

/// Broker-side queue state reported by a successful declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Acknowledgment primitives for a single delivery.
///
/// Each delivery must be settled exactly once. Implementations return an
/// error on a second settlement instead of touching the broker again.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    /// Remove the message from the queue.
    async fn ack(&self) -> Result<()>;

    /// Reject the message. With `requeue` it becomes available again;
    /// without, it is dead-lettered (or dropped when no dead-letter target
    /// exists).
    async fn nack(&self, requeue: bool) -> Result<()>;

    /// `true` once the broker has taken the delivery back, e.g. because the
    /// consumer was cancelled or the connection closed. The message is
    /// already queued for redelivery elsewhere, so a revoked delivery must
    /// not reach a handler and cannot be settled.
    fn is_revoked(&self) -> bool {
        false
    }
}

/// A message handed from the transport to a delivery loop.
pub struct Delivery {
    routing_key: Arc<str>,
    envelope: Envelope,
    redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<Arc<str>>,
        envelope: Envelope,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        // ---
        Self {
            routing_key: routing_key.into(),
            envelope,
            redelivered,
            acker,
        }
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// `true` when the broker delivered this message before and it was
    /// requeued.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// See [`Acker::is_revoked`].
    pub fn is_revoked(&self) -> bool {
        self.acker.is_revoked()
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Handle returned from a successful `consume`.
///
/// The consumer stays registered until the handle is dropped or the
/// transport is closed; either way the inbox yields `None` afterwards.
/// Unsettled deliveries of a dropped consumer are requeued.
#[derive(Debug)]
pub struct SubscriptionHandle {
    // ---
    /// Queue this consumer reads from.
    pub queue: String,

    /// Deliveries in queue order.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Broker transport abstraction.
///
/// Implementations must ensure that:
/// - `declare_exchange` and `declare_and_bind` are idempotent for identical
///   arguments.
/// - Every declared queue carries the `peril_dlx` dead-letter exchange.
/// - Deliveries from one consumer arrive in queue order and are not
///   settled until the holder calls `ack` or `nack`.
/// - At most one live consumer per queue exists per transport instance.
/// - `publish` returns only after the broker accepted the message.
///
/// The in-memory transport is the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier used in log lines and consumer tags.
    fn transport_id(&self) -> &str;

    /// Declare an exchange of the given kind.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare the target's queue and bind it to the target's exchange.
    async fn declare_and_bind(&self, target: &RoutingTarget) -> Result<QueueHandle>;

    /// Publish an envelope to `exchange` under `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, env: Envelope) -> Result<()>;

    /// Start a manually acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle>;

    /// Close the transport and release broker resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// Cheap to clone; every clone talks to the same broker connection.
pub type TransportPtr = Arc<dyn Transport>;

/// Error for a second settlement of the same delivery.
pub(crate) fn already_settled(routing_key: &str) -> PerilError {
    PerilError::Transport(format!("delivery on '{routing_key}' already settled"))
}

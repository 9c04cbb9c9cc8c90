//! Typed publish/subscribe for the Peril strategy game.
//!
//! Players exchange moves, war declarations and pause broadcasts through a
//! topic broker; a server-side worker records war outcomes. This crate is the
//! message dispatch core underneath:
//!
//! - topology: durable or transient queues, bound to an exchange, with
//!   dead-letter routing to `peril_dlx`
//! - two wire encodings (JSON and CBOR) behind [`Codec`]
//! - one delivery loop per subscription, handing decoded values to a
//!   [`Handler`] and settling each message from its [`AckVerdict`]
//!
//! Transports are selected from the broker URI in [`PerilConfig`]:
//! `memory://` runs an in-process broker, `amqp://` uses lapin (feature
//! `transport_lapin`).
//!

// Import all sub modules once...
mod macros;

mod ack;
mod codec;
mod domain;
mod error;
mod peril_config;
mod pubsub;
mod transport;

pub mod gamelogic;
pub mod routing;

pub(crate) use macros::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
};

pub(crate) use domain::already_settled;

use std::sync::{Mutex, MutexGuard};

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Re-export main types
pub use ack::{resolve, AckAction, AckVerdict};
pub use codec::{BinaryCodec, Codec, JsonCodec};
pub use error::{PerilError, Result};
pub use peril_config::{PerilConfig, ENV_BROKER_URI, ENV_LOG_PATH, ENV_PREFETCH, ENV_USERNAME, MEMORY_URI};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    create_transport,
    MemoryHub,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

pub use pubsub::{
    //
    declare_and_bind,
    ensure_game_topology,
    publish,
    publish_binary,
    publish_json,
    subscribe,
    subscribe_binary,
    subscribe_json,
    DecodeFailurePolicy,
    Handler,
    SubscribeOptions,
    SubscriptionTask,
    DECODE_REQUEUE_DELAY,
};

// --- public re-exports
pub use domain::{
    //
    Acker,
    ContentType,
    Delivery,
    Durability,
    Envelope,
    ExchangeKind,
    QueueHandle,
    RoutingTarget,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

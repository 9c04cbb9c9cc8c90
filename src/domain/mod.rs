//! Domain layer public interface.
//!
//! Broker-level abstractions shared by the transports, the publisher and
//! the delivery loop. Nothing here refers to a concrete client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub(crate) use transport::already_settled;

pub use transport::{
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

//! Topology management.
//!
//! Declaration is a one-time startup step. Nothing here retries: a failure
//! is returned to the caller, who treats it as fatal for whatever it was
//! setting up.

use crate::{
    // ---
    log_info,
    routing,
    Durability,
    ExchangeKind,
    QueueHandle,
    Result,
    RoutingTarget,
    Transport,
};

/// Declare `target`'s queue and bind it to `target`'s exchange.
///
/// `Transient` queues are exclusive, auto-delete and non-durable;
/// `Durable` queues are durable, shared and kept when unused. Both get the
/// `peril_dlx` dead-letter exchange. Repeating the call with the same
/// arguments is a no-op.
///
/// # Errors
///
/// [`PerilError::Topology`](crate::PerilError::Topology) if the declaration
/// or the binding is refused.
pub async fn declare_and_bind(transport: &dyn Transport, target: &RoutingTarget) -> Result<QueueHandle> {
    // ---
    transport.declare_and_bind(target).await
}

/// Declare the exchanges every Peril process relies on, plus the durable
/// dead-letter queue collecting discarded messages.
///
/// | exchange       | kind   |
/// |----------------|--------|
/// | `peril_direct` | direct |
/// | `peril_topic`  | topic  |
/// | `peril_dlx`    | fanout |
///
/// # Errors
///
/// [`PerilError::Topology`](crate::PerilError::Topology) on the first refused
/// declaration.
pub async fn ensure_game_topology(transport: &dyn Transport) -> Result<()> {
    // ---
    transport
        .declare_exchange(routing::EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct)
        .await?;
    transport
        .declare_exchange(routing::EXCHANGE_PERIL_TOPIC, ExchangeKind::Topic)
        .await?;
    transport
        .declare_exchange(routing::EXCHANGE_PERIL_DLX, ExchangeKind::Fanout)
        .await?;

    let dlq = RoutingTarget::new(
        routing::EXCHANGE_PERIL_DLX,
        routing::QUEUE_PERIL_DLQ,
        "#",
        Durability::Durable,
    );
    declare_and_bind(transport, &dlq).await?;

    log_info!("[{}] game topology ready", transport.transport_id());
    Ok(())
}

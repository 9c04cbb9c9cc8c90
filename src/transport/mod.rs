//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait. Broker
//! clients are hidden behind feature flags and exposed only through
//! constructor functions; the in-memory transport is always available.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_lapin")]
mod amqp;

pub use memory::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryHub,
};

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

use crate::{log_info, PerilConfig, PerilError, Result, TransportPtr};

/// Create the transport selected by `config.broker_uri`.
///
/// - `memory://` → in-memory transport on the process-global hub
/// - `amqp://`, `amqps://` → RabbitMQ via lapin (`transport_lapin` feature)
///
/// # Errors
///
/// [`PerilError::Config`] for an unsupported scheme (or an AMQP URI without
/// the `transport_lapin` feature); [`PerilError::Transport`] when the broker
/// connection fails.
pub async fn create_transport(config: &PerilConfig) -> Result<TransportPtr> {
    // ---
    if config.is_memory() {
        log_info!("[{}] using in-memory transport", config.transport_id);
        return create_memory_transport(config).await;
    }

    let scheme = config
        .broker_uri
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or_default();

    match scheme {
        #[cfg(feature = "transport_lapin")]
        "amqp" | "amqps" => create_lapin_transport(config).await,

        #[cfg(not(feature = "transport_lapin"))]
        "amqp" | "amqps" => Err(PerilError::Config(
            "AMQP broker URI requires the `transport_lapin` feature".to_string(),
        )),

        other => Err(PerilError::Config(format!(
            "unsupported broker URI scheme '{other}'"
        ))),
    }
}

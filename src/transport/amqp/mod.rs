//! AMQP protocol transports.
//!
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

mod lapin;

pub use self::lapin::create_transport as create_lapin_transport;

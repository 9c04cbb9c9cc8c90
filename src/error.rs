use thiserror::Error;

/// Errors produced by the dispatch core, its transports and collaborators.
#[derive(Error, Debug)]
pub enum PerilError {
    /// Queue or exchange declaration, or queue binding, failed.
    ///
    /// Topology is a startup precondition; callers treat this as fatal for
    /// the subscription being set up.
    #[error("topology error: {0}")]
    Topology(String),

    /// A value could not be encoded for publishing.
    #[error("encode error: {0}")]
    Encode(String),

    /// An inbound payload could not be decoded into the target type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Connection or channel level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A delivery loop in this process already owns the queue.
    #[error("queue already has an active consumer: {0}")]
    AlreadyConsuming(String),

    /// The transport was closed.
    #[error("transport closed")]
    ConnectionClosed,

    /// The game-log sink rejected an insert.
    #[error("log sink error: {0}")]
    Sink(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A game command could not be applied.
    #[error("{0}")]
    Command(String),
}

/// Result type alias for peril operations.
pub type Result<T> = std::result::Result<T, PerilError>;

//! Typed publishing.

use crate::{
    // ---
    log_debug,
    BinaryCodec,
    Codec,
    Envelope,
    JsonCodec,
    Result,
    Transport,
};

/// Encode `value` with `codec` and publish it to `exchange`/`routing_key`.
///
/// Returns once the transport accepted the message. Nothing is retried; a
/// handler that publishes typically maps a failure here to
/// [`AckVerdict::RequeueRetry`](crate::AckVerdict::RequeueRetry) so its own
/// inbound message comes back and the publish is attempted again.
///
/// # Errors
///
/// - [`PerilError::Encode`](crate::PerilError::Encode) before anything is sent.
/// - [`PerilError::Transport`](crate::PerilError::Transport) (or
///   `ConnectionClosed`) from the transport.
pub async fn publish<T, C>(
    transport: &dyn Transport,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<()>
where
    C: Codec<T> + ?Sized,
{
    // ---
    let payload = codec.encode(value)?;
    let env = Envelope::new(codec.content_type(), payload);

    transport.publish(exchange, routing_key, env).await?;

    log_debug!(
        "[{}] published {} to {exchange}/{routing_key}",
        transport.transport_id(),
        codec.content_type()
    );
    Ok(())
}

/// [`publish`] with the JSON codec.
pub async fn publish_json<T>(
    transport: &dyn Transport,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    publish(transport, exchange, routing_key, value, &JsonCodec).await
}

/// [`publish`] with the binary (CBOR) codec.
pub async fn publish_binary<T>(
    transport: &dyn Transport,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    publish(transport, exchange, routing_key, value, &BinaryCodec).await
}

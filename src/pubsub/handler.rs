//! Handler capability consumed by the delivery loop.

use std::future::Future;

use crate::AckVerdict;

/// Business logic for one message type.
///
/// A handler receives a decoded payload and classifies the outcome as an
/// [`AckVerdict`]. It never acknowledges anything itself.
///
/// Any `Fn(T) -> impl Future<Output = AckVerdict>` closure is a handler:
///
/// ```
/// # use peril::{AckVerdict, Handler};
/// # use serde::Deserialize;
/// #[derive(Deserialize)]
/// struct Ping { n: u32 }
///
/// fn assert_handler<H: Handler<Ping>>(_: &H) {}
///
/// let handler = |ping: Ping| async move {
///     if ping.n > 0 { AckVerdict::Ack } else { AckVerdict::DiscardPermanently }
/// };
/// assert_handler(&handler);
/// ```
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, value: T) -> AckVerdict;
}

#[async_trait::async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = AckVerdict> + Send + 'static,
{
    async fn handle(&self, value: T) -> AckVerdict {
        (self)(value).await
    }
}

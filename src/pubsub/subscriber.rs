//! Subscriptions and the delivery loop.
//!
//! [`subscribe`] ensures topology, registers a manually acknowledged
//! consumer and spawns one task running the delivery loop:
//!
//! 1. wait for the next delivery (or cancellation),
//! 2. decode it with the subscription's codec,
//! 3. hand the value to the handler,
//! 4. settle the delivery according to the handler's verdict.
//!
//! Deliveries of one subscription are handled strictly one at a time, in
//! queue order. Different subscriptions run independently.
//!
//! The loop itself is not generic: the payload type is erased when the
//! subscription is built, into a [`Dispatch`] object that decodes and calls
//! the handler.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    ack,
    log_debug,
    log_error,
    log_info,
    log_warn,
    AckVerdict,
    BinaryCodec,
    Codec,
    Delivery,
    Envelope,
    Handler,
    JsonCodec,
    PerilConfig,
    PerilError,
    Result,
    RoutingTarget,
    SubscriptionHandle,
    TransportPtr,
};

/// What the delivery loop does with a payload it cannot decode.
///
/// The handler is never invoked for such a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Reject without requeue; the message goes to the dead-letter exchange.
    #[default]
    Discard,
    /// Reject with requeue, after [`DECODE_REQUEUE_DELAY`].
    ///
    /// Only useful when another consumer of the queue may understand the
    /// payload. The in-memory transport allows one consumer per queue, so
    /// there the same loop gets the payload back every
    /// `DECODE_REQUEUE_DELAY` until the subscription is cancelled.
    Requeue,
}

/// Pause before requeueing an undecodable payload under
/// [`DecodeFailurePolicy::Requeue`]. The loop holds the delivery meanwhile.
pub const DECODE_REQUEUE_DELAY: Duration = Duration::from_millis(100);

impl DecodeFailurePolicy {
    fn verdict(self) -> AckVerdict {
        match self {
            DecodeFailurePolicy::Discard => AckVerdict::DiscardPermanently,
            DecodeFailurePolicy::Requeue => AckVerdict::RequeueRetry,
        }
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Declare and bind the queue before consuming.
    ///
    /// Set to `false` when the queue was declared beforehand; both orders
    /// work because declaration is idempotent.
    ///
    /// Default: `true`
    pub declare: bool,

    /// Handling of undecodable payloads.
    pub decode_failure: DecodeFailurePolicy,

    /// Stops the loop. The delivery being handled when it fires is still
    /// settled.
    pub cancel: CancellationToken,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            declare: true,
            decode_failure: DecodeFailurePolicy::default(),
            cancel: CancellationToken::new(),
        }
    }
}

impl SubscribeOptions {
    /// Options taking the decode-failure policy from `config`.
    pub fn from_config(config: &PerilConfig) -> Self {
        Self {
            decode_failure: config.decode_failure_policy,
            ..Self::default()
        }
    }

    /// Consume a queue that was already declared.
    pub fn skip_declare(mut self) -> Self {
        self.declare = false;
        self
    }

    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    /// Stop the loop when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// A running subscription.
#[derive(Debug)]
pub struct SubscriptionTask {
    queue: String,
    join: JoinHandle<()>,
}

impl SubscriptionTask {
    /// Queue this subscription consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the delivery loop to end.
    ///
    /// # Errors
    ///
    /// [`PerilError::Transport`] if the loop task panicked.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| PerilError::Transport(format!("delivery loop for '{}' failed: {e}", self.queue)))
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased decode + handle step.
trait Dispatch: Send + Sync {
    fn dispatch<'a>(&'a self, env: &'a Envelope) -> BoxFuture<'a, Result<AckVerdict>>;
}

struct Typed<T, C, H> {
    codec: C,
    handler: H,
    _phantom: PhantomData<fn(T)>,
}

impl<T, C, H> Dispatch for Typed<T, C, H>
where
    T: Send + 'static,
    C: Codec<T>,
    H: Handler<T>,
{
    fn dispatch<'a>(&'a self, env: &'a Envelope) -> BoxFuture<'a, Result<AckVerdict>> {
        // ---
        let expected = self.codec.content_type();
        if env.content_type() != expected {
            let err = PerilError::MalformedPayload(format!(
                "content type {} does not match codec {expected}",
                env.content_type()
            ));
            return Box::pin(async move { Err(err) });
        }

        let value = match self.codec.decode(env.payload()) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = self.handler.handle(value);
        Box::pin(async move { Ok(fut.await) })
    }
}

/// Subscribe `handler` to `target`, decoding with `codec`.
///
/// Returns once the consumer is registered; from then on every message
/// routed to the queue reaches the handler. The loop ends when the
/// transport closes or `options.cancel` fires.
///
/// # Errors
///
/// - [`PerilError::Topology`] if declaring or binding the queue fails.
/// - [`PerilError::AlreadyConsuming`] if another loop in this process owns
///   the queue.
/// - [`PerilError::Transport`] if the consumer cannot be registered.
pub async fn subscribe<T, C, H>(
    transport: &TransportPtr,
    target: &RoutingTarget,
    codec: C,
    handler: H,
    options: SubscribeOptions,
) -> Result<SubscriptionTask>
where
    T: Send + 'static,
    C: Codec<T> + 'static,
    H: Handler<T> + 'static,
{
    // ---
    if options.declare {
        crate::declare_and_bind(transport.as_ref(), target).await?;
    }

    let handle = transport.consume(&target.queue_name).await?;

    log_info!(
        "[{}] subscribed to {} ({} on {})",
        transport.transport_id(),
        target.queue_name,
        target.binding_key,
        target.exchange
    );

    let dispatch: Box<dyn Dispatch> = Box::new(Typed {
        codec,
        handler,
        _phantom: PhantomData,
    });

    let join = tokio::spawn(delivery_loop(
        handle,
        dispatch,
        options.decode_failure,
        options.cancel,
    ));

    Ok(SubscriptionTask {
        queue: target.queue_name.clone(),
        join,
    })
}

/// [`subscribe`] with the JSON codec.
pub async fn subscribe_json<T, H>(
    transport: &TransportPtr,
    target: &RoutingTarget,
    handler: H,
    options: SubscribeOptions,
) -> Result<SubscriptionTask>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    H: Handler<T> + 'static,
{
    subscribe(transport, target, JsonCodec, handler, options).await
}

/// [`subscribe`] with the binary (CBOR) codec.
pub async fn subscribe_binary<T, H>(
    transport: &TransportPtr,
    target: &RoutingTarget,
    handler: H,
    options: SubscribeOptions,
) -> Result<SubscriptionTask>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    H: Handler<T> + 'static,
{
    subscribe(transport, target, BinaryCodec, handler, options).await
}

async fn delivery_loop(
    mut handle: SubscriptionHandle,
    dispatch: Box<dyn Dispatch>,
    on_decode_failure: DecodeFailurePolicy,
    cancel: CancellationToken,
) {
    // ---
    let queue = handle.queue.clone();
    log_debug!("delivery loop started for {queue}");

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log_info!("delivery loop for {queue} cancelled");
                break;
            }
            next = handle.inbox.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    log_info!("delivery loop for {queue} ended: consumer closed");
                    break;
                }
            },
        };

        if delivery.is_revoked() {
            log_debug!("{queue}: skipping revoked delivery '{}'", delivery.routing_key());
            continue;
        }

        handle_one(&queue, dispatch.as_ref(), on_decode_failure, &cancel, delivery).await;
    }
}

async fn handle_one(
    queue: &str,
    dispatch: &dyn Dispatch,
    on_decode_failure: DecodeFailurePolicy,
    cancel: &CancellationToken,
    delivery: Delivery,
) {
    // ---
    let verdict = match dispatch.dispatch(delivery.envelope()).await {
        Ok(verdict) => verdict,
        Err(e) => {
            let verdict = on_decode_failure.verdict();
            log_warn!(
                "{queue}: dropping handler call for '{}': {e}; settling as {verdict:?}",
                delivery.routing_key()
            );
            if verdict == AckVerdict::RequeueRetry {
                tokio::select! {
                    _ = tokio::time::sleep(DECODE_REQUEUE_DELAY) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            verdict
        }
    };

    log_debug!("{queue}: '{}' -> {verdict:?}", delivery.routing_key());

    if let Err(e) = ack::resolve(verdict, &delivery).await {
        if delivery.is_revoked() {
            log_warn!(
                "{queue}: '{}' was taken back while being handled; it will be redelivered",
                delivery.routing_key()
            );
        } else {
            log_error!("{queue}: failed to settle delivery as {verdict:?}: {e}");
        }
    }
}

//! In-memory transport implementation.
//!
//! A pure in-process broker implementing the domain-level `Transport` trait.
//! It is used by the tests, by `memory://` configurations, and as the
//! reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Exchanges are `direct` (key equality), `topic` (`*`/`#` patterns) or
//!   `fanout` (every bound queue).
//! - `Durable` queues are shared by name and outlive connections.
//!   `Transient` queues are exclusive to the declaring connection and are
//!   deleted when it closes, or when their consumer goes away.
//! - Every queue dead-letters to `peril_dlx`, keeping the original routing
//!   key. A message is never dead-lettered back into its own queue.
//! - Deliveries stay unacknowledged until settled. At most
//!   `prefetch_count` are outstanding per consumer. A requeued message goes
//!   back to the head of its queue with `redelivered` set.
//! - Cancelling a consumer (close, or a dropped inbox) requeues its
//!   unsettled messages and revokes the deliveries still in its inbox.
//! - Publishing to a missing exchange fails; publishing a key nothing
//!   matches silently drops the message.
//!
//! ## Deviations
//!
//! A queue has at most one consumer, across all connections sharing the
//! hub. A real broker would round-robin between consumers of a shared queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc;

use crate::{
    // ---
    already_settled,
    lock_ignore_poison,
    log_debug,
    log_info,
    log_warn,
    routing,
    Acker,
    Delivery,
    Durability,
    Envelope,
    ExchangeKind,
    PerilConfig,
    PerilError,
    QueueHandle,
    Result,
    RoutingTarget,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

#[derive(Clone)]
struct Message {
    routing_key: Arc<str>,
    envelope: Envelope,
    redelivered: bool,
}

struct Consumer {
    connection_id: String,
    prefetch: usize,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Shared with every delivery handed to this consumer.
    revoked: Arc<AtomicBool>,
}

struct QueueState {
    durability: Durability,
    /// Declaring connection for exclusive queues.
    owner: Option<String>,
    dead_letter_exchange: String,
    bindings: Vec<(String, String)>,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    consumer: Option<Consumer>,
}

impl QueueState {
    fn handle(&self, name: &str) -> QueueHandle {
        // ---
        QueueHandle {
            name: name.to_string(),
            message_count: self.ready.len() as u32,
            consumer_count: u32::from(self.consumer.is_some()),
        }
    }

    /// Drop the consumer and put its unsettled messages back at the head,
    /// oldest first.
    ///
    /// Deliveries still sitting in the consumer's inbox are revoked, so the
    /// loop draining it skips them instead of handling a message that is
    /// already queued again.
    fn cancel_consumer(&mut self) {
        // ---
        if let Some(consumer) = self.consumer.take() {
            consumer.revoked.store(true, Ordering::SeqCst);
        }
        let unacked = std::mem::take(&mut self.unacked);
        for (_, mut msg) in unacked.into_iter().rev() {
            msg.redelivered = true;
            self.ready.push_front(msg);
        }
    }

    /// A consumer whose inbox receiver is gone.
    fn consumer_is_gone(&self) -> bool {
        self.consumer.as_ref().is_some_and(|c| c.tx.is_closed())
    }
}

#[derive(Default)]
struct HubState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. Every `MemoryTransport`
/// sharing a hub sees the same exchanges and queues, the way connections to
/// one broker would.
///
/// The inspection methods (`queue_exists`, `queue_depth`, ...) exist for
/// tests and have no broker counterpart.
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// `true` if `queue` is currently declared.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    /// Messages waiting for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
    }

    /// Delivered but unsettled messages on `queue`.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
    }

    /// `(exchange, binding_key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    /// Payloads waiting on `queue`, head first, with their routing keys.
    pub fn peek(&self, queue: &str) -> Vec<(String, Envelope)> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.routing_key.to_string(), m.envelope.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(PerilError::Topology(format!(
                "exchange '{name}' exists as {existing:?}, requested {kind:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    fn declare_and_bind(&self, connection_id: &str, target: &RoutingTarget) -> Result<QueueHandle> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let queue_name = target.queue_name.as_str();

        if let Some(queue) = state.queues.get(queue_name) {
            if queue.durability != target.durability {
                return Err(PerilError::Topology(format!(
                    "queue '{queue_name}' exists as {:?}, requested {:?}",
                    queue.durability, target.durability
                )));
            }
            if let Some(owner) = &queue.owner {
                if owner != connection_id {
                    return Err(PerilError::Topology(format!(
                        "queue '{queue_name}' is exclusive to another connection"
                    )));
                }
            }
        } else {
            let owner = match target.durability {
                Durability::Durable => None,
                Durability::Transient => Some(connection_id.to_string()),
            };
            state.queues.insert(
                queue_name.to_string(),
                QueueState {
                    durability: target.durability,
                    owner,
                    dead_letter_exchange: routing::EXCHANGE_PERIL_DLX.to_string(),
                    bindings: Vec::new(),
                    ready: VecDeque::new(),
                    unacked: BTreeMap::new(),
                    consumer: None,
                },
            );
        }

        if !state.exchanges.contains_key(&target.exchange) {
            return Err(PerilError::Topology(format!(
                "cannot bind '{queue_name}': no exchange '{}'",
                target.exchange
            )));
        }

        let binding = (target.exchange.clone(), target.binding_key.clone());
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| PerilError::Topology(format!("queue '{queue_name}' vanished")))?;
        if !queue.bindings.contains(&binding) {
            queue.bindings.push(binding);
        }

        Ok(queue.handle(queue_name))
    }

    fn publish(self: &Arc<Self>, exchange: &str, routing_key: &str, env: Envelope) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if !state.exchanges.contains_key(exchange) {
            return Err(PerilError::Transport(format!(
                "publish failed: no exchange '{exchange}'"
            )));
        }

        let msg = Message {
            routing_key: Arc::from(routing_key),
            envelope: env,
            redelivered: false,
        };
        let targets = route(&state, exchange, routing_key, None);
        if targets.is_empty() {
            log_debug!("memory: '{exchange}'/'{routing_key}' matched no queue, dropped");
        }
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(msg.clone());
            }
            self.pump(&mut state, &queue);
        }
        Ok(())
    }

    fn consume(
        self: &Arc<Self>,
        connection_id: &str,
        queue_name: &str,
        prefetch: usize,
    ) -> Result<SubscriptionHandle> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| PerilError::Transport(format!("consume failed: no queue '{queue_name}'")))?;

        if let Some(owner) = &queue.owner {
            if owner != connection_id {
                return Err(PerilError::Transport(format!(
                    "consume failed: queue '{queue_name}' is exclusive to another connection"
                )));
            }
        }

        if queue.consumer_is_gone() {
            queue.cancel_consumer();
        }
        if queue.consumer.is_some() {
            return Err(PerilError::AlreadyConsuming(queue_name.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumer = Some(Consumer {
            connection_id: connection_id.to_string(),
            prefetch: prefetch.max(1),
            tx,
            revoked: Arc::new(AtomicBool::new(false)),
        });

        self.pump(&mut state, queue_name);

        Ok(SubscriptionHandle {
            queue: queue_name.to_string(),
            inbox: rx,
        })
    }

    /// Deliver ready messages to the queue's consumer up to its prefetch.
    fn pump(self: &Arc<Self>, state: &mut HubState, queue_name: &str) {
        // ---
        loop {
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            let Some(consumer) = &queue.consumer else {
                return;
            };
            if queue.unacked.len() >= consumer.prefetch {
                return;
            }
            let revoked = Arc::clone(&consumer.revoked);
            let Some(msg) = queue.ready.pop_front() else {
                return;
            };

            let tag = state.next_tag;
            state.next_tag += 1;

            let delivery = Delivery::new(
                Arc::clone(&msg.routing_key),
                msg.envelope.clone(),
                msg.redelivered,
                Box::new(MemoryAcker {
                    hub: Arc::clone(self),
                    queue: queue_name.to_string(),
                    routing_key: Arc::clone(&msg.routing_key),
                    tag,
                    settled: AtomicBool::new(false),
                    revoked,
                }),
            );

            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            queue.unacked.insert(tag, msg);

            let sent = queue
                .consumer
                .as_ref()
                .is_some_and(|c| c.tx.send(delivery).is_ok());
            if !sent {
                log_debug!("memory: consumer of '{queue_name}' went away");
                queue.cancel_consumer();
                if queue.durability == Durability::Transient {
                    state.queues.remove(queue_name);
                }
                return;
            }
        }
    }

    fn settle(self: &Arc<Self>, queue_name: &str, tag: u64, action: Settle) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let Some(queue) = state.queues.get_mut(queue_name) else {
            // Queue deleted underneath the delivery; nothing left to settle.
            return Ok(());
        };
        let mut msg = queue.unacked.remove(&tag).ok_or_else(|| {
            PerilError::Transport(format!("unknown delivery tag {tag} on '{queue_name}'"))
        })?;

        match action {
            Settle::Ack => {}
            Settle::Requeue => {
                msg.redelivered = true;
                queue.ready.push_front(msg);
            }
            Settle::DeadLetter => {
                let dlx = queue.dead_letter_exchange.clone();
                let routing_key = Arc::clone(&msg.routing_key);
                let targets = if state.exchanges.contains_key(&dlx) {
                    route(&state, &dlx, &routing_key, Some(queue_name))
                } else {
                    Vec::new()
                };
                if targets.is_empty() {
                    log_warn!("memory: message on '{queue_name}' discarded without dead-letter target");
                }
                msg.redelivered = false;
                for target in targets {
                    if let Some(q) = state.queues.get_mut(&target) {
                        q.ready.push_back(msg.clone());
                    }
                    self.pump(&mut state, &target);
                }
            }
        }

        self.pump(&mut state, queue_name);
        Ok(())
    }

    fn close(&self, connection_id: &str) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        state.queues.retain(|name, queue| {
            if queue.owner.as_deref() == Some(connection_id) {
                log_debug!("memory: deleting exclusive queue '{name}'");
                queue.cancel_consumer();
                return false;
            }
            let ours = queue
                .consumer
                .as_ref()
                .is_some_and(|c| c.connection_id == connection_id);
            if ours {
                queue.cancel_consumer();
                return queue.durability == Durability::Durable;
            }
            true
        });
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
        }
    }
}

/// Queues bound to `exchange` whose binding matches `routing_key`.
fn route(state: &HubState, exchange: &str, routing_key: &str, skip: Option<&str>) -> Vec<String> {
    // ---
    let Some(kind) = state.exchanges.get(exchange) else {
        return Vec::new();
    };

    let mut targets: Vec<String> = state
        .queues
        .iter()
        .filter(|(name, _)| Some(name.as_str()) != skip)
        .filter(|(_, queue)| {
            queue.bindings.iter().any(|(ex, key)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Topic => routing::topic_matches(key, routing_key),
                        ExchangeKind::Fanout => true,
                    }
            })
        })
        .map(|(name, _)| name.clone())
        .collect();

    // Deterministic fan-out order.
    targets.sort();
    targets
}

struct MemoryAcker {
    hub: Arc<MemoryHub>,
    queue: String,
    routing_key: Arc<str>,
    tag: u64,
    settled: AtomicBool,
    revoked: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, action: Settle) -> Result<()> {
        // ---
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(already_settled(&self.routing_key));
        }
        if self.revoked.load(Ordering::SeqCst) {
            return Err(PerilError::ConnectionClosed);
        }
        self.hub.settle(&self.queue, self.tag, action)
    }
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if requeue {
            self.settle(Settle::Requeue)
        } else {
            self.settle(Settle::DeadLetter)
        }
    }

    fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// One instance plays the role of one broker connection: exclusive queues
/// belong to it and go away when it closes.
struct MemoryTransport {
    // ---
    transport_id: String,
    connection_id: String,
    prefetch: usize,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(PerilError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.hub.declare_exchange(name, kind)?;
        log_debug!("[{}] Declared exchange: {name} ({kind:?})", self.transport_id);
        Ok(())
    }

    async fn declare_and_bind(&self, target: &RoutingTarget) -> Result<QueueHandle> {
        // ---
        self.ensure_open()?;
        let handle = self.hub.declare_and_bind(&self.connection_id, target)?;
        log_debug!(
            "[{}] Declared queue: {} bound to {} with '{}'",
            self.transport_id,
            target.queue_name,
            target.exchange,
            target.binding_key
        );
        Ok(handle)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, env: Envelope) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.hub.publish(exchange, routing_key, env)
    }

    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;
        let handle = self.hub.consume(&self.connection_id, queue, self.prefetch)?;
        log_debug!("[{}] Started consuming queue: {queue}", self.transport_id);
        Ok(handle)
    }

    /// Close the transport.
    ///
    /// Deletes this connection's exclusive queues and cancels its consumers,
    /// which ends their delivery loops. Idempotent.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.hub.close(&self.connection_id);
        log_info!("[{}] memory transport closed", self.transport_id);
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// All transports created this way share one bus, like processes connected
/// to the same broker. For isolated tests use
/// [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: &PerilConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport on the provided hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    config: &PerilConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.transport_id);

    let transport = MemoryTransport {
        transport_id: config.transport_id.clone(),
        connection_id: format!("{}-{}", config.transport_id, uuid::Uuid::new_v4()),
        prefetch: usize::from(config.prefetch_count),
        hub,
        closed: AtomicBool::new(false),
    };

    Ok(Arc::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentType;
    use tokio::time::{timeout, Duration};

    async fn setup(hub: &Arc<MemoryHub>, id: &str) -> TransportPtr {
        // ---
        let transport = create_memory_transport_with_hub(&PerilConfig::memory(id), hub.clone())
            .await
            .expect("memory transport");
        transport
            .declare_exchange("ex", ExchangeKind::Topic)
            .await
            .expect("declare exchange");
        transport
            .declare_exchange(routing::EXCHANGE_PERIL_DLX, ExchangeKind::Fanout)
            .await
            .expect("declare dlx");
        transport
    }

    fn env(body: &'static str) -> Envelope {
        Envelope::new(ContentType::Json, body)
    }

    async fn next(handle: &mut SubscriptionHandle) -> Delivery {
        timeout(Duration::from_millis(200), handle.inbox.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn exchange_kind_conflict_is_topology_error() {
        // ---
        let hub = MemoryHub::new();
        let transport = setup(&hub, "t").await;

        let err = transport
            .declare_exchange("ex", ExchangeKind::Direct)
            .await
            .expect_err("kind conflict");
        assert!(matches!(err, PerilError::Topology(_)));
    }

    #[tokio::test]
    async fn binding_without_exchange_fails() {
        // ---
        let hub = MemoryHub::new();
        let transport = setup(&hub, "t").await;
        let target = RoutingTarget::new("missing", "q", "k", Durability::Durable);

        let err = transport
            .declare_and_bind(&target)
            .await
            .expect_err("no exchange");
        assert!(matches!(err, PerilError::Topology(_)));
    }

    #[tokio::test]
    async fn prefetch_limits_outstanding_deliveries() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport_with_hub(
            &PerilConfig::memory("t").with_prefetch_count(1),
            hub.clone(),
        )
        .await
        .expect("transport");
        transport
            .declare_exchange("ex", ExchangeKind::Direct)
            .await
            .expect("exchange");
        transport
            .declare_and_bind(&RoutingTarget::new("ex", "q", "k", Durability::Durable))
            .await
            .expect("declare");

        for body in ["1", "2", "3"] {
            transport.publish("ex", "k", env(body)).await.expect("publish");
        }
        let mut handle = transport.consume("q").await.expect("consume");

        let first = next(&mut handle).await;
        assert_eq!(first.envelope().payload().as_ref(), b"1");
        assert_eq!(hub.queue_depth("q"), Some(2));
        assert!(handle.inbox.try_recv().is_err());

        first.ack().await.expect("ack");
        let second = next(&mut handle).await;
        assert_eq!(second.envelope().payload().as_ref(), b"2");
        assert_eq!(hub.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn double_settlement_is_rejected() {
        // ---
        let hub = MemoryHub::new();
        let transport = setup(&hub, "t").await;
        transport
            .declare_and_bind(&RoutingTarget::new("ex", "q", "a.*", Durability::Durable))
            .await
            .expect("declare");
        let mut handle = transport.consume("q").await.expect("consume");

        transport.publish("ex", "a.b", env("x")).await.expect("publish");
        let delivery = next(&mut handle).await;

        delivery.ack().await.expect("first ack");
        assert!(delivery.nack(true).await.is_err());
        assert_eq!(hub.queue_depth("q"), Some(0));
        assert_eq!(hub.unacked_count("q"), Some(0));
    }

    #[tokio::test]
    async fn dropped_consumer_requeues_unsettled_messages() {
        // ---
        let hub = MemoryHub::new();
        let transport = setup(&hub, "t").await;
        transport
            .declare_and_bind(&RoutingTarget::new("ex", "durable", "#", Durability::Durable))
            .await
            .expect("declare durable");

        let handle = transport.consume("durable").await.expect("consume");
        transport.publish("ex", "k", env("x")).await.expect("publish");
        drop(handle);

        // A new consumer takes over and sees the message flagged as redelivered.
        let mut again = transport.consume("durable").await.expect("consume again");
        let delivery = next(&mut again).await;
        assert!(delivery.redelivered());
    }

    #[tokio::test]
    async fn close_removes_exclusive_queues_and_ends_consumers() {
        // ---
        let hub = MemoryHub::new();
        let transport = setup(&hub, "t").await;
        transport
            .declare_and_bind(&RoutingTarget::new("ex", "mine", "#", Durability::Transient))
            .await
            .expect("declare");
        let mut handle = transport.consume("mine").await.expect("consume");

        transport.close().await.expect("close");

        assert!(!hub.queue_exists("mine"));
        let end = timeout(Duration::from_millis(200), handle.inbox.recv())
            .await
            .expect("inbox should close");
        assert!(end.is_none());
        assert!(matches!(
            transport.publish("ex", "k", env("x")).await,
            Err(PerilError::ConnectionClosed)
        ));
    }
}

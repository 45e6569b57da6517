//! The HA coordinator: fronts a priority-ordered set of [`BrokerClient`]s as
//! one logical endpoint.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::address::{self, BrokerAddress};
use crate::barrier::CountedBarrier;
use crate::broker_client::{BrokerClient, DeclareTarget, SubscribeHandler};
use crate::config::{
    ClientOptions, DecodeValidator, ExchangeSpec, NonDeliveryCallback, Order, PublishOptions, SubscribeOptions,
};
use crate::context::{Context, PublishedCache};
use crate::error::{Error, Result};
use crate::packet::{PacketMeta, PublishMeta};
use crate::serializer::BincodeSerializer;
use crate::status::{ConnectionStatusOptions, StatsRecord, StatusSummary, WatcherId, WatcherRegistry};

/// Priority-ordered broker list plus an identity index, kept together so
/// "every entry in the list is in the map" holds by construction.
#[derive(Default)]
struct BrokerSet {
    order: Vec<Arc<BrokerClient>>,
    by_identity: HashMap<String, Arc<BrokerClient>>,
}

impl BrokerSet {
    fn insert(&mut self, client: Arc<BrokerClient>) {
        self.by_identity.insert(client.identity().to_string(), client.clone());
        self.order.push(client);
    }

    fn remove(&mut self, identity: &str) -> Option<Arc<BrokerClient>> {
        self.order.retain(|c| c.identity() != identity);
        self.by_identity.remove(identity)
    }
}

struct CoordInner {
    brokers: Mutex<BrokerSet>,
    cache: Mutex<PublishedCache>,
    watchers: Mutex<WatcherRegistry>,
    serializer: Option<BincodeSerializer>,
    options: ClientOptions,
    /// Overrides `options.non_delivery_callback` once [`HaBrokerClient::non_delivery`]
    /// is called; a `OnceLock` rather than a field on `options` because the
    /// coordinator is shared behind `Arc` and registered after construction.
    non_delivery_override: std::sync::OnceLock<NonDeliveryCallback>,
    closed: AtomicBool,
}

/// Fronts a priority-ordered set of broker connections as one logical
/// publish/subscribe endpoint.
#[derive(Clone)]
pub struct HaBrokerClient {
    inner: Arc<CoordInner>,
}

impl HaBrokerClient {
    /// Construct from a comma-separated host/port spec and start
    /// every broker's connect loop. Must be called from within a Tokio
    /// runtime, since it spawns background tasks.
    pub async fn new(
        serializer: Option<BincodeSerializer>,
        options: ClientOptions,
        host_spec: Option<&str>,
        port_spec: Option<&str>,
    ) -> Result<Self> {
        let addresses = address::parse_addresses(host_spec, port_spec)?;

        let inner = Arc::new(CoordInner {
            brokers: Mutex::new(BrokerSet::default()),
            cache: Mutex::new(PublishedCache::default()),
            watchers: Mutex::new(WatcherRegistry::default()),
            serializer,
            options: options.clone(),
            non_delivery_override: std::sync::OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        for address in addresses {
            Self::spawn_broker(&inner, address, options.clone()).await;
        }

        Ok(Self { inner })
    }

    /// Wires status/return callbacks and registers the client in the broker
    /// set *before* starting its connect loop, so no status transition can
    /// race ahead of the set containing it.
    async fn spawn_broker(inner: &Arc<CoordInner>, address: BrokerAddress, options: ClientOptions) {
        let client = BrokerClient::new(address, options);

        let weak_status = Arc::downgrade(inner);
        let identity_for_status = client.identity().to_string();
        client.set_update_status_callback(Arc::new(move |was_connected_before: bool| {
            let weak_status = weak_status.clone();
            let identity = identity_for_status.clone();
            Box::pin(async move {
                if let Some(coord) = weak_status.upgrade() {
                    CoordInner::on_broker_status_changed(&coord, &identity, was_connected_before).await;
                }
            })
        }));

        let weak_return = Arc::downgrade(inner);
        client.install_return_handler(Arc::new(move |identity: String, to: String, reason: String, message: Vec<u8>| {
            if let Some(coord) = weak_return.upgrade() {
                tokio::spawn(async move {
                    CoordInner::handle_return(&coord, identity, to, reason, message).await;
                });
            }
        }));

        inner.brokers.lock().await.insert(client.clone());
        client.start();
    }

    /// Broker selection: explicit
    /// `options.brokers` takes precedence, in listed order; otherwise the
    /// full configured set in priority or random order.
    async fn select(&self, brokers: &Option<Vec<String>>, order: Option<Order>) -> Vec<Arc<BrokerClient>> {
        let set = self.inner.brokers.lock().await;

        if let Some(list) = brokers {
            if !list.is_empty() {
                return list
                    .iter()
                    .filter_map(|id| match set.by_identity.get(id) {
                        Some(c) => Some(c.clone()),
                        None => {
                            warn!(identity = %id, "broker selection: unknown identity, skipping");
                            None
                        }
                    })
                    .collect();
            }
        }

        let mut candidates = set.order.clone();
        if order.unwrap_or(self.inner.options.order) == Order::Random {
            candidates.shuffle(&mut rand::thread_rng());
        }
        candidates
    }

    /// Attempt delivery to the selected brokers: non-fanout stops at first
    /// success (priority failover); fanout publishes concurrently to every
    /// candidate.
    async fn attempt_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &[u8],
        kind: Option<&str>,
        options: &PublishOptions,
    ) -> (Vec<String>, Vec<String>) {
        let candidates = self.select(&options.brokers, options.order).await;
        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.identity().to_string()).collect();

        let mut accepted = Vec::new();
        if options.fanout {
            let futures = candidates.iter().map(|c| {
                let c = c.clone();
                let exchange = exchange.to_string();
                let routing_key = routing_key.to_string();
                let message = message.to_vec();
                let kind = kind.map(str::to_string);
                let options = options.clone();
                async move {
                    let ok = c
                        .publish(&exchange, &routing_key, &message, &options, kind.as_deref(), false)
                        .await;
                    (c.identity().to_string(), ok)
                }
            });
            for (identity, ok) in futures::future::join_all(futures).await {
                if ok {
                    accepted.push(identity);
                }
            }
        } else {
            for c in &candidates {
                if c.publish(exchange, routing_key, message, options, kind, false).await {
                    accepted.push(c.identity().to_string());
                    break;
                }
            }
        }

        (accepted, candidate_ids)
    }

    async fn publish_prepared(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Vec<u8>,
        meta: PublishMeta,
        options: PublishOptions,
    ) -> Result<Vec<String>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::NoConnectedBrokers);
        }

        let (accepted, candidates) = self
            .attempt_publish(exchange, routing_key, &message, meta.kind.as_deref(), &options)
            .await;
        if accepted.is_empty() {
            return Err(Error::NoConnectedBrokers);
        }

        if options.mandatory {
            let context = Context {
                name: meta.name,
                kind: meta.kind,
                from: meta.from,
                token: meta.token,
                one_way: meta.one_way,
                persistent: options.persistent,
                brokers: candidates,
                failed: Vec::new(),
            };
            let mut cache = self.inner.cache.lock().await;
            cache.store(&message, context);
            crate::metrics::PUBLISHED_CACHE_SIZE
                .with_label_values(&["default"])
                .set(cache.len() as i64);
        }

        Ok(accepted)
    }

    /// Serialize `packet` via the configured serializer and publish it.
    /// Fails with [`Error::InvalidArgument`] if no serializer was configured,
    /// or if `options.no_serialize` is set (use [`Self::publish_bytes`] for
    /// already-serialized payloads instead).
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        packet: &T,
        options: PublishOptions,
    ) -> Result<Vec<String>>
    where
        T: Serialize + PacketMeta,
    {
        if options.no_serialize {
            return Err(Error::InvalidArgument(
                "no_serialize set on a typed publish; use publish_bytes".to_string(),
            ));
        }
        let serializer = self
            .inner
            .serializer
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no serializer configured".to_string()))?;
        let meta = PublishMeta::capture(packet);
        let bytes = serializer.encode(packet)?;
        self.publish_prepared(exchange, routing_key, bytes, meta, options).await
    }

    /// Publish an already-serialized payload directly, bypassing the
    /// configured serializer.
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Vec<u8>,
        meta: PublishMeta,
        options: PublishOptions,
    ) -> Result<Vec<String>> {
        self.publish_prepared(exchange, routing_key, message, meta, options).await
    }

    /// Subscribes on every selected broker. Returns the identities that
    /// accepted the subscription.
    pub async fn subscribe(
        &self,
        queue: &str,
        exchange: Option<ExchangeSpec>,
        options: SubscribeOptions,
        handler: SubscribeHandler,
    ) -> Vec<String> {
        let candidates = self.select(&options.brokers, None).await;
        let mut accepted = Vec::new();
        for c in candidates {
            if c.subscribe(queue, exchange.as_ref(), &options, handler.clone()).await {
                accepted.push(c.identity().to_string());
            }
        }
        accepted
    }

    /// Builds a [`DecodeValidator`] for `T` against the configured
    /// serializer, for use as `SubscribeOptions::decode_validator`. Returns
    /// `None` if no serializer was configured.
    pub fn decode_validator<T>(&self) -> Option<DecodeValidator>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.inner.serializer.map(crate::serializer::decode_validator::<T>)
    }

    /// Cancels the subscription for `queue` on every selected broker,
    /// waiting for all of them to report in (or `timeout`, whichever comes
    /// first). Returns the identities that confirmed cancellation; a broker
    /// with no matching subscription reports in as a no-op success.
    pub async fn unsubscribe(&self, queue: &str, brokers: Option<Vec<String>>, timeout: Option<Duration>) -> Vec<String> {
        let candidates = self.select(&brokers, None).await;
        let barrier = CountedBarrier::new(candidates.len());
        let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for c in candidates {
            let barrier = barrier.clone();
            let results = results.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                if c.unsubscribe(&queue).await {
                    results.lock().await.push(c.identity().to_string());
                }
                barrier.completed_one();
            });
        }

        barrier.wait(timeout, || {}).await;
        let results = results.lock().await.clone();
        results
    }

    /// Forces a fresh declaration of `target` on every selected broker.
    pub async fn declare(
        &self,
        target: DeclareTarget,
        name: &str,
        durable: bool,
        brokers: Option<Vec<String>>,
    ) -> Vec<String> {
        let candidates = self.select(&brokers, None).await;
        let mut accepted = Vec::new();
        for c in candidates {
            if c.declare(target.clone(), name, durable).await {
                accepted.push(c.identity().to_string());
            }
        }
        accepted
    }

    /// Deletes `name` from every selected broker.
    pub async fn delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
        brokers: Option<Vec<String>>,
    ) -> Vec<String> {
        let candidates = self.select(&brokers, None).await;
        let mut accepted = Vec::new();
        for c in candidates {
            if c.delete(name, if_unused, if_empty).await {
                accepted.push(c.identity().to_string());
            }
        }
        accepted
    }

    /// Drops a broker from the configured set and closes its connection.
    /// A no-op if no broker at `host:port` is configured.
    pub async fn remove(&self, host: &str, port: u16) -> Result<()> {
        let identity = {
            let set = self.inner.brokers.lock().await;
            set.order
                .iter()
                .find(|c| c.address.host == host && c.address.port == port)
                .map(|c| c.identity().to_string())
        };
        let Some(identity) = identity else {
            return Ok(());
        };

        let client = self.inner.brokers.lock().await.remove(&identity);
        if let Some(client) = client {
            client.close(true).await;
        }
        Ok(())
    }

    /// Closes every configured broker, waiting for all of them to report
    /// in (or `timeout`, whichever comes first).
    pub async fn close(&self, timeout: Option<Duration>) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let clients: Vec<Arc<BrokerClient>> = self.inner.brokers.lock().await.order.clone();
        let barrier = CountedBarrier::new(clients.len());

        for client in clients {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                client.close(true).await;
                barrier.completed_one();
            });
        }

        barrier.wait(timeout, || {}).await;
    }

    /// Registers the callback invoked when a returned message has
    /// exhausted every eligible broker. Only the first call takes effect.
    pub fn non_delivery(&self, callback: NonDeliveryCallback) {
        let _ = self.inner.non_delivery_override.set(callback);
    }

    /// Registers a boundary-crossing connection-status watcher. Returns
    /// the id used to unregister it, and spawns the one-off timer task when
    /// `options.one_off` is set.
    pub async fn connection_status(
        &self,
        options: ConnectionStatusOptions,
        callback: impl Fn(crate::status::StatusEvent) + Send + Sync + 'static,
    ) -> WatcherId {
        let (id, timer) = self.inner.watchers.lock().await.register(options, callback);

        if let Some((secs, cancel_rx)) = timer {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        inner.watchers.lock().await.fire_timeout(id);
                    }
                    _ = cancel_rx => {}
                }
            });
        }

        id
    }

    pub async fn unregister_connection_status(&self, id: WatcherId) {
        self.inner.watchers.lock().await.unregister(id);
    }

    /// A status summary per configured broker.
    pub async fn status(&self) -> Vec<StatusSummary> {
        self.inner
            .brokers
            .lock()
            .await
            .order
            .iter()
            .map(|c| c.summary())
            .collect()
    }

    /// A statistics record per configured broker.
    pub async fn stats(&self) -> Vec<StatsRecord> {
        self.inner.brokers.lock().await.order.iter().map(|c| c.stats()).collect()
    }
}

impl CoordInner {
    /// Reconstructs the before/after connected sets for every configured
    /// broker around this one transition, then evaluates watchers.
    /// `was_connected_before` is this broker's own prior connectedness;
    /// every other broker's didn't change.
    async fn on_broker_status_changed(self: &Arc<Self>, identity: &str, was_connected_before: bool) {
        let (after_connected, all_failed, all_identities) = {
            let set = self.brokers.lock().await;
            let after = set
                .order
                .iter()
                .filter(|c| c.status().is_connected())
                .map(|c| c.identity().to_string())
                .collect::<HashSet<_>>();
            let failed = set
                .order
                .iter()
                .filter(|c| c.status().is_failed())
                .map(|c| c.identity().to_string())
                .collect::<HashSet<_>>();
            let all = set.order.iter().map(|c| c.identity().to_string()).collect::<HashSet<_>>();
            (after, failed, all)
        };

        let now_connected = after_connected.contains(identity);
        let mut before_connected = after_connected.clone();
        if was_connected_before && !now_connected {
            before_connected.insert(identity.to_string());
        } else if !was_connected_before && now_connected {
            before_connected.remove(identity);
        }

        self.watchers
            .lock()
            .await
            .on_transition(identity, &before_connected, &after_connected, &all_failed, &all_identities);
    }

    /// Return-message re-routing.
    async fn handle_return(self: &Arc<Self>, identity: String, to: String, reason: String, message: Vec<u8>) {
        // Snapshot connectedness before marking the returning broker
        // `Stopping` below: an ACCESS_REFUSED downgrade-retry still needs to
        // reach that broker over its still-live channel, and `BrokerClient::publish`
        // only accepts `Connected` targets.
        let connected = self.connected_identities_inner().await;

        let mut context = match self.cache.lock().await.fetch(&message) {
            Some(c) => c,
            None => {
                debug!(%identity, %reason, "return with no cached context, dropping");
                if reason == "ACCESS_REFUSED" {
                    self.mark_broker_stopping(&identity).await;
                }
                return;
            }
        };

        context.record_failure(&identity);
        self.cache.lock().await.store(&message, context.clone());

        let remaining: Vec<String> = context
            .unfailed_brokers()
            .into_iter()
            .filter(|id| connected.contains(id))
            .collect();

        let mut delivered = !remaining.is_empty();

        if remaining.is_empty() {
            let retryable = (context.persistent || context.one_way)
                && matches!(reason.as_str(), "ACCESS_REFUSED" | "NO_CONSUMERS");
            if retryable {
                let retry_targets: Vec<String> = context
                    .brokers
                    .iter()
                    .filter(|id| connected.contains(*id))
                    .cloned()
                    .collect();
                if !retry_targets.is_empty() {
                    let opts = PublishOptions {
                        mandatory: false,
                        persistent: context.persistent,
                        no_serialize: true,
                        brokers: Some(retry_targets),
                        ..Default::default()
                    };
                    let (accepted, _) = self
                        .attempt_publish_inner(&to, &to, &message, context.kind.as_deref(), &opts)
                        .await;
                    delivered = !accepted.is_empty();
                }
            }
        } else {
            let opts = PublishOptions {
                mandatory: true,
                persistent: context.persistent,
                no_serialize: true,
                brokers: Some(remaining),
                ..Default::default()
            };
            let _ = self
                .attempt_publish_inner(&to, &to, &message, context.kind.as_deref(), &opts)
                .await;
        }

        // Transition the returning broker last: the retry above must still
        // see it as `Connected`, but it ends this handler `Stopping` either
        // way.
        if reason == "ACCESS_REFUSED" {
            self.mark_broker_stopping(&identity).await;
        }

        if !delivered {
            self.invoke_non_delivery(&reason, &context, &to);
        }
    }

    async fn mark_broker_stopping(self: &Arc<Self>, identity: &str) {
        let client = self.brokers.lock().await.by_identity.get(identity).cloned();
        if let Some(client) = client {
            client.mark_stopping().await;
        }
    }

    async fn connected_identities_inner(self: &Arc<Self>) -> HashSet<String> {
        self.brokers
            .lock()
            .await
            .order
            .iter()
            .filter(|c| c.status().is_connected())
            .map(|c| c.identity().to_string())
            .collect()
    }

    async fn attempt_publish_inner(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        message: &[u8],
        kind: Option<&str>,
        options: &PublishOptions,
    ) -> (Vec<String>, Vec<String>) {
        let candidates = {
            let set = self.brokers.lock().await;
            match &options.brokers {
                Some(list) => list
                    .iter()
                    .filter_map(|id| set.by_identity.get(id).cloned())
                    .collect::<Vec<_>>(),
                None => set.order.clone(),
            }
        };
        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.identity().to_string()).collect();

        let mut accepted = Vec::new();
        for c in &candidates {
            if c.publish(exchange, routing_key, message, options, kind, true).await {
                accepted.push(c.identity().to_string());
                break;
            }
        }
        (accepted, candidate_ids)
    }

    fn invoke_non_delivery(self: &Arc<Self>, reason: &str, context: &Context, to: &str) {
        let cb = self
            .non_delivery_override
            .get()
            .or(self.options.non_delivery_callback.as_ref());
        match cb {
            Some(cb) => cb(reason, context.kind.as_deref(), context.token.as_deref(), context.from.as_deref(), to),
            None => warn!(reason, to, "message undeliverable, no non_delivery callback registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_serializer_is_rejected() {
        let client = HaBrokerClient::new(None, ClientOptions::default(), Some("127.0.0.1"), Some("1"))
            .await
            .unwrap();
        let err = client
            .publish("ex", "rk", &b"raw".to_vec(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn publish_with_no_serialize_on_typed_path_is_rejected() {
        let client = HaBrokerClient::new(
            Some(BincodeSerializer),
            ClientOptions::default(),
            Some("127.0.0.1"),
            Some("1"),
        )
        .await
        .unwrap();
        let options = PublishOptions {
            no_serialize: true,
            ..Default::default()
        };
        let err = client.publish("ex", "rk", &b"raw".to_vec(), options).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn publish_with_no_connected_brokers_fails() {
        let client = HaBrokerClient::new(
            Some(BincodeSerializer),
            ClientOptions::default(),
            Some("127.0.0.1"),
            Some("1"),
        )
        .await
        .unwrap();
        // Port 1 on loopback isn't listening; the broker stays Connecting.
        let err = client
            .publish_bytes("ex", "rk", b"raw".to_vec(), PublishMeta::default(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoConnectedBrokers));
    }

    #[tokio::test]
    async fn unsubscribe_of_never_subscribed_queue_is_a_no_op() {
        let client = HaBrokerClient::new(
            Some(BincodeSerializer),
            ClientOptions::default(),
            Some("127.0.0.1"),
            Some("1"),
        )
        .await
        .unwrap();
        // The broker is still `Connecting` (nothing listens on port 1), so
        // `unsubscribe` reports back via its no-op path, not a live cancel,
        // but that still counts as "confirmed" per the idempotence contract.
        let reported = client.unsubscribe("no-such-queue", None, Some(Duration::from_millis(50))).await;
        assert_eq!(reported.len(), 1);
    }

    #[test]
    fn decode_validator_rejects_garbage_bytes() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Packet {
            field: String,
        }
        let validator = crate::serializer::decode_validator::<Packet>(BincodeSerializer);
        assert!(validator(&[0xff, 0xff, 0xff]).is_err());
        let encoded = BincodeSerializer.encode(&Packet { field: "ok".into() }).unwrap();
        assert!(validator(&encoded).is_ok());
    }

    #[tokio::test]
    async fn remove_of_unknown_broker_is_a_no_op() {
        let client = HaBrokerClient::new(
            Some(BincodeSerializer),
            ClientOptions::default(),
            Some("127.0.0.1"),
            Some("1"),
        )
        .await
        .unwrap();
        assert!(client.remove("no-such-host", 1).await.is_ok());
    }
}

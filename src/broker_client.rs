//! Per-broker client: owns one AMQP connection, tracks subscriptions, and
//! runs the connect/heartbeat/reconnect state machine.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::address::BrokerAddress;
use crate::config::{ClientOptions, DecodeValidator, ExchangeSpec, PublishOptions, SubscribeOptions};
use crate::status::Status;

/// Declaration target for [`BrokerClient::declare`].
#[derive(Debug, Clone)]
pub enum DeclareTarget {
    Queue,
    Exchange(crate::config::ExchangeKind),
}

/// Subscriber callback. Handlers take either 2 or 3 arguments (message, or
/// message + header); realized here as two boxed-closure variants rather
/// than runtime arity probing.
#[derive(Clone)]
pub enum SubscribeHandler {
    Simple(Arc<dyn Fn(String, Vec<u8>) + Send + Sync>),
    WithHeader(Arc<dyn Fn(String, Vec<u8>, BasicProperties) + Send + Sync>),
}

/// Legacy three-byte sentinel a subscriber should silently ignore; gated
/// behind the `legacy_nil_sentinel` flag so new deployments can turn it off.
const LEGACY_NIL_SENTINEL: &[u8] = b"nil";

/// The coordinator's per-broker status hook. Returns a boxed future rather
/// than being itself `async fn` so it can live behind a plain `dyn Fn` while
/// still letting [`BrokerClient::transition`] await it in-order with the
/// state change that triggered it.
pub type UpdateStatusHook = Arc<dyn Fn(bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Inner {
    status: Status,
    connection: Option<Connection>,
    channel: Option<Channel>,
    /// Queue name -> consumer tag, so `unsubscribe` can `basic_cancel` the
    /// right consumer.
    subscriptions: HashMap<String, String>,
    last_failed: bool,
}

/// One wrapper per configured broker address.
pub struct BrokerClient {
    pub address: BrokerAddress,
    identity: String,
    alias: String,
    options: ClientOptions,
    inner: Mutex<Inner>,
    disconnects: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    last_disconnect_ms: std::sync::atomic::AtomicI64,
    last_failure_ms: std::sync::atomic::AtomicI64,
    status_flag: AtomicU64,
    stopped: AtomicBool,
    update_status_callback: OnceLock<UpdateStatusHook>,
    /// `(identity, to, reason, message_bytes)`.
    return_callback: OnceLock<Arc<dyn Fn(String, String, String, Vec<u8>) + Send + Sync>>,
    legacy_nil_sentinel: bool,
}

fn status_to_tag(status: Status) -> u64 {
    status as u8 as u64
}

/// Forward a tracked operational fault to `options.exception_callback`, if
/// the caller registered one.
fn report_exception(options: &ClientOptions, message: &str, data: Option<&[u8]>) {
    if let Some(cb) = options.exception_callback.as_ref() {
        cb(message, data);
    }
}

impl BrokerClient {
    pub fn new(address: BrokerAddress, options: ClientOptions) -> Arc<Self> {
        let identity = address.identity();
        let alias = address.alias();
        Arc::new(Self {
            address,
            identity,
            alias,
            options,
            inner: Mutex::new(Inner {
                status: Status::Connecting,
                connection: None,
                channel: None,
                subscriptions: HashMap::new(),
                last_failed: false,
            }),
            disconnects: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            last_disconnect_ms: std::sync::atomic::AtomicI64::new(0),
            last_failure_ms: std::sync::atomic::AtomicI64::new(0),
            status_flag: AtomicU64::new(status_to_tag(Status::Connecting)),
            stopped: AtomicBool::new(false),
            update_status_callback: OnceLock::new(),
            return_callback: OnceLock::new(),
            legacy_nil_sentinel: true,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Installed once, by the coordinator, right after construction.
    pub fn set_update_status_callback(&self, cb: UpdateStatusHook) {
        let _ = self.update_status_callback.set(cb);
    }

    pub fn status(&self) -> Status {
        // AtomicU64 mirrors `inner.status` for lock-free reads; `inner`
        // remains the source of truth for transitions.
        match self.status_flag.load(Ordering::SeqCst) {
            0 => Status::Connecting,
            1 => Status::Connected,
            2 => Status::Stopping,
            3 => Status::Disconnected,
            4 => Status::Closed,
            _ => Status::Failed,
        }
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// `{identity, alias, status, disconnects, failures, retries}`.
    pub fn summary(&self) -> crate::status::StatusSummary {
        crate::status::StatusSummary {
            identity: self.identity.clone(),
            alias: self.alias.clone(),
            status: self.status(),
            disconnects: self.disconnects(),
            failures: self.failures(),
            retries: self.retries(),
        }
    }

    /// Statistics record: zero counters report as `None`.
    pub fn stats(&self) -> crate::status::StatsRecord {
        use chrono::TimeZone;

        let non_zero = |n: u64| if n == 0 { None } else { Some(n) };
        let ts = |millis: i64| {
            if millis == 0 {
                None
            } else {
                chrono::Utc.timestamp_millis_opt(millis).single()
            }
        };

        crate::status::StatsRecord {
            alias: self.alias.clone(),
            identity: self.identity.clone(),
            status: self.status().to_string(),
            disconnects: non_zero(self.disconnects()),
            disconnect_last: ts(self.last_disconnect_ms.load(Ordering::SeqCst)),
            failures: non_zero(self.failures()),
            failure_last: ts(self.last_failure_ms.load(Ordering::SeqCst)),
            retries: non_zero(self.retries()),
        }
    }

    /// Kick off the connect/reconnect background loop. Called once by the
    /// coordinator after construction.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_connect_loop().await;
        });
    }

    async fn run_connect_loop(self: Arc<Self>) {
        loop {
            if self.status().is_terminal() {
                return;
            }
            match self.connect_once().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(identity = %self.identity, error = %err, "connect attempt failed");
                    self.transition(Status::Failed).await;
                }
            }
            if self.status().is_terminal() {
                return;
            }
            let delay = jittered_delay(self.options.reconnect_interval);
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(self: &Arc<Self>) -> crate::error::Result<()> {
        let uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            self.options.user,
            self.options.pass,
            self.address.host,
            self.address.port,
            percent_encode_vhost(&self.options.vhost),
        );

        let mut props = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        if let Some(heartbeat) = self.options.heartbeat {
            props = props.with_heartbeat(heartbeat);
        }

        let connection = Connection::connect(&uri, props).await?;
        info!(identity = %self.identity, "broker connection established");

        let weak = Arc::downgrade(self);
        connection.on_error(move |err| {
            if let Some(client) = weak.upgrade() {
                client.note_disconnect(err);
            }
        });

        let channel = connection.create_channel().await?;
        if self.options.prefetch > 0 {
            channel
                .basic_qos(self.options.prefetch, BasicQosOptions::default())
                .await?;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.connection = Some(connection);
            inner.channel = Some(channel);
        }

        self.transition(Status::Connected).await;
        Ok(())
    }

    fn note_disconnect(self: &Arc<Self>, err: lapin::Error) {
        let this = self.clone();
        tokio::spawn(async move {
            error!(identity = %this.identity, error = %err, "broker connection lost");
            report_exception(&this.options, &format!("broker connection lost: {err}"), None);
            this.transition(Status::Disconnected).await;
            if !this.status().is_terminal() {
                this.run_connect_loop().await;
            }
        });
    }

    /// Move to `new_status`, running the failure-accounting side effects
    /// and invoking the update-status callback exactly once per distinct
    /// transition.
    async fn transition(self: &Arc<Self>, new_status: Status) {
        let (changed, was_connected) = {
            let mut inner = self.inner.lock().await;
            if inner.status.is_terminal() || inner.status == new_status {
                return;
            }
            let was_connected = inner.status.is_connected();

            match new_status {
                Status::Connected => {
                    inner.last_failed = false;
                    self.retries.store(0, Ordering::SeqCst);
                }
                Status::Failed => {
                    if inner.last_failed {
                        self.retries.fetch_add(1, Ordering::SeqCst);
                    } else {
                        inner.last_failed = true;
                        self.retries.store(0, Ordering::SeqCst);
                        self.failures.fetch_add(1, Ordering::SeqCst);
                    }
                    self.last_failure_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
                }
                Status::Disconnected => {
                    self.disconnects.fetch_add(1, Ordering::SeqCst);
                    self.last_disconnect_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
                }
                _ => {}
            }

            inner.status = new_status;
            self.status_flag.store(status_to_tag(new_status), Ordering::SeqCst);
            (true, was_connected)
        };

        if changed {
            crate::metrics::BROKER_CONNECTED
                .with_label_values(&[&self.identity])
                .set(new_status.is_connected() as i64);
            debug!(identity = %self.identity, status = %new_status, "status transition");
            if let Some(cb) = self.update_status_callback.get() {
                cb(was_connected).await;
            }
        }
    }

    /// Mark the broker `Stopping` after a peer ACCESS_REFUSED return.
    pub async fn mark_stopping(self: &Arc<Self>) {
        self.transition(Status::Stopping).await;
    }

    pub fn install_return_handler(&self, cb: Arc<dyn Fn(String, String, String, Vec<u8>) + Send + Sync>) {
        let _ = self.return_callback.set(cb);
    }

    /// Declares and binds the queue, installs a consumer, and dispatches
    /// each delivery to `handler`. A no-op returning `true` if already
    /// subscribed to `queue`.
    pub async fn subscribe(
        self: &Arc<Self>,
        queue: &str,
        exchange: Option<&ExchangeSpec>,
        options: &SubscribeOptions,
        handler: SubscribeHandler,
    ) -> bool {
        if !self.status().is_usable() {
            return false;
        }

        let mut inner = self.inner.lock().await;
        if inner.subscriptions.contains_key(queue) {
            return true;
        }
        let channel = match inner.channel.as_ref() {
            Some(c) => c.clone(),
            None => return false,
        };

        if let Err(err) = self
            .declare_and_bind(&channel, queue, exchange, options)
            .await
        {
            error!(identity = %self.identity, error = %err, queue, "subscribe: declare/bind failed");
            report_exception(&self.options, &format!("subscribe: declare/bind failed: {err}"), None);
            return false;
        }

        let consumer_tag = format!("{}-{}", self.identity, uuid::Uuid::new_v4());
        let consume_result = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: !options.ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        let mut consumer = match consume_result {
            Ok(c) => c,
            Err(err) => {
                error!(identity = %self.identity, error = %err, queue, "subscribe: basic_consume failed");
                report_exception(&self.options, &format!("subscribe: basic_consume failed: {err}"), None);
                return false;
            }
        };

        inner.subscriptions.insert(queue.to_string(), consumer_tag);
        drop(inner);

        let identity = self.identity.clone();
        let queue = queue.to_string();
        let ack = options.ack;
        let no_unserialize = options.no_unserialize;
        let allowed = options.allowed_kinds.clone();
        let decode_validator = options.decode_validator.clone();
        let legacy_nil = self.legacy_nil_sentinel;
        let no_log = options.no_log;
        let log_data = options.log_data;
        let log_filter: HashSet<String> = options.log_filter.iter().cloned().collect();
        let category = options.category.clone().unwrap_or_default();
        let client_options = self.options.clone();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(err) => {
                        error!(%identity, error = %err, "consumer stream error");
                        report_exception(&client_options, &format!("consumer stream error: {err}"), None);
                        break;
                    }
                };

                if ack {
                    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                        error!(%identity, error = %err, "failed to ack before handler");
                    }
                }

                if legacy_nil && delivery.data.as_slice() == LEGACY_NIL_SENTINEL {
                    continue;
                }

                if !no_log {
                    let headers = logged_headers(&delivery.properties, &log_filter);
                    if log_data {
                        debug!(%identity, queue = %queue, category, headers = ?headers, data = ?delivery.data, "RECEIVE");
                    } else {
                        debug!(%identity, queue = %queue, category, headers = ?headers, "RECEIVE");
                    }
                }

                if !no_unserialize {
                    if let Some(validator) = decode_validator.as_ref() {
                        if let Err(err) = validator(&delivery.data) {
                            warn!(%identity, queue = %queue, error = %err, "decode failed, dropping delivery");
                            if let Some(cb) = client_options.exception_on_receive_callback.as_ref() {
                                cb(&delivery.data, &err);
                            }
                            continue;
                        }
                    }
                }

                if no_unserialize || allowed.is_empty() {
                    guarded_dispatch(&handler, &identity, &queue, delivery.data.clone(), &delivery.properties, &client_options);
                    continue;
                }

                let packet_kind = delivery.properties.kind().as_ref().map(|s| s.as_str());
                if kind_is_allowed(packet_kind, &allowed) {
                    guarded_dispatch(&handler, &identity, &queue, delivery.data.clone(), &delivery.properties, &client_options);
                } else {
                    warn!(%identity, queue = %queue, kind = ?packet_kind, "dropping delivery of disallowed kind");
                }
            }
        });

        true
    }

    /// Cancels the consumer for `queue`. A no-op returning `true` if not
    /// (or no longer) subscribed — testable property 9 requires a repeated
    /// `unsubscribe` to be a silent no-op, matching `subscribe`'s own
    /// already-subscribed no-op.
    pub async fn unsubscribe(&self, queue: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(consumer_tag) = inner.subscriptions.remove(queue) else {
            return true;
        };
        let channel = match inner.channel.as_ref() {
            Some(c) => c.clone(),
            None => return true,
        };
        drop(inner);

        match channel.basic_cancel(&consumer_tag, BasicCancelOptions::default()).await {
            Ok(()) => true,
            Err(err) => {
                error!(identity = %self.identity, error = %err, queue, "unsubscribe: basic_cancel failed");
                report_exception(&self.options, &format!("unsubscribe: basic_cancel failed: {err}"), None);
                false
            }
        }
    }

    async fn declare_and_bind(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: Option<&ExchangeSpec>,
        options: &SubscribeOptions,
    ) -> crate::error::Result<()> {
        if !options.no_declare {
            channel
                .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
                .await?;
        }

        for spec in [exchange, options.exchange2.as_ref()].into_iter().flatten() {
            channel
                .exchange_declare(
                    &spec.name,
                    spec.kind.into(),
                    ExchangeDeclareOptions {
                        durable: spec.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            let routing_key = options.key.as_deref().unwrap_or(queue);
            channel
                .queue_bind(
                    queue,
                    &spec.name,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(())
    }

    /// Publishes an already-serialized payload through `exchange`.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &[u8],
        options: &PublishOptions,
        kind: Option<&str>,
        retried: bool,
    ) -> bool {
        if !self.status().is_connected() {
            return false;
        }

        let inner = self.inner.lock().await;
        let channel = match inner.channel.as_ref() {
            Some(c) => c.clone(),
            None => return false,
        };
        drop(inner);

        if options.declare {
            if let Err(err) = channel
                .exchange_declare(
                    exchange,
                    lapin::ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                error!(identity = %self.identity, error = %err, exchange, "publish: forced declare failed");
                report_exception(&self.options, &format!("publish: forced declare failed: {err}"), Some(message));
                return false;
            }
        }

        if !options.no_log {
            let label = if retried { "RE-SEND" } else { "SEND" };
            if options.log_data {
                debug!(identity = %self.identity, exchange, routing_key, data = ?message, "{}", label);
            } else {
                debug!(identity = %self.identity, exchange, routing_key, "{}", label);
            }
        }

        let mut props = BasicProperties::default();
        if options.persistent {
            props = props.with_delivery_mode(2);
        }
        if let Some(kind) = kind {
            props = props.with_kind(kind.into());
        }

        let publish_options = BasicPublishOptions {
            mandatory: options.mandatory,
            immediate: options.immediate,
        };

        let timer = crate::metrics::PUBLISH_DURATION
            .with_label_values(&[&self.identity])
            .start_timer();
        let result = channel
            .basic_publish(exchange, routing_key, publish_options, message, props)
            .await;
        timer.observe_duration();

        match result {
            Ok(confirm) => {
                // Undeliverable `mandatory`/`immediate` messages surface on
                // the `PublisherConfirm` this publish returns, not through a
                // channel-level callback; await it off to the side so a slow
                // or absent confirm never blocks the caller on this publish.
                if let Some(cb) = self.return_callback.get().cloned() {
                    let identity = self.identity.clone();
                    let fallback_to = if !exchange.is_empty() {
                        exchange.to_string()
                    } else {
                        routing_key.to_string()
                    };
                    tokio::spawn(async move {
                        match confirm.await {
                            Ok(mut confirmation) => {
                                if let Some(message) = confirmation.take_message() {
                                    let to = if !message.exchange.as_str().is_empty() {
                                        message.exchange.to_string()
                                    } else if !message.routing_key.as_str().is_empty() {
                                        message.routing_key.to_string()
                                    } else {
                                        fallback_to
                                    };
                                    let reason = message.reply_text.to_string();
                                    cb(identity, to, reason, message.data.clone());
                                }
                            }
                            Err(err) => {
                                warn!(%identity, error = %err, "publisher confirm failed");
                            }
                        }
                    });
                }
                true
            }
            Err(err) => {
                error!(identity = %self.identity, error = %err, exchange, "publish failed");
                report_exception(&self.options, &format!("publish failed: {err}"), Some(message));
                false
            }
        }
    }

    /// Forces a fresh declaration of `target`, evicting any cached handle first.
    pub async fn declare(&self, target: DeclareTarget, name: &str, durable: bool) -> bool {
        if !self.status().is_usable() {
            return false;
        }
        let inner = self.inner.lock().await;
        let channel = match inner.channel.as_ref() {
            Some(c) => c.clone(),
            None => return false,
        };
        drop(inner);

        let result = match target {
            DeclareTarget::Queue => channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map(|_| ()),
            DeclareTarget::Exchange(kind) => channel
                .exchange_declare(
                    name,
                    kind.into(),
                    ExchangeDeclareOptions {
                        durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                error!(identity = %self.identity, error = %err, name, "declare failed");
                report_exception(&self.options, &format!("declare failed: {err}"), None);
                false
            }
        }
    }

    /// Removes `name` from the local subscription set, then requests a broker-side delete.
    pub async fn delete(&self, name: &str, if_unused: bool, if_empty: bool) -> bool {
        if !self.status().is_usable() {
            return false;
        }
        let mut inner = self.inner.lock().await;
        let known = inner.subscriptions.remove(name).is_some();
        let channel = match inner.channel.as_ref() {
            Some(c) => c.clone(),
            None => return false,
        };
        drop(inner);

        if !known {
            // Declare-then-delete dance: avoids a channel close on NOT_FOUND
            // for a queue we never locally registered.
            let _ = channel
                .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
                .await;
        }

        match channel
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => true,
            Err(err) => {
                error!(identity = %self.identity, error = %err, name, "delete failed");
                report_exception(&self.options, &format!("delete failed: {err}"), None);
                false
            }
        }
    }

    /// `status == Closed`/`Failed` is recorded at the moment closure is
    /// *initiated*, not when the transport confirms quiescence (DESIGN.md OQ-2).
    pub async fn close(self: &Arc<Self>, normal: bool) {
        if self.status().is_terminal() {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.transition(if normal { Status::Closed } else { Status::Failed }).await;

        let connection = {
            let mut inner = self.inner.lock().await;
            inner.channel.take();
            inner.connection.take()
        };

        if let Some(connection) = connection {
            if let Err(err) = connection.close(200, "normal shutdown").await {
                warn!(identity = %self.identity, error = %err, "error closing connection");
            }
        }
    }
}

/// Header keys present on a delivery, minus anything named in `filter`
///.
fn logged_headers(properties: &BasicProperties, filter: &HashSet<String>) -> Vec<String> {
    properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .keys()
                .map(|k| k.to_string())
                .filter(|k| !filter.contains(k))
                .collect()
        })
        .unwrap_or_default()
}

/// Allowed-kinds gate, read off the AMQP `type` property rather than the
/// decoded payload (DESIGN.md OQ-4).
fn kind_is_allowed(kind: Option<&str>, allowed: &[String]) -> bool {
    match kind {
        Some(k) => allowed.iter().any(|a| a == k),
        None => false,
    }
}

fn dispatch(handler: &SubscribeHandler, identity: &str, data: Vec<u8>, properties: &BasicProperties) {
    match handler {
        SubscribeHandler::Simple(f) => f(identity.to_string(), data),
        SubscribeHandler::WithHeader(f) => f(identity.to_string(), data, properties.clone()),
    }
}

/// Runs the user handler behind `catch_unwind`: a panicking handler must not
/// take the whole consumer task down with it. A caught panic is tracked as
/// [`crate::error::Error::Handler`] via `exception_callback`.
fn guarded_dispatch(
    handler: &SubscribeHandler,
    identity: &str,
    queue: &str,
    data: Vec<u8>,
    properties: &BasicProperties,
    options: &ClientOptions,
) {
    let data_for_panic = data.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatch(handler, identity, data, properties);
    }));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "subscriber handler panicked".to_string());
        let err = crate::error::Error::Handler(message);
        error!(%identity, queue, error = %err, "subscriber handler panicked");
        report_exception(options, &err.to_string(), Some(&data_for_panic));
    }
}

/// Reconnect delay drawn uniformly from `[0, interval)` seconds, to avoid a
/// thundering herd of simultaneous reconnects.
fn jittered_delay(interval_secs: u64) -> Duration {
    if interval_secs == 0 {
        return Duration::from_secs(0);
    }
    let millis = interval_secs * 1000;
    let jittered = rand::thread_rng().gen_range(0..millis);
    Duration::from_millis(jittered)
}

fn percent_encode_vhost(vhost: &str) -> String {
    if vhost == "/" {
        "%2f".to_string()
    } else {
        vhost.replace('/', "%2f")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_delay_stays_in_bounds() {
        for _ in 0..100 {
            let d = jittered_delay(60);
            assert!(d < Duration::from_secs(60));
        }
    }

    #[test]
    fn zero_interval_is_zero_delay() {
        assert_eq!(jittered_delay(0), Duration::from_secs(0));
    }

    #[test]
    fn vhost_percent_encoding() {
        assert_eq!(percent_encode_vhost("/"), "%2f");
        assert_eq!(percent_encode_vhost("/my/vhost"), "%2fmy%2fvhost");
    }

    #[test]
    fn kind_filter_allows_listed_kinds_only() {
        let allowed = vec!["Order".to_string(), "Invoice".to_string()];
        assert!(kind_is_allowed(Some("Order"), &allowed));
        assert!(!kind_is_allowed(Some("Refund"), &allowed));
        assert!(!kind_is_allowed(None, &allowed));
    }

    #[test]
    fn logged_headers_omits_filtered_keys() {
        let mut table = FieldTable::default();
        table.insert("trace_id".into(), lapin::types::AMQPValue::LongString("abc".into()));
        table.insert("secret".into(), lapin::types::AMQPValue::LongString("shh".into()));
        let properties = BasicProperties::default().with_headers(table);
        let filter: HashSet<String> = ["secret".to_string()].into_iter().collect();

        let headers = logged_headers(&properties, &filter);
        assert_eq!(headers, vec!["trace_id".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_queue_is_a_no_op() {
        let address = BrokerAddress::new("127.0.0.1", 1, 0);
        let client = BrokerClient::new(address, ClientOptions::default());
        assert!(client.unsubscribe("no-such-queue").await);
        assert!(client.unsubscribe("no-such-queue").await);
    }
}

//! Configuration options.

use std::sync::Arc;

/// Broker selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Priority,
    Random,
}

impl Default for Order {
    fn default() -> Self {
        Order::Priority
    }
}

pub type ExceptionCallback = Arc<dyn Fn(&str, Option<&[u8]>) + Send + Sync>;
pub type ExceptionOnReceiveCallback = Arc<dyn Fn(&[u8], &str) + Send + Sync>;
pub type NonDeliveryCallback = Arc<dyn Fn(&str, Option<&str>, Option<&str>, Option<&str>, &str) + Send + Sync>;
/// Type-erased decode check run against an inbound delivery's raw bytes
/// before a subscribe handler sees it; `Err` carries the decode failure
/// message forwarded to `ExceptionOnReceiveCallback`.
pub type DecodeValidator = Arc<dyn Fn(&[u8]) -> std::result::Result<(), String> + Send + Sync>;

/// Options used to construct the coordinator.
#[derive(Clone)]
pub struct ClientOptions {
    pub user: String,
    pub pass: String,
    pub vhost: String,
    /// Forbid broker connection redirection. Accepted for parity with the
    /// external option surface; `lapin`'s connection handshake has no
    /// redirect negotiation to suppress (modern RabbitMQ never redirects),
    /// so this has no effect on the transport.
    pub insist: bool,
    /// Seconds; reconnect delay is `rand(0, interval)`; default 60.
    pub reconnect_interval: u64,
    /// Seconds between transport heartbeats; `None` disables.
    pub heartbeat: Option<u16>,
    /// Unacked-message window; 0 = unbounded.
    pub prefetch: u16,
    /// Default publish selection order.
    pub order: Order,
    pub exception_callback: Option<ExceptionCallback>,
    pub exception_on_receive_callback: Option<ExceptionOnReceiveCallback>,
    pub non_delivery_callback: Option<NonDeliveryCallback>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user: "guest".to_string(),
            pass: "guest".to_string(),
            vhost: "/".to_string(),
            insist: false,
            reconnect_interval: 60,
            heartbeat: None,
            prefetch: 0,
            order: Order::default(),
            exception_callback: None,
            exception_on_receive_callback: None,
            non_delivery_callback: None,
        }
    }
}

/// Kind of exchange to declare, mirroring `lapin::ExchangeKind` without
/// forcing callers to depend on `lapin` types directly at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Exchange declaration used by publish/subscribe/declare.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// Publish options beyond AMQP standard.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub persistent: bool,
    pub mandatory: bool,
    pub immediate: bool,
    pub fanout: bool,
    pub brokers: Option<Vec<String>>,
    pub order: Option<Order>,
    pub no_serialize: bool,
    pub declare: bool,
    pub log_data: bool,
    pub no_log: bool,
    /// Header field names to omit from the SEND/RE-SEND log line.
    pub log_filter: Vec<String>,
}

/// Subscribe options.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub ack: bool,
    pub no_unserialize: bool,
    pub no_declare: bool,
    pub exchange2: Option<ExchangeSpec>,
    pub key: Option<String>,
    pub brokers: Option<Vec<String>>,
    pub category: Option<String>,
    pub log_data: bool,
    pub no_log: bool,
    /// Header field names to omit from the inbound-delivery log line.
    pub log_filter: Vec<String>,
    /// Allowed packet kinds; empty means "allow everything".
    pub allowed_kinds: Vec<String>,
    /// Validates each delivery's raw bytes decode via the serializer before
    /// dispatch; a failure routes to `ClientOptions::exception_on_receive_callback`
    /// and the handler is not called.
    pub decode_validator: Option<DecodeValidator>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("ack", &self.ack)
            .field("no_unserialize", &self.no_unserialize)
            .field("no_declare", &self.no_declare)
            .field("exchange2", &self.exchange2)
            .field("key", &self.key)
            .field("brokers", &self.brokers)
            .field("category", &self.category)
            .field("log_data", &self.log_data)
            .field("no_log", &self.no_log)
            .field("log_filter", &self.log_filter)
            .field("allowed_kinds", &self.allowed_kinds)
            .field("decode_validator", &self.decode_validator.is_some())
            .finish()
    }
}

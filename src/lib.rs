//! High-availability AMQP messaging client: fronts a priority-ordered set of
//! brokers as one logical publish/subscribe endpoint, failing over and
//! re-routing returned messages across the set as individual brokers drop in
//! and out.
//!
//! [`coordinator::HaBrokerClient`] is the entry point; [`config::ClientOptions`]
//! configures credentials, reconnect behavior, and callbacks.

#![forbid(unsafe_code)]

pub mod address;
pub mod barrier;
pub mod broker_client;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod serializer;
pub mod status;

pub use address::BrokerAddress;
pub use broker_client::{BrokerClient, DeclareTarget, SubscribeHandler};
pub use config::{ClientOptions, DecodeValidator, ExchangeKind, ExchangeSpec, Order, PublishOptions, SubscribeOptions};
pub use context::Context;
pub use coordinator::HaBrokerClient;
pub use error::{Error, Result};
pub use packet::{PacketMeta, PublishMeta};
pub use serializer::{decode_validator, BincodeSerializer};
pub use status::{
    Boundary, ConnectionStatusOptions, Status, StatsRecord, StatusEvent, StatusSummary, WatcherId,
};

//! Error taxonomy for the HA AMQP client.

/// Errors surfaced by the coordinator and per-broker clients.
///
/// Per the propagation policy, only [`Error::InvalidArgument`] and
/// [`Error::NoConnectedBrokers`] are expected to reach callers of
/// [`crate::coordinator::HaBrokerClient`] directly; the rest are logged and
/// routed to the exception tracker at the point they occur.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no user data supplied for broker addresses")]
    NoUserData,

    #[error("no broker hosts configured")]
    NoBrokerHosts,

    #[error("no connected brokers available for this operation")]
    NoConnectedBrokers,

    #[error("AMQP transport error: {0}")]
    Transport(#[from] lapin::Error),

    #[error("failed to decode inbound message: {0}")]
    Decode(String),

    #[error("subscriber handler failed: {0}")]
    Handler(String),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

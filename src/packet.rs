//! Capability-tagged packet metadata. A small trait that publishable packets
//! may optionally implement in place of duck-typed probing of arbitrary
//! payload types; packets that don't implement it still publish fine, just
//! with an all-`None` [`crate::context::Context`].

/// Metadata a packet may expose for context capture and logging. All
/// accessors default to `None` so implementing only the fields that matter
/// is enough.
pub trait PacketMeta {
    /// Human-readable packet kind, used for logging and the `non_delivery`
    /// callback's `type` argument.
    fn kind(&self) -> Option<&str> {
        None
    }

    /// Logical name of this packet instance.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Originating identity, forwarded to `non_delivery` as `from`.
    fn from(&self) -> Option<&str> {
        None
    }

    /// Correlation token, forwarded to `non_delivery` as `token`.
    fn token(&self) -> Option<&str> {
        None
    }

    /// True for fire-and-forget packets: a return with no remaining brokers
    /// still qualifies for the persistent/one_way retry-without-mandatory
    /// path.
    fn one_way(&self) -> bool {
        false
    }
}

/// Blanket impl so raw byte payloads (no metadata) can still be published;
/// all accessors return their defaults.
impl PacketMeta for Vec<u8> {}
impl PacketMeta for [u8] {}

/// Metadata captured from a packet at publish time, independent of its
/// concrete type — this is what actually gets stored in [`crate::context::Context`],
/// since the context cache must outlive any particular `T: PacketMeta`.
#[derive(Debug, Clone, Default)]
pub struct PublishMeta {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub from: Option<String>,
    pub token: Option<String>,
    pub one_way: bool,
}

impl PublishMeta {
    pub fn capture<T: PacketMeta>(packet: &T) -> Self {
        Self {
            name: packet.name().map(str::to_string),
            kind: packet.kind().map(str::to_string),
            from: packet.from().map(str::to_string),
            token: packet.token().map(str::to_string),
            one_way: packet.one_way(),
        }
    }
}

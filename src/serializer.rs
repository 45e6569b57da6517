//! Wire serialization for published packets. [`HaBrokerClient`](crate::coordinator::HaBrokerClient)
//! is generic over packet types bound by `Serialize`/`DeserializeOwned`, so
//! "must expose encode and decode" is enforced by the type system rather
//! than checked at construction time.
//!
//! [`BincodeSerializer`] is the default wire format.

use crate::config::DecodeValidator;
use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

#[derive(Default, Clone, Copy, Debug)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn encode<T: Serialize>(&self, packet: &T) -> Result<Vec<u8>> {
        bincode::serialize(packet).map_err(Error::Bincode)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Wraps a type-bound decode into the type-erased closure `SubscribeOptions`
/// carries, so the coordinator (which knows `T`) can hand the per-broker
/// consumer loop (which only ever sees raw bytes) a way to validate a
/// delivery before dispatch.
pub fn decode_validator<T>(serializer: BincodeSerializer) -> DecodeValidator
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(move |bytes: &[u8]| serializer.decode::<T>(bytes).map(|_| ()).map_err(|e| e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Packet {
        field: String,
    }

    #[test]
    fn round_trips_through_bincode() {
        let s = BincodeSerializer;
        let packet = Packet {
            field: "hello".into(),
        };
        let bytes = s.encode(&packet).unwrap();
        let decoded: Packet = s.decode(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn decode_failure_is_reported() {
        let s = BincodeSerializer;
        let err = s.decode::<Packet>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}

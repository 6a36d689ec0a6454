//! The identity of a remote node this process can connect to.

use serde::{Deserialize, Serialize};

/// A peer known to this node, immutable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(with = "hex_bytes")]
    pub identity_public_key: [u8; 32],
}

impl Peer {
    pub fn addr_key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("identity_public_key must be 32 bytes"))
    }
}

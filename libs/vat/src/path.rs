//! Vat identities and bootstrap paths.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;

use crate::VatError;

/// Length of a vat identity in bytes.
const VAT_ID_LEN: usize = 32;

/// An opaque routing identity naming one RPC mesh participant.
///
/// 256 bits, rendered as lowercase hex. Identities are generated fresh
/// per process incarnation; the core never derives meaning from the bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatId([u8; VAT_ID_LEN]);

impl VatId {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        let mut bytes = [0u8; VAT_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates an identity from raw bytes.
    pub const fn from_bytes(bytes: [u8; VAT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw identity bytes.
    pub const fn as_bytes(&self) -> &[u8; VAT_ID_LEN] {
        &self.0
    }

    /// Parses the lowercase hex rendering.
    pub fn parse(s: &str) -> Result<Self, VatError> {
        if s.len() != VAT_ID_LEN * 2 {
            return Err(VatError::InvalidLength {
                expected: VAT_ID_LEN * 2,
                actual: s.len(),
            });
        }
        let decoded = hex::decode(s).map_err(|e| VatError::InvalidHex(e.to_string()))?;
        let mut bytes = [0u8; VAT_ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is noise in logs; eight leading chars identify a vat.
        write!(f, "VatId({}..)", &hex::encode(self.0)[..8])
    }
}

impl FromStr for VatId {
    type Err = VatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for VatId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for VatId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An opaque bootstrap address: the identity of a vat together with the
/// socket address at which it accepts RPC connections.
///
/// A freshly launched machine establishes its `VatPath` during the run
/// handshake; peers use the path to make first contact. A path is valid
/// only until teardown of its machine begins.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VatPath {
    id: VatId,
    address: SocketAddr,
}

impl VatPath {
    /// Couples an identity with its connection address.
    pub const fn new(id: VatId, address: SocketAddr) -> Self {
        Self { id, address }
    }

    /// The vat's routing identity.
    pub const fn vat_id(&self) -> &VatId {
        &self.id
    }

    /// The address at which the vat accepts connections.
    pub const fn address(&self) -> SocketAddr {
        self.address
    }
}

impl fmt::Display for VatPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Names one member of a pool.
///
/// Identifiers are handed out by the server when a member joins. Besides the
/// server assigned number they carry the member's pool, the address it accepts
/// peer connections at, its location and the implementation data it joined
/// with.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    id: u64,
    pool: String,
    address: String,
    location: String,
    data: Vec<u8>,
}

impl Identifier {
    pub fn new(
        id: u64,
        pool: impl Into<String>,
        address: impl Into<String>,
        location: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            pool: pool.into(),
            address: address.into(),
            location: location.into(),
            data,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.location)
    }
}

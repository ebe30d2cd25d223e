//! Room tokens and the ids peers rendezvous on

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result};

/// Minimum token length accepted for a room
pub const MIN_TOKEN_LEN: usize = 5;
const ROOM_ID_LEN: usize = 10;

/// Shared secret that peers use to find each other.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomToken(String);

impl RoomToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into().trim().to_string();
        if token.chars().count() < MIN_TOKEN_LEN {
            return Err(Error::InvalidInput(format!(
                "room token must be at least {MIN_TOKEN_LEN} characters"
            )));
        }
        Ok(Self(token))
    }

    /// A fresh random token of the form `room-<hex>`.
    pub fn generate() -> Self {
        let mut random = Uuid::new_v4().simple().to_string();
        random.truncate(12);
        Self(format!("room-{random}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The public room id derived from this token.
    pub fn room_id(&self) -> RoomId {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(ROOM_ID_LEN);
        RoomId(id)
    }
}

impl fmt::Debug for RoomToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_tuple("RoomToken").field(&"[REDACTED]").finish()
    }
}

/// Public room identifier: a short hex prefix of the token's SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

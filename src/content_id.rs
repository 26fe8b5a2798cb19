//! Content identifiers with canonical equality.
//!
//! A CIDv0 (`Qm...`) and the CIDv1 of the same DAG (`bafy...`) address the
//! same content, as do a CIDv1 printed in base32 and in base58. Every
//! [`ContentId`] is stored in its CIDv1 form so that `==` compares what the
//! identifiers address rather than how they were spelled.

use std::fmt;
use std::str::FromStr;

use cid::Cid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An IPFS content identifier, canonicalised to CIDv1
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(Cid);

#[derive(Debug, thiserror::Error)]
#[error("invalid content identifier '{input}': {reason}")]
pub struct ContentIdError {
    input: String,
    reason: String,
}

impl ContentId {
    pub fn from_cid(cid: Cid) -> Result<Self, ContentIdError> {
        let v1 = cid.into_v1().map_err(|e| ContentIdError {
            input: cid.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ContentId(v1))
    }

    pub fn cid(&self) -> &Cid {
        &self.0
    }

    /// `/ipfs/<cid>` path form understood by the content store
    pub fn ipfs_path(&self) -> String {
        format!("/ipfs/{}", self)
    }

    /// Host label for a subdomain gateway. Base32 CIDv1 is lowercase and
    /// therefore survives DNS case folding.
    pub fn subdomain_label(&self) -> String {
        self.to_string()
    }
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    /// Accepts a bare CID or an `/ipfs/<cid>[/...]` path
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed
            .strip_prefix("/ipfs/")
            .or_else(|| trimmed.strip_prefix("ipfs://"))
            .unwrap_or(trimmed);
        let raw = raw.split('/').next().unwrap_or_default();

        let cid = Cid::try_from(raw).map_err(|e| ContentIdError {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_cid(cid)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

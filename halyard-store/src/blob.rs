// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// Content address of a blob: `sha256-<base64>` over the raw content.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlobDigest([u8; 32]);

impl BlobDigest {
    pub fn compute(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sha256-{}", base64::encode(self.0))
    }
}

impl fmt::Debug for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlobDigest({})", self)
    }
}

impl FromStr for BlobDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b64 = s
            .strip_prefix("sha256-")
            .ok_or_else(|| Error::InvalidParameter(format!("malformed blob digest {:?}", s)))?;
        let bytes = base64::decode(b64)
            .map_err(|_| Error::InvalidParameter(format!("malformed blob digest {:?}", s)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidParameter(format!("malformed blob digest {:?}", s)))?;
        Ok(Self(arr))
    }
}

/// Streaming write into a blob store. Content is digested as it is written;
/// `install` publishes it under its digest.
pub trait BlobWriter: Send {
    fn write(&mut self, chunk: &[u8]) -> Result<(), Error>;

    /// Publish the written content. When `expected` is given and does not
    /// match the computed digest, nothing is installed.
    fn install(self: Box<Self>, expected: Option<&BlobDigest>) -> Result<BlobDigest, Error>;
}

/// The content-addressed blob store, as the replication core consumes it.
pub trait BlobStore: Send + Sync {
    fn contains(&self, digest: &BlobDigest) -> bool;

    fn content(&self, digest: &BlobDigest) -> Result<Option<Bytes>, Error>;

    fn open_write(&self) -> Result<Box<dyn BlobWriter>, Error>;
}

/// In-memory [`BlobStore`].
#[derive(Clone, Default)]
pub struct MemBlobStore {
    blobs: Arc<RwLock<HashMap<BlobDigest, Bytes>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlobStore {
    fn contains(&self, digest: &BlobDigest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    fn content(&self, digest: &BlobDigest) -> Result<Option<Bytes>, Error> {
        Ok(self.blobs.read().get(digest).cloned())
    }

    fn open_write(&self) -> Result<Box<dyn BlobWriter>, Error> {
        Ok(Box::new(MemBlobWriter {
            blobs: Arc::clone(&self.blobs),
            buf: Vec::new(),
        }))
    }
}

struct MemBlobWriter {
    blobs: Arc<RwLock<HashMap<BlobDigest, Bytes>>>,
    buf: Vec<u8>,
}

impl BlobWriter for MemBlobWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn install(self: Box<Self>, expected: Option<&BlobDigest>) -> Result<BlobDigest, Error> {
        let digest = BlobDigest::compute(&self.buf);
        if let Some(expected) = expected {
            if expected != &digest {
                return Err(Error::CorruptRevisionData(format!(
                    "blob digest mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }
        self.blobs.write().insert(digest.clone(), Bytes::from(self.buf));
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let d = BlobDigest::compute(b"hello");
        let parsed: BlobDigest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);
        assert!("sha1-xxxx".parse::<BlobDigest>().is_err());
    }

    #[test]
    fn install_verifies_expected_digest() {
        let store = MemBlobStore::new();
        let mut w = store.open_write().unwrap();
        w.write(b"attachment ").unwrap();
        w.write(b"content").unwrap();
        let wrong = BlobDigest::compute(b"other");
        assert!(matches!(
            w.install(Some(&wrong)),
            Err(Error::CorruptRevisionData(_))
        ));

        let mut w = store.open_write().unwrap();
        w.write(b"attachment content").unwrap();
        let digest = w.install(None).unwrap();
        assert!(store.contains(&digest));
        assert_eq!(
            store.content(&digest).unwrap().unwrap(),
            Bytes::from_static(b"attachment content")
        );
    }
}

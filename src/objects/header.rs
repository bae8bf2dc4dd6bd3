use std::marker::PhantomData;

use bitcoin::{
    block::{Header as BtcHeader, Version},
    consensus,
    hash_types::TxMerkleNode,
    pow::CompactTarget,
    BlockHash,
};
use tracing::warn;

use crate::error::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// Attachment state of a [`Header`].
pub trait HeaderState: sealed::Sealed + Send + Sync + 'static {
    /// Whether setters may change the header.
    const MUTABLE: bool;
}

/// A header built by the client and not yet part of a block or the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached;

/// A header that belongs to a block or was fetched from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached;

impl sealed::Sealed for Detached {}
impl sealed::Sealed for Attached {}

impl HeaderState for Detached {
    const MUTABLE: bool = true;
}

impl HeaderState for Attached {
    const MUTABLE: bool = false;
}

/// An 80-byte block header plus the height it was fetched at.
///
/// The height is a snapshot of the chain position at fetch time and is not
/// updated if the chain later reorganizes past it. Setters only succeed on
/// [`Detached`] headers; on [`Attached`] ones they return
/// [`Error::ImmutableAttachedObject`] and leave the header unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header<S: HeaderState = Detached> {
    inner: BtcHeader,
    height: Option<u32>,
    _state: PhantomData<S>,
}

impl Header<Detached> {
    /// A detached header from its fields.
    pub fn new(
        version: u32,
        previous_block_hash: BlockHash,
        merkle: TxMerkleNode,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self::wrap(
            BtcHeader {
                version: Version::from_consensus(version as i32),
                prev_blockhash: previous_block_hash,
                merkle_root: merkle,
                time: timestamp,
                bits: CompactTarget::from_consensus(bits),
                nonce,
            },
            None,
        )
    }

    /// Decode an 80-byte wire header.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(Self::wrap(consensus::encode::deserialize(raw)?, None))
    }

    pub(crate) fn attach(self, height: Option<u32>) -> Header<Attached> {
        Header::wrap(self.inner, height)
    }
}

impl Header<Attached> {
    pub(crate) fn from_chain(inner: BtcHeader, height: Option<u32>) -> Self {
        Self::wrap(inner, height)
    }

    /// An editable copy without the fetch height.
    pub fn detach(&self) -> Header<Detached> {
        Header::wrap(self.inner, None)
    }

    pub(crate) fn with_height(mut self, height: Option<u32>) -> Self {
        self.height = height;
        self
    }
}

impl<S: HeaderState> Header<S> {
    fn wrap(inner: BtcHeader, height: Option<u32>) -> Self {
        Self {
            inner,
            height,
            _state: PhantomData,
        }
    }

    fn writable(&self, field: &'static str) -> Result<()> {
        if S::MUTABLE {
            Ok(())
        } else {
            warn!(field, hash = %self.hash(), "refusing to modify an attached header");
            Err(Error::ImmutableAttachedObject("header"))
        }
    }

    /// Height at fetch time; `None` for client-built headers.
    pub fn height(&self) -> Option<u32> {
        self.height
    }

    /// Protocol version.
    pub fn version(&self) -> u32 {
        self.inner.version.to_consensus() as u32
    }

    /// Hash of the parent block.
    pub fn previous_block_hash(&self) -> BlockHash {
        self.inner.prev_blockhash
    }

    /// Merkle root of the block's transactions.
    pub fn merkle(&self) -> TxMerkleNode {
        self.inner.merkle_root
    }

    /// Block hash, computed from the header fields.
    pub fn hash(&self) -> BlockHash {
        self.inner.block_hash()
    }

    /// Block timestamp.
    pub fn timestamp(&self) -> u32 {
        self.inner.time
    }

    /// Compact difficulty target.
    pub fn bits(&self) -> u32 {
        self.inner.bits.to_consensus()
    }

    /// Proof-of-work nonce.
    pub fn nonce(&self) -> u32 {
        self.inner.nonce
    }

    /// Set the version.
    pub fn set_version(&mut self, version: u32) -> Result<()> {
        self.writable("version")?;
        self.inner.version = Version::from_consensus(version as i32);
        Ok(())
    }

    /// Set the timestamp.
    pub fn set_timestamp(&mut self, timestamp: u32) -> Result<()> {
        self.writable("timestamp")?;
        self.inner.time = timestamp;
        Ok(())
    }

    /// Set the compact difficulty target.
    pub fn set_bits(&mut self, bits: u32) -> Result<()> {
        self.writable("bits")?;
        self.inner.bits = CompactTarget::from_consensus(bits);
        Ok(())
    }

    /// Set the nonce.
    pub fn set_nonce(&mut self, nonce: u32) -> Result<()> {
        self.writable("nonce")?;
        self.inner.nonce = nonce;
        Ok(())
    }

    /// The 80-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        consensus::encode::serialize(&self.inner)
    }

    /// The bitcoin crate's header.
    pub fn as_bitcoin(&self) -> &BtcHeader {
        &self.inner
    }
}

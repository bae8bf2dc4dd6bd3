//! Base58Check payment addresses.
use std::{fmt, str::FromStr};

use bitcoin::{hashes::Hash, PubkeyHash, ScriptBuf, ScriptHash};

use crate::{
    error::{Error, Result},
    objects::Script,
};

/// Version byte of mainnet pay-to-public-key-hash addresses.
pub const MAINNET_P2KH: u8 = 0x00;
/// Version byte of mainnet pay-to-script-hash addresses.
pub const MAINNET_P2SH: u8 = 0x05;
/// Version byte of testnet/regtest pay-to-public-key-hash addresses.
pub const TESTNET_P2KH: u8 = 0x6f;
/// Version byte of testnet/regtest pay-to-script-hash addresses.
pub const TESTNET_P2SH: u8 = 0xc4;

/// A decoded Base58Check address: one version byte and a 20-byte hash.
///
/// Decoding never yields a partially valid address; any checksum, length or
/// version failure is an [`Error::InvalidAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentAddress {
    version: u8,
    hash: [u8; 20],
}

impl PaymentAddress {
    /// Build from parts; fails on an unknown version byte.
    pub fn new(version: u8, hash: [u8; 20]) -> Result<Self> {
        match version {
            MAINNET_P2KH | MAINNET_P2SH | TESTNET_P2KH | TESTNET_P2SH => Ok(Self { version, hash }),
            v => Err(Error::InvalidAddress(format!("unknown version byte {v:#04x}"))),
        }
    }

    /// Version byte.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The 20-byte public key hash or script hash.
    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    /// True for pay-to-script-hash versions.
    pub fn is_script_hash(&self) -> bool {
        matches!(self.version, MAINNET_P2SH | TESTNET_P2SH)
    }

    /// Base58Check text.
    pub fn encoded(&self) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.version);
        payload.extend_from_slice(&self.hash);
        bitcoin::base58::encode_check(&payload)
    }

    /// Output script paying to this address, used as the history index key.
    pub fn script_pubkey(&self) -> Script {
        let script = if self.is_script_hash() {
            ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(self.hash))
        } else {
            ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(self.hash))
        };
        Script::from(script)
    }
}

impl FromStr for PaymentAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let payload =
            bitcoin::base58::decode_check(s).map_err(|e| Error::InvalidAddress(e.to_string()))?;
        if payload.len() != 21 {
            return Err(Error::InvalidAddress(format!(
                "payload is {} bytes, expected 21",
                payload.len()
            )));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Self::new(payload[0], hash)
    }
}

impl fmt::Display for PaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SATOSHI: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    #[test]
    fn decodes_genesis_address() {
        let a: PaymentAddress = SATOSHI.parse().unwrap();
        assert_eq!(a.version(), MAINNET_P2KH);
        assert_eq!(
            hex::encode(a.hash()),
            "62e907b15cbf27d5425399ebf6f0fb50ebb88f18"
        );
        assert_eq!(a.encoded(), SATOSHI);
        assert!(a.script_pubkey().as_script().is_p2pkh());
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut s = SATOSHI.to_string();
        s.pop();
        s.push('b');
        assert_eq!(
            s.parse::<PaymentAddress>().unwrap_err().kind(),
            crate::error::ErrorKind::InvalidAddress
        );
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut payload = vec![0x30u8];
        payload.extend_from_slice(&[1u8; 20]);
        let text = bitcoin::base58::encode_check(&payload);
        assert!(text.parse::<PaymentAddress>().is_err());
    }
}

use bitcoin::{
    blockdata::script::Instruction,
    consensus::{
        encode::{self, VarInt},
        Decodable,
    },
    Script as BtcScript, ScriptBuf,
};

use crate::error::Result;

/// Rule fork flags accepted by [`Script::to_string`].
pub mod forks {
    /// Pay-to-script-hash evaluation.
    pub const BIP16: u32 = 1 << 0;
    /// Duplicate transaction ids rejected.
    pub const BIP30: u32 = 1 << 1;
    /// Coinbase carries the block height.
    pub const BIP34: u32 = 1 << 2;
    /// Strict DER signatures.
    pub const BIP66: u32 = 1 << 3;
    /// `OP_CHECKLOCKTIMEVERIFY`.
    pub const BIP65: u32 = 1 << 4;
    /// `OP_CHECKSEQUENCEVERIFY`.
    pub const BIP112: u32 = 1 << 5;
    /// Every fork above.
    pub const ALL: u32 = BIP16 | BIP30 | BIP34 | BIP66 | BIP65 | BIP112;
}

/// An opaque script program.
///
/// `is_valid` reports whether the byte layout matched its length prefix when
/// the script was parsed; `is_valid_operations` reports whether every
/// operation parses. The two flags are independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Script {
    bytes: ScriptBuf,
    prefix_valid: bool,
}

impl Script {
    /// Parse script bytes. With `prefix`, `data` starts with a compact-size
    /// length that must match the remaining byte count.
    pub fn from_data(data: &[u8], prefix: bool) -> Self {
        if !prefix {
            return Self::from(ScriptBuf::from_bytes(data.to_vec()));
        }
        let mut cursor = data;
        match VarInt::consensus_decode(&mut cursor) {
            Ok(VarInt(len)) => Self {
                prefix_valid: len == cursor.len() as u64,
                bytes: ScriptBuf::from_bytes(cursor.to_vec()),
            },
            Err(_) => Self {
                bytes: ScriptBuf::new(),
                prefix_valid: false,
            },
        }
    }

    /// Borrow as a bitcoin script.
    pub fn as_script(&self) -> &BtcScript {
        self.bytes.as_script()
    }

    /// Raw program bytes, without a length prefix.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_bytes()
    }

    /// Prefix and byte count matched at parse time.
    pub fn is_valid(&self) -> bool {
        self.prefix_valid
    }

    /// Every operation parses; a push with a size mismatch fails this check.
    pub fn is_valid_operations(&self) -> bool {
        self.bytes.instructions().all(|i| i.is_ok())
    }

    /// Size of the program bytes.
    pub fn satoshi_content_size(&self) -> usize {
        self.bytes.len()
    }

    /// Serialized size, optionally including the compact-size prefix.
    pub fn serialized_size(&self, prefix: bool) -> usize {
        let len = self.bytes.len();
        if prefix {
            VarInt(len as u64).size() + len
        } else {
            len
        }
    }

    /// Human readable operations. Lock-time opcodes render under their
    /// fork name only when that fork is in `active_forks`.
    pub fn to_string(&self, active_forks: u32) -> String {
        self.bytes
            .to_asm_string()
            .split(' ')
            .map(|token| match token {
                "OP_CLTV" | "OP_CHECKLOCKTIMEVERIFY" | "OP_NOP2" => {
                    if active_forks & forks::BIP65 != 0 {
                        "OP_CHECKLOCKTIMEVERIFY"
                    } else {
                        "OP_NOP2"
                    }
                }
                "OP_CSV" | "OP_CHECKSEQUENCEVERIFY" | "OP_NOP3" => {
                    if active_forks & forks::BIP112 != 0 {
                        "OP_CHECKSEQUENCEVERIFY"
                    } else {
                        "OP_NOP3"
                    }
                }
                other => other,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Signature operation count. `embedded` selects accurate multisig
    /// counting, as used for redeem scripts.
    pub fn sigops(&self, embedded: bool) -> usize {
        if embedded {
            self.bytes.count_sigops()
        } else {
            self.bytes.count_sigops_legacy()
        }
    }

    /// Sigops of the redeem script pushed last by this input script, when
    /// `prevout_script` is pay-to-script-hash. Any other prevout yields `0`.
    pub fn embedded_sigops(&self, prevout_script: &Script) -> usize {
        if !prevout_script.is_pay_to_script_hash() {
            return 0;
        }
        match self.bytes.instructions().last() {
            Some(Ok(Instruction::PushBytes(data))) if !data.is_empty() => {
                BtcScript::from_bytes(data.as_bytes()).count_sigops()
            }
            _ => 0,
        }
    }

    /// Matches `OP_HASH160 <20 bytes> OP_EQUAL`.
    pub fn is_pay_to_script_hash(&self) -> bool {
        self.bytes.is_p2sh()
    }

    /// Length-prefixed wire bytes.
    pub fn to_data(&self, prefix: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size(prefix));
        if prefix {
            out.extend(encode::serialize(&VarInt(self.bytes.len() as u64)));
        }
        out.extend_from_slice(self.bytes.as_bytes());
        out
    }

    pub(crate) fn into_inner(self) -> ScriptBuf {
        self.bytes
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::from(ScriptBuf::new())
    }
}

impl From<ScriptBuf> for Script {
    fn from(bytes: ScriptBuf) -> Self {
        Self {
            bytes,
            prefix_valid: true,
        }
    }
}

/// Parse a hex script, mostly for fixtures.
pub fn script_from_hex(text: &str) -> Result<Script> {
    let bytes = hex::decode(text).map_err(|e| crate::Error::InvalidFormat(e.to_string()))?;
    Ok(Script::from_data(&bytes, false))
}

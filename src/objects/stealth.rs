use bitcoin::{
    blockdata::script::Instruction,
    hashes::{sha256d, Hash},
    opcodes::all::OP_RETURN,
    Txid,
};

use crate::objects::{Script, Transaction};

/// Sign byte prepended to the 32-byte ephemeral key coordinate.
pub const EPHEMERAL_KEY_SIGN: u8 = 0x02;

/// Bytes of a stealth prefix.
pub const PREFIX_SIZE: usize = 4;

/// One stealth payment row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stealth {
    ephemeral_public_key_hash: [u8; 33],
    transaction_hash: Txid,
    public_key_hash: [u8; 20],
}

impl Stealth {
    /// Row from its parts.
    pub fn new(
        ephemeral_public_key_hash: [u8; 33],
        transaction_hash: Txid,
        public_key_hash: [u8; 20],
    ) -> Self {
        Self {
            ephemeral_public_key_hash,
            transaction_hash,
            public_key_hash,
        }
    }

    /// Compressed ephemeral key, sign byte included.
    pub fn ephemeral_public_key_hash(&self) -> &[u8; 33] {
        &self.ephemeral_public_key_hash
    }

    /// Transaction carrying the payment.
    pub fn transaction_hash(&self) -> Txid {
        self.transaction_hash
    }

    /// Paid public key hash.
    pub fn public_key_hash(&self) -> &[u8; 20] {
        &self.public_key_hash
    }
}

/// A stealth row as indexed by a store: the row, its filter prefix and the
/// confirming height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthRecord {
    /// Leading bytes matched against a binary filter.
    pub prefix: [u8; PREFIX_SIZE],
    /// Height of the confirming block.
    pub height: u32,
    /// The row itself.
    pub stealth: Stealth,
}

/// Stealth prefix of a null-data script: the first four bytes of its
/// double-SHA256.
pub fn stealth_prefix(script: &Script) -> [u8; PREFIX_SIZE] {
    let digest = sha256d::Hash::hash(script.as_bytes()).to_byte_array();
    let mut prefix = [0u8; PREFIX_SIZE];
    prefix.copy_from_slice(&digest[..PREFIX_SIZE]);
    prefix
}

fn ephemeral_key(script: &Script) -> Option<[u8; 32]> {
    let mut ops = script.as_script().instructions();
    match (ops.next(), ops.next(), ops.next()) {
        (Some(Ok(Instruction::Op(OP_RETURN))), Some(Ok(Instruction::PushBytes(data))), None)
            if data.len() >= 32 =>
        {
            let mut key = [0u8; 32];
            key.copy_from_slice(&data.as_bytes()[..32]);
            Some(key)
        }
        _ => None,
    }
}

/// Stealth rows carried by `tx`: each `OP_RETURN <ephemeral key>` output
/// immediately followed by a pay-to-public-key-hash output.
pub fn extract_stealth(tx: &Transaction, height: u32) -> Vec<StealthRecord> {
    let outputs: Vec<_> = tx.outputs().iter().collect();
    outputs
        .windows(2)
        .filter_map(|pair| {
            let key = ephemeral_key(pair[0].script())?;
            let paid = pair[1].script().as_script();
            if !paid.is_p2pkh() {
                return None;
            }
            let mut ephemeral = [0u8; 33];
            ephemeral[0] = EPHEMERAL_KEY_SIGN;
            ephemeral[1..].copy_from_slice(&key);
            let mut pkh = [0u8; 20];
            pkh.copy_from_slice(&paid.as_bytes()[3..23]);
            Some(StealthRecord {
                prefix: stealth_prefix(pair[0].script()),
                height,
                stealth: Stealth::new(ephemeral, tx.hash(), pkh),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Input, Output, OutputPoint};
    use bitcoin::{PubkeyHash, ScriptBuf};

    fn stealth_tx(seed: u8) -> Transaction {
        Transaction::new(
            1,
            0,
            vec![Input::new(
                OutputPoint::new(Txid::from_byte_array([seed; 32]), 0),
                Script::default(),
                u32::MAX,
            )],
            vec![
                Output::new(0, Script::from(ScriptBuf::new_op_return([seed; 32]))),
                Output::new(
                    1_000,
                    Script::from(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([seed; 20]))),
                ),
            ],
        )
    }

    #[test]
    fn extracts_key_and_hash() {
        let tx = stealth_tx(9);
        let rows = extract_stealth(&tx, 44);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.height, 44);
        assert_eq!(row.stealth.ephemeral_public_key_hash()[0], EPHEMERAL_KEY_SIGN);
        assert_eq!(&row.stealth.ephemeral_public_key_hash()[1..], &[9u8; 32]);
        assert_eq!(row.stealth.public_key_hash(), &[9u8; 20]);
        assert_eq!(row.stealth.transaction_hash(), tx.hash());
        assert_eq!(row.prefix, stealth_prefix(tx.outputs()[0].script()));
    }

    #[test]
    fn plain_outputs_carry_no_stealth() {
        let tx = Transaction::new(
            1,
            0,
            vec![],
            vec![Output::new(1, Script::from(ScriptBuf::new_op_return([1u8; 8])))],
        );
        assert!(extract_stealth(&tx, 1).is_empty());
    }
}

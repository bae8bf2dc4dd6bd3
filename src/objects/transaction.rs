use bitcoin::{
    absolute::LockTime,
    consensus::{self, Encodable},
    hashes::{sha256d, Hash},
    transaction::Version,
    Amount, Sequence, TxIn, TxOut, Txid, Witness,
};

use crate::{
    error::{Error, Result},
    list::ListView,
    objects::{OutputPoint, Script},
};

/// Confirmations a coinbase output needs before it can be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Lock times below this are block heights, at or above it are timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Value reported for an output that could not be found.
pub const NOT_FOUND_VALUE: u64 = u64::MAX;

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    value: u64,
    script: Script,
}

impl Output {
    /// Output paying `value` satoshis to `script`.
    pub fn new(value: u64, script: Script) -> Self {
        Self { value, script }
    }

    /// Satoshi value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Locking script.
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// False only for the default "not found" output.
    pub fn is_valid(&self) -> bool {
        self.value != NOT_FOUND_VALUE || self.script.satoshi_content_size() != 0
    }

    /// Serialized size. The storage form (`wire == false`) carries an extra
    /// 4-byte spender height.
    pub fn serialized_size(&self, wire: bool) -> usize {
        let store = if wire { 0 } else { 4 };
        store + 8 + self.script.serialized_size(true)
    }

    /// Legacy sigop count of the locking script.
    pub fn signature_operations(&self) -> usize {
        self.script.sigops(false)
    }

    fn to_bitcoin(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.script.clone().into_inner(),
        }
    }
}

impl From<TxOut> for Output {
    fn from(o: TxOut) -> Self {
        Self::new(o.value.to_sat(), Script::from(o.script_pubkey))
    }
}

/// Spend status of a previous output, as known when it was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendState {
    /// Spent by a confirmed transaction.
    Confirmed,
    /// Spent by a mempool transaction.
    Unconfirmed,
}

/// Chain metadata about the output an input spends.
///
/// Attached by the query engine when a transaction is fetched or validated;
/// never part of the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prevout {
    /// The previous output itself.
    pub output: Output,
    /// Height of its transaction, `None` while in the mempool.
    pub height: Option<u32>,
    /// Whether its transaction is a coinbase.
    pub coinbase: bool,
    /// Whether something other than the inspecting transaction spends it.
    pub spender: Option<SpendState>,
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    previous_output: OutputPoint,
    script: Script,
    sequence: u32,
    witness: Witness,
    prevout: Option<Prevout>,
}

impl Input {
    /// Input spending `previous_output`.
    pub fn new(previous_output: OutputPoint, script: Script, sequence: u32) -> Self {
        Self {
            previous_output,
            script,
            sequence,
            witness: Witness::new(),
            prevout: None,
        }
    }

    /// The output this input spends.
    pub fn previous_output(&self) -> &OutputPoint {
        &self.previous_output
    }

    /// Unlocking script.
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Segregated witness stack.
    pub fn witness(&self) -> &Witness {
        &self.witness
    }

    /// Previous output metadata, when attached.
    pub fn prevout(&self) -> Option<&Prevout> {
        self.prevout.as_ref()
    }

    /// Sequence is final (`u32::MAX`).
    pub fn is_final(&self) -> bool {
        self.sequence == u32::MAX
    }

    /// False only for a fully default input.
    pub fn is_valid(&self) -> bool {
        self.sequence != 0 || self.previous_output.is_valid() || self.script.is_valid()
    }

    /// Serialized size: point, prefixed script and sequence.
    pub fn serialized_size(&self) -> usize {
        36 + self.script.serialized_size(true) + 4
    }

    /// Sigops of the unlocking script, plus the embedded redeem script's when
    /// BIP16 is active and the attached prevout is pay-to-script-hash.
    pub fn signature_operations(&self, bip16_active: bool) -> usize {
        let own = self.script.sigops(false);
        match (&self.prevout, bip16_active) {
            (Some(prev), true) => {
                own.saturating_add(self.script.embedded_sigops(prev.output.script()))
            }
            _ => own,
        }
    }

    fn to_bitcoin(&self) -> TxIn {
        TxIn {
            previous_output: self.previous_output.into(),
            script_sig: self.script.clone().into_inner(),
            sequence: Sequence(self.sequence),
            witness: self.witness.clone(),
        }
    }
}

impl From<TxIn> for Input {
    fn from(i: TxIn) -> Self {
        Self {
            previous_output: i.previous_output.into(),
            script: Script::from(i.script_sig),
            sequence: i.sequence.0,
            witness: i.witness,
            prevout: None,
        }
    }
}

/// A transaction. Input and output counts are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    version: u32,
    locktime: u32,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    hash: Txid,
}

impl Transaction {
    /// Assemble a transaction; its hash is computed once here.
    pub fn new(version: u32, locktime: u32, inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        let mut tx = Self {
            version,
            locktime,
            inputs,
            outputs,
            hash: Txid::all_zeros(),
        };
        tx.rehash();
        tx
    }

    /// Decode consensus bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let tx: bitcoin::Transaction = consensus::encode::deserialize(raw)?;
        Ok(tx.into())
    }

    /// Consensus bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        consensus::encode::serialize(&self.to_bitcoin())
    }

    /// Convert into the bitcoin crate's transaction.
    pub fn to_bitcoin(&self) -> bitcoin::Transaction {
        bitcoin::Transaction {
            version: Version(self.version as i32),
            lock_time: LockTime::from_consensus(self.locktime),
            input: self.inputs.iter().map(Input::to_bitcoin).collect(),
            output: self.outputs.iter().map(Output::to_bitcoin).collect(),
        }
    }

    /// Protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Lock time.
    pub fn locktime(&self) -> u32 {
        self.locktime
    }

    /// Change the version; the hash follows.
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
        self.rehash();
    }

    /// Change the lock time; the hash follows.
    pub fn set_locktime(&mut self, locktime: u32) {
        self.locktime = locktime;
        self.rehash();
    }

    fn rehash(&mut self) {
        self.hash = self.to_bitcoin().compute_txid();
    }

    /// Transaction id.
    pub fn hash(&self) -> Txid {
        self.hash
    }

    /// Double-SHA256 of the witness-stripped serialization followed by the
    /// little-endian `sighash_type`.
    pub fn hash_sighash_type(&self, sighash_type: u32) -> sha256d::Hash {
        let mut stripped = self.to_bitcoin();
        for input in &mut stripped.input {
            input.witness = Witness::new();
        }
        let mut engine = sha256d::Hash::engine();
        // Writing into a hash engine cannot fail.
        let _ = stripped.consensus_encode(&mut engine);
        let _ = sighash_type.consensus_encode(&mut engine);
        sha256d::Hash::from_engine(engine)
    }

    /// Serialized size. The storage form (`wire == false`) adds a 4-byte
    /// spender height per output.
    pub fn serialized_size(&self, wire: bool) -> usize {
        let size = consensus::encode::serialize(&self.to_bitcoin()).len();
        if wire {
            size
        } else {
            size + 4 * self.outputs.len()
        }
    }

    /// Lazy view over the inputs.
    pub fn inputs(&self) -> ListView<'_, Input> {
        ListView::new(&self.inputs)
    }

    /// Lazy view over the outputs.
    pub fn outputs(&self) -> ListView<'_, Output> {
        ListView::new(&self.outputs)
    }

    /// Attach previous-output metadata to input `index`.
    ///
    /// This is validation context only; the wire form is untouched.
    pub fn set_prevout(&mut self, index: usize, prevout: Option<Prevout>) -> Result<()> {
        let count = self.inputs.len();
        let input = self
            .inputs
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, count })?;
        input.prevout = prevout;
        Ok(())
    }

    /// Input value minus output value, floored at zero.
    pub fn fees(&self) -> u64 {
        self.total_input_value()
            .saturating_sub(self.total_output_value())
    }

    /// Sigop count with BIP16 active. Saturates at `usize::MAX`.
    pub fn signature_operations(&self) -> usize {
        self.signature_operations_bip16_active(true)
    }

    /// Sigop count over inputs and outputs. Saturates at `usize::MAX`.
    pub fn signature_operations_bip16_active(&self, bip16_active: bool) -> usize {
        let ins = self
            .inputs
            .iter()
            .map(|i| i.signature_operations(bip16_active));
        let outs = self.outputs.iter().map(Output::signature_operations);
        super::saturating_count(ins.chain(outs))
    }

    /// Sum of previous output values. A missing prevout counts as
    /// [`NOT_FOUND_VALUE`], so the sum saturates at `u64::MAX`.
    pub fn total_input_value(&self) -> u64 {
        self.inputs.iter().fold(0u64, |n, i| {
            let v = i.prevout.as_ref().map_or(NOT_FOUND_VALUE, |p| p.output.value);
            n.saturating_add(v)
        })
    }

    /// Sum of output values, saturating at `u64::MAX`.
    pub fn total_output_value(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |n, o| n.saturating_add(o.value))
    }

    /// Exactly one input, spending the null point.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// A non-coinbase transaction with a null previous output.
    pub fn is_null_non_coinbase(&self) -> bool {
        !self.is_coinbase() && self.inputs.iter().any(|i| i.previous_output.is_null())
    }

    /// Coinbase script outside the 2..=100 byte range.
    pub fn is_oversized_coinbase(&self) -> bool {
        if !self.is_coinbase() {
            return false;
        }
        let size = self.inputs[0].script.serialized_size(false);
        !(2..=100).contains(&size)
    }

    /// Spends a coinbase output that is not mature at `target_height`.
    pub fn is_immature(&self, target_height: u32) -> bool {
        self.inputs.iter().any(|i| match &i.prevout {
            Some(Prevout {
                coinbase: true,
                height: Some(h),
                ..
            }) => target_height < h.saturating_add(COINBASE_MATURITY),
            Some(Prevout {
                coinbase: true,
                height: None,
                ..
            }) => true,
            _ => false,
        })
    }

    /// Non-coinbase spending more than its inputs provide.
    pub fn is_overspent(&self) -> bool {
        !self.is_coinbase() && self.total_output_value() > self.total_input_value()
    }

    /// Some previous output is already spent; mempool spends count only
    /// with `include_unconfirmed`.
    pub fn is_double_spend(&self, include_unconfirmed: bool) -> bool {
        self.inputs
            .iter()
            .filter_map(|i| i.prevout.as_ref().and_then(|p| p.spender))
            .any(|s| s == SpendState::Confirmed || include_unconfirmed)
    }

    /// Some previous output metadata is absent.
    pub fn is_missing_previous_outputs(&self) -> bool {
        !self.is_coinbase() && self.inputs.iter().any(|i| i.prevout.is_none())
    }

    /// Final at `block_height` / `block_time`.
    pub fn is_final(&self, block_height: u32, block_time: u32) -> bool {
        if self.locktime == 0 {
            return true;
        }
        let limit = if self.locktime < LOCKTIME_THRESHOLD {
            block_height
        } else {
            block_time
        };
        self.locktime < limit || self.inputs.iter().all(Input::is_final)
    }

    /// A lock time is set but every input sequence disables it.
    pub fn is_locktime_conflict(&self) -> bool {
        self.locktime != 0 && !self.inputs.is_empty() && self.inputs.iter().all(Input::is_final)
    }
}

impl From<bitcoin::Transaction> for Transaction {
    fn from(tx: bitcoin::Transaction) -> Self {
        let hash = tx.compute_txid();
        Self {
            version: tx.version.0 as u32,
            locktime: tx.lock_time.to_consensus_u32(),
            inputs: tx.input.into_iter().map(Input::from).collect(),
            outputs: tx.output.into_iter().map(Output::from).collect(),
            hash,
        }
    }
}

//! In-memory overlay on the persisted unspent-output set.

use std::collections::HashMap;

use emberd_consensus::Hash256;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::{Block, OutPoint, Transaction, TxType};
use emberd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::{rule_error, ChainError, RuleErrorKind};

/// An unspent transaction output as persisted in the UTXO set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
    pub tx_type: TxType,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.write_u8(self.tx_type.as_u8());
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        let tx_type =
            TxType::from_u8(decoder.read_u8()?).ok_or(DecodeError::UnexpectedEnd)?;
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
            tx_type,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let entry = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(entry)
    }
}

/// Journal record for one spent output, sufficient to reverse the spend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentTxOut {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// Stake viewpoint the view represents, forwarded to the validator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StakeViewpoint {
    /// The view sits on top of the named best block with its regular
    /// transaction tree treated as valid.
    #[default]
    PrevValidInitial,
    /// The view reflects the current tip as committed.
    Tip,
}

#[derive(Clone, Debug)]
struct ViewEntry {
    output: UtxoEntry,
    spent: bool,
    modified: bool,
}

/// Overlay over the durable UTXO set. Entries are loaded on demand, amended
/// by connect/disconnect, and written back through a batch on commit.
pub struct UtxoView {
    entries: HashMap<OutPoint, ViewEntry>,
    best_hash: Hash256,
    viewpoint: StakeViewpoint,
}

impl UtxoView {
    pub fn new(best_hash: Hash256, viewpoint: StakeViewpoint) -> Self {
        Self {
            entries: HashMap::new(),
            best_hash,
            viewpoint,
        }
    }

    /// Hash of the block this view is built on top of.
    pub fn best_hash(&self) -> &Hash256 {
        &self.best_hash
    }

    pub fn set_best_hash(&mut self, hash: Hash256) {
        self.best_hash = hash;
    }

    pub fn viewpoint(&self) -> StakeViewpoint {
        self.viewpoint
    }

    /// The unspent entry for the outpoint, if the view knows it.
    pub fn lookup(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries
            .get(outpoint)
            .filter(|entry| !entry.spent)
            .map(|entry| &entry.output)
    }

    /// Loads any outputs referenced by the block's inputs that are not
    /// already in the view.
    pub fn fetch_inputs<S: KeyValueStore>(
        &mut self,
        store: &S,
        block: &Block,
    ) -> Result<(), ChainError> {
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if self.entries.contains_key(&input.prevout) {
                    continue;
                }
                let key = input.prevout.key_bytes();
                if let Some(bytes) = store.get(Column::Utxo, &key)? {
                    let output = UtxoEntry::decode(&bytes)?;
                    self.entries.insert(
                        input.prevout,
                        ViewEntry {
                            output,
                            spent: false,
                            modified: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn add_tx_outputs(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        let tx_type = tx.tx_type();
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint {
                hash: txid,
                index: index as u32,
            };
            self.entries.insert(
                outpoint,
                ViewEntry {
                    output: UtxoEntry {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase,
                        tx_type,
                    },
                    spent: false,
                    modified: true,
                },
            );
        }
    }

    /// Marks all outputs referenced by the block spent and adds the outputs
    /// it creates. Appends a journal record per spend when `stxos` is given.
    /// Deterministic in (view, block) only.
    pub fn connect_transactions(
        &mut self,
        block: &Block,
        mut stxos: Option<&mut Vec<SpentTxOut>>,
    ) -> Result<(), ChainError> {
        let height = block.header.height;
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let entry = match self.entries.get_mut(&input.prevout) {
                        Some(entry) if !entry.spent => entry,
                        _ => {
                            return Err(rule_error(
                                RuleErrorKind::MissingTxOut,
                                format!(
                                    "output {}:{} is unavailable",
                                    emberd_consensus::hash256_to_hex(&input.prevout.hash),
                                    input.prevout.index
                                ),
                            ))
                        }
                    };
                    entry.spent = true;
                    entry.modified = true;
                    if let Some(stxos) = stxos.as_deref_mut() {
                        stxos.push(SpentTxOut {
                            outpoint: input.prevout,
                            entry: entry.output.clone(),
                        });
                    }
                }
            }
            self.add_tx_outputs(tx, height);
        }
        self.best_hash = block.hash();
        Ok(())
    }

    /// The inverse of `connect_transactions`, reconstructing spent outputs
    /// from the journal records produced by the connect.
    pub fn disconnect_transactions(
        &mut self,
        block: &Block,
        stxos: &[SpentTxOut],
    ) -> Result<(), ChainError> {
        let mut cursor = stxos.len();
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for (index, _) in tx.outputs.iter().enumerate().rev() {
                let outpoint = OutPoint {
                    hash: txid,
                    index: index as u32,
                };
                self.entries.insert(
                    outpoint,
                    ViewEntry {
                        output: UtxoEntry {
                            value: 0,
                            script_pubkey: Vec::new(),
                            height: block.header.height,
                            is_coinbase: false,
                            tx_type: TxType::Regular,
                        },
                        spent: true,
                        modified: true,
                    },
                );
            }

            if !tx.is_coinbase() {
                for input in tx.inputs.iter().rev() {
                    if cursor == 0 {
                        return Err(ChainError::Corrupt(
                            "spend journal has fewer entries than block inputs",
                        ));
                    }
                    cursor -= 1;
                    let spent = &stxos[cursor];
                    if spent.outpoint != input.prevout {
                        return Err(ChainError::Corrupt(
                            "spend journal outpoint mismatch during disconnect",
                        ));
                    }
                    self.entries.insert(
                        spent.outpoint,
                        ViewEntry {
                            output: spent.entry.clone(),
                            spent: false,
                            modified: true,
                        },
                    );
                }
            }
        }
        if cursor != 0 {
            return Err(ChainError::Corrupt(
                "spend journal has more entries than block inputs",
            ));
        }
        self.best_hash = block.header.prev_block;
        Ok(())
    }

    /// Adds the view's modifications to the batch: spent entries become
    /// deletions, everything else an upsert.
    pub fn apply_to_batch(&self, batch: &mut WriteBatch) {
        for (outpoint, entry) in &self.entries {
            if !entry.modified {
                continue;
            }
            let key = outpoint.key_bytes();
            if entry.spent {
                batch.delete(Column::Utxo, key);
            } else {
                batch.put(Column::Utxo, key, entry.output.encode());
            }
        }
    }

    /// Drops fully spent entries and clears modified flags. Called after the
    /// durable write succeeded.
    pub fn commit(&mut self) {
        self.entries.retain(|_, entry| !entry.spent);
        for entry in self.entries.values_mut() {
            entry.modified = false;
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

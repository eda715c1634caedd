//! Transaction types with stake classification.

use emberd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Script tag byte marking a ticket-purchase output.
pub const TAG_TICKET: u8 = 0xba;
/// Script tag byte marking a vote output.
pub const TAG_VOTE: u8 = 0xbb;
/// Script tag byte marking a revocation output.
pub const TAG_REVOCATION: u8 = 0xbc;

/// Stake classification of a transaction, determined by the tag byte of its
/// first output script.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxType {
    Regular,
    Ticket,
    Vote,
    Revocation,
}

impl TxType {
    pub fn as_u8(self) -> u8 {
        match self {
            TxType::Regular => 0,
            TxType::Ticket => 1,
            TxType::Vote => 2,
            TxType::Revocation => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TxType::Regular),
            1 => Some(TxType::Ticket),
            2 => Some(TxType::Vote),
            3 => Some(TxType::Revocation),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    pub expiry: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode())
    }

    /// A coinbase has exactly one input whose previous output is null.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn tx_type(&self) -> TxType {
        let tag = self
            .outputs
            .first()
            .and_then(|output| output.script_pubkey.first());
        match tag {
            Some(&TAG_TICKET) => TxType::Ticket,
            Some(&TAG_VOTE) => TxType::Vote,
            Some(&TAG_REVOCATION) => TxType::Revocation,
            _ => TxType::Regular,
        }
    }

    /// The ticket consumed by a vote or revocation. Those spend the ticket
    /// output with their first input, so the referenced txid is the ticket.
    pub fn spent_ticket_hash(&self) -> Option<Hash256> {
        match self.tx_type() {
            TxType::Vote | TxType::Revocation => {
                self.inputs.first().map(|input| input.prevout.hash)
            }
            _ => None,
        }
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_var_int(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.write(encoder);
            encoder.write_var_bytes(&input.signature_script);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_var_int(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.write_u32_le(self.expiry);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_var_int()?;
        if input_count > u32::MAX as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut inputs = Vec::with_capacity(input_count.min(1_024) as usize);
        for _ in 0..input_count {
            inputs.push(TxIn {
                prevout: OutPoint::read(decoder)?,
                signature_script: decoder.read_var_bytes()?,
                sequence: decoder.read_u32_le()?,
            });
        }
        let output_count = decoder.read_var_int()?;
        if output_count > u32::MAX as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut outputs = Vec::with_capacity(output_count.min(1_024) as usize);
        for _ in 0..output_count {
            outputs.push(TxOut {
                value: decoder.read_i64_le()?,
                script_pubkey: decoder.read_var_bytes()?,
            });
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time: decoder.read_u32_le()?,
            expiry: decoder.read_u32_le()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }
}

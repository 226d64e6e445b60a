//! Minimal transaction wire codec.
//!
//! Just enough of the bitcoin-family serialization to ingest history
//! transactions into the ledger and to re-serialize signed transactions for
//! broadcast: inputs, outputs, optional witness data and the txid over the
//! legacy (witness-stripped) encoding. Script execution is out of scope.

use byteorder::{ByteOrder, LittleEndian};

use ember_electrum::chain::double_sha256;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;
const MAX_SANE_COUNT: u64 = 1_000_000;

/// Raised when raw bytes do not parse as a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TxDecodeError {
    /// Input ended mid-field.
    #[error("transaction truncated")]
    Truncated,
    /// A length prefix is implausibly large.
    #[error("implausible count {0}")]
    ImplausibleCount(u64),
    /// Bytes remain after the transaction ended.
    #[error("{0} trailing bytes after transaction")]
    TrailingBytes(usize),
    /// A transaction must fund and spend something.
    #[error("transaction has no inputs or no outputs")]
    Empty,
}

/// One transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    /// Previous output's txid, wire (little-endian) order.
    pub prev_txid: [u8; 32],
    /// Previous output's index.
    pub prev_vout: u32,
    /// Unlocking script.
    pub script_sig: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
    /// Witness stack, empty for legacy inputs.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    /// The previous output's txid in display order hex, the form history
    /// entries and the ledger use.
    #[must_use]
    pub fn prev_txid_hex(&self) -> String {
        let mut reversed = self.prev_txid;
        reversed.reverse();
        hex::encode(reversed)
    }
}

/// One transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Value in base units.
    pub value: i64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

/// A parsed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Version.
    pub version: i32,
    /// Inputs.
    pub inputs: Vec<TxIn>,
    /// Outputs.
    pub outputs: Vec<TxOut>,
    /// Lock time.
    pub lock_time: u32,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TxDecodeError> {
        if self.at + n > self.bytes.len() {
            return Err(TxDecodeError::Truncated);
        }
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TxDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, TxDecodeError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn i32(&mut self) -> Result<i32, TxDecodeError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn i64(&mut self) -> Result<i64, TxDecodeError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn varint(&mut self) -> Result<u64, TxDecodeError> {
        let value = match self.u8()? {
            0xfd => u64::from(LittleEndian::read_u16(self.take(2)?)),
            0xfe => u64::from(LittleEndian::read_u32(self.take(4)?)),
            0xff => LittleEndian::read_u64(self.take(8)?),
            small => u64::from(small),
        };
        if value > MAX_SANE_COUNT {
            return Err(TxDecodeError::ImplausibleCount(value));
        }
        Ok(value)
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>, TxDecodeError> {
        let len = self.varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.at
    }
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

impl Transaction {
    /// Decodes a transaction, accepting both legacy and segwit encodings.
    pub fn decode(raw: &[u8]) -> Result<Self, TxDecodeError> {
        let mut cursor = Cursor { bytes: raw, at: 0 };
        let version = cursor.i32()?;

        let mut input_count = cursor.varint()?;
        let segwit = input_count == u64::from(SEGWIT_MARKER) && cursor.remaining() > 0;
        if segwit {
            if cursor.u8()? != SEGWIT_FLAG {
                return Err(TxDecodeError::Truncated);
            }
            input_count = cursor.varint()?;
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let mut prev_txid = [0u8; 32];
            prev_txid.copy_from_slice(cursor.take(32)?);
            inputs.push(TxIn {
                prev_txid,
                prev_vout: cursor.u32()?,
                script_sig: cursor.var_bytes()?,
                sequence: cursor.u32()?,
                witness: Vec::new(),
            });
        }

        let output_count = cursor.varint()?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOut {
                value: cursor.i64()?,
                script_pubkey: cursor.var_bytes()?,
            });
        }

        if segwit {
            for input in &mut inputs {
                let items = cursor.varint()?;
                for _ in 0..items {
                    input.witness.push(cursor.var_bytes()?);
                }
            }
        }

        let lock_time = cursor.u32()?;
        if cursor.remaining() > 0 {
            return Err(TxDecodeError::TrailingBytes(cursor.remaining()));
        }
        if inputs.is_empty() || outputs.is_empty() {
            return Err(TxDecodeError::Empty);
        }
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Serializes the transaction. Witness encoding is used only when
    /// requested and at least one input carries witness data.
    #[must_use]
    pub fn encode(&self, include_witness: bool) -> Vec<u8> {
        let has_witness =
            include_witness && self.inputs.iter().any(|input| !input.witness.is_empty());
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        if has_witness {
            out.push(SEGWIT_MARKER);
            out.push(SEGWIT_FLAG);
        }
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(&input.prev_txid);
            out.extend_from_slice(&input.prev_vout.to_le_bytes());
            write_var_bytes(&mut out, &input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_var_bytes(&mut out, &output.script_pubkey);
        }
        if has_witness {
            for input in &self.inputs {
                write_varint(&mut out, input.witness.len() as u64);
                for item in &input.witness {
                    write_var_bytes(&mut out, item);
                }
            }
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    /// The transaction id: double SHA-256 over the witness-stripped
    /// encoding, rendered display order.
    #[must_use]
    pub fn txid(&self) -> String {
        let mut hash = double_sha256(&self.encode(false));
        hash.reverse();
        hex::encode(hash)
    }
}

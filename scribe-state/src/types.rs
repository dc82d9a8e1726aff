//! Core chain and row types for the Scribe index.

use std::fmt;

use core2::io::{self, Read, Write};

use crate::encoding::{
    read_bytes, read_fixed, read_i64_le, read_u32_le, read_u64_le, read_u8, read_vec, version,
    write_bytes, write_fixed, write_i64_le, write_u32_le, write_u64_le, write_u8, write_vec,
    RowSerde,
};

/// A block height on the canonical chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Height(pub u32);

impl Height {
    /// The key bytes used for height-keyed columns.
    ///
    /// Big-endian so lexicographic key order equals numeric order.
    pub fn to_key(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Parses a height key back into a [`Height`].
    pub fn from_key(key: &[u8]) -> io::Result<Self> {
        let bytes: [u8; 4] = key
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad height key length"))?;
        Ok(Height(u32::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RowSerde for Height {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32_le(w, self.0)
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Height(read_u32_le(r)?))
    }
}

/// A block hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Default,
)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid(pub [u8; 32]);

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl RowSerde for Txid {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_fixed::<32, _>(w, &self.0)
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Txid(read_fixed::<32, _>(r)?))
    }
}

/// An address descriptor: the canonical byte form of an address as derived
/// by the chain parser (typically the output script).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressDescriptor(pub Vec<u8>);

impl fmt::Display for AddressDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// A reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Outpoint {
    /// The transaction that created the output.
    pub txid: Txid,
    /// The output index within that transaction.
    pub vout: u32,
}

impl Outpoint {
    /// The key bytes used for outpoint-keyed columns: txid followed by
    /// the big-endian output index.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.vout.to_be_bytes());
        key
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// The output consumed by this input.
    pub prevout: Outpoint,
}

impl TxInput {
    /// True for the null prevout used by coinbase inputs.
    pub fn is_coinbase(&self) -> bool {
        self.prevout.txid.0 == [0u8; 32] && self.prevout.vout == u32::MAX
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Output amount in base units.
    pub value: u64,
    /// The locking script, also the source of the address descriptor.
    pub script: Vec<u8>,
}

/// A parsed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    /// Transaction identifier.
    pub txid: Txid,
    /// Inputs in order.
    pub inputs: Vec<TxInput>,
    /// Outputs in order.
    pub outputs: Vec<TxOutput>,
}

impl Tx {
    /// Sum of output values.
    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

impl RowSerde for Tx {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_fixed::<32, _>(&mut *w, &self.txid.0)?;
        write_vec(&mut *w, &self.inputs, |w, input| {
            write_fixed::<32, _>(&mut *w, &input.prevout.txid.0)?;
            write_u32_le(w, input.prevout.vout)
        })?;
        write_vec(&mut *w, &self.outputs, |w, output| {
            write_u64_le(&mut *w, output.value)?;
            write_bytes(w, &output.script)
        })
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        let txid = Txid(read_fixed::<32, _>(&mut *r)?);
        let inputs = read_vec(&mut *r, |r| {
            let txid = Txid(read_fixed::<32, _>(&mut *r)?);
            let vout = read_u32_le(r)?;
            Ok(TxInput {
                prevout: Outpoint { txid, vout },
            })
        })?;
        let outputs = read_vec(&mut *r, |r| {
            let value = read_u64_le(&mut *r)?;
            let script = read_bytes(r)?;
            Ok(TxOutput { value, script })
        })?;
        Ok(Tx {
            txid,
            inputs,
            outputs,
        })
    }
}

/// A block as delivered by the chain source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Height the source reports for this block.
    pub height: Height,
    /// Block hash.
    pub hash: BlockHash,
    /// Hash of the parent block.
    pub prev_hash: BlockHash,
    /// Block timestamp, seconds since the epoch.
    pub time: i64,
    /// Serialized block size in bytes.
    pub size: u32,
    /// Transactions in inclusion order.
    pub txs: Vec<Tx>,
}

/* ───────────────────────────── column rows ──────────────────────────────── */

/// Value stored in the `heights` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    /// Block hash.
    pub hash: BlockHash,
    /// Hash of the parent block.
    pub prev_hash: BlockHash,
    /// Block timestamp, seconds since the epoch.
    pub time: i64,
    /// Serialized block size in bytes.
    pub size: u32,
    /// Identifiers of the contained transactions in inclusion order.
    pub txids: Vec<Txid>,
}

impl RowSerde for BlockRow {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_fixed::<32, _>(&mut *w, &self.hash.0)?;
        write_fixed::<32, _>(&mut *w, &self.prev_hash.0)?;
        write_i64_le(&mut *w, self.time)?;
        write_u32_le(&mut *w, self.size)?;
        write_vec(w, &self.txids, |w, txid| write_fixed::<32, _>(w, &txid.0))
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(BlockRow {
            hash: BlockHash(read_fixed::<32, _>(&mut *r)?),
            prev_hash: BlockHash(read_fixed::<32, _>(&mut *r)?),
            time: read_i64_le(&mut *r)?,
            size: read_u32_le(&mut *r)?,
            txids: read_vec(r, |r| Ok(Txid(read_fixed::<32, _>(r)?)))?,
        })
    }
}

/// Value stored in the `transactions` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRow {
    /// Height the transaction confirmed at.
    pub height: Height,
    /// The transaction itself.
    pub tx: Tx,
}

impl RowSerde for TxRow {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32_le(&mut *w, self.height.0)?;
        self.tx.serialize(w)
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        let height = Height(read_u32_le(&mut *r)?);
        let tx = Tx::deserialize(r)?;
        Ok(TxRow { height, tx })
    }
}

/// One confirmed touch of an address by a transaction.
///
/// Canonical order within an address row is ascending `(height, tx_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrTxRef {
    /// Height of the touching transaction.
    pub height: Height,
    /// Position of the transaction within its block.
    pub tx_index: u32,
    /// Identifier of the touching transaction.
    pub txid: Txid,
}

impl AddrTxRef {
    /// The canonical sort key.
    pub fn sort_key(&self) -> (u32, u32) {
        (self.height.0, self.tx_index)
    }
}

/// A contract-style sub-entry of an address, kept only with extended indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRef {
    /// Descriptor of the contract.
    pub contract: AddressDescriptor,
    /// Number of transfers seen between the address and the contract.
    pub transfers: u32,
}

/// Value stored in the `addresses` column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddrHistory {
    /// Confirmed transactions touching the address, canonically ordered.
    pub refs: Vec<AddrTxRef>,
    /// Contract sub-entries, empty unless extended indexing is enabled.
    pub contracts: Vec<ContractRef>,
}

impl AddrHistory {
    /// True when the row carries no information and can be deleted.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.contracts.is_empty()
    }

    /// True when `refs` is in canonical `(height, tx_index)` order.
    pub fn is_sorted(&self) -> bool {
        self.refs.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key())
    }
}

impl RowSerde for AddrHistory {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_vec(&mut *w, &self.refs, |w, r| {
            write_u32_le(&mut *w, r.height.0)?;
            write_u32_le(&mut *w, r.tx_index)?;
            write_fixed::<32, _>(w, &r.txid.0)
        })?;
        write_vec(w, &self.contracts, |w, c| {
            write_bytes(&mut *w, &c.contract.0)?;
            write_u32_le(w, c.transfers)
        })
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        let refs = read_vec(&mut *r, |r| {
            let height = Height(read_u32_le(&mut *r)?);
            let tx_index = read_u32_le(&mut *r)?;
            let txid = Txid(read_fixed::<32, _>(r)?);
            Ok(AddrTxRef {
                height,
                tx_index,
                txid,
            })
        })?;
        let contracts = read_vec(r, |r| {
            let contract = AddressDescriptor(read_bytes(&mut *r)?);
            let transfers = read_u32_le(r)?;
            Ok(ContractRef {
                contract,
                transfers,
            })
        })?;
        Ok(AddrHistory { refs, contracts })
    }
}

/// Value stored in the `utxos` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoRow {
    /// Output amount in base units.
    pub value: u64,
    /// The locking script of the output.
    pub script: Vec<u8>,
    /// Height of the creating transaction.
    pub height: Height,
    /// Whether a confirmed transaction has consumed the output.
    pub spent: bool,
}

impl RowSerde for UtxoRow {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u64_le(&mut *w, self.value)?;
        write_bytes(&mut *w, &self.script)?;
        write_u32_le(&mut *w, self.height.0)?;
        write_u8(w, self.spent as u8)
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        let value = read_u64_le(&mut *r)?;
        let script = read_bytes(&mut *r)?;
        let height = Height(read_u32_le(&mut *r)?);
        let spent = match read_u8(r)? {
            0 => false,
            1 => true,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non-canonical spent flag {other}"),
                ))
            }
        };
        Ok(UtxoRow {
            value,
            script,
            height,
            spent,
        })
    }
}

/// Aggregate size statistics of one column family.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct ColumnStats {
    /// Column name.
    pub name: String,
    /// Number of rows.
    pub rows: u64,
    /// Total key bytes.
    pub key_bytes: u64,
    /// Total value bytes.
    pub value_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(tag: u8) -> Tx {
        Tx {
            txid: Txid([tag; 32]),
            inputs: vec![
                TxInput {
                    prevout: Outpoint {
                        txid: Txid([0; 32]),
                        vout: u32::MAX,
                    },
                },
                TxInput {
                    prevout: Outpoint {
                        txid: Txid([7; 32]),
                        vout: 1,
                    },
                },
            ],
            outputs: vec![
                TxOutput {
                    value: 5_000_000_000,
                    script: vec![0x76, 0xa9, tag],
                },
                TxOutput {
                    value: 0,
                    script: vec![],
                },
            ],
        }
    }

    #[test]
    fn height_key_order_matches_numeric_order() {
        let a = Height(1).to_key();
        let b = Height(256).to_key();
        let c = Height(65_536).to_key();
        assert!(a < b && b < c);
        assert_eq!(Height::from_key(&b).unwrap(), Height(256));
    }

    #[test]
    fn tx_round_trip() {
        let tx = sample_tx(3);
        let bytes = tx.to_bytes().unwrap();
        assert_eq!(Tx::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn coinbase_input_detected() {
        let tx = sample_tx(3);
        assert!(tx.inputs[0].is_coinbase());
        assert!(!tx.inputs[1].is_coinbase());
    }

    #[test]
    fn block_row_round_trip() {
        let row = BlockRow {
            hash: BlockHash([1; 32]),
            prev_hash: BlockHash([2; 32]),
            time: 1_700_000_000,
            size: 285,
            txids: vec![Txid([3; 32]), Txid([4; 32])],
        };
        let bytes = row.to_bytes().unwrap();
        assert_eq!(BlockRow::from_bytes(&bytes).unwrap(), row);
    }

    #[test]
    fn addr_history_round_trip_and_order_check() {
        let sorted = AddrHistory {
            refs: vec![
                AddrTxRef {
                    height: Height(1),
                    tx_index: 0,
                    txid: Txid([1; 32]),
                },
                AddrTxRef {
                    height: Height(1),
                    tx_index: 2,
                    txid: Txid([2; 32]),
                },
                AddrTxRef {
                    height: Height(9),
                    tx_index: 0,
                    txid: Txid([3; 32]),
                },
            ],
            contracts: vec![ContractRef {
                contract: AddressDescriptor(vec![0xAA]),
                transfers: 4,
            }],
        };
        assert!(sorted.is_sorted());
        let bytes = sorted.to_bytes().unwrap();
        assert_eq!(AddrHistory::from_bytes(&bytes).unwrap(), sorted);

        let mut unsorted = sorted.clone();
        unsorted.refs.swap(0, 2);
        assert!(!unsorted.is_sorted());
    }

    #[test]
    fn utxo_row_rejects_bad_spent_flag() {
        let row = UtxoRow {
            value: 42,
            script: vec![1, 2, 3],
            height: Height(7),
            spent: true,
        };
        let mut bytes = row.to_bytes().unwrap();
        assert_eq!(UtxoRow::from_bytes(&bytes).unwrap(), row);
        *bytes.last_mut().unwrap() = 9;
        assert!(UtxoRow::from_bytes(&bytes).is_err());
    }
}

//! Checksummed wrapper for database rows.

use crate::encoding::{read_fixed, write_fixed, version, CompactSize, RowSerde};

use blake2::{
    digest::{Update, VariableOutput},
    Blake2bVar,
};
use core2::io::{self, Read, Write};

/// A database value carrying its own integrity checksum.
///
/// Layout (little-endian unless noted):
///
/// ┌────── byte 0 ───────┬─────── CompactSize(len) ─────┬──── len bytes ───┬─ 32 bytes ─┐
/// │ StoredEntry version │ (length of item.serialize()) │       Body       │    Hash    │
/// └─────────────────────┴──────────────────────────────┴──────────────────┴────────────┘
///
/// The checksum covers `key || body`, so a value copied under the wrong key
/// is detected the same way as a torn write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry<T: RowSerde> {
    /// Inner record.
    item: T,
    /// Entry checksum.
    checksum: [u8; 32],
}

impl<T: RowSerde> StoredEntry<T> {
    /// Create a new entry, hashing `key || encoded_item`.
    pub fn new<K: AsRef<[u8]>>(key: K, item: T) -> io::Result<Self> {
        let mut body = Vec::new();
        item.serialize(&mut body)?;
        let checksum = Self::blake2b256(key.as_ref(), &body);
        Ok(Self { item, checksum })
    }

    /// Verify checksum given the DB key.
    ///
    /// Returns `true` if `self.checksum == blake2b256(key || item.serialize())`.
    pub fn verify<K: AsRef<[u8]>>(&self, key: K) -> io::Result<bool> {
        let mut body = Vec::new();
        self.item.serialize(&mut body)?;
        Ok(Self::blake2b256(key.as_ref(), &body) == self.checksum)
    }

    /// Returns a reference to the inner item.
    pub fn inner(&self) -> &T {
        &self.item
    }

    /// Consumes the entry, returning the inner item.
    pub fn into_inner(self) -> T {
        self.item
    }

    /// Computes a BLAKE2b-256 checksum over `key || body`.
    fn blake2b256(key: &[u8], body: &[u8]) -> [u8; 32] {
        let mut hasher = Blake2bVar::new(32).expect("32 is a valid Blake2bVar output size");
        hasher.update(key);
        hasher.update(body);
        let mut output = [0u8; 32];
        hasher
            .finalize_variable(&mut output)
            .expect("output buffer matches the requested size");
        output
    }
}

impl<T: RowSerde> RowSerde for StoredEntry<T> {
    const VERSION: u8 = version::V1;

    fn encode_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut body = Vec::new();
        self.item.serialize(&mut body)?;

        CompactSize::write(&mut *w, body.len())?;
        w.write_all(&body)?;
        write_fixed::<32, _>(w, &self.checksum)
    }

    fn decode_latest<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = CompactSize::read(&mut *r)? as usize;

        let mut body = vec![0u8; len];
        r.read_exact(&mut body)?;
        let item = T::deserialize(&body[..])?;

        let checksum = read_fixed::<32, _>(r)?;
        Ok(Self { item, checksum })
    }
}

/// Verifies the outer frame of a stored entry without knowing its row type.
///
/// Used by the offline repair pass, which must be able to judge a value
/// torn or intact for every column uniformly.
pub(crate) fn verify_raw(key: &[u8], value: &[u8]) -> bool {
    fn parse(value: &[u8]) -> io::Result<(usize, usize, [u8; 32])> {
        let mut cursor = core2::io::Cursor::new(value);
        let mut tag = [0u8; 1];
        cursor.read_exact(&mut tag)?;
        if tag[0] != version::V1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad entry tag"));
        }
        let len = CompactSize::read(&mut cursor)? as usize;
        let body_start = cursor.position() as usize;
        let mut body = vec![0u8; len];
        cursor.read_exact(&mut body)?;
        let checksum = read_fixed::<32, _>(&mut cursor)?;
        if cursor.position() as usize != value.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after entry",
            ));
        }
        Ok((body_start, len, checksum))
    }

    match parse(value) {
        Ok((body_start, len, checksum)) => {
            let body = &value[body_start..body_start + len];
            StoredEntry::<crate::types::Height>::blake2b256(key, body) == checksum
        }
        Err(_) => false,
    }
}

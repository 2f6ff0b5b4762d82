//! Capability strings: the only way to name, and gain access to, a file.
//!
//! | form | grants |
//! |------|--------|
//! | `URI:CHK:<key>:<crypttext-hash>:<k>:<n>:<size>` | read an immutable file |
//! | `URI:CHK-Verifier:<si>:<crypttext-hash>:<k>:<n>:<size>` | check and repair, no read |
//! | `URI:SSK:<writekey>:<fingerprint>` | read and write a mutable file |
//! | `URI:SSK-RO:<readkey>:<fingerprint>` | read a mutable file |
//! | `URI:DIR2:<writekey>:<fingerprint>` | read and write a directory |
//! | `URI:DIR2-RO:<readkey>:<fingerprint>` | read a directory |
//!
//! Byte fields are lowercase unpadded base32. Parsing is total: a string that
//! fits none of the forms becomes [`Capability::Unknown`], which keeps the
//! original text so it survives being written back out.

use std::fmt;
use std::str::FromStr;

use crate::constants::{HASH_SIZE, MAX_SHARES_TOTAL, STORAGE_INDEX_SIZE};
use crate::error::{GridError, Result};
use crate::hashutil::{self, StorageIndex};

const CHK: &str = "URI:CHK:";
const CHK_VERIFIER: &str = "URI:CHK-Verifier:";
const SSK: &str = "URI:SSK:";
const SSK_RO: &str = "URI:SSK-RO:";
const DIR2: &str = "URI:DIR2:";
const DIR2_RO: &str = "URI:DIR2-RO:";

/// Read capability for an immutable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkRead {
    pub key: [u8; HASH_SIZE],
    pub crypttext_hash: [u8; HASH_SIZE],
    pub needed: usize,
    pub total: usize,
    pub size: u64,
}

impl ChkRead {
    pub fn storage_index(&self) -> StorageIndex {
        hashutil::storage_index_hash(&self.key)
    }

    pub fn verifier(&self) -> ChkVerify {
        ChkVerify {
            storage_index: self.storage_index(),
            crypttext_hash: self.crypttext_hash,
            needed: self.needed,
            total: self.total,
            size: self.size,
        }
    }
}

/// Verify-only capability for an immutable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkVerify {
    pub storage_index: StorageIndex,
    pub crypttext_hash: [u8; HASH_SIZE],
    pub needed: usize,
    pub total: usize,
    pub size: u64,
}

/// Write capability for a mutable file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SskWrite {
    pub writekey: [u8; HASH_SIZE],
    pub fingerprint: [u8; HASH_SIZE],
}

impl SskWrite {
    pub fn readonly(&self) -> SskRead {
        SskRead {
            readkey: hashutil::ssk_readkey_hash(&self.writekey),
            fingerprint: self.fingerprint,
        }
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.readonly().storage_index()
    }
}

/// Read capability for a mutable file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SskRead {
    pub readkey: [u8; HASH_SIZE],
    pub fingerprint: [u8; HASH_SIZE],
}

impl SskRead {
    pub fn storage_index(&self) -> StorageIndex {
        hashutil::ssk_storage_index_hash(&self.readkey)
    }
}

/// A parsed capability string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    ImmutableRead(ChkRead),
    ImmutableVerify(ChkVerify),
    MutableWrite(SskWrite),
    MutableRead(SskRead),
    DirectoryWrite(SskWrite),
    DirectoryRead(SskRead),
    Unknown { uri: String, reason: String },
}

fn field<const N: usize>(uri: &str, name: &str, encoded: &str) -> Result<[u8; N]> {
    let bytes = hashutil::a2b(encoded)
        .map_err(|e| GridError::malformed(uri, format!("{name}: {e}")))?;
    if hashutil::b2a(&bytes) != encoded {
        return Err(GridError::malformed(uri, format!("{name}: not canonical base32")));
    }
    bytes
        .try_into()
        .map_err(|_| GridError::malformed(uri, format!("{}: expected {} bytes", name, N)))
}

fn number<T: FromStr>(uri: &str, name: &str, text: &str) -> Result<T> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) || (text.len() > 1 && text.starts_with('0')) {
        return Err(GridError::malformed(uri, format!("{name}: not a number")));
    }
    text.parse()
        .map_err(|_| GridError::malformed(uri, format!("{name}: out of range")))
}

/// Splits the part after the prefix into exactly `count` fields.
fn fields<'a>(uri: &str, rest: &'a str, count: usize) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != count {
        return Err(GridError::malformed(
            uri,
            format!("expected {count} fields, found {}", parts.len()),
        ));
    }
    Ok(parts)
}

fn parse_shares(uri: &str, k: &str, n: &str) -> Result<(usize, usize)> {
    let needed: usize = number(uri, "k", k)?;
    let total: usize = number(uri, "n", n)?;
    if needed == 0 || needed > total || total > MAX_SHARES_TOTAL {
        return Err(GridError::malformed(uri, format!("bad encoding {needed}-of-{total}")));
    }
    Ok((needed, total))
}

fn parse_ssk(uri: &str, rest: &str, key_name: &str) -> Result<([u8; HASH_SIZE], [u8; HASH_SIZE])> {
    let parts = fields(uri, rest, 2)?;
    Ok((
        field(uri, key_name, parts[0])?,
        field(uri, "fingerprint", parts[1])?,
    ))
}

impl Capability {
    /// Parses any string; unrecognised or malformed input becomes `Unknown`.
    pub fn parse(uri: &str) -> Capability {
        uri.parse().unwrap_or_else(|e: GridError| Capability::Unknown {
            uri: uri.to_string(),
            reason: match e {
                GridError::MalformedCapability { reason, .. } => reason,
                other => other.to_string(),
            },
        })
    }

    fn parse_strict(uri: &str) -> Result<Capability> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix(CHK) {
            let p = fields(uri, rest, 5)?;
            let (needed, total) = parse_shares(uri, p[2], p[3])?;
            return Ok(Capability::ImmutableRead(ChkRead {
                key: field(uri, "key", p[0])?,
                crypttext_hash: field(uri, "crypttext hash", p[1])?,
                needed,
                total,
                size: number(uri, "size", p[4])?,
            }));
        }
        if let Some(rest) = uri.strip_prefix(CHK_VERIFIER) {
            let p = fields(uri, rest, 5)?;
            let (needed, total) = parse_shares(uri, p[2], p[3])?;
            let si: [u8; STORAGE_INDEX_SIZE] = field(uri, "storage index", p[0])?;
            return Ok(Capability::ImmutableVerify(ChkVerify {
                storage_index: StorageIndex::from_bytes(si),
                crypttext_hash: field(uri, "crypttext hash", p[1])?,
                needed,
                total,
                size: number(uri, "size", p[4])?,
            }));
        }
        if let Some(rest) = uri.strip_prefix(SSK_RO) {
            let (readkey, fingerprint) = parse_ssk(uri, rest, "readkey")?;
            return Ok(Capability::MutableRead(SskRead { readkey, fingerprint }));
        }
        if let Some(rest) = uri.strip_prefix(SSK) {
            let (writekey, fingerprint) = parse_ssk(uri, rest, "writekey")?;
            return Ok(Capability::MutableWrite(SskWrite { writekey, fingerprint }));
        }
        if let Some(rest) = uri.strip_prefix(DIR2_RO) {
            let (readkey, fingerprint) = parse_ssk(uri, rest, "readkey")?;
            return Ok(Capability::DirectoryRead(SskRead { readkey, fingerprint }));
        }
        if let Some(rest) = uri.strip_prefix(DIR2) {
            let (writekey, fingerprint) = parse_ssk(uri, rest, "writekey")?;
            return Ok(Capability::DirectoryWrite(SskWrite { writekey, fingerprint }));
        }
        Err(GridError::malformed(uri, "unrecognised capability form"))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Capability::Unknown { .. })
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            Capability::MutableWrite(_)
                | Capability::MutableRead(_)
                | Capability::DirectoryWrite(_)
                | Capability::DirectoryRead(_)
        )
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Capability::DirectoryWrite(_) | Capability::DirectoryRead(_))
    }

    pub fn is_writeable(&self) -> bool {
        matches!(self, Capability::MutableWrite(_) | Capability::DirectoryWrite(_))
    }

    /// The read-only form of this capability, `None` if it grants no read access.
    pub fn read_only(&self) -> Option<Capability> {
        match self {
            Capability::ImmutableRead(_)
            | Capability::MutableRead(_)
            | Capability::DirectoryRead(_) => Some(self.clone()),
            Capability::MutableWrite(w) => Some(Capability::MutableRead(w.readonly())),
            Capability::DirectoryWrite(w) => Some(Capability::DirectoryRead(w.readonly())),
            Capability::ImmutableVerify(_) | Capability::Unknown { .. } => None,
        }
    }

    /// Verify-only form of an immutable capability.
    pub fn verifier(&self) -> Option<Capability> {
        match self {
            Capability::ImmutableRead(r) => Some(Capability::ImmutableVerify(r.verifier())),
            Capability::ImmutableVerify(_) => Some(self.clone()),
            _ => None,
        }
    }

    pub fn storage_index(&self) -> Option<StorageIndex> {
        match self {
            Capability::ImmutableRead(r) => Some(r.storage_index()),
            Capability::ImmutableVerify(v) => Some(v.storage_index),
            Capability::MutableWrite(w) | Capability::DirectoryWrite(w) => Some(w.storage_index()),
            Capability::MutableRead(r) | Capability::DirectoryRead(r) => Some(r.storage_index()),
            Capability::Unknown { .. } => None,
        }
    }
}

impl FromStr for Capability {
    type Err = GridError;

    /// Strict parse: fails with `MalformedCapability` instead of producing `Unknown`.
    fn from_str(s: &str) -> Result<Self> {
        Capability::parse_strict(s)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use hashutil::b2a;
        match self {
            Capability::ImmutableRead(r) => write!(
                f,
                "{CHK}{}:{}:{}:{}:{}",
                b2a(&r.key),
                b2a(&r.crypttext_hash),
                r.needed,
                r.total,
                r.size
            ),
            Capability::ImmutableVerify(v) => write!(
                f,
                "{CHK_VERIFIER}{}:{}:{}:{}:{}",
                v.storage_index,
                b2a(&v.crypttext_hash),
                v.needed,
                v.total,
                v.size
            ),
            Capability::MutableWrite(w) => {
                write!(f, "{SSK}{}:{}", b2a(&w.writekey), b2a(&w.fingerprint))
            }
            Capability::MutableRead(r) => {
                write!(f, "{SSK_RO}{}:{}", b2a(&r.readkey), b2a(&r.fingerprint))
            }
            Capability::DirectoryWrite(w) => {
                write!(f, "{DIR2}{}:{}", b2a(&w.writekey), b2a(&w.fingerprint))
            }
            Capability::DirectoryRead(r) => {
                write!(f, "{DIR2_RO}{}:{}", b2a(&r.readkey), b2a(&r.fingerprint))
            }
            Capability::Unknown { uri, .. } => f.write_str(uri),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chk() -> ChkRead {
        ChkRead {
            key: [1; HASH_SIZE],
            crypttext_hash: [2; HASH_SIZE],
            needed: 3,
            total: 10,
            size: 12_345,
        }
    }

    fn ssk() -> SskWrite {
        SskWrite {
            writekey: [3; HASH_SIZE],
            fingerprint: [4; HASH_SIZE],
        }
    }

    #[test]
    fn test_every_variant_round_trips() {
        let caps = vec![
            Capability::ImmutableRead(chk()),
            Capability::ImmutableVerify(chk().verifier()),
            Capability::MutableWrite(ssk()),
            Capability::MutableRead(ssk().readonly()),
            Capability::DirectoryWrite(ssk()),
            Capability::DirectoryRead(ssk().readonly()),
            Capability::parse("URI:LIT:nbswy3dp"),
        ];
        for cap in caps {
            let text = cap.to_string();
            assert_eq!(Capability::parse(&text), cap, "{text}");
            assert_eq!(Capability::parse(&text).to_string(), text);
        }
    }

    #[test]
    fn test_attenuation() {
        let write = Capability::MutableWrite(ssk());
        let read = write.read_only().unwrap();
        assert!(matches!(read, Capability::MutableRead(_)));
        assert_eq!(read.storage_index(), write.storage_index());
        assert!(!read.is_writeable());

        let imm = Capability::ImmutableRead(chk());
        let verify = imm.verifier().unwrap();
        assert_eq!(verify.storage_index(), imm.storage_index());
        assert!(verify.read_only().is_none());
        assert!(write.verifier().is_none());
    }

    #[test]
    fn test_malformed_strings_become_unknown() {
        let good = Capability::ImmutableRead(chk()).to_string();
        let cases = [
            String::new(),
            "garbage".to_string(),
            "URI:CHK:abc".to_string(),
            good.replace(":3:10:", ":11:10:"),
            good.replace(":3:10:", ":03:10:"),
            format!("{good}:extra"),
            "URI:SSK:aaaa:bbbb".to_string(),
        ];
        for case in cases {
            let cap = Capability::parse(&case);
            assert!(cap.is_unknown(), "{case} parsed as {cap:?}");
            assert_eq!(cap.to_string(), case);
            assert!(matches!(
                case.parse::<Capability>(),
                Err(GridError::MalformedCapability { .. })
            ));
        }
    }

    #[test]
    fn test_kind_predicates() {
        let dir = Capability::DirectoryWrite(ssk());
        assert!(dir.is_mutable() && dir.is_directory() && dir.is_writeable());
        let imm = Capability::ImmutableRead(chk());
        assert!(!imm.is_mutable() && !imm.is_directory());
        assert!(Capability::parse("x").storage_index().is_none());
    }
}

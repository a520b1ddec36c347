//! Bulk checksums.
//!
//! Digests are computed over the active byte range of every fragment of a
//! bulk descriptor, in order. A caller buffer shorter than the digest gets
//! the leading bytes of the full digest.

use std::fmt;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::bulk::{BulkDesc, BulkFragment};
use crate::error::{SecError, SecResult};

/// Largest digest any algorithm produces.
pub const HASH_DIGEST_SIZE_MAX: usize = 64;

/// Smallest caller buffer accepted by [`compute_bulk_checksum`].
pub const MIN_CHECKSUM_BUF: usize = 4;

/// Bulk hash algorithms, by wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BulkHashAlg {
    /// No hashing; not usable for checksums.
    Null = 0,
    /// Adler-32.
    Adler32 = 1,
    /// CRC-32 (IEEE).
    Crc32 = 2,
    /// MD5.
    Md5 = 3,
    /// SHA-1.
    Sha1 = 4,
    /// SHA-256.
    Sha256 = 5,
    /// SHA-384.
    Sha384 = 6,
    /// SHA-512.
    Sha512 = 7,
}

impl BulkHashAlg {
    /// One past the highest wire id.
    pub const MAX: u8 = 8;

    /// Every algorithm, in wire id order.
    pub const ALL: [BulkHashAlg; 8] = [
        BulkHashAlg::Null,
        BulkHashAlg::Adler32,
        BulkHashAlg::Crc32,
        BulkHashAlg::Md5,
        BulkHashAlg::Sha1,
        BulkHashAlg::Sha256,
        BulkHashAlg::Sha384,
        BulkHashAlg::Sha512,
    ];

    /// Looks up an algorithm by wire id.
    pub fn from_u8(id: u8) -> SecResult<Self> {
        Self::ALL
            .get(id as usize)
            .copied()
            .ok_or_else(|| SecError::UnsupportedAlgorithm(id.to_string()))
    }

    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            BulkHashAlg::Null => "null",
            BulkHashAlg::Adler32 => "adler32",
            BulkHashAlg::Crc32 => "crc32",
            BulkHashAlg::Md5 => "md5",
            BulkHashAlg::Sha1 => "sha1",
            BulkHashAlg::Sha256 => "sha256",
            BulkHashAlg::Sha384 => "sha384",
            BulkHashAlg::Sha512 => "sha512",
        }
    }

    /// Looks up an algorithm by name, ignoring case.
    pub fn from_name(name: &str) -> SecResult<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| SecError::UnsupportedAlgorithm(name.to_string()))
    }

    /// Native digest length in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            BulkHashAlg::Null => 0,
            BulkHashAlg::Adler32 | BulkHashAlg::Crc32 => 4,
            BulkHashAlg::Md5 => 16,
            BulkHashAlg::Sha1 => 20,
            BulkHashAlg::Sha256 => 32,
            BulkHashAlg::Sha384 => 48,
            BulkHashAlg::Sha512 => 64,
        }
    }
}

impl fmt::Display for BulkHashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const ADLER_MOD: u32 = 65521;
// largest n such that 255 * n * (n + 1) / 2 + (n + 1) * (ADLER_MOD - 1) fits in u32
const ADLER_NMAX: usize = 5552;

/// Incremental Adler-32.
#[derive(Debug, Clone, Copy)]
struct Adler32 {
    a: u32,
    b: u32,
}

impl Adler32 {
    fn new() -> Self {
        Self { a: 1, b: 0 }
    }

    fn update(&mut self, data: &[u8]) {
        for chunk in data.chunks(ADLER_NMAX) {
            for &byte in chunk {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= ADLER_MOD;
            self.b %= ADLER_MOD;
        }
    }

    fn finalize(self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// One in-flight digest.
enum Hasher {
    Adler32(Adler32),
    Crc32(crc32fast::Hasher),
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(alg: BulkHashAlg) -> SecResult<Self> {
        Ok(match alg {
            BulkHashAlg::Null => {
                return Err(SecError::UnsupportedAlgorithm(alg.name().to_string()))
            }
            BulkHashAlg::Adler32 => Hasher::Adler32(Adler32::new()),
            BulkHashAlg::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            BulkHashAlg::Md5 => Hasher::Md5(Md5::new()),
            BulkHashAlg::Sha1 => Hasher::Sha1(Sha1::new()),
            BulkHashAlg::Sha256 => Hasher::Sha256(Sha256::new()),
            BulkHashAlg::Sha384 => Hasher::Sha384(Sha384::new()),
            BulkHashAlg::Sha512 => Hasher::Sha512(Sha512::new()),
        })
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Adler32(h) => h.update(data),
            Hasher::Crc32(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Writes the full digest into `out` and returns its length.
    fn finalize_into(self, out: &mut [u8; HASH_DIGEST_SIZE_MAX]) -> usize {
        let mut put = |digest: &[u8]| {
            out[..digest.len()].copy_from_slice(digest);
            digest.len()
        };
        match self {
            Hasher::Adler32(h) => put(&h.finalize().to_le_bytes()[..]),
            Hasher::Crc32(h) => put(&h.finalize().to_le_bytes()[..]),
            Hasher::Md5(h) => put(h.finalize().as_slice()),
            Hasher::Sha1(h) => put(h.finalize().as_slice()),
            Hasher::Sha256(h) => put(h.finalize().as_slice()),
            Hasher::Sha384(h) => put(h.finalize().as_slice()),
            Hasher::Sha512(h) => put(h.finalize().as_slice()),
        }
    }
}

/// Hashes the active range of every fragment with `alg` into `out`.
///
/// Returns the number of bytes written: the digest size, or `out.len()` when
/// the buffer is shorter and the digest was truncated.
pub fn compute_bulk_checksum(
    fragments: &[BulkFragment],
    alg: BulkHashAlg,
    out: &mut [u8],
) -> SecResult<usize> {
    if out.len() < MIN_CHECKSUM_BUF {
        return Err(SecError::BufferTooSmall {
            len: out.len(),
            min: MIN_CHECKSUM_BUF,
        });
    }

    let mut hasher = Hasher::new(alg)?;
    let mut nob = 0usize;
    for frag in fragments {
        hasher.update(frag.data());
        nob += frag.len();
    }

    let mut digest = [0u8; HASH_DIGEST_SIZE_MAX];
    let size = hasher.finalize_into(&mut digest);
    let written = size.min(out.len());
    out[..written].copy_from_slice(&digest[..written]);

    debug!(
        alg = %alg,
        fragments = fragments.len(),
        nob,
        written,
        truncated = written < size,
        "computed bulk checksum"
    );
    Ok(written)
}

impl BulkDesc {
    /// Checksums this descriptor's fragments; see [`compute_bulk_checksum`].
    pub fn checksum(&self, alg: BulkHashAlg, out: &mut [u8]) -> SecResult<usize> {
        compute_bulk_checksum(self.fragments(), alg, out)
    }
}

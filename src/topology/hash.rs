use serde::{Deserialize, Serialize};
use std::fmt;

const FNV_32_INIT: u32 = 2_166_136_261;
const FNV_32_PRIME: u32 = 16_777_619;
const FNV_64_INIT: u64 = 14_695_981_039_346_656_037;
const FNV_64_PRIME: u64 = 1_099_511_628_211;

/// Key hashing functions a topology document may name in `hashAlgorithm`.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// CRC-32 folded to 15 bits, the default for partitioned documents.
    Crc,
    Fnv1_32,
    Fnv1a_32,
    Fnv1_64,
    Fnv1a_64,
}

impl HashAlgorithm {
    /// Looks up an algorithm by the name used on the wire (case-insensitive).
    pub fn lookup(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "CRC" | "CRC_HASH" => Some(Self::Crc),
            "FNV1_32" | "FNV1_32_HASH" => Some(Self::Fnv1_32),
            "FNV1A_32" | "FNV1A_32_HASH" => Some(Self::Fnv1a_32),
            "FNV1_64" | "FNV1_64_HASH" => Some(Self::Fnv1_64),
            "FNV1A_64" | "FNV1A_64_HASH" => Some(Self::Fnv1a_64),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Crc => "CRC",
            Self::Fnv1_32 => "FNV1_32",
            Self::Fnv1a_32 => "FNV1A_32",
            Self::Fnv1_64 => "FNV1_64",
            Self::Fnv1a_64 => "FNV1A_64",
        }
    }

    /// Hashes a key. 64-bit variants keep only the low 32 bits.
    pub fn hash(&self, key: &str) -> u32 {
        let bytes = key.as_bytes();
        match self {
            Self::Crc => (crc32fast::hash(bytes) >> 16) & 0x7fff,
            Self::Fnv1_32 => {
                let mut hash = FNV_32_INIT;
                for byte in bytes {
                    hash = hash.wrapping_mul(FNV_32_PRIME);
                    hash ^= *byte as u32;
                }
                hash
            }
            Self::Fnv1a_32 => {
                let mut hash = FNV_32_INIT;
                for byte in bytes {
                    hash ^= *byte as u32;
                    hash = hash.wrapping_mul(FNV_32_PRIME);
                }
                hash
            }
            Self::Fnv1_64 => {
                let mut hash = FNV_64_INIT;
                for byte in bytes {
                    hash = hash.wrapping_mul(FNV_64_PRIME);
                    hash ^= *byte as u64;
                }
                hash as u32
            }
            Self::Fnv1a_64 => {
                let mut hash = FNV_64_INIT;
                for byte in bytes {
                    hash ^= *byte as u64;
                    hash = hash.wrapping_mul(FNV_64_PRIME);
                }
                hash as u32
            }
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

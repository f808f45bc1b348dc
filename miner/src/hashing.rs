//! Hashing primitives shared by the work queue, the coordinator and kernels.
//!
//! Headers are kept in the server's getwork word order. Every 32-bit field
//! inside that layout (timestamp, nonce) is big-endian; the default oracle
//! swaps each word back to the real header order before hashing.

use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

use crate::error::{MinerError, Result};

pub const HEADER_LEN: usize = 80;
pub const PAYLOAD_LEN: usize = 128;
pub const TARGET_LEN: usize = 32;
pub const TIMESTAMP_OFFSET: usize = 68;
pub const NONCE_OFFSET: usize = 76;

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a,
    0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Deterministic 256-bit digest of a complete header.
///
/// Kernels and the coordinator only ever compare the output against a
/// target, so any deterministic function can stand in for the real one.
pub trait HashOracle: Send + Sync {
    fn digest(&self, header: &[u8; HEADER_LEN]) -> [u8; 32];
}

/// Double SHA-256 over the word-swapped header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256d;

impl HashOracle for Sha256d {
    fn digest(&self, header: &[u8; HEADER_LEN]) -> [u8; 32] {
        let swapped = swap_words(header);
        let first = Sha256::digest(&swapped);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}

/// Reverse the bytes of every 4-byte word.
pub fn swap_words(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for word in out.chunks_exact_mut(4) {
        word.reverse();
    }
    out
}

/// SHA-256 state after compressing the first 64 header bytes, as eight
/// little-endian words.
pub fn midstate(header: &[u8; HEADER_LEN]) -> [u8; 32] {
    let swapped = swap_words(&header[..64]);
    let mut state = SHA256_IV;
    let block = GenericArray::clone_from_slice(&swapped);
    sha2::compress256(&mut state, &[block]);

    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

pub fn read_timestamp(header: &[u8; HEADER_LEN]) -> u32 {
    read_word(header, TIMESTAMP_OFFSET)
}

pub fn read_nonce(header: &[u8; HEADER_LEN]) -> u32 {
    read_word(header, NONCE_OFFSET)
}

fn read_word(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Header with the timestamp and nonce fields replaced.
pub fn assemble_header(data: &[u8; HEADER_LEN], timestamp: u32, nonce: u32) -> [u8; HEADER_LEN] {
    let mut header = *data;
    header[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&timestamp.to_be_bytes());
    header[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(&nonce.to_be_bytes());
    header
}

/// `true` when `hash <= target`, both read as 256-bit little-endian integers.
pub fn check_target(hash: &[u8; 32], target: &[u8; TARGET_LEN]) -> bool {
    for i in (0..32).rev() {
        if hash[i] < target[i] {
            return true;
        }
        if hash[i] > target[i] {
            return false;
        }
    }
    true
}

/// The 128-byte result blob handed to backends: header with the (possibly
/// rolled) timestamp and winning nonce, zero padded.
#[derive(Clone, PartialEq, Eq)]
pub struct SubmissionPayload([u8; PAYLOAD_LEN]);

impl SubmissionPayload {
    pub fn new(data: &[u8; HEADER_LEN], timestamp: u32, nonce: u32) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..HEADER_LEN].copy_from_slice(&assemble_header(data, timestamp, nonce));
        Self(payload)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAYLOAD_LEN {
            return Err(MinerError::InvalidHeader {
                expected: PAYLOAD_LEN,
                actual: bytes.len(),
            });
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(bytes);
        Ok(Self(payload))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(&hex::decode(s.trim())?)
    }

    pub fn as_bytes(&self) -> &[u8; PAYLOAD_LEN] {
        &self.0
    }

    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.0[..HEADER_LEN]);
        header
    }

    pub fn timestamp(&self) -> u32 {
        read_word(&self.0, TIMESTAMP_OFFSET)
    }

    pub fn nonce(&self) -> u32 {
        read_word(&self.0, NONCE_OFFSET)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for SubmissionPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionPayload")
            .field("timestamp", &self.timestamp())
            .field("nonce", &format_args!("{:08x}", self.nonce()))
            .finish()
    }
}

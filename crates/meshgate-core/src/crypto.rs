//! Crypto engine — PSK expansion, nonce construction, AES-CTR encrypt/decrypt,
//! and the plaintext-sanity heuristic used to pick a channel key among
//! candidates.
//!
//! There is no peer-to-peer handshake here: every channel shares a single
//! symmetric key (the PSK), derived once and reused for every packet. The
//! nonce, not a handshake, is what keeps ciphertexts from colliding.

use aes::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key length {0} is not a supported PSK length")]
    KeyLength(usize),
    #[error("channel is unencrypted (null key)")]
    NullKey,
}

/// The well-known 16-byte default PSK (PSK index 1), as used by firmware
/// when a channel specifies `psk: [1]` (a single-byte index).
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// AES variant selected by expanded key length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes128,
    Aes256,
}

/// An expanded AES key, zeroized on drop. Carries the algorithm it selects
/// so callers never have to re-derive that from the length.
#[derive(ZeroizeOnDrop)]
pub struct ExpandedKey {
    bytes: Zeroizing<Vec<u8>>,
    #[zeroize(skip)]
    pub algorithm: Algorithm,
}

impl ExpandedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Expand raw PSK material (as received off the wire / from config) into an
/// AES key, following the firmware's length-dependent rules:
///
/// - length 0: no encryption (`CryptoError::NullKey`).
/// - length 1: PSK index 1..10. Index 1 is the default PSK verbatim
///   (AES-128). Index > 1 increments the 16th byte of the default PSK by
///   `(index - 1) mod 256`. NOTE: this stays 16 bytes / AES-128 even though
///   an older comment in the original firmware says otherwise — firmware
///   behavior wins (see SPEC_FULL §9).
/// - length 16: used as-is, AES-128.
/// - length 32: used as-is, AES-256.
/// - length 1..16 (exclusive of 1 and 16, i.e. 2..=15): zero-padded right to
///   16 bytes, AES-128.
/// - length 17..31: zero-padded right to 32 bytes, AES-256.
/// - any other length: `CryptoError::KeyLength`.
pub fn expand_psk(raw: &[u8]) -> Result<ExpandedKey, CryptoError> {
    match raw.len() {
        0 => Err(CryptoError::NullKey),
        1 => {
            let index = raw[0];
            let mut key = DEFAULT_PSK;
            if index > 1 {
                key[15] = key[15].wrapping_add(index.wrapping_sub(1));
            }
            Ok(ExpandedKey {
                bytes: Zeroizing::new(key.to_vec()),
                algorithm: Algorithm::Aes128,
            })
        }
        16 => Ok(ExpandedKey {
            bytes: Zeroizing::new(raw.to_vec()),
            algorithm: Algorithm::Aes128,
        }),
        32 => Ok(ExpandedKey {
            bytes: Zeroizing::new(raw.to_vec()),
            algorithm: Algorithm::Aes256,
        }),
        n if n < 16 => {
            let mut key = vec![0u8; 16];
            key[..n].copy_from_slice(raw);
            Ok(ExpandedKey {
                bytes: Zeroizing::new(key),
                algorithm: Algorithm::Aes128,
            })
        }
        n if n < 32 => {
            let mut key = vec![0u8; 32];
            key[..n].copy_from_slice(raw);
            Ok(ExpandedKey {
                bytes: Zeroizing::new(key),
                algorithm: Algorithm::Aes256,
            })
        }
        n => Err(CryptoError::KeyLength(n)),
    }
}

/// Build the 16-byte AES-CTR nonce: little-endian 64-bit packet id in bytes
/// 0..7, little-endian 32-bit source node number in bytes 8..11, zeros in
/// bytes 12..15. The same nonce is used for both encrypt and decrypt.
pub fn build_nonce(packet_id: u64, from_node: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0..8].copy_from_slice(&packet_id.to_le_bytes());
    nonce[8..12].copy_from_slice(&from_node.to_le_bytes());
    nonce
}

/// Run AES-CTR over `data` in place, keyed by `key` with the given nonce.
/// Encryption and decryption are the same operation in CTR mode.
fn apply_keystream(key: &ExpandedKey, nonce: &[u8; 16], data: &mut [u8]) {
    let nonce = aes::cipher::generic_array::GenericArray::from_slice(nonce);
    match key.algorithm {
        Algorithm::Aes128 => {
            let key = aes::cipher::generic_array::GenericArray::from_slice(key.as_bytes());
            let mut cipher = Aes128Ctr::new(key, nonce);
            cipher.apply_keystream(data);
        }
        Algorithm::Aes256 => {
            let key = aes::cipher::generic_array::GenericArray::from_slice(key.as_bytes());
            let mut cipher = Aes256Ctr::new(key, nonce);
            cipher.apply_keystream(data);
        }
    }
}

pub fn encrypt(plaintext: &[u8], key: &ExpandedKey, packet_id: u64, from_node: u32) -> Vec<u8> {
    let mut buf = plaintext.to_vec();
    apply_keystream(key, &build_nonce(packet_id, from_node), &mut buf);
    buf
}

pub fn decrypt(ciphertext: &[u8], key: &ExpandedKey, packet_id: u64, from_node: u32) -> Vec<u8> {
    // CTR mode: decrypt is the identical operation as encrypt.
    encrypt(ciphertext, key, packet_id, from_node)
}

/// Plaintext-sanity heuristic: does this decrypted buffer look like the
/// start of a valid wire-decoder record? Used to pick among candidate keys
/// when the channel name alone doesn't resolve to one.
///
/// Accepts when: length >= 2, the first byte's wire type is one of
/// {0,1,2,3,4,5}, the field number is nonzero, and — for wire type 2 — the
/// following length varint is <= remaining bytes and <= 1000. This must
/// never reject a genuinely valid short record, so it stays loose.
pub fn looks_like_plaintext(buf: &[u8]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let tag = buf[0];
    let wire_type = tag & 0x7;
    let field_number = tag >> 3;
    if field_number == 0 {
        return false;
    }
    if !(0..=5).contains(&wire_type) {
        return false;
    }
    if wire_type == 2 {
        let mut pos = 1usize;
        let mut len: u64 = 0;
        let mut shift = 0u32;
        loop {
            if pos >= buf.len() || shift >= 64 {
                return false;
            }
            let byte = buf[pos];
            pos += 1;
            len |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let remaining = buf.len() - pos;
        if len > remaining as u64 || len > 1000 {
            return false;
        }
    }
    true
}

// ── Channel key discovery ─────────────────────────────────────────────────────

/// Well-known channel names mapped to their conventional PSK index. Every
/// Meshtastic firmware default channel is named `LongFast` and keyed to PSK
/// index 1 (the default PSK); the others are the standard modem presets
/// that also ship with the default PSK unless reconfigured.
const WELL_KNOWN_CHANNELS: &[(&str, u8)] = &[
    ("LongFast", 1),
    ("LongSlow", 1),
    ("LongModerate", 1),
    ("MediumFast", 1),
    ("MediumSlow", 1),
    ("ShortFast", 1),
    ("ShortSlow", 1),
    ("ShortTurbo", 1),
    ("VeryLongSlow", 1),
    ("admin", 1),
];

/// Resolve the default PSK index for a channel name. Unknown names default
/// to index 1 (the default PSK) as the spec requires, overridable by
/// caller-supplied keys tried afterward.
pub fn default_psk_index_for_channel(name: &str) -> u8 {
    WELL_KNOWN_CHANNELS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, idx)| *idx)
        .unwrap_or(1)
}

/// Try candidate keys in order (default channel key first, then
/// caller-supplied keys in iteration order) and return the first decryption
/// that passes the plaintext-sanity heuristic.
pub fn try_decrypt_candidates<'a>(
    ciphertext: &[u8],
    packet_id: u64,
    from_node: u32,
    candidates: impl Iterator<Item = &'a ExpandedKey>,
) -> Option<Vec<u8>> {
    for key in candidates {
        let plaintext = decrypt(ciphertext, key, packet_id, from_node);
        if looks_like_plaintext(&plaintext) {
            return Some(plaintext);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_data, encode_data, Data};

    #[test]
    fn expand_psk_empty_is_null_key() {
        assert_eq!(expand_psk(&[]), Err(CryptoError::NullKey));
    }

    #[test]
    fn expand_psk_index_one_is_default_psk_verbatim() {
        let key = expand_psk(&[1]).unwrap();
        assert_eq!(key.algorithm, Algorithm::Aes128);
        assert_eq!(key.as_bytes(), &DEFAULT_PSK);
    }

    #[test]
    fn expand_psk_index_two_increments_last_byte() {
        let key = expand_psk(&[2]).unwrap();
        let mut expected = DEFAULT_PSK;
        expected[15] = expected[15].wrapping_add(1);
        assert_eq!(key.as_bytes(), &expected[..]);
        assert_eq!(key.algorithm, Algorithm::Aes128);
    }

    #[test]
    fn expand_psk_sixteen_bytes_used_as_is() {
        let raw = [7u8; 16];
        let key = expand_psk(&raw).unwrap();
        assert_eq!(key.as_bytes(), &raw[..]);
        assert_eq!(key.algorithm, Algorithm::Aes128);
    }

    #[test]
    fn expand_psk_thirty_two_bytes_used_as_is() {
        let raw = [9u8; 32];
        let key = expand_psk(&raw).unwrap();
        assert_eq!(key.as_bytes(), &raw[..]);
        assert_eq!(key.algorithm, Algorithm::Aes256);
    }

    #[test]
    fn expand_psk_short_key_zero_padded_to_16() {
        let raw = [1u8, 2, 3];
        let key = expand_psk(&raw).unwrap();
        assert_eq!(key.algorithm, Algorithm::Aes128);
        assert_eq!(key.as_bytes().len(), 16);
        assert_eq!(&key.as_bytes()[..3], &raw[..]);
        assert!(key.as_bytes()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn expand_psk_mid_length_zero_padded_to_32() {
        let raw = [5u8; 20];
        let key = expand_psk(&raw).unwrap();
        assert_eq!(key.algorithm, Algorithm::Aes256);
        assert_eq!(key.as_bytes().len(), 32);
        assert_eq!(&key.as_bytes()[..20], &raw[..]);
    }

    #[test]
    fn expand_psk_fifteen_bytes_is_error_free_but_invalid_other_lengths_fail() {
        // 15 bytes pads to 16 (valid, per rule); 33+ is the actual error case.
        assert!(expand_psk(&[0u8; 15]).is_ok());
        assert_eq!(expand_psk(&[0u8; 33]), Err(CryptoError::KeyLength(33)));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = expand_psk(&DEFAULT_PSK).unwrap();
        let plaintext = b"Hello, mesh!".to_vec();
        let ct = encrypt(&plaintext, &key, 0x123456, 0x298A814D);
        let pt = decrypt(&ct, &key, 0x123456, 0x298A814D);
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn nonce_fixed_within_same_packet_differs_across_packet_ids() {
        let n1 = build_nonce(1, 42);
        let n2 = build_nonce(1, 42);
        let n3 = build_nonce(2, 42);
        assert_eq!(n1, n2);
        assert_ne!(n1, n3);
    }

    #[test]
    fn nonce_layout_matches_spec() {
        let nonce = build_nonce(0x0000_0000_0012_3456, 0x298A_814D);
        assert_eq!(&nonce[0..8], &0x123456u64.to_le_bytes());
        assert_eq!(&nonce[8..12], &0x298A_814Du32.to_le_bytes());
        assert_eq!(&nonce[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn looks_like_plaintext_accepts_valid_short_record() {
        let encoded = encode_data(&Data {
            portnum: 1,
            payload: b"Hi".to_vec(),
            ..Default::default()
        });
        assert!(looks_like_plaintext(&encoded));
        assert!(decode_data(&encoded).is_ok());
    }

    #[test]
    fn looks_like_plaintext_rejects_too_short() {
        assert!(!looks_like_plaintext(&[0x0a]));
        assert!(!looks_like_plaintext(&[]));
    }

    #[test]
    fn looks_like_plaintext_rejects_field_number_zero() {
        // tag byte 0x02 => field_number 0, wire_type 2
        assert!(!looks_like_plaintext(&[0x02, 0x01, 0xff]));
    }

    #[test]
    fn try_decrypt_candidates_picks_first_plausible() {
        let wrong_key = expand_psk(&[3u8; 16]).unwrap();
        let right_key = expand_psk(&DEFAULT_PSK).unwrap();
        let plaintext = encode_data(&Data {
            portnum: 1,
            payload: b"Hello".to_vec(),
            ..Default::default()
        });
        let ct = encrypt(&plaintext, &right_key, 99, 7);
        let candidates = vec![wrong_key, right_key];
        let found = try_decrypt_candidates(&ct, 99, 7, candidates.iter()).unwrap();
        assert_eq!(found, plaintext);
    }

    #[test]
    fn default_channel_name_resolves_to_default_psk_index() {
        assert_eq!(default_psk_index_for_channel("LongFast"), 1);
        assert_eq!(default_psk_index_for_channel("SomeCustomChannel"), 1);
    }
}

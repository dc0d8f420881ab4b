//! Message Record Codec
//!
//! This module defines the on-disk layout of a single message record inside
//! a block file, and the keyed 64-bit checksum that seals it.
//!
//! ## Record layout (little-endian)
//!
//! ```text
//! ┌───────────────┬─────────┬─────────┬───────────┬─────────┐
//! │ total_len:u32 │ seq:u64 │ ts:i64  │ slen:u16  │ subject │
//! └───────────────┴─────────┴─────────┴───────────┴─────────┘
//! ┌──────────────────────────┬─────────┬───────────┐
//! │ [hdr_len:u32, headers]   │ payload │ hash[8]   │
//! └──────────────────────────┴─────────┴───────────┘
//! ```
//!
//! - The high bit of `total_len` (`HBIT`) marks the presence of the
//!   optional headers blob.
//! - The high bit of `seq` (`EBIT`) marks a tombstone: a record that was
//!   erased or skipped. Decoding a tombstone yields `seq = 0`.
//! - The trailing 8 bytes are a keyed 64-bit hash over the header bytes
//!   after `total_len` (seq, ts, subject length), the subject, the headers
//!   blob if present, and the payload. The hash key is derived per block so
//!   records cannot be transplanted between blocks undetected.
//!
//! Decoded subject/header/payload are returned as owned values so callers
//! can never extend into a shared block buffer.

use std::hash::Hasher;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;

use crate::error::{Error, Result};

/// Fixed header size: total_len(4) + seq(8) + ts(8) + subj_len(2).
pub const MSG_HDR_LEN: usize = 22;

/// Trailing checksum size.
pub const CHECKSUM_LEN: usize = 8;

/// Size of an empty (tombstone) record: header plus checksum, no body.
pub const EMPTY_RECORD_LEN: usize = MSG_HDR_LEN + CHECKSUM_LEN;

/// High bit of `total_len`: record carries a headers blob. The same bit is
/// reused by the store on cache index slots to mark checksum-verified
/// records.
pub const HBIT: u32 = 1 << 31;

/// High bit of `seq`: record is an erased/skipped tombstone.
pub const EBIT: u64 = 1 << 63;

/// Keyed 64-bit hasher for records and metadata checksums.
///
/// The key is the first half of `SHA-256(key_material)`, so each stream,
/// block, and consumer gets its own hash state from a stable derivation.
#[derive(Debug, Clone)]
pub struct RecordHasher {
    k0: u64,
    k1: u64,
}

impl RecordHasher {
    pub fn new(key_material: &[u8]) -> Self {
        let digest = Sha256::digest(key_material);
        let k0 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        Self { k0, k1 }
    }

    /// Hash a sequence of byte slices as one logical message.
    pub fn checksum(&self, parts: &[&[u8]]) -> [u8; CHECKSUM_LEN] {
        let mut hh = SipHasher24::new_with_keys(self.k0, self.k1);
        for part in parts {
            hh.write(part);
        }
        hh.finish().to_le_bytes()
    }

    /// Hex string of the hash over a single buffer, used for `meta.sum`
    /// style checksum files.
    pub fn hex_checksum(&self, buf: &[u8]) -> String {
        let sum = self.checksum(&[buf]);
        let mut out = String::with_capacity(CHECKSUM_LEN * 2);
        for b in sum {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

/// A record decoded out of a block buffer. All fields are owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub subject: String,
    pub headers: Option<Bytes>,
    pub payload: Bytes,
    /// Sequence number; 0 for tombstones (`EBIT` was set on disk).
    pub seq: u64,
    /// Nanoseconds since the Unix epoch.
    pub ts: i64,
}

/// Total encoded size of a record for the given parts.
pub fn message_record_size(subj: &str, hdr: &[u8], msg: &[u8]) -> u64 {
    if hdr.is_empty() {
        // total_len(4) + seq(8) + ts(8) + subj_len(2) + subj + msg + hash(8)
        (MSG_HDR_LEN + subj.len() + msg.len() + CHECKSUM_LEN) as u64
    } else {
        // as above plus hdr_len(4) + hdr
        (MSG_HDR_LEN + subj.len() + 4 + hdr.len() + msg.len() + CHECKSUM_LEN) as u64
    }
}

/// Check that an encoded size is representable; the high bit of the length
/// field is reserved for the headers flag.
pub fn check_record_size(rl: u64) -> Result<u32> {
    if rl >= HBIT as u64 {
        return Err(Error::RecordTooLarge);
    }
    Ok(rl as u32)
}

/// Append a fully encoded record (header, body, trailing checksum) to
/// `buf`. `rl` must equal [`message_record_size`] for the same parts.
/// Returns the record checksum so callers can track the last one written.
pub fn append_record(
    buf: &mut Vec<u8>,
    rl: u32,
    seq: u64,
    ts: i64,
    subj: &str,
    hdr: &[u8],
    msg: &[u8],
    hh: &RecordHasher,
) -> [u8; CHECKSUM_LEN] {
    let has_headers = !hdr.is_empty();
    let mut tlen = rl;
    if has_headers {
        tlen |= HBIT;
    }

    let mut rec_hdr = [0u8; MSG_HDR_LEN];
    rec_hdr[0..4].copy_from_slice(&tlen.to_le_bytes());
    rec_hdr[4..12].copy_from_slice(&seq.to_le_bytes());
    rec_hdr[12..20].copy_from_slice(&ts.to_le_bytes());
    rec_hdr[20..22].copy_from_slice(&(subj.len() as u16).to_le_bytes());

    buf.extend_from_slice(&rec_hdr);
    buf.extend_from_slice(subj.as_bytes());

    if has_headers {
        buf.extend_from_slice(&(hdr.len() as u32).to_le_bytes());
        buf.extend_from_slice(hdr);
    }
    buf.extend_from_slice(msg);

    let checksum = hh.checksum(&[&rec_hdr[4..MSG_HDR_LEN], subj.as_bytes(), hdr, msg]);
    buf.extend_from_slice(&checksum);

    checksum
}

/// Decode the record at the front of `buf`.
///
/// If `hh` is supplied the trailing checksum is recomputed and compared;
/// a mismatch yields [`Error::BadRecord`]. Records with `EBIT` set decode
/// with `seq = 0`.
pub fn decode_record(buf: &[u8], hh: Option<&RecordHasher>) -> Result<DecodedRecord> {
    if buf.len() < MSG_HDR_LEN {
        return Err(Error::BadRecord);
    }

    let tlen = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let has_headers = tlen & HBIT != 0;
    let rl = (tlen & !HBIT) as usize;
    let slen = u16::from_le_bytes(buf[20..22].try_into().unwrap()) as usize;

    if rl < MSG_HDR_LEN {
        return Err(Error::BadRecord);
    }
    let dlen = rl - MSG_HDR_LEN;
    if dlen < CHECKSUM_LEN || slen + CHECKSUM_LEN > dlen || rl > buf.len() {
        return Err(Error::BadRecord);
    }

    let data = &buf[MSG_HDR_LEN..MSG_HDR_LEN + dlen];

    // Verify the trailing checksum if asked to.
    if let Some(hh) = hh {
        let body = if has_headers {
            if slen + 4 > dlen - CHECKSUM_LEN {
                return Err(Error::BadRecord);
            }
            &data[slen + 4..dlen - CHECKSUM_LEN]
        } else {
            &data[slen..dlen - CHECKSUM_LEN]
        };
        let sum = hh.checksum(&[&buf[4..MSG_HDR_LEN], &data[..slen], body]);
        if sum != data[dlen - CHECKSUM_LEN..] {
            return Err(Error::BadRecord);
        }
    }

    let mut seq = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    if seq & EBIT != 0 {
        seq = 0;
    }
    let ts = i64::from_le_bytes(buf[12..20].try_into().unwrap());

    let subject =
        String::from_utf8(data[..slen].to_vec()).map_err(|_| Error::BadRecord)?;

    let end = dlen - CHECKSUM_LEN;
    let (headers, payload) = if has_headers {
        let hl = u32::from_le_bytes(
            data[slen..slen + 4].try_into().map_err(|_| Error::BadRecord)?,
        ) as usize;
        let bi = slen + 4;
        if bi + hl > end {
            return Err(Error::BadRecord);
        }
        (
            Some(Bytes::copy_from_slice(&data[bi..bi + hl])),
            Bytes::copy_from_slice(&data[bi + hl..end]),
        )
    } else {
        (None, Bytes::copy_from_slice(&data[slen..end]))
    };

    Ok(DecodedRecord {
        subject,
        headers,
        payload,
        seq,
        ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> RecordHasher {
        RecordHasher::new(b"test-stream-1")
    }

    fn encode(seq: u64, ts: i64, subj: &str, hdr: &[u8], msg: &[u8]) -> Vec<u8> {
        let rl = message_record_size(subj, hdr, msg);
        let rl = check_record_size(rl).unwrap();
        let mut buf = Vec::new();
        append_record(&mut buf, rl, seq, ts, subj, hdr, msg, &hasher());
        buf
    }

    // ---------------------------------------------------------------
    // Sizes
    // ---------------------------------------------------------------

    #[test]
    fn test_record_size_no_headers() {
        // 22 + 3 + 5 + 8
        assert_eq!(message_record_size("foo", &[], b"hello"), 38);
    }

    #[test]
    fn test_record_size_with_headers() {
        // 22 + 3 + 4 + 2 + 5 + 8
        assert_eq!(message_record_size("foo", b"hh", b"hello"), 44);
    }

    #[test]
    fn test_record_size_empty_everything() {
        assert_eq!(
            message_record_size("", &[], &[]),
            EMPTY_RECORD_LEN as u64
        );
    }

    #[test]
    fn test_encoded_len_matches_record_size() {
        let buf = encode(1, 2, "orders.new", b"k: v", b"payload");
        assert_eq!(
            buf.len() as u64,
            message_record_size("orders.new", b"k: v", b"payload")
        );
    }

    #[test]
    fn test_check_record_size_rejects_high_bit() {
        assert_eq!(check_record_size(HBIT as u64), Err(Error::RecordTooLarge));
        assert_eq!(check_record_size((HBIT as u64) + 1), Err(Error::RecordTooLarge));
        assert!(check_record_size((HBIT as u64) - 1).is_ok());
    }

    // ---------------------------------------------------------------
    // Round-trips
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_no_headers() {
        let buf = encode(42, 1_700_000_000_000_000_000, "foo", &[], b"hello");
        let rec = decode_record(&buf, Some(&hasher())).unwrap();
        assert_eq!(rec.subject, "foo");
        assert_eq!(rec.headers, None);
        assert_eq!(rec.payload, Bytes::from_static(b"hello"));
        assert_eq!(rec.seq, 42);
        assert_eq!(rec.ts, 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_roundtrip_with_headers() {
        let buf = encode(7, 99, "events", b"content-type: json", b"{}");
        let rec = decode_record(&buf, Some(&hasher())).unwrap();
        assert_eq!(rec.subject, "events");
        assert_eq!(
            rec.headers,
            Some(Bytes::from_static(b"content-type: json"))
        );
        assert_eq!(rec.payload, Bytes::from_static(b"{}"));
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let buf = encode(1, 1, "s", &[], &[]);
        let rec = decode_record(&buf, Some(&hasher())).unwrap();
        assert!(rec.payload.is_empty());
        assert_eq!(rec.headers, None);
    }

    #[test]
    fn test_roundtrip_binary_payload() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let buf = encode(1, 1, "bin", &[], &payload);
        let rec = decode_record(&buf, Some(&hasher())).unwrap();
        assert_eq!(&rec.payload[..], &payload[..]);
    }

    #[test]
    fn test_decode_without_verification() {
        let buf = encode(5, 10, "x", &[], b"y");
        let rec = decode_record(&buf, None).unwrap();
        assert_eq!(rec.seq, 5);
        assert_eq!(rec.payload, Bytes::from_static(b"y"));
    }

    // ---------------------------------------------------------------
    // Tombstones
    // ---------------------------------------------------------------

    #[test]
    fn test_erased_bit_decodes_as_seq_zero() {
        let buf = encode(9 | EBIT, 0, "", &[], b"random-fill");
        let rec = decode_record(&buf, Some(&hasher())).unwrap();
        assert_eq!(rec.seq, 0);
    }

    // ---------------------------------------------------------------
    // Corruption
    // ---------------------------------------------------------------

    #[test]
    fn test_flipped_payload_byte_fails_verification() {
        let mut buf = encode(1, 1, "foo", &[], b"hello");
        buf[MSG_HDR_LEN + 3 + 1] ^= 0x01; // inside the payload
        assert_eq!(
            decode_record(&buf, Some(&hasher())),
            Err(Error::BadRecord)
        );
        // Without verification the damage goes unnoticed.
        assert!(decode_record(&buf, None).is_ok());
    }

    #[test]
    fn test_flipped_subject_byte_fails_verification() {
        let mut buf = encode(1, 1, "foo", &[], b"hello");
        buf[MSG_HDR_LEN] ^= 0x01;
        assert_eq!(
            decode_record(&buf, Some(&hasher())),
            Err(Error::BadRecord)
        );
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let buf = encode(1, 1, "foo", &[], b"hello");
        let other = RecordHasher::new(b"test-stream-2");
        assert_eq!(decode_record(&buf, Some(&other)), Err(Error::BadRecord));
    }

    #[test]
    fn test_truncated_buffer() {
        let buf = encode(1, 1, "foo", &[], b"hello");
        assert_eq!(
            decode_record(&buf[..buf.len() - 1], Some(&hasher())),
            Err(Error::BadRecord)
        );
        assert_eq!(decode_record(&buf[..10], None), Err(Error::BadRecord));
        assert_eq!(decode_record(&[], None), Err(Error::BadRecord));
    }

    #[test]
    fn test_zero_record_length_is_bad() {
        let mut buf = encode(1, 1, "foo", &[], b"hello");
        buf[0..4].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(decode_record(&buf, None), Err(Error::BadRecord));
    }

    #[test]
    fn test_subject_longer_than_data_is_bad() {
        let mut buf = encode(1, 1, "foo", &[], b"hello");
        buf[20..22].copy_from_slice(&u16::MAX.to_le_bytes());
        assert_eq!(decode_record(&buf, None), Err(Error::BadRecord));
    }

    // ---------------------------------------------------------------
    // Hasher
    // ---------------------------------------------------------------

    #[test]
    fn test_hasher_is_deterministic() {
        let a = hasher().checksum(&[b"one", b"two"]);
        let b = hasher().checksum(&[b"one", b"two"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hasher_key_separation() {
        let a = RecordHasher::new(b"stream-1").checksum(&[b"data"]);
        let b = RecordHasher::new(b"stream-2").checksum(&[b"data"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_checksum_format() {
        let hex = hasher().hex_checksum(b"meta contents");
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! Stream and Consumer State
//!
//! Aggregate state of a stream (`StreamState`), the durable cursor state of
//! a consumer (`ConsumerState`), and the owned message view returned by
//! reads (`StoredMsg`).
//!
//! Timestamps throughout the store are `i64` nanoseconds since the Unix
//! epoch, matching the record format.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Aggregate state of a stream store.
///
/// Invariants: `first_seq <= last_seq + 1`; an empty store has
/// `first_seq = last_seq + 1`. `msgs`/`bytes` are the sums over all live
/// records in all blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    /// Timestamp of the first live message, in unix nanoseconds.
    pub first_ts: i64,
    pub last_seq: u64,
    /// Timestamp of the last message, in unix nanoseconds.
    pub last_ts: i64,
    pub consumers: usize,
}

/// A consumer-sequence / stream-sequence pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Durable cursor state for a consumer.
///
/// Invariants: `ack_floor <= delivered` componentwise; every key in
/// `pending` lies in `(ack_floor.stream_seq, delivered.stream_seq]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    /// Outstanding deliveries: stream sequence to delivery timestamp
    /// (unix nanoseconds, downsampled to seconds on disk).
    pub pending: HashMap<u64, i64>,
    /// Redelivery counts by stream sequence.
    pub redelivered: HashMap<u64, u64>,
}

/// A message as returned by the read path. All fields are owned copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMsg {
    pub subject: String,
    pub headers: Option<Bytes>,
    pub payload: Bytes,
    pub seq: u64,
    /// Unix nanoseconds.
    pub ts: i64,
}

//! Fragmentation of payloads larger than one datagram.
//!
//! Each chunk travels as an ordinary framed message with the fragment bit
//! set. Its payload starts with four 7-bit varints: group id, total payload
//! bits, chunk byte size and chunk number.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PeerError, Result};
use crate::frame::HEADER_SIZE;
use crate::sequence::SequenceBits;

/// Upper bound on a reassembled payload.
pub const MAX_FRAGMENTED_SIZE: usize = 16 * 1024 * 1024;

/// Unfinished groups kept per connection.
pub const MAX_PENDING_GROUPS: usize = 32;

/// Bytes allocated across unfinished groups of one connection.
pub const MAX_PENDING_BYTES: usize = 4 * MAX_FRAGMENTED_SIZE;

const DEFAULT_GROUP_MAX_AGE: Duration = Duration::from_secs(25);

/// Largest varint-encoded header: four u32 values of up to 5 bytes each.
const MAX_FRAGMENT_HEADER_SIZE: usize = 20;

fn varint_len(mut v: u32) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

fn put_varint(buf: &mut BytesMut, mut v: u32) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_varint(data: &[u8], pos: &mut usize) -> Result<u32> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *data.get(*pos).ok_or_else(|| malformed("truncated varint"))?;
        *pos += 1;
        if shift > 28 {
            return Err(malformed("varint overflow"));
        }
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn malformed(reason: &str) -> PeerError {
    PeerError::MalformedLibraryMessage {
        kind: "Fragment",
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group: u32,
    pub total_bits: u32,
    pub chunk_size: u32,
    pub chunk_number: u32,
}

impl FragmentHeader {
    pub fn encoded_len(&self) -> usize {
        varint_len(self.group)
            + varint_len(self.total_bits)
            + varint_len(self.chunk_size)
            + varint_len(self.chunk_number)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        put_varint(buf, self.group);
        put_varint(buf, self.total_bits);
        put_varint(buf, self.chunk_size);
        put_varint(buf, self.chunk_number);
    }

    /// Decode from the start of `data`, returning the header and its length.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0;
        let header = Self {
            group: get_varint(data, &mut pos)?,
            total_bits: get_varint(data, &mut pos)?,
            chunk_size: get_varint(data, &mut pos)?,
            chunk_number: get_varint(data, &mut pos)?,
        };
        Ok((header, pos))
    }

    pub fn total_bytes(&self) -> usize {
        (self.total_bits as usize).div_ceil(8)
    }

    pub fn chunk_count(&self) -> usize {
        self.total_bytes().div_ceil(self.chunk_size.max(1) as usize)
    }
}

/// Largest chunk such that one framed fragment fits in `mtu`.
pub fn best_chunk_size(group: u32, total_bytes: usize, mtu: usize) -> usize {
    let available = mtu.saturating_sub(HEADER_SIZE);
    let total_bits = (total_bytes * 8) as u32;
    let mut chunk = available.saturating_sub(4).max(1);
    loop {
        let chunks = total_bytes.div_ceil(chunk) as u32;
        let header = FragmentHeader {
            group,
            total_bits,
            chunk_size: chunk as u32,
            chunk_number: chunks,
        };
        if chunk + header.encoded_len() <= available || chunk == 1 {
            return chunk;
        }
        chunk -= 1;
    }
}

/// Split `payload` into fragment payloads (fragment header + chunk).
pub fn split(group: u32, payload: &[u8], mtu: usize) -> Vec<Bytes> {
    let chunk_size = best_chunk_size(group, payload.len(), mtu);
    let total_bits = (payload.len() * 8) as u32;
    payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(number, chunk)| {
            let header = FragmentHeader {
                group,
                total_bits,
                chunk_size: chunk_size as u32,
                chunk_number: number as u32,
            };
            let mut buf = BytesMut::with_capacity(MAX_FRAGMENT_HEADER_SIZE + chunk.len());
            header.encode_into(&mut buf);
            buf.put_slice(chunk);
            buf.freeze()
        })
        .collect()
}

struct FragmentGroup {
    data: Vec<u8>,
    received: SequenceBits,
    remaining: usize,
    chunk_size: usize,
    total_bits: u32,
    last_touched: Instant,
}

impl FragmentGroup {
    fn new(header: &FragmentHeader, now: Instant) -> Self {
        Self {
            data: vec![0; header.total_bytes()],
            received: SequenceBits::new(header.chunk_count()),
            remaining: header.chunk_count(),
            chunk_size: header.chunk_size as usize,
            total_bits: header.total_bits,
            last_touched: now,
        }
    }

    fn matches(&self, header: &FragmentHeader) -> bool {
        self.total_bits == header.total_bits && self.chunk_size == header.chunk_size as usize
    }
}

/// Per-connection reassembly of fragment groups.
///
/// Group ids wrap, so an unfinished group may be met again by a later
/// message. A chunk starts its group afresh when its header disagrees with
/// the group, when it carries other bytes for a chunk already received, or
/// when the group has been silent for `max_age`.
pub struct FragmentAssembler {
    groups: HashMap<u32, FragmentGroup>,
    pending_bytes: usize,
    max_age: Duration,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_GROUP_MAX_AGE)
    }
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            pending_bytes: 0,
            max_age,
        }
    }

    /// Groups that still miss at least one chunk.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Bytes allocated for unfinished groups.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Feed one fragment payload; returns the whole payload once complete.
    pub fn insert(&mut self, now: Instant, fragment: &[u8]) -> Result<Option<Bytes>> {
        let (header, offset) = FragmentHeader::decode(fragment)?;
        let chunk = &fragment[offset..];
        let total = header.total_bytes();
        if total == 0 || total > MAX_FRAGMENTED_SIZE {
            return Err(malformed("fragment group size out of range"));
        }
        if header.chunk_size == 0 || chunk.len() > header.chunk_size as usize {
            return Err(malformed("chunk size mismatch"));
        }
        let number = header.chunk_number as usize;
        if number >= header.chunk_count() {
            return Err(malformed("chunk number out of range"));
        }
        let start = number * header.chunk_size as usize;
        let end = start + chunk.len();
        if end > total {
            return Err(malformed("chunk exceeds group size"));
        }

        let mut duplicate = false;
        let stale = self.groups.get(&header.group).is_some_and(|group| {
            if !group.matches(&header) || now.saturating_duration_since(group.last_touched) > self.max_age {
                return true;
            }
            if group.received.get(number) {
                duplicate = group.data[start..end] == *chunk;
                return !duplicate;
            }
            false
        });
        if duplicate {
            return Ok(None);
        }
        if stale {
            tracing::debug!(group = header.group, "replacing unfinished fragment group");
            self.remove(header.group);
        }
        if !self.groups.contains_key(&header.group) {
            self.make_room(total);
            self.pending_bytes += total;
            self.groups.insert(header.group, FragmentGroup::new(&header, now));
        }
        let Some(group) = self.groups.get_mut(&header.group) else {
            return Ok(None);
        };

        group.data[start..end].copy_from_slice(chunk);
        group.received.set(number, true);
        group.remaining -= 1;
        group.last_touched = now;
        if group.remaining > 0 {
            return Ok(None);
        }

        let complete = self.remove(header.group).map(|g| Bytes::from(g.data));
        tracing::trace!(group = header.group, total, "fragment group complete");
        Ok(complete)
    }

    /// Drop groups that have not seen a chunk for `max_age`.
    pub fn evict_stale(&mut self, now: Instant) {
        let max_age = self.max_age;
        let before = self.groups.len();
        self.groups
            .retain(|_, group| now.saturating_duration_since(group.last_touched) <= max_age);
        if self.groups.len() != before {
            self.pending_bytes = self.groups.values().map(|g| g.data.len()).sum();
            tracing::debug!(evicted = before - self.groups.len(), "evicted stale fragment groups");
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.pending_bytes = 0;
    }

    fn remove(&mut self, id: u32) -> Option<FragmentGroup> {
        let group = self.groups.remove(&id)?;
        self.pending_bytes -= group.data.len();
        Some(group)
    }

    /// Evict the least recently touched groups until a new group of
    /// `incoming` bytes fits both caps.
    fn make_room(&mut self, incoming: usize) {
        while !self.groups.is_empty()
            && (self.groups.len() >= MAX_PENDING_GROUPS
                || self.pending_bytes + incoming > MAX_PENDING_BYTES)
        {
            let oldest = self
                .groups
                .iter()
                .min_by_key(|(_, group)| group.last_touched)
                .map(|(id, _)| *id);
            let Some(oldest) = oldest else {
                return;
            };
            tracing::debug!(group = oldest, "fragment reassembly full, dropping oldest group");
            self.remove(oldest);
        }
    }
}

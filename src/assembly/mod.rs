//! Out-of-order fragment-to-frame reassembly.
//!
//! Video frames arrive as independently routed fragments with no ordering
//! guarantee, possibly duplicated across transports during failover. The
//! [`FrameReassembler`] keeps a bounded ring of in-flight assemblies:
//! at most N frames are tracked at once, the oldest (by insertion order)
//! is evicted to make room, and assemblies that stall without completing
//! are swept by an idle timeout. Evicted frames are lost, never retried.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::constants::{
    DEFAULT_RING_CAPACITY, DEFAULT_STALE_FRAME_AGE, MAX_FRAGMENTS_PER_FRAME,
};
use crate::core::AssemblyError;
use crate::packet::{FragmentHeader, TrainId};

/// A fully reconstructed media frame.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    /// Frame identifier from the fragment headers.
    pub frame_id: u32,
    /// Originating train.
    pub train_id: TrainId,
    /// Payload bytes, concatenated in fragment-index order.
    pub bytes: Bytes,
    /// Reassembly latency: controller receive time minus the train-clock
    /// origin timestamp. Raw, before clock-offset correction.
    pub latency_ms: i64,
    /// Train-clock origin timestamp of the frame, ms since epoch.
    pub created_at_ms: u64,
}

/// One in-flight frame being pieced together.
#[derive(Debug)]
struct FrameAssembly {
    frame_id: u32,
    train_id: TrainId,
    expected: u16,
    received: u16,
    /// Index-addressed fragment slots (`fragment_index - 1`).
    slots: Vec<Option<Bytes>>,
    /// Train-clock timestamp copied from the first fragment seen.
    created_at_ms: u64,
    /// Controller-clock arrival time of the first fragment (stale sweep).
    first_seen_ms: u64,
}

impl FrameAssembly {
    fn new(header: &FragmentHeader, now_ms: u64) -> Self {
        Self {
            frame_id: header.frame_id,
            train_id: header.train_id,
            expected: header.fragment_count,
            received: 0,
            slots: vec![None; header.fragment_count as usize],
            created_at_ms: header.origin_timestamp_ms,
            first_seen_ms: now_ms,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    /// Concatenate all slots in index order into one contiguous buffer.
    fn assemble(&mut self, now_ms: u64) -> CompletedFrame {
        let total: usize = self
            .slots
            .iter()
            .filter_map(|s| s.as_ref().map(Bytes::len))
            .sum();
        let mut buf = BytesMut::with_capacity(total);
        for slot in self.slots.iter().flatten() {
            buf.extend_from_slice(slot);
        }
        CompletedFrame {
            frame_id: self.frame_id,
            train_id: self.train_id,
            bytes: buf.freeze(),
            latency_ms: now_ms as i64 - self.created_at_ms as i64,
            created_at_ms: self.created_at_ms,
        }
    }
}

/// Snapshot of one in-flight assembly, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyProgress {
    /// Frame identifier.
    pub frame_id: u32,
    /// Fragments stored so far.
    pub received: u16,
    /// Fragments the frame declared.
    pub expected: u16,
    /// Controller-clock age of the assembly, ms.
    pub age_ms: u64,
}

/// Ring-buffered reassembler for out-of-order fragments.
///
/// The frame-id map and the insertion-order queue are kept consistent at
/// all times; the ring never holds more than `capacity` assemblies.
#[derive(Debug)]
pub struct FrameReassembler {
    capacity: usize,
    max_fragments: u16,
    stale_age: Duration,
    assemblies: HashMap<u32, FrameAssembly>,
    order: VecDeque<u32>,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    /// Create a reassembler with the default ring capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    /// Create a reassembler tracking at most `capacity` in-flight frames.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_fragments: MAX_FRAGMENTS_PER_FRAME,
            stale_age: DEFAULT_STALE_FRAME_AGE,
            assemblies: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Override the idle age after which a stalled assembly is swept.
    pub fn set_stale_age(&mut self, age: Duration) {
        self.stale_age = age;
    }

    /// Number of in-flight assemblies.
    pub fn in_flight(&self) -> usize {
        self.assemblies.len()
    }

    /// Progress of every in-flight assembly, oldest first.
    pub fn progress(&self, now_ms: u64) -> Vec<AssemblyProgress> {
        self.order
            .iter()
            .filter_map(|id| self.assemblies.get(id))
            .map(|a| AssemblyProgress {
                frame_id: a.frame_id,
                received: a.received,
                expected: a.expected,
                age_ms: now_ms.saturating_sub(a.first_seen_ms),
            })
            .collect()
    }

    /// Feed one fragment into the ring.
    ///
    /// Returns `Ok(Some(frame))` when this fragment completes its frame,
    /// `Ok(None)` otherwise. Duplicates are ignored without mutating
    /// state. Invalid headers are rejected before any allocation.
    pub fn process_fragment(
        &mut self,
        header: &FragmentHeader,
        payload: Bytes,
        now_ms: u64,
    ) -> Result<Option<CompletedFrame>, AssemblyError> {
        self.validate(header)?;

        if !self.assemblies.contains_key(&header.frame_id) {
            self.insert_assembly(header, now_ms);
        }

        // The entry is guaranteed present after insert_assembly.
        let Some(assembly) = self.assemblies.get_mut(&header.frame_id) else {
            return Ok(None);
        };

        if assembly.expected != header.fragment_count {
            return Err(AssemblyError::CountMismatch {
                frame_id: header.frame_id,
                expected: assembly.expected,
                actual: header.fragment_count,
            });
        }

        let slot = (header.fragment_index - 1) as usize;
        if assembly.slots[slot].is_some() {
            // Duplicate delivery (e.g. the same frame over two transports
            // during failover). Idempotent: keep the stored payload.
            debug!(
                frame_id = header.frame_id,
                index = header.fragment_index,
                "duplicate fragment ignored"
            );
            return Ok(None);
        }

        assembly.slots[slot] = Some(payload);
        assembly.received += 1;

        if assembly.is_complete() {
            let frame = assembly.assemble(now_ms);
            self.remove(header.frame_id);
            debug!(
                frame_id = frame.frame_id,
                size = frame.bytes.len(),
                latency_ms = frame.latency_ms,
                "frame complete"
            );
            return Ok(Some(frame));
        }

        Ok(None)
    }

    /// Sweep assemblies whose first fragment arrived longer than the
    /// stale age ago. Returns the number of frames dropped.
    pub fn evict_stale(&mut self, now_ms: u64) -> usize {
        let cutoff = self.stale_age.as_millis() as u64;
        let stale: Vec<u32> = self
            .assemblies
            .values()
            .filter(|a| now_ms.saturating_sub(a.first_seen_ms) >= cutoff)
            .map(|a| a.frame_id)
            .collect();
        for frame_id in &stale {
            warn!(frame_id, "dropping stalled frame assembly");
            self.remove(*frame_id);
        }
        stale.len()
    }

    /// Discard every in-flight assembly (e.g. on train reselection).
    pub fn clear(&mut self) {
        self.assemblies.clear();
        self.order.clear();
    }

    fn validate(&self, header: &FragmentHeader) -> Result<(), AssemblyError> {
        if header.fragment_count == 0 || header.fragment_count > self.max_fragments {
            return Err(AssemblyError::ImplausibleCount {
                frame_id: header.frame_id,
                count: header.fragment_count,
            });
        }
        if header.fragment_index == 0 || header.fragment_index > header.fragment_count {
            return Err(AssemblyError::IndexOutOfRange {
                frame_id: header.frame_id,
                index: header.fragment_index,
                count: header.fragment_count,
            });
        }
        Ok(())
    }

    fn insert_assembly(&mut self, header: &FragmentHeader, now_ms: u64) {
        if self.assemblies.len() >= self.capacity {
            // Evict the oldest in-flight frame; it is lost for good.
            if let Some(oldest) = self.order.pop_front() {
                self.assemblies.remove(&oldest);
                warn!(frame_id = oldest, "ring full, evicting oldest frame");
            }
        }
        self.assemblies
            .insert(header.frame_id, FrameAssembly::new(header, now_ms));
        self.order.push_back(header.frame_id);
    }

    fn remove(&mut self, frame_id: u32) {
        self.assemblies.remove(&frame_id);
        self.order.retain(|id| *id != frame_id);
    }
}

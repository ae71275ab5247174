//! Status sync register.
//!
//! A 128-bit value shared by Host and peer, versioned by a 4-bit change counter.  The
//! engine does not interpret the bits; it only carries the value and its counter as one
//! unit.
//!
//! Host updates arrive as eight [`Opcode::StatusSet`] payload words.  They are staged and
//! committed when the frame closes, and only if all eight arrived, so a reader can never
//! pair a new counter with a value mixing old and new words.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::framer::{CompletedFrame, Opcode};

/// Number of 16-bit words in the status value
pub const STATUS_WORDS: usize = 8;

const COUNTER_MASK: u8 = 0x0F;
const ALL_WORDS: u8 = 0xFF;

/// Value and change counter, always read together
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub value: u128,
    /// Increments (mod 16) on every committed update
    pub change_counter: u8,
}

#[derive(Debug, Default, Clone, Copy)]
struct Staging {
    words: [u16; STATUS_WORDS],
    received: u8,
}

/// Outcome of closing a status frame, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommit {
    /// Frame carried no staged words
    Nothing,
    Committed,
    /// Frame closed before all words arrived
    Discarded,
}

#[derive(Debug, Default, Clone)]
pub struct StatusRegister {
    current: StatusSnapshot,
    visibility_mask: u16,
    staging: Option<Staging>,
    get_latch: Option<StatusSnapshot>,
}

impl StatusRegister {
    pub fn new(visibility_mask: u16) -> Self {
        Self {
            visibility_mask,
            ..Self::default()
        }
    }

    /// Stage one word of an incoming update.  Nothing is visible until
    /// [`Self::commit()`].
    pub fn write(&mut self, offset_words: usize, value: u16) {
        if offset_words >= STATUS_WORDS {
            trace!("Status word {offset_words} beyond value, ignored");
            return;
        }
        let staging = self.staging.get_or_insert_with(Staging::default);
        staging.words[offset_words] = value;
        staging.received |= 1 << offset_words;
    }

    /// Commit the staged update if complete, otherwise discard it.
    pub fn commit(&mut self) -> StatusCommit {
        let Some(staging) = self.staging.take() else {
            return StatusCommit::Nothing;
        };

        if staging.received != ALL_WORDS {
            warn!(
                "Discarding partial status update ({} of {STATUS_WORDS} words)",
                staging.received.count_ones()
            );
            return StatusCommit::Discarded;
        }

        let value = staging
            .words
            .iter()
            .enumerate()
            .fold(0u128, |acc, (i, &w)| acc | (w as u128) << (i * 16));
        self.apply(value);
        StatusCommit::Committed
    }

    /// Replace the whole value at once, as the peer's menu layer does.
    pub fn apply(&mut self, value: u128) {
        self.current = StatusSnapshot {
            value,
            change_counter: self.current.change_counter.wrapping_add(1) & COUNTER_MASK,
        };
        debug!(
            "Status updated, counter {}: {value:#034X}",
            self.current.change_counter
        );
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.current
    }

    pub fn read_visibility_mask(&self) -> u16 {
        self.visibility_mask
    }

    /// Supplied by the peer; the engine never changes it.
    pub fn set_visibility_mask(&mut self, mask: u16) {
        self.visibility_mask = mask;
    }

    /// Handle a payload word of a status namespace frame, returning the reply.
    pub fn on_word(&mut self, opcode: Opcode, position: u32, word: u16) -> u16 {
        match opcode {
            Opcode::StatusSet => {
                self.write(position as usize - 1, word);
                0
            }
            Opcode::StatusGet => {
                // Latch once so all words of the reply come from one snapshot
                let snapshot = *self.get_latch.get_or_insert(self.current);
                match position {
                    1 => snapshot.change_counter as u16,
                    2..=9 => (snapshot.value >> ((position - 2) * 16)) as u16,
                    _ => 0,
                }
            }
            Opcode::StatusMask if position == 1 => self.visibility_mask,
            _ => 0,
        }
    }

    /// Completion hook for status namespace frames.
    pub fn on_frame_complete(&mut self, frame: CompletedFrame) -> StatusCommit {
        self.get_latch = None;
        match frame.opcode {
            Opcode::StatusSet => self.commit(),
            _ => StatusCommit::Nothing,
        }
    }
}

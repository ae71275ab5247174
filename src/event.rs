//! Async event broadcaster.
//!
//! Pointer, keyboard, clock and feedback updates are not request driven.  Each class has
//! one slot holding the latest value and a [`Toggle`] that changes on every publish.  A
//! consumer remembers the last toggle it saw and calls [`EventBroadcaster::poll()`]; a
//! different toggle means new data.  Nothing is ever cleared by the reader, and a
//! publisher never waits: if the consumer falls behind, the older value is overwritten.
//!
//! Multi-word updates (pointer, clock, keyboard sequences) are assembled from the frame
//! and published when it closes, complete or not at all.  Keyboard sequences are looked
//! up in a small remap table after assembly, so the multi-byte PS/2 Pause and Print
//! Screen sequences surface as single events.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::engine::Diagnostics;
use crate::framer::{CompletedFrame, Opcode};

/// Longest keyboard sequence accepted in one frame
pub const MAX_KEY_SEQUENCE: usize = 8;

const KEY_EXTENDED: u8 = 0xE0;
const KEY_BREAK: u8 = 0xF0;
const KEY_PAUSE_PREFIX: u8 = 0xE1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Pointer,
    Keys,
    Clock,
    /// Drive rumble / force feedback, published by the peer
    Feedback,
}

impl EventClass {
    const COUNT: usize = 4;

    fn slot(self) -> usize {
        match self {
            EventClass::Pointer => 0,
            EventClass::Keys => 1,
            EventClass::Clock => 2,
            EventClass::Feedback => 3,
        }
    }
}

/// Freshness marker for a slot.
///
/// A generation counter rather than a single bit, so a consumer that misses several
/// updates still sees a change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Toggle(u32);

impl Toggle {
    /// Value before the first publish
    pub const INITIAL: Toggle = Toggle(0);

    fn next(self) -> Self {
        Toggle(self.0.wrapping_add(1))
    }

    pub fn generation(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PointerState {
    pub buttons: u8,
    pub dx: i16,
    pub dy: i16,
    pub wheel: i8,
}

/// Logical keyboard event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Scan {
        code: u8,
        extended: bool,
        pressed: bool,
    },
    /// Pause has no release sequence
    Pause,
    PrintScreen {
        pressed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// Raw calendar bytes as sent by the Host
    Calendar([u8; 8]),
    /// Seconds since the Unix epoch
    Unix(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventValue {
    Pointer(PointerState),
    Key(KeyEvent),
    Clock(ClockEvent),
    Feedback(u16),
}

impl EventValue {
    pub fn class(&self) -> EventClass {
        match self {
            EventValue::Pointer(_) => EventClass::Pointer,
            EventValue::Key(_) => EventClass::Keys,
            EventValue::Clock(_) => EventClass::Clock,
            EventValue::Feedback(_) => EventClass::Feedback,
        }
    }
}

/// Multi-byte sequences remapped to one logical key event
const KEY_SEQUENCES: &[(&[u8], KeyEvent)] = &[
    (
        &[0xE1, 0x14, 0x77, 0xE1, 0xF0, 0x14, 0xF0, 0x77],
        KeyEvent::Pause,
    ),
    (
        &[0xE0, 0x12, 0xE0, 0x7C],
        KeyEvent::PrintScreen { pressed: true },
    ),
    (
        &[0xE0, 0xF0, 0x7C, 0xE0, 0xF0, 0x12],
        KeyEvent::PrintScreen { pressed: false },
    ),
];

fn is_prefix(code: u8) -> bool {
    matches!(code, KEY_EXTENDED | KEY_BREAK | KEY_PAUSE_PREFIX)
}

/// Decode a fully assembled scan code sequence.
pub fn decode_key_sequence(sequence: &[u8]) -> Option<KeyEvent> {
    if let Some((_, event)) = KEY_SEQUENCES.iter().find(|(seq, _)| *seq == sequence) {
        return Some(*event);
    }

    let (extended, pressed, code) = match *sequence {
        [code] => (false, true, code),
        [KEY_BREAK, code] => (false, false, code),
        [KEY_EXTENDED, code] => (true, true, code),
        [KEY_EXTENDED, KEY_BREAK, code] => (true, false, code),
        _ => return None,
    };
    if is_prefix(code) {
        return None;
    }
    Some(KeyEvent::Scan {
        code,
        extended,
        pressed,
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    value: Option<EventValue>,
    toggle: Toggle,
}

#[derive(Debug, Default, Clone, Copy)]
struct Staging {
    words: [u16; MAX_KEY_SEQUENCE],
    received: usize,
}

#[derive(Debug, Default, Clone)]
pub struct EventBroadcaster {
    slots: [Slot; EventClass::COUNT],
    staging: Option<Staging>,
    feedback_latch: Option<Slot>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `value` into its class's slot and flip the toggle.  Never blocks.
    pub fn publish(&mut self, value: EventValue) -> Toggle {
        let slot = &mut self.slots[value.class().slot()];
        slot.value = Some(value);
        slot.toggle = slot.toggle.next();
        trace!("Published {value:?}, toggle {}", slot.toggle.0);
        slot.toggle
    }

    /// Latest value of `class` if its toggle differs from `last_seen`.
    pub fn poll(&self, class: EventClass, last_seen: Toggle) -> Option<(EventValue, Toggle)> {
        let slot = &self.slots[class.slot()];
        if slot.toggle == last_seen {
            return None;
        }
        slot.value.map(|value| (value, slot.toggle))
    }

    /// Current toggle of `class`, for a consumer that only wants changes from now on
    pub fn toggle(&self, class: EventClass) -> Toggle {
        self.slots[class.slot()].toggle
    }

    /// Handle a payload word of an event namespace frame, returning the reply.
    pub fn on_word(&mut self, opcode: Opcode, position: u32, word: u16) -> u16 {
        match opcode {
            Opcode::FeedbackGet => {
                let slot = *self
                    .feedback_latch
                    .get_or_insert(self.slots[EventClass::Feedback.slot()]);
                match (position, slot.value) {
                    (1, _) => slot.toggle.0 as u16,
                    (2, Some(EventValue::Feedback(value))) => value,
                    _ => 0,
                }
            }
            _ => {
                let staging = self.staging.get_or_insert_with(Staging::default);
                let offset = position as usize - 1;
                if offset < MAX_KEY_SEQUENCE {
                    staging.words[offset] = word;
                }
                staging.received = staging.received.max(position as usize);
                0
            }
        }
    }

    /// Completion hook for event namespace frames.
    pub fn on_frame_complete(&mut self, frame: CompletedFrame, diag: &mut Diagnostics) {
        self.feedback_latch = None;
        let staging = self.staging.take().unwrap_or_default();
        if frame.opcode == Opcode::FeedbackGet {
            return;
        }

        match Self::assemble(frame.opcode, &staging) {
            Some(value) => {
                self.publish(value);
            }
            None => {
                warn!(
                    "Discarding {:?} update ({} words)",
                    frame.opcode, frame.payload_words
                );
                diag.discarded_commands = diag.discarded_commands.wrapping_add(1);
            }
        }
    }

    fn assemble(opcode: Opcode, staging: &Staging) -> Option<EventValue> {
        // Words past the staging area are never needed, only counted
        let words = &staging.words[..staging.received.min(MAX_KEY_SEQUENCE)];

        match (opcode, words) {
            (Opcode::Pointer, [buttons, dx, dy, rest @ ..]) => {
                Some(EventValue::Pointer(PointerState {
                    buttons: *buttons as u8,
                    dx: *dx as i16,
                    dy: *dy as i16,
                    wheel: rest.first().map_or(0, |&w| w as u8 as i8),
                }))
            }
            (Opcode::Keys, _) if staging.received > MAX_KEY_SEQUENCE => None,
            (Opcode::Keys, [_, ..]) => {
                let mut sequence = [0u8; MAX_KEY_SEQUENCE];
                for (byte, word) in sequence.iter_mut().zip(words) {
                    *byte = *word as u8;
                }
                decode_key_sequence(&sequence[..words.len()]).map(EventValue::Key)
            }
            (Opcode::Clock, [a, b, c, d, ..]) => {
                let mut calendar = [0u8; 8];
                for (chunk, word) in calendar.chunks_mut(2).zip([a, b, c, d]) {
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
                Some(EventValue::Clock(ClockEvent::Calendar(calendar)))
            }
            (Opcode::Timestamp, [lo, hi, ..]) => Some(EventValue::Clock(ClockEvent::Unix(
                (*lo as u32) | (*hi as u32) << 16,
            ))),
            _ => None,
        }
    }
}

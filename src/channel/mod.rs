//! Channel transport between Host and peer.
//!
//! The raw channel is a reliable, in-order, full-duplex word stream plus a framing signal.
//! A command sequence is open exactly while the framing signal is asserted.  This module
//! turns samples of that signal into [`Framing`] edges; everything above it works in
//! terms of those edges and never touches the raw channel.
//!
//! See [`crate`] for how the transport fits into the engine.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;
pub mod sync;

#[cfg(feature = "async")]
pub use futures::{AsyncChannelTransport, AsyncWordChannel};
pub use sync::{ChannelTransport, ScriptedChannel, WordChannel};

/// State of the framing signal at one channel turn, relative to the previous turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Signal idle, and was idle
    Idle,
    /// Signal went active: a new frame starts with this turn's word
    Opened,
    /// Signal active, and was active: this turn's word continues the frame
    Active,
    /// Signal went idle: the open frame is complete
    Closed,
}

impl Framing {
    /// Whether a word is exchanged on this turn
    pub fn carries_word(self) -> bool {
        matches!(self, Framing::Opened | Framing::Active)
    }
}

/// Edge detector for the framing signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramingTracker {
    active: bool,
}

impl FramingTracker {
    pub const fn new() -> Self {
        Self { active: false }
    }

    /// Feed the current framing signal, returning the edge it represents.
    pub fn update(&mut self, active: bool) -> Framing {
        let framing = match (self.active, active) {
            (false, false) => Framing::Idle,
            (false, true) => Framing::Opened,
            (true, true) => Framing::Active,
            (true, false) => Framing::Closed,
        };
        self.active = active;
        framing
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_edges() {
        let mut tracker = FramingTracker::new();
        assert_eq!(tracker.update(false), Framing::Idle);
        assert_eq!(tracker.update(true), Framing::Opened);
        assert_eq!(tracker.update(true), Framing::Active);
        assert!(tracker.is_active());
        assert_eq!(tracker.update(false), Framing::Closed);
        assert_eq!(tracker.update(false), Framing::Idle);
        assert!(!Framing::Closed.carries_word());
        assert!(Framing::Opened.carries_word());
    }
}

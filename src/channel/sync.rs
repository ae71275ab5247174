//! Synchronous channel transport - typically used by the peer's main loop.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::collections::VecDeque;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{Framing, FramingTracker};
use crate::framer::CommandFrame;
use crate::{Error, Result};

/// Trait for accessing the raw word channel.
///
/// Sync version, typically used when the channel is a peripheral register block or
/// an in-process queue.
pub trait WordChannel {
    /// Read the word the Host clocked in on this turn
    fn read_word(&mut self) -> Result<u16>;

    /// Write the reply word for this turn
    fn write_word(&mut self, word: u16) -> Result<()>;

    /// Sample the framing signal
    fn channel_active(&mut self) -> Result<bool>;
}

/// Owns the raw channel and reports framing edges to the layers above.
pub struct ChannelTransport<C: WordChannel> {
    channel: C,
    tracker: FramingTracker,
}

impl<C: WordChannel> ChannelTransport<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            tracker: FramingTracker::new(),
        }
    }

    /// Sample the framing signal and classify this turn.
    pub fn framing(&mut self) -> Result<Framing> {
        let active = self.channel.channel_active()?;
        let framing = self.tracker.update(active);
        if framing == Framing::Opened || framing == Framing::Closed {
            trace!("Channel {framing:?}");
        }
        Ok(framing)
    }

    /// Receive this turn's word
    pub fn receive(&mut self) -> Result<u16> {
        self.channel.read_word()
    }

    /// Send this turn's reply
    pub fn send(&mut self, word: u16) -> Result<()> {
        self.channel.write_word(word)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptEntry {
    Word(u16),
    Idle,
}

/// In-memory [`WordChannel`] replaying a Host-side script.
///
/// Words pushed with [`Self::push_frame()`] are presented with the framing signal
/// asserted, followed by one idle sample closing the frame.  Every reply the engine
/// writes is recorded and can be collected with [`Self::take_replies()`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedChannel {
    script: VecDeque<ScriptEntry>,
    replies: Vec<u16>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a complete frame: its words, then the framing signal dropping.
    pub fn push_frame(&mut self, frame: &CommandFrame) {
        self.push_words(&frame.to_words());
        self.push_idle();
    }

    /// Queue raw words with the framing signal asserted, without closing the frame.
    pub fn push_words(&mut self, words: &[u16]) {
        self.script
            .extend(words.iter().copied().map(ScriptEntry::Word));
    }

    /// Queue one idle sample of the framing signal.
    pub fn push_idle(&mut self) {
        self.script.push_back(ScriptEntry::Idle);
    }

    /// Whether the script has been fully consumed
    pub fn is_drained(&self) -> bool {
        self.script.is_empty()
    }

    pub fn replies(&self) -> &[u16] {
        &self.replies
    }

    /// Collect and clear the recorded replies
    pub fn take_replies(&mut self) -> Vec<u16> {
        core::mem::take(&mut self.replies)
    }
}

impl WordChannel for ScriptedChannel {
    fn read_word(&mut self) -> Result<u16> {
        match self.script.front() {
            Some(ScriptEntry::Word(word)) => {
                let word = *word;
                self.script.pop_front();
                Ok(word)
            }
            _ => Err(Error::Io),
        }
    }

    fn write_word(&mut self, word: u16) -> Result<()> {
        self.replies.push(word);
        Ok(())
    }

    fn channel_active(&mut self) -> Result<bool> {
        match self.script.front() {
            Some(ScriptEntry::Word(_)) => Ok(true),
            Some(ScriptEntry::Idle) => {
                self.script.pop_front();
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

//! Asynchronous channel transport - typically used when the channel is reached through
//! an async peripheral driver or a socket.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::channel::sync::{ScriptedChannel, WordChannel};
use crate::channel::{Framing, FramingTracker};

/// Trait for accessing the raw word channel.
///
/// Async version of [`WordChannel`].
#[async_trait(?Send)]
pub trait AsyncWordChannel {
    /// Read the word the Host clocked in on this turn
    async fn read_word(&mut self) -> Result<u16>;

    /// Write the reply word for this turn
    async fn write_word(&mut self, word: u16) -> Result<()>;

    /// Sample the framing signal
    async fn channel_active(&mut self) -> Result<bool>;
}

/// Async version of [`crate::channel::ChannelTransport`].
pub struct AsyncChannelTransport<C: AsyncWordChannel> {
    channel: C,
    tracker: FramingTracker,
}

impl<C: AsyncWordChannel> AsyncChannelTransport<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            tracker: FramingTracker::new(),
        }
    }

    /// Sample the framing signal and classify this turn.
    pub async fn framing(&mut self) -> Result<Framing> {
        let active = self.channel.channel_active().await?;
        let framing = self.tracker.update(active);
        if framing == Framing::Opened || framing == Framing::Closed {
            trace!("Channel {framing:?}");
        }
        Ok(framing)
    }

    /// Receive this turn's word
    pub async fn receive(&mut self) -> Result<u16> {
        self.channel.read_word().await
    }

    /// Send this turn's reply
    pub async fn send(&mut self, word: u16) -> Result<()> {
        self.channel.write_word(word).await
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

#[async_trait(?Send)]
impl AsyncWordChannel for ScriptedChannel {
    async fn read_word(&mut self) -> Result<u16> {
        WordChannel::read_word(self)
    }

    async fn write_word(&mut self, word: u16) -> Result<()> {
        WordChannel::write_word(self, word)
    }

    async fn channel_active(&mut self) -> Result<bool> {
        WordChannel::channel_active(self)
    }
}

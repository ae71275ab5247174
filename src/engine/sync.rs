//! Synchronous driver - typically called once per channel turn from the peer's main loop.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::channel::{ChannelTransport, Framing, WordChannel};
use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::io::{StorageBackend, TransferBackend};

/// Binds an [`Engine`] to a channel and the peer-local backends.
///
/// Example usage:
///
/// ```rust
/// use peer_bridge::channel::ScriptedChannel;
/// use peer_bridge::config::BridgeConfig;
/// use peer_bridge::engine::Bridge;
/// use peer_bridge::framer::CommandFrame;
/// use peer_bridge::io::{MemoryRegion, MemoryStorage};
///
/// let mut channel = ScriptedChannel::new();
/// channel.push_frame(&CommandFrame::status_set(0x1234));
///
/// let config = BridgeConfig::default();
/// let mut bridge = Bridge::new(config, channel, MemoryStorage::new(1), MemoryRegion::new(0, 256));
/// bridge.run_until_idle().unwrap();
/// assert_eq!(bridge.engine().status_snapshot().value, 0x1234);
/// ```
pub struct Bridge<C: WordChannel, S: StorageBackend, T: TransferBackend> {
    transport: ChannelTransport<C>,
    engine: Engine,
    storage: S,
    transfer: T,
}

impl<C: WordChannel, S: StorageBackend, T: TransferBackend> Bridge<C, S, T> {
    pub fn new(config: BridgeConfig, channel: C, storage: S, transfer: T) -> Self {
        Self {
            transport: ChannelTransport::new(channel),
            engine: Engine::new(config),
            storage,
            transfer,
        }
    }

    /// Process exactly one channel turn.
    ///
    /// Returns the framing edge seen on this turn.  Errors only if the channel itself
    /// fails; protocol anomalies are absorbed by the engine.
    pub fn step(&mut self) -> Result<Framing> {
        let framing = self.transport.framing()?;
        match framing {
            Framing::Opened => {
                self.engine.begin_frame();
                self.exchange()?;
            }
            Framing::Active => self.exchange()?,
            Framing::Closed => self.engine.end_frame(&mut self.storage),
            Framing::Idle => self.engine.sample_backpressure(&mut self.transfer),
        }
        Ok(framing)
    }

    fn exchange(&mut self) -> Result<()> {
        let word = self.transport.receive()?;
        let reply = self
            .engine
            .on_word(word, &mut self.storage, &mut self.transfer);
        self.transport.send(reply)
    }

    /// Step until the channel reports idle, returning the number of words exchanged.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut words = 0;
        loop {
            let framing = self.step()?;
            if framing == Framing::Idle {
                break;
            }
            if framing.carries_word() {
                words += 1;
            }
        }
        trace!("Channel idle after {words} words");
        Ok(words)
    }

    /// Mount or unmount `drive` from what the storage backend reports, with no channel
    /// traffic.
    pub fn refresh_mount(&mut self, drive: u8) -> Result<()> {
        match self.storage.mount_info(drive) {
            Some(info) => self.engine.mount(drive, info.size, info.read_only),
            None => self.engine.unmount(drive),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn transfer_mut(&mut self) -> &mut T {
        &mut self.transfer
    }

    pub fn channel(&self) -> &C {
        self.transport.channel()
    }

    pub fn channel_mut(&mut self) -> &mut C {
        self.transport.channel_mut()
    }
}

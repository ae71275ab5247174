//! Asynchronous driver - typically used when the channel is reached through an async
//! peripheral driver.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::channel::{AsyncChannelTransport, AsyncWordChannel, Framing};
use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::io::{StorageBackend, TransferBackend};

/// Yield delay for async polling loops.
///
/// Application must provide an implementation of this trait in order for
/// [`AsyncBridge::serve_frame()`] to be able to yield while waiting for the Host to open
/// a frame.
///
/// This trait keeps `peer-bridge` free of any specific async runtime.
///
/// Example:
///
/// ```rust,ignore
/// use embassy_time::{Duration, Timer};
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         Timer::after(Duration::from_micros(100)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl Future<Output = ()>;
}

/// Async version of [`crate::engine::Bridge`].
///
/// See [`AsyncDelay`] for required delay trait.
pub struct AsyncBridge<C, S, T, D>
where
    C: AsyncWordChannel,
    S: StorageBackend,
    T: TransferBackend,
    D: AsyncDelay,
{
    transport: AsyncChannelTransport<C>,
    engine: Engine,
    storage: S,
    transfer: T,
    _delay: core::marker::PhantomData<D>,
}

impl<C, S, T, D> AsyncBridge<C, S, T, D>
where
    C: AsyncWordChannel,
    S: StorageBackend,
    T: TransferBackend,
    D: AsyncDelay,
{
    pub fn new(config: BridgeConfig, channel: C, storage: S, transfer: T) -> Self {
        Self {
            transport: AsyncChannelTransport::new(channel),
            engine: Engine::new(config),
            storage,
            transfer,
            _delay: core::marker::PhantomData,
        }
    }

    /// Process exactly one channel turn.
    pub async fn step(&mut self) -> Result<Framing> {
        let framing = self.transport.framing().await?;
        match framing {
            Framing::Opened => {
                self.engine.begin_frame();
                self.exchange().await?;
            }
            Framing::Active => self.exchange().await?,
            Framing::Closed => self.engine.end_frame(&mut self.storage),
            Framing::Idle => self.engine.sample_backpressure(&mut self.transfer),
        }
        Ok(framing)
    }

    async fn exchange(&mut self) -> Result<()> {
        let word = self.transport.receive().await?;
        let reply = self
            .engine
            .on_word(word, &mut self.storage, &mut self.transfer);
        self.transport.send(reply).await
    }

    /// Wait for the Host to open a frame, then serve it to completion.
    ///
    /// Returns the number of words exchanged in the frame.
    pub async fn serve_frame(&mut self) -> Result<usize> {
        let mut words = 0;
        loop {
            match self.step().await? {
                // Yield with a delay to avoid spinning while the Host is quiet
                Framing::Idle => D::delay().await,
                Framing::Opened | Framing::Active => words += 1,
                Framing::Closed => break,
            }
        }
        debug!("Served frame of {words} words");
        Ok(words)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
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

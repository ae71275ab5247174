//! Bridge protocol engine for a controlling Host and a peer execution unit sharing a single
//! serialized command channel.
//!
//! Four logically independent traffic classes are multiplexed over the one channel:
//! - **Status sync** - a 128-bit configuration value with a 4-bit change counter
//! - **Virtual block devices** - up to 10 emulated drives contending for one sector buffer
//! - **Bulk transfer** - download (Host to peer) and upload (peer to Host) byte streams
//! - **Async events** - pointer, keyboard, clock and feedback updates with toggle-style
//!   freshness detection
//!
//! `no_std`.  Requires `alloc`, as the sector buffer and drive table are sized when the
//! engine is configured.
//!
//! ## Architecture
//!
//! The engine is the peer side of the channel.  The Host is the channel master: it raises
//! the framing signal, clocks one 16-bit word per channel turn, and reads back the reply
//! word the engine produces for that turn.  A command sequence is open exactly while the
//! framing signal is asserted.
//!
//! ```text
//!   Host ──words──> [ channel ] ──> Framer ──> status | drive | transfer | event
//!   Host <──replies─ [ channel ] <────────────────────────┘
//! ```
//!
//! The first word of each frame is the opcode (see [`framer::Opcode`]); the remaining
//! words are forwarded, together with their position in the frame, to the component
//! owning that opcode's namespace.  Components whose commands span several words commit
//! only when the frame closes, so a frame cut short by the framing signal never leaves a
//! half-applied value behind.
//!
//! The engine is driven by a single synchronous step per channel turn and never blocks.
//! The only stall is the caller-visible `waiting` flag of the transfer controller, which
//! is re-evaluated on every step from [`io::TransferBackend::ready()`].
//!
//! ## Modules
//!
//! - [`channel`] - Channel transport: framing edge detection over a raw word channel,
//!   sync and async
//! - [`config`] - Engine configuration
//! - [`framer`] - Opcode table, command frame encoding and decoding
//! - [`status`] - Status sync register
//! - [`drive`] - Virtual block device arbiter
//! - [`transfer`] - Bulk transfer controller
//! - [`event`] - Async event broadcaster
//! - [`engine`] - The engine itself, plus sync and async drivers binding it to a channel
//! - [`io`] - Storage and transfer collaborator traits, with in-memory implementations
//!
//! ## Getting Started
//!
//! **Peer setup**:
//! 1. Build a [`config::BridgeConfig`] with the drive count, block size class and word
//!    width agreed with the Host
//! 2. Implement [`channel::WordChannel`] for your physical channel, and
//!    [`io::StorageBackend`] / [`io::TransferBackend`] for your local memories
//! 3. Create an [`engine::Bridge`] and call [`engine::Bridge::step()`] once per channel
//!    turn from your main loop
//! 4. Read state through the snapshot accessors on [`engine::Engine`], e.g.
//!    [`engine::Engine::status_snapshot()`] and [`engine::Engine::poll_event()`]
//!
//! **Host side**: build frames with [`framer::CommandFrame`] and clock them over the
//! channel, reading one reply word per turn.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable [`channel::AsyncWordChannel`] and [`engine::AsyncBridge`] (requires
//!   `async-trait`).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![no_std]

extern crate alloc;

pub mod channel;
pub mod config;
pub mod drive;
pub mod engine;
pub mod event;
pub mod framer;
pub mod io;
pub mod status;
pub mod transfer;

/// Bridge errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Channel I/O error
    Io,
    /// Configuration value out of range
    InvalidConfig,
    /// Drive index beyond the configured drive count
    NoSuchDrive,
    /// Drive already has outstanding work
    Busy,
    /// Write requested on a read-only drive
    ReadOnly,
    /// Drive has no image mounted
    NotMounted,
    /// Argument out of range
    InvalidArgument,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io => write!(f, "Channel I/O error"),
            Error::InvalidConfig => write!(f, "Invalid bridge configuration"),
            Error::NoSuchDrive => write!(f, "No such drive"),
            Error::Busy => write!(f, "Drive busy"),
            Error::ReadOnly => write!(f, "Drive is read-only"),
            Error::NotMounted => write!(f, "Drive not mounted"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
        }
    }
}

/// Type to represent the result of a bridge operation
pub type Result<T> = core::result::Result<T, Error>;

//! The bridge engine.
//!
//! [`Engine`] is the transport-free state machine: it is handed one word per channel turn
//! and returns the reply word, routing each frame to the component owning its opcode's
//! namespace.  It never touches the channel itself.  [`Bridge`] (and [`AsyncBridge`] with
//! the `async` feature) bind an engine to a channel and the peer-local backends, and are
//! what an application normally drives.
//!
//! Local consumers (the peer's UI or OS emulation) read engine state only through the
//! snapshot accessors here, each of which returns one consistent copy.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;
pub mod sync;

#[cfg(feature = "async")]
pub use futures::{AsyncBridge, AsyncDelay};
pub use sync::Bridge;

use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::config::BridgeConfig;
use crate::drive::{DriveArbiter, DriveDirection, DriveStatus, VirtualDrive};
use crate::event::{EventBroadcaster, EventClass, EventValue, Toggle};
use crate::framer::{FrameEvent, Framer, Namespace};
use crate::io::{StorageBackend, TransferBackend};
use crate::status::{StatusCommit, StatusRegister, StatusSnapshot};
use crate::transfer::{CompletedTransfer, TransferController, TransferProgress};

/// Counters for anomalies the protocol absorbs without reporting them to the Host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    /// Frames opened with an unknown opcode
    pub ignored_opcodes: u32,
    /// Multi-word commands cut short by the framing signal
    pub discarded_commands: u32,
    /// Sector bytes with no acknowledged drive, or in the wrong direction
    pub rejected_sector_bytes: u32,
    /// Sector bytes beyond the end of the block or request
    pub clamped_sector_bytes: u32,
    /// Transfer data words refused while waiting
    pub stalled_words: u32,
    /// Storage or transfer backend errors
    pub backend_failures: u32,
    /// Acknowledgments refused
    pub rejected_acks: u32,
}

/// Peer-side protocol engine.
#[derive(Debug, Clone)]
pub struct Engine {
    config: BridgeConfig,
    framer: Framer,
    status: StatusRegister,
    drives: DriveArbiter,
    transfer: TransferController,
    events: EventBroadcaster,
    diagnostics: Diagnostics,
    ignoring: bool,
}

impl Engine {
    pub fn new(config: BridgeConfig) -> Self {
        info!(
            "Bridge engine: {} drive(s), {} byte blocks, {:?} transfers",
            config.drive_count(),
            config.block_size(),
            config.word_width()
        );
        Self {
            framer: Framer::new(),
            status: StatusRegister::new(0),
            drives: DriveArbiter::new(&config),
            transfer: TransferController::new(config.word_width()),
            events: EventBroadcaster::new(),
            diagnostics: Diagnostics::default(),
            ignoring: false,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The framing signal went active.
    pub fn begin_frame(&mut self) {
        self.ignoring = false;
        self.framer.on_channel_active();
    }

    /// Re-evaluate transfer backpressure.  Called on every turn, including idle ones.
    pub fn sample_backpressure<T: TransferBackend>(&mut self, transfer: &mut T) {
        self.transfer.set_waiting(!transfer.ready());
    }

    /// Process one word received during an open frame, returning this turn's reply.
    pub fn on_word<S: StorageBackend, T: TransferBackend>(
        &mut self,
        word: u16,
        storage: &mut S,
        transfer: &mut T,
    ) -> u16 {
        self.sample_backpressure(transfer);

        let reply = match self.framer.on_word(word) {
            FrameEvent::Opcode(_) => 0,
            FrameEvent::Ignored => {
                if !self.ignoring {
                    self.ignoring = true;
                    self.diagnostics.ignored_opcodes =
                        self.diagnostics.ignored_opcodes.wrapping_add(1);
                }
                0
            }
            FrameEvent::Payload {
                opcode,
                position,
                word,
            } => match opcode.namespace() {
                Namespace::Status => self.status.on_word(opcode, position, word),
                Namespace::Drive => {
                    self.drives
                        .on_word(opcode, position, word, storage, &mut self.diagnostics)
                }
                Namespace::Transfer => self.transfer.on_word(
                    opcode,
                    position,
                    word,
                    transfer,
                    &mut self.diagnostics,
                ),
                Namespace::Event => self.events.on_word(opcode, position, word),
            },
        };
        trace!("Turn {word:#06X} -> {reply:#06X}");
        reply
    }

    /// The framing signal went idle: run the completion hook of the frame's owner.
    pub fn end_frame<S: StorageBackend>(&mut self, storage: &mut S) {
        self.ignoring = false;
        let Some(frame) = self.framer.on_channel_idle() else {
            return;
        };

        let diag = &mut self.diagnostics;
        match frame.opcode.namespace() {
            Namespace::Status => {
                if self.status.on_frame_complete(frame) == StatusCommit::Discarded {
                    diag.discarded_commands = diag.discarded_commands.wrapping_add(1);
                }
            }
            Namespace::Drive => self.drives.on_frame_complete(frame, storage, diag),
            Namespace::Transfer => self.transfer.on_frame_complete(frame, diag),
            Namespace::Event => self.events.on_frame_complete(frame, diag),
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Replace the status value from the peer side, bumping the change counter.
    pub fn status_apply(&mut self, value: u128) {
        self.status.apply(value);
    }

    pub fn visibility_mask(&self) -> u16 {
        self.status.read_visibility_mask()
    }

    pub fn set_visibility_mask(&mut self, mask: u16) {
        self.status.set_visibility_mask(mask);
    }

    pub fn drive_table_snapshot(&self) -> Vec<VirtualDrive> {
        self.drives.drives().to_vec()
    }

    pub fn drive_status(&self, drive: u8) -> Option<DriveStatus> {
        self.drives.status_query(drive)
    }

    pub fn drives(&self) -> &DriveArbiter {
        &self.drives
    }

    /// Mount an image of `size_bytes` on `drive`.  A size of 0 unmounts it.
    pub fn mount(&mut self, drive: u8, size_bytes: u64, read_only: bool) -> Result<()> {
        if size_bytes == 0 {
            return self.drives.unmount(drive);
        }
        self.drives.mount(drive, size_bytes, read_only)
    }

    pub fn unmount(&mut self, drive: u8) -> Result<()> {
        self.drives.unmount(drive)
    }

    /// Raise a read request: the Host supplies `blocks` blocks starting at `lba`.
    pub fn request_read(&mut self, drive: u8, lba: u32, blocks: u8) -> Result<()> {
        self.drives
            .request(drive, DriveDirection::Read, lba, blocks)
    }

    /// Raise a write request: the Host drains `blocks` blocks starting at `lba`.
    pub fn request_write(&mut self, drive: u8, lba: u32, blocks: u8) -> Result<()> {
        self.drives
            .request(drive, DriveDirection::Write, lba, blocks)
    }

    pub fn transfer_progress(&self) -> TransferProgress {
        self.transfer.progress()
    }

    pub fn last_transfer(&self) -> Option<CompletedTransfer> {
        self.transfer.last_completed()
    }

    /// Latest event of `class`, if newer than `last_seen`.
    pub fn poll_event(&self, class: EventClass, last_seen: Toggle) -> Option<(EventValue, Toggle)> {
        self.events.poll(class, last_seen)
    }

    pub fn publish_feedback(&mut self, value: u16) -> Toggle {
        self.events.publish(EventValue::Feedback(value))
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{CommandFrame, Opcode};
    use crate::io::{MemoryRegion, MemoryStorage};

    struct Harness {
        engine: Engine,
        storage: MemoryStorage,
        region: MemoryRegion,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                engine: Engine::new(BridgeConfig::default()),
                storage: MemoryStorage::new(1),
                region: MemoryRegion::new(0, 64),
            }
        }

        fn frame(&mut self, frame: &CommandFrame) -> Vec<u16> {
            self.engine.begin_frame();
            let replies = frame
                .to_words()
                .into_iter()
                .map(|w| {
                    self.engine
                        .on_word(w, &mut self.storage, &mut self.region)
                })
                .collect();
            self.engine.end_frame(&mut self.storage);
            replies
        }
    }

    #[test]
    fn test_unknown_opcode_counted_once() {
        let mut h = Harness::new();
        let replies = h.frame(&CommandFrame::raw(0x0BAD).with_words(&[1, 2, 3]));
        assert_eq!(replies, [0, 0, 0, 0]);
        assert_eq!(h.engine.diagnostics().ignored_opcodes, 1);
        assert_eq!(h.engine.status_snapshot(), StatusSnapshot::default());
    }

    #[test]
    fn test_partial_status_counted() {
        let mut h = Harness::new();
        h.frame(&CommandFrame::new(Opcode::StatusSet).with_words(&[1, 2, 3]));
        assert_eq!(h.engine.diagnostics().discarded_commands, 1);
        assert_eq!(h.engine.status_snapshot().change_counter, 0);
    }

    #[test]
    fn test_status_round_trip_through_engine() {
        let mut h = Harness::new();
        h.frame(&CommandFrame::status_set(0xABCD));
        let replies = h.frame(&CommandFrame::status_get());
        assert_eq!(replies[1], 1);
        assert_eq!(replies[2], 0xABCD);
        assert!(replies[3..].iter().all(|&w| w == 0));
    }

    #[test]
    fn test_local_mount_zero_unmounts() {
        let mut h = Harness::new();
        h.engine.mount(0, 4096, false).unwrap();
        assert!(h.engine.drive_table_snapshot()[0].mounted);
        h.engine.mount(0, 0, false).unwrap();
        assert!(!h.engine.drive_table_snapshot()[0].mounted);
        assert_eq!(h.engine.request_read(0, 0, 1), Err(crate::Error::NotMounted));
    }

    #[test]
    fn test_backpressure_sampled_per_turn() {
        let mut h = Harness::new();
        h.region.set_ready(false);
        h.engine.sample_backpressure(&mut h.region);
        assert!(h.engine.transfer_progress().waiting);
        h.region.set_ready(true);
        h.engine.sample_backpressure(&mut h.region);
        assert!(!h.engine.transfer_progress().waiting);
    }

    #[test]
    fn test_feedback_visible_to_host() {
        let mut h = Harness::new();
        h.engine.publish_feedback(0x0042);
        let replies = h.frame(&CommandFrame::feedback_get());
        assert_eq!(replies, [0, 1, 0x0042]);
    }
}

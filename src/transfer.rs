//! Bulk transfer controller.
//!
//! Moves file data between the Host and peer memory with an auto-incrementing address.
//! One session at a time, `Idle -> Downloading -> Idle` or `Idle -> Uploading -> Idle`,
//! started and stopped by [`Opcode::FileTx`] and fed by [`Opcode::FileData`].
//!
//! Backpressure: while the peer memory reports not ready, the controller is `waiting`.
//! Data words presented while waiting are refused without advancing the address, and the
//! Host re-presents them.  Download replies carry the refusal in bit 0.  Once a word is
//! refused, the rest of that data frame is refused too, so what a frame moved is always
//! a prefix of it.  [`Opcode::FileStatus`] reports whether the last data frame stalled
//! and how many words it moved, which is how an upload Host tells a stall from data.
//!
//! The file index and type tag are plain settings.  A session copies them when it
//! starts, so changing them mid-session only affects the next one.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::WordWidth;
use crate::engine::Diagnostics;
use crate::framer::{CompletedFrame, FILE_TX_STOP, FILE_TX_UPLOAD, Opcode};
use crate::io::TransferBackend;

/// Bit 0 of a download reply: word refused, present it again
pub const REPLY_STALLED: u16 = 1;

/// FILE_STATUS bit 3: the last data frame stalled before its end
pub const STATUS_FRAME_STALLED: u16 = 1 << 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    #[default]
    Idle,
    /// Host to peer
    Download,
    /// Peer to Host
    Upload,
}

impl TransferDirection {
    fn to_bits(self) -> u16 {
        match self {
            TransferDirection::Idle => 0,
            TransferDirection::Download => 1,
            TransferDirection::Upload => 2,
        }
    }
}

/// An active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub start_address: u32,
    pub address: u32,
    pub file_index: u16,
    pub file_type: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    #[default]
    Idle,
    Downloading(Session),
    Uploading(Session),
}

impl TransferState {
    pub fn direction(&self) -> TransferDirection {
        match self {
            TransferState::Idle => TransferDirection::Idle,
            TransferState::Downloading(_) => TransferDirection::Download,
            TransferState::Uploading(_) => TransferDirection::Upload,
        }
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            TransferState::Idle => None,
            TransferState::Downloading(session) | TransferState::Uploading(session) => {
                Some(session)
            }
        }
    }
}

/// Progress as shown to a loading UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    /// Current address, or the final address of the last session when idle
    pub address: u32,
    pub waiting: bool,
}

/// Latched when a session terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub direction: TransferDirection,
    pub start_address: u32,
    pub final_address: u32,
    pub file_index: u16,
    pub file_type: u32,
}

impl CompletedTransfer {
    /// Bytes moved by the session
    pub fn bytes(&self) -> u32 {
        self.final_address.wrapping_sub(self.start_address)
    }
}

/// What one [`Opcode::FileData`] frame achieved
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataFrameReport {
    /// Words moved before the first stall, or the whole frame
    pub words: u32,
    pub stalled: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Staging {
    words: [u16; 3],
    received: usize,
}

#[derive(Debug, Clone)]
pub struct TransferController {
    state: TransferState,
    word_width: WordWidth,
    waiting: bool,
    file_index: u16,
    file_type: u32,
    last_completed: Option<CompletedTransfer>,
    staging: Option<Staging>,
    data_frame: DataFrameReport,
    last_data_frame: DataFrameReport,
}

impl TransferController {
    pub fn new(word_width: WordWidth) -> Self {
        Self {
            state: TransferState::Idle,
            word_width,
            waiting: false,
            file_index: 0,
            file_type: 0,
            last_completed: None,
            staging: None,
            data_frame: DataFrameReport::default(),
            last_data_frame: DataFrameReport::default(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn waiting(&self) -> bool {
        self.waiting
    }

    /// Set by the consuming side, typically from [`TransferBackend::ready()`] on every
    /// step.
    pub fn set_waiting(&mut self, waiting: bool) {
        if waiting != self.waiting {
            trace!("Transfer waiting: {waiting}");
        }
        self.waiting = waiting;
    }

    pub fn set_file_index(&mut self, index: u16) {
        self.file_index = index;
    }

    pub fn set_file_type(&mut self, file_type: u32) {
        self.file_type = file_type;
    }

    pub fn last_completed(&self) -> Option<CompletedTransfer> {
        self.last_completed
    }

    /// Outcome of the most recently closed data frame
    pub fn last_data_frame(&self) -> DataFrameReport {
        self.last_data_frame
    }

    pub fn progress(&self) -> TransferProgress {
        let address = match self.state {
            TransferState::Downloading(session) | TransferState::Uploading(session) => {
                session.address
            }
            TransferState::Idle => self.last_completed.map_or(0, |c| c.final_address),
        };
        TransferProgress {
            direction: self.state.direction(),
            address,
            waiting: self.waiting,
        }
    }

    /// Start a session.  Ignored, returning `false`, if one is already active.
    pub fn start(&mut self, direction: TransferDirection, address: u32) -> bool {
        if self.state != TransferState::Idle {
            warn!(
                "Transfer start ignored, {:?} session active",
                self.state.direction()
            );
            return false;
        }

        let session = Session {
            start_address: address,
            address,
            file_index: self.file_index,
            file_type: self.file_type,
        };
        self.state = match direction {
            TransferDirection::Download => TransferState::Downloading(session),
            TransferDirection::Upload => TransferState::Uploading(session),
            TransferDirection::Idle => return false,
        };
        debug!(
            "Transfer {direction:?} started at {address:#010X}, file {} type {:#010X}",
            session.file_index, session.file_type
        );
        true
    }

    /// End the active session, latching its final address.
    pub fn terminate(&mut self) -> Option<CompletedTransfer> {
        let direction = self.state.direction();
        let session = *self.state.session_mut()?;
        self.state = TransferState::Idle;

        let completed = CompletedTransfer {
            direction,
            start_address: session.start_address,
            final_address: session.address,
            file_index: session.file_index,
            file_type: session.file_type,
        };
        debug!(
            "Transfer {direction:?} finished at {:#010X}, {} bytes",
            completed.final_address,
            completed.bytes()
        );
        self.last_completed = Some(completed);
        Some(completed)
    }

    /// Store one downloaded data word.  Returns `false` if the word was refused because
    /// the controller is waiting.
    pub fn download_word<T: TransferBackend>(
        &mut self,
        word: u16,
        backend: &mut T,
        diag: &mut Diagnostics,
    ) -> bool {
        let waiting = self.waiting;
        let width = self.word_width;
        let TransferState::Downloading(session) = &mut self.state else {
            trace!("Download data with no download session");
            return true;
        };
        if waiting {
            diag.stalled_words = diag.stalled_words.wrapping_add(1);
            return false;
        }

        let bytes = word.to_le_bytes();
        for (offset, &byte) in bytes[..width.stride() as usize].iter().enumerate() {
            let addr = session.address.wrapping_add(offset as u32);
            if let Err(e) = backend.sink_byte(addr, byte) {
                warn!("Download store at {addr:#010X} failed: {e:?}");
                diag.backend_failures = diag.backend_failures.wrapping_add(1);
            }
        }
        session.address = session.address.wrapping_add(width.stride());
        true
    }

    /// Fetch one data word for upload.  Returns `None` if the controller is waiting.
    pub fn upload_word<T: TransferBackend>(
        &mut self,
        backend: &mut T,
        diag: &mut Diagnostics,
    ) -> Option<u16> {
        let waiting = self.waiting;
        let width = self.word_width;
        let TransferState::Uploading(session) = &mut self.state else {
            trace!("Upload data with no upload session");
            return Some(0);
        };
        if waiting {
            diag.stalled_words = diag.stalled_words.wrapping_add(1);
            return None;
        }

        let mut bytes = [0u8; 2];
        for (offset, byte) in bytes.iter_mut().take(width.stride() as usize).enumerate() {
            let addr = session.address.wrapping_add(offset as u32);
            *byte = backend.source_byte(addr).unwrap_or_else(|e| {
                warn!("Upload fetch at {addr:#010X} failed: {e:?}");
                diag.backend_failures = diag.backend_failures.wrapping_add(1);
                0
            });
        }
        session.address = session.address.wrapping_add(width.stride());
        Some(u16::from_le_bytes(bytes))
    }

    /// Handle a payload word of a transfer namespace frame, returning the reply.
    pub fn on_word<T: TransferBackend>(
        &mut self,
        opcode: Opcode,
        position: u32,
        word: u16,
        backend: &mut T,
        diag: &mut Diagnostics,
    ) -> u16 {
        match opcode {
            Opcode::FileData => self.data_word(word, backend, diag),
            Opcode::FileTx | Opcode::FileIndex | Opcode::FileInfo => {
                let staging = self.staging.get_or_insert_with(Staging::default);
                let offset = position as usize - 1;
                if offset < staging.words.len() {
                    staging.words[offset] = word;
                    staging.received = staging.received.max(offset + 1);
                }
                0
            }
            Opcode::FileStatus if position == 1 => {
                let stalled = if self.last_data_frame.stalled {
                    STATUS_FRAME_STALLED
                } else {
                    0
                };
                (self.waiting as u16) | (self.state.direction().to_bits() << 1) | stalled
            }
            Opcode::FileStatus if position == 2 => self.last_data_frame.words as u16,
            _ => 0,
        }
    }

    fn data_word<T: TransferBackend>(
        &mut self,
        word: u16,
        backend: &mut T,
        diag: &mut Diagnostics,
    ) -> u16 {
        let uploading = matches!(self.state, TransferState::Uploading(_));
        if self.data_frame.stalled {
            diag.stalled_words = diag.stalled_words.wrapping_add(1);
            return if uploading { 0 } else { REPLY_STALLED };
        }

        let moved = if uploading {
            self.upload_word(backend, diag)
        } else if self.download_word(word, backend, diag) {
            Some(0)
        } else {
            None
        };
        match moved {
            Some(reply) => {
                self.data_frame.words = self.data_frame.words.wrapping_add(1);
                reply
            }
            None => {
                debug!("Data frame stalled after {} words", self.data_frame.words);
                self.data_frame.stalled = true;
                if uploading { 0 } else { REPLY_STALLED }
            }
        }
    }

    /// Completion hook for transfer namespace frames.
    pub fn on_frame_complete(&mut self, frame: CompletedFrame, diag: &mut Diagnostics) {
        if frame.opcode == Opcode::FileData {
            self.last_data_frame = core::mem::take(&mut self.data_frame);
            return;
        }
        let staging = self.staging.take().unwrap_or_default();
        let words = &staging.words[..staging.received];

        match (frame.opcode, words) {
            (Opcode::FileTx, [FILE_TX_STOP, ..]) => {
                if self.terminate().is_none() {
                    trace!("Transfer stop with no active session");
                }
            }
            (Opcode::FileTx, [tag, lo, hi, ..]) => {
                let direction = if *tag == FILE_TX_UPLOAD {
                    TransferDirection::Upload
                } else {
                    TransferDirection::Download
                };
                self.start(direction, (*lo as u32) | (*hi as u32) << 16);
            }
            (Opcode::FileIndex, [index, ..]) => self.set_file_index(*index),
            (Opcode::FileInfo, [lo, hi, ..]) => {
                self.set_file_type((*lo as u32) | (*hi as u32) << 16)
            }
            (Opcode::FileTx | Opcode::FileIndex | Opcode::FileInfo, _) => {
                warn!(
                    "Discarding partial {:?} command ({} words)",
                    frame.opcode, frame.payload_words
                );
                diag.discarded_commands = diag.discarded_commands.wrapping_add(1);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryRegion;

    fn complete(opcode: Opcode, payload_words: u32) -> CompletedFrame {
        CompletedFrame {
            opcode,
            payload_words,
        }
    }

    fn send_frame(
        controller: &mut TransferController,
        opcode: Opcode,
        words: &[u16],
        backend: &mut MemoryRegion,
        diag: &mut Diagnostics,
    ) -> alloc::vec::Vec<u16> {
        let replies = words
            .iter()
            .enumerate()
            .map(|(i, &w)| controller.on_word(opcode, i as u32 + 1, w, backend, diag))
            .collect();
        controller.on_frame_complete(complete(opcode, words.len() as u32), diag);
        replies
    }

    #[test]
    fn test_download_advances_by_stride() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0x5000_1234, 16);
        let mut diag = Diagnostics::default();

        send_frame(
            &mut controller,
            Opcode::FileTx,
            &[0x00FF, 0x1234, 0x5000],
            &mut region,
            &mut diag,
        );
        assert_eq!(controller.state().direction(), TransferDirection::Download);
        assert_eq!(controller.progress().address, 0x5000_1234);

        send_frame(&mut controller, Opcode::FileData, &[0xAABB], &mut region, &mut diag);
        assert_eq!(controller.progress().address, 0x5000_1236);
        assert_eq!(&region.data()[..2], &[0xBB, 0xAA]);

        send_frame(&mut controller, Opcode::FileTx, &[0], &mut region, &mut diag);
        let completed = controller.last_completed().unwrap();
        assert_eq!(completed.final_address, 0x5000_1236);
        assert_eq!(completed.bytes(), 2);
        assert_eq!(controller.progress().direction, TransferDirection::Idle);
        assert_eq!(controller.progress().address, 0x5000_1236);
    }

    #[test]
    fn test_byte_width_stride() {
        let mut controller = TransferController::new(WordWidth::Byte);
        let mut region = MemoryRegion::new(0, 4);
        let mut diag = Diagnostics::default();

        assert!(controller.start(TransferDirection::Download, 0));
        controller.download_word(0x1101, &mut region, &mut diag);
        controller.download_word(0x2202, &mut region, &mut diag);
        assert_eq!(controller.progress().address, 2);
        assert_eq!(region.data(), &[0x01, 0x02, 0, 0]);
    }

    #[test]
    fn test_waiting_stalls_without_loss() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0, 8);
        let mut diag = Diagnostics::default();
        controller.start(TransferDirection::Download, 0);

        controller.set_waiting(true);
        for _ in 0..3 {
            assert!(!controller.download_word(0x0201, &mut region, &mut diag));
            assert_eq!(controller.progress().address, 0);
        }
        assert_eq!(region.data()[0], 0);
        assert_eq!(diag.stalled_words, 3);

        controller.set_waiting(false);
        assert!(controller.download_word(0x0201, &mut region, &mut diag));
        assert_eq!(controller.progress().address, 2);
        assert_eq!(&region.data()[..4], &[1, 2, 0, 0]);
    }

    #[test]
    fn test_upload_reads_source() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0x100, 4);
        region.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        let mut diag = Diagnostics::default();

        send_frame(
            &mut controller,
            Opcode::FileTx,
            &[FILE_TX_UPLOAD, 0x0100, 0],
            &mut region,
            &mut diag,
        );
        let replies = send_frame(
            &mut controller,
            Opcode::FileData,
            &[0, 0],
            &mut region,
            &mut diag,
        );
        assert_eq!(replies, alloc::vec![0x0201, 0x0403]);

        controller.set_waiting(true);
        assert_eq!(controller.upload_word(&mut region, &mut diag), None);
        assert_eq!(controller.progress().address, 0x104);
    }

    #[test]
    fn test_metadata_snapshot_at_start() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0, 4);
        let mut diag = Diagnostics::default();

        send_frame(&mut controller, Opcode::FileIndex, &[3], &mut region, &mut diag);
        send_frame(
            &mut controller,
            Opcode::FileInfo,
            &[0x4E53, 0x4553],
            &mut region,
            &mut diag,
        );
        controller.start(TransferDirection::Download, 0);

        controller.set_file_index(9);
        controller.set_file_type(0);
        let completed = controller.terminate().unwrap();
        assert_eq!(completed.file_index, 3);
        assert_eq!(completed.file_type, 0x4553_4E53);
    }

    #[test]
    fn test_partial_start_discarded() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0, 4);
        let mut diag = Diagnostics::default();

        send_frame(&mut controller, Opcode::FileTx, &[0x00FF, 0x1234], &mut region, &mut diag);
        assert_eq!(controller.state(), TransferState::Idle);
        assert_eq!(diag.discarded_commands, 1);
    }

    #[test]
    fn test_start_while_active_ignored() {
        let mut controller = TransferController::new(WordWidth::Word);
        assert!(controller.start(TransferDirection::Download, 0x10));
        assert!(!controller.start(TransferDirection::Upload, 0x20));
        assert_eq!(controller.progress().address, 0x10);
        assert_eq!(controller.progress().direction, TransferDirection::Download);
    }

    #[test]
    fn test_upload_stall_holds_rest_of_frame() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0, 8);
        region.data_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut diag = Diagnostics::default();
        controller.start(TransferDirection::Upload, 0);

        let mut reply = |controller: &mut TransferController, position, waiting| {
            controller.set_waiting(waiting);
            controller.on_word(Opcode::FileData, position, 0, &mut region, &mut diag)
        };
        assert_eq!(reply(&mut controller, 1, false), 0x0201);
        assert_eq!(reply(&mut controller, 2, true), 0);
        // Ready again, but the frame already stalled
        assert_eq!(reply(&mut controller, 3, false), 0);
        controller.on_frame_complete(complete(Opcode::FileData, 3), &mut diag);

        assert_eq!(
            controller.last_data_frame(),
            DataFrameReport {
                words: 1,
                stalled: true
            }
        );
        assert_eq!(controller.progress().address, 2);
        assert_eq!(
            controller.on_word(Opcode::FileStatus, 1, 0, &mut region, &mut diag),
            STATUS_FRAME_STALLED | 0b100
        );
        assert_eq!(
            controller.on_word(Opcode::FileStatus, 2, 0, &mut region, &mut diag),
            1
        );

        // The retry continues the stream where it stopped
        let replies = send_frame(
            &mut controller,
            Opcode::FileData,
            &[0, 0],
            &mut region,
            &mut diag,
        );
        assert_eq!(replies, alloc::vec![0x0403, 0x0605]);
        assert_eq!(
            controller.last_data_frame(),
            DataFrameReport {
                words: 2,
                stalled: false
            }
        );
    }

    #[test]
    fn test_download_stall_holds_rest_of_frame() {
        let mut controller = TransferController::new(WordWidth::Byte);
        let mut region = MemoryRegion::new(0, 4);
        let mut diag = Diagnostics::default();
        controller.start(TransferDirection::Download, 0);

        assert_eq!(
            controller.on_word(Opcode::FileData, 1, 0x11, &mut region, &mut diag),
            0
        );
        controller.set_waiting(true);
        assert_eq!(
            controller.on_word(Opcode::FileData, 2, 0x22, &mut region, &mut diag),
            REPLY_STALLED
        );
        controller.set_waiting(false);
        assert_eq!(
            controller.on_word(Opcode::FileData, 3, 0x33, &mut region, &mut diag),
            REPLY_STALLED
        );
        controller.on_frame_complete(complete(Opcode::FileData, 3), &mut diag);

        assert_eq!(region.data(), &[0x11, 0, 0, 0]);
        assert_eq!(controller.last_data_frame().words, 1);
        assert_eq!(diag.stalled_words, 2);
    }

    #[test]
    fn test_stall_counter_wraps() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0, 4);
        let mut diag = Diagnostics {
            stalled_words: u32::MAX,
            ..Diagnostics::default()
        };
        controller.start(TransferDirection::Download, 0);
        controller.set_waiting(true);
        assert!(!controller.download_word(0x0101, &mut region, &mut diag));
        assert_eq!(diag.stalled_words, 0);
    }

    #[test]
    fn test_address_low_word_first() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0x0005_1234, 4);
        let mut diag = Diagnostics::default();

        send_frame(
            &mut controller,
            Opcode::FileTx,
            &[0x00FF, 0x1234, 0x0005],
            &mut region,
            &mut diag,
        );
        send_frame(&mut controller, Opcode::FileData, &[0xAABB], &mut region, &mut diag);
        assert_eq!(controller.progress().address, 0x0005_1236);
    }

    #[test]
    fn test_status_reply() {
        let mut controller = TransferController::new(WordWidth::Word);
        let mut region = MemoryRegion::new(0, 4);
        let mut diag = Diagnostics::default();
        controller.start(TransferDirection::Upload, 0);
        controller.set_waiting(true);
        assert_eq!(
            controller.on_word(Opcode::FileStatus, 1, 0, &mut region, &mut diag),
            0b101
        );
    }
}

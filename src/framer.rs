//! Command framing on top of the channel transport.
//!
//! A frame is one opcode word followed by any number of payload words, delimited by the
//! framing signal.  [`Framer`] decodes frames on the peer, one word per turn, tracking
//! the position of each word within its frame.  [`CommandFrame`] encodes frames on the
//! Host side.
//!
//! The framer does not bound or validate payload length: each component consumes the
//! prefix it expects and ignores trailing words.  Opcodes outside [`Opcode`] are ignored
//! to the end of their frame, leaving unused values free for later commands.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Tag word starting an upload session in [`Opcode::FileTx`]
pub const FILE_TX_UPLOAD: u16 = 0x00AA;
/// Tag word starting a download session in [`Opcode::FileTx`]
pub const FILE_TX_DOWNLOAD: u16 = 0x00FF;
/// Tag word terminating the active session in [`Opcode::FileTx`]
pub const FILE_TX_STOP: u16 = 0x0000;

/// Command opcodes.
///
/// Reply words are produced on every turn; position 0 (the opcode itself) always
/// replies 0.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Host sets the status value: 8 words, least significant first
    StatusSet = 0x0001,
    /// Host reads the status value: change counter, then 8 value words
    StatusGet = 0x0002,
    /// Host reads the visibility mask
    StatusMask = 0x0003,

    /// Side-effect free drive status: drive index in, status word and block count out
    DriveStatus = 0x0010,
    /// Arbitrate once, returning the selected drive's status word and LBA
    DriveArbitrate = 0x0011,
    /// Acknowledge the selected drive, granting it the sector buffer
    DriveAck = 0x0012,
    /// Release the acknowledged drive
    DriveRelease = 0x0013,
    /// Host fills the sector buffer
    SectorWrite = 0x0014,
    /// Host drains the sector buffer
    SectorRead = 0x0015,
    /// Mount or unmount an image: drive, flags, 4 size words
    DriveMount = 0x0016,

    /// Start or stop a transfer session: tag, address low, address high
    FileTx = 0x0020,
    /// Transfer data words
    FileData = 0x0021,
    /// Set the file index for the next session
    FileIndex = 0x0022,
    /// Set the 32-bit file type tag for the next session
    FileInfo = 0x0023,
    /// Read the transfer controller's waiting flag, direction and last data frame stall,
    /// then the number of words the last data frame moved
    FileStatus = 0x0024,

    /// Pointer update: buttons, dx, dy, optional wheel
    Pointer = 0x0030,
    /// Keyboard scan code sequence, one byte per word
    Keys = 0x0031,
    /// Calendar clock: 4 words carrying 8 bytes
    Clock = 0x0032,
    /// Unix timestamp: 2 words, least significant first
    Timestamp = 0x0033,
    /// Host reads the feedback (rumble) slot
    FeedbackGet = 0x0034,
}

impl Opcode {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0001 => Some(Opcode::StatusSet),
            0x0002 => Some(Opcode::StatusGet),
            0x0003 => Some(Opcode::StatusMask),
            0x0010 => Some(Opcode::DriveStatus),
            0x0011 => Some(Opcode::DriveArbitrate),
            0x0012 => Some(Opcode::DriveAck),
            0x0013 => Some(Opcode::DriveRelease),
            0x0014 => Some(Opcode::SectorWrite),
            0x0015 => Some(Opcode::SectorRead),
            0x0016 => Some(Opcode::DriveMount),
            0x0020 => Some(Opcode::FileTx),
            0x0021 => Some(Opcode::FileData),
            0x0022 => Some(Opcode::FileIndex),
            0x0023 => Some(Opcode::FileInfo),
            0x0024 => Some(Opcode::FileStatus),
            0x0030 => Some(Opcode::Pointer),
            0x0031 => Some(Opcode::Keys),
            0x0032 => Some(Opcode::Clock),
            0x0033 => Some(Opcode::Timestamp),
            0x0034 => Some(Opcode::FeedbackGet),
            _ => None,
        }
    }

    /// Component owning this opcode
    pub fn namespace(self) -> Namespace {
        match self {
            Opcode::StatusSet | Opcode::StatusGet | Opcode::StatusMask => Namespace::Status,
            Opcode::DriveStatus
            | Opcode::DriveArbitrate
            | Opcode::DriveAck
            | Opcode::DriveRelease
            | Opcode::SectorWrite
            | Opcode::SectorRead
            | Opcode::DriveMount => Namespace::Drive,
            Opcode::FileTx
            | Opcode::FileData
            | Opcode::FileIndex
            | Opcode::FileInfo
            | Opcode::FileStatus => Namespace::Transfer,
            Opcode::Pointer
            | Opcode::Keys
            | Opcode::Clock
            | Opcode::Timestamp
            | Opcode::FeedbackGet => Namespace::Event,
        }
    }
}

/// The four traffic classes sharing the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Status,
    Drive,
    Transfer,
    Event,
}

/// A Host-side command frame: opcode plus payload words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: u16,
    payload: Vec<u16>,
}

impl CommandFrame {
    pub fn new(opcode: Opcode) -> Self {
        Self::raw(opcode as u16)
    }

    /// Frame with an arbitrary opcode value, including ones the peer does not know
    pub fn raw(opcode: u16) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }

    pub fn with_word(mut self, word: u16) -> Self {
        self.payload.push(word);
        self
    }

    pub fn with_words(mut self, words: &[u16]) -> Self {
        self.payload.extend_from_slice(words);
        self
    }

    /// Pad with `count` zero words, used to clock out replies
    pub fn with_turns(mut self, count: usize) -> Self {
        self.payload.resize(self.payload.len() + count, 0);
        self
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn payload(&self) -> &[u16] {
        &self.payload
    }

    /// Words in channel order, opcode first
    pub fn to_words(&self) -> Vec<u16> {
        let mut words = Vec::with_capacity(1 + self.payload.len());
        words.push(self.opcode);
        words.extend_from_slice(&self.payload);
        words
    }

    pub fn status_set(value: u128) -> Self {
        let mut frame = Self::new(Opcode::StatusSet);
        for i in 0..8 {
            frame.payload.push((value >> (i * 16)) as u16);
        }
        frame
    }

    pub fn status_get() -> Self {
        Self::new(Opcode::StatusGet).with_turns(9)
    }

    pub fn drive_status(drive: u8) -> Self {
        Self::new(Opcode::DriveStatus).with_words(&[drive as u16, 0])
    }

    pub fn drive_arbitrate() -> Self {
        Self::new(Opcode::DriveArbitrate).with_turns(3)
    }

    pub fn drive_ack(drive: u8) -> Self {
        Self::new(Opcode::DriveAck).with_word(drive as u16)
    }

    pub fn drive_release() -> Self {
        Self::new(Opcode::DriveRelease)
    }

    /// Mount an image of `size` bytes.  A size of 0 unmounts the drive.
    pub fn drive_mount(drive: u8, size: u64, read_only: bool) -> Self {
        let mut frame = Self::new(Opcode::DriveMount)
            .with_word(drive as u16)
            .with_word(read_only as u16);
        for i in 0..4 {
            frame.payload.push((size >> (i * 16)) as u16);
        }
        frame
    }

    pub fn sector_write(words: &[u16]) -> Self {
        Self::new(Opcode::SectorWrite).with_words(words)
    }

    pub fn sector_read(turns: usize) -> Self {
        Self::new(Opcode::SectorRead).with_turns(turns)
    }

    pub fn file_tx_download(address: u32) -> Self {
        Self::file_tx(FILE_TX_DOWNLOAD, address)
    }

    pub fn file_tx_upload(address: u32) -> Self {
        Self::file_tx(FILE_TX_UPLOAD, address)
    }

    pub fn file_tx_stop() -> Self {
        Self::new(Opcode::FileTx).with_word(FILE_TX_STOP)
    }

    fn file_tx(tag: u16, address: u32) -> Self {
        Self::new(Opcode::FileTx).with_words(&[tag, address as u16, (address >> 16) as u16])
    }

    pub fn file_data(words: &[u16]) -> Self {
        Self::new(Opcode::FileData).with_words(words)
    }

    pub fn file_index(index: u16) -> Self {
        Self::new(Opcode::FileIndex).with_word(index)
    }

    pub fn file_info(file_type: u32) -> Self {
        Self::new(Opcode::FileInfo).with_words(&[file_type as u16, (file_type >> 16) as u16])
    }

    pub fn file_status() -> Self {
        Self::new(Opcode::FileStatus).with_turns(2)
    }

    pub fn pointer(buttons: u8, dx: i16, dy: i16, wheel: i8) -> Self {
        Self::new(Opcode::Pointer).with_words(&[
            buttons as u16,
            dx as u16,
            dy as u16,
            wheel as u8 as u16,
        ])
    }

    pub fn keys(codes: &[u8]) -> Self {
        let mut frame = Self::new(Opcode::Keys);
        frame.payload.extend(codes.iter().map(|&c| c as u16));
        frame
    }

    pub fn clock(calendar: [u8; 8]) -> Self {
        let mut frame = Self::new(Opcode::Clock);
        frame
            .payload
            .extend(calendar.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])));
        frame
    }

    pub fn timestamp(seconds: u32) -> Self {
        Self::new(Opcode::Timestamp).with_words(&[seconds as u16, (seconds >> 16) as u16])
    }

    pub fn feedback_get() -> Self {
        Self::new(Opcode::FeedbackGet).with_turns(2)
    }
}

/// What the framer made of one word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// The word opened a frame for a known opcode
    Opcode(Opcode),
    /// A payload word at `position` (1 for the first word after the opcode)
    Payload {
        opcode: Opcode,
        position: u32,
        word: u16,
    },
    /// The word belongs to a frame with an unknown opcode
    Ignored,
}

/// A frame closed by the framing signal, handed to the owning component's
/// completion hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedFrame {
    pub opcode: Opcode,
    /// Payload words received, excluding the opcode
    pub payload_words: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Closed,
    AwaitOpcode,
    Open { opcode: Opcode, position: u32 },
    Ignored { opcode: u16 },
}

/// Peer-side frame decoder.
#[derive(Debug, Clone)]
pub struct Framer {
    state: FrameState,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub const fn new() -> Self {
        Self {
            state: FrameState::Closed,
        }
    }

    /// Framing signal went active: the next word is an opcode.
    pub fn on_channel_active(&mut self) {
        if self.is_open() {
            warn!("Frame reopened without closing");
        }
        self.state = FrameState::AwaitOpcode;
    }

    /// Decode one word.
    pub fn on_word(&mut self, word: u16) -> FrameEvent {
        match self.state {
            FrameState::Closed | FrameState::AwaitOpcode => {
                if self.state == FrameState::Closed {
                    warn!("Word {word:#06X} outside a frame, treating as opcode");
                }
                match Opcode::from_u16(word) {
                    Some(opcode) => {
                        trace!("Frame opened: {opcode:?}");
                        self.state = FrameState::Open {
                            opcode,
                            position: 0,
                        };
                        FrameEvent::Opcode(opcode)
                    }
                    None => {
                        debug!("Ignoring frame with unknown opcode {word:#06X}");
                        self.state = FrameState::Ignored { opcode: word };
                        FrameEvent::Ignored
                    }
                }
            }
            FrameState::Open { opcode, position } => {
                let position = position.saturating_add(1);
                self.state = FrameState::Open { opcode, position };
                FrameEvent::Payload {
                    opcode,
                    position,
                    word,
                }
            }
            FrameState::Ignored { .. } => FrameEvent::Ignored,
        }
    }

    /// Framing signal went idle.  Returns the completed frame, if it had a known opcode.
    pub fn on_channel_idle(&mut self) -> Option<CompletedFrame> {
        let state = core::mem::replace(&mut self.state, FrameState::Closed);
        match state {
            FrameState::Open { opcode, position } => {
                trace!("Frame closed: {opcode:?} with {position} payload words");
                Some(CompletedFrame {
                    opcode,
                    payload_words: position,
                })
            }
            FrameState::Ignored { opcode } => {
                trace!("Ignored frame {opcode:#06X} closed");
                None
            }
            FrameState::Closed | FrameState::AwaitOpcode => None,
        }
    }

    /// Whether a frame is open
    pub fn is_open(&self) -> bool {
        !matches!(self.state, FrameState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table() {
        for raw in 0..=0x00FFu16 {
            if let Some(opcode) = Opcode::from_u16(raw) {
                assert_eq!(opcode as u16, raw);
            }
        }
        assert_eq!(Opcode::from_u16(0x0000), None);
        assert_eq!(Opcode::from_u16(0x7FFF), None);
        assert_eq!(Opcode::SectorRead.namespace(), Namespace::Drive);
        assert_eq!(Opcode::FileStatus.namespace(), Namespace::Transfer);
        assert_eq!(Opcode::Keys.namespace(), Namespace::Event);
    }

    #[test]
    fn test_positions_tracked_per_frame() {
        let mut framer = Framer::new();
        framer.on_channel_active();
        assert_eq!(framer.on_word(0x0021), FrameEvent::Opcode(Opcode::FileData));
        assert_eq!(
            framer.on_word(0xAAAA),
            FrameEvent::Payload {
                opcode: Opcode::FileData,
                position: 1,
                word: 0xAAAA
            }
        );
        assert_eq!(
            framer.on_word(0xBBBB),
            FrameEvent::Payload {
                opcode: Opcode::FileData,
                position: 2,
                word: 0xBBBB
            }
        );
        assert_eq!(
            framer.on_channel_idle(),
            Some(CompletedFrame {
                opcode: Opcode::FileData,
                payload_words: 2
            })
        );
        assert!(!framer.is_open());

        // Position restarts with the next frame
        framer.on_channel_active();
        framer.on_word(0x0022);
        assert_eq!(
            framer.on_word(7),
            FrameEvent::Payload {
                opcode: Opcode::FileIndex,
                position: 1,
                word: 7
            }
        );
    }

    #[test]
    fn test_unknown_opcode_ignored_to_end_of_frame() {
        let mut framer = Framer::new();
        framer.on_channel_active();
        assert_eq!(framer.on_word(0x0999), FrameEvent::Ignored);
        assert_eq!(framer.on_word(0x0001), FrameEvent::Ignored);
        assert_eq!(framer.on_channel_idle(), None);
    }

    #[test]
    fn test_empty_frame_has_no_completion() {
        let mut framer = Framer::new();
        framer.on_channel_active();
        assert_eq!(framer.on_channel_idle(), None);
    }

    #[test]
    fn test_encoders() {
        let frame = CommandFrame::status_set(0x0008_0007_0006_0005_0004_0003_0002_0001);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let frame = CommandFrame::file_tx_download(0x5000_1234);
        assert_eq!(
            frame.to_words(),
            alloc::vec![0x0020, FILE_TX_DOWNLOAD, 0x1234, 0x5000]
        );

        let frame = CommandFrame::drive_mount(2, 0x1_0000_0200, true);
        assert_eq!(frame.payload(), &[2, 1, 0x0200, 0x0000, 0x0001, 0x0000]);

        let frame = CommandFrame::clock([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.payload(), &[0x0201, 0x0403, 0x0605, 0x0807]);

        let frame = CommandFrame::pointer(1, -2, 3, -1);
        assert_eq!(frame.payload(), &[1, 0xFFFE, 3, 0x00FF]);

        assert_eq!(CommandFrame::status_get().payload().len(), 9);
    }
}

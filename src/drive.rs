//! Virtual block device arbiter.
//!
//! Up to ten virtual drives share a single sector buffer.  The peer raises read or write
//! requests on drives; the Host discovers them by arbitration, acknowledges one drive at
//! a time, and moves sector data through the buffer.
//!
//! Per drive: `Idle -> Selected -> Transferring -> Idle`.
//!
//! - [`Opcode::DriveArbitrate`] is the only arbitration trigger.  It scans downward from
//!   the round-robin base `rrb`, wrapping, selects the first drive with pending work and
//!   moves `rrb` one past it in scan order.  Any set of drives with persistent work is
//!   therefore served within `N` arbitrations.
//! - [`Opcode::DriveStatus`] reports a drive without touching `rrb`.
//! - [`Opcode::DriveAck`] grants the buffer to the selected drive.  Exactly one drive is
//!   acknowledged at a time and sector traffic for any other drive is rejected.
//!
//! Data direction in sector commands is relative to the buffer: the Host writes the
//! buffer to satisfy a drive's read request, and reads it to satisfy a write request.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{BlockSizeClass, BridgeConfig, WordWidth};
use crate::engine::Diagnostics;
use crate::framer::{CompletedFrame, Opcode};
use crate::io::StorageBackend;
use crate::{Error, Result};

/// Largest block count a single request can carry (6 bits)
pub const MAX_BLOCK_COUNT: u8 = 63;

const MOUNT_WORDS: usize = 6;

/// Pending operation on a drive, from the drive's point of view
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DriveDirection {
    #[default]
    Idle,
    /// Drive wants sectors from the Host's image
    Read,
    /// Drive wants sectors written to the Host's image
    Write,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DrivePhase {
    #[default]
    Idle,
    /// Chosen by arbitration, not yet acknowledged
    Selected,
    /// Acknowledged, owns the sector buffer
    Transferring,
}

/// Sector buffer access direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorDirection {
    /// Host stores bytes into the buffer
    Write,
    /// Host fetches bytes from the buffer
    Read,
}

/// One virtual drive slot.  Slots exist for the whole session and are reused across
/// mounts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtualDrive {
    pub index: u8,
    pub mounted: bool,
    pub read_only: bool,
    pub size_bytes: u64,
    pub pending_lba: u32,
    /// Blocks outstanding in the current request, 0 to [`MAX_BLOCK_COUNT`]
    pub pending_block_count: u8,
    pub direction: DriveDirection,
    pub phase: DrivePhase,
}

impl VirtualDrive {
    fn new(index: u8) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn has_pending(&self) -> bool {
        self.direction != DriveDirection::Idle && self.pending_block_count > 0
    }

    fn clear_request(&mut self) {
        self.direction = DriveDirection::Idle;
        self.pending_block_count = 0;
        self.phase = DrivePhase::Idle;
    }
}

// Drive status word layout
const FLAG_READ: u16 = 1 << 0;
const FLAG_WRITE: u16 = 1 << 1;
const FLAG_MOUNTED: u16 = 1 << 2;
const FLAG_READ_ONLY: u16 = 1 << 3;
const CLASS_SHIFT: u16 = 4;
const FLAG_ACKNOWLEDGED: u16 = 1 << 7;
const INDEX_SHIFT: u16 = 8;

/// Side-effect free view of one drive, as reported to the Host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveStatus {
    pub index: u8,
    pub pending_block_count: u8,
    pub block_size_class: u8,
    pub direction: DriveDirection,
    pub mounted: bool,
    pub read_only: bool,
    pub acknowledged: bool,
}

impl DriveStatus {
    /// Pack into the status word carried on the channel
    pub fn to_word(&self) -> u16 {
        let mut word = match self.direction {
            DriveDirection::Read => FLAG_READ,
            DriveDirection::Write => FLAG_WRITE,
            DriveDirection::Idle => 0,
        };
        if self.mounted {
            word |= FLAG_MOUNTED;
        }
        if self.read_only {
            word |= FLAG_READ_ONLY;
        }
        if self.acknowledged {
            word |= FLAG_ACKNOWLEDGED;
        }
        word | ((self.block_size_class as u16) << CLASS_SHIFT)
            | ((self.index as u16) << INDEX_SHIFT)
    }
}

/// Result of one arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitration {
    pub status: DriveStatus,
    pub lba: u32,
}

#[derive(Debug, Clone)]
struct SectorBuffer {
    data: Vec<u8>,
    address: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct MountStaging {
    words: [u16; MOUNT_WORDS],
    received: usize,
}

/// Arbiter owning the drive table and the shared sector buffer.
#[derive(Debug, Clone)]
pub struct DriveArbiter {
    drives: Vec<VirtualDrive>,
    block_size_class: BlockSizeClass,
    word_width: WordWidth,
    buffer: SectorBuffer,
    rrb: usize,
    selected: Option<u8>,
    acknowledged: Option<u8>,
    status_latch: Option<DriveStatus>,
    arbitration_latch: Option<Option<Arbitration>>,
    mount_staging: Option<MountStaging>,
}

impl DriveArbiter {
    pub fn new(config: &BridgeConfig) -> Self {
        let drive_count = config.drive_count();
        Self {
            drives: (0..drive_count).map(VirtualDrive::new).collect(),
            block_size_class: config.block_size_class(),
            word_width: config.word_width(),
            buffer: SectorBuffer {
                data: vec![0; config.block_size()],
                address: 0,
            },
            rrb: 0,
            selected: None,
            acknowledged: None,
            status_latch: None,
            arbitration_latch: None,
            mount_staging: None,
        }
    }

    pub fn drives(&self) -> &[VirtualDrive] {
        &self.drives
    }

    pub fn drive(&self, drive: u8) -> Option<&VirtualDrive> {
        self.drives.get(drive as usize)
    }

    /// Current round-robin base
    pub fn rrb(&self) -> usize {
        self.rrb
    }

    pub fn selected(&self) -> Option<u8> {
        self.selected
    }

    pub fn acknowledged(&self) -> Option<u8> {
        self.acknowledged
    }

    /// Current sector buffer address
    pub fn buffer_address(&self) -> usize {
        self.buffer.address
    }

    pub fn block_size(&self) -> usize {
        self.buffer.data.len()
    }

    fn drive_mut(&mut self, drive: u8) -> Result<&mut VirtualDrive> {
        self.drives
            .get_mut(drive as usize)
            .ok_or(Error::NoSuchDrive)
    }

    /// Mount an image on `drive`.  Pending work on the slot is left untouched.
    pub fn mount(&mut self, drive: u8, size_bytes: u64, read_only: bool) -> Result<()> {
        let slot = self.drive_mut(drive)?;
        slot.mounted = true;
        slot.size_bytes = size_bytes;
        slot.read_only = read_only;
        debug!(
            "Drive {drive} mounted, {size_bytes} bytes{}",
            if read_only { ", read-only" } else { "" }
        );
        Ok(())
    }

    /// Unmount `drive`, cancelling its pending work and any acknowledgment it holds.
    pub fn unmount(&mut self, drive: u8) -> Result<()> {
        let slot = self.drive_mut(drive)?;
        slot.mounted = false;
        slot.read_only = false;
        slot.size_bytes = 0;
        slot.clear_request();
        if self.acknowledged == Some(drive) {
            self.acknowledged = None;
        }
        if self.selected == Some(drive) {
            self.selected = None;
        }
        debug!("Drive {drive} unmounted");
        Ok(())
    }

    /// Peer side: raise a read or write request on `drive`.
    ///
    /// `blocks` above [`MAX_BLOCK_COUNT`] is clamped.
    pub fn request(
        &mut self,
        drive: u8,
        direction: DriveDirection,
        lba: u32,
        blocks: u8,
    ) -> Result<()> {
        if direction == DriveDirection::Idle || blocks == 0 {
            return Err(Error::InvalidArgument);
        }

        let slot = self.drive_mut(drive)?;
        if !slot.mounted {
            return Err(Error::NotMounted);
        }
        if slot.has_pending() {
            return Err(Error::Busy);
        }
        if direction == DriveDirection::Write && slot.read_only {
            return Err(Error::ReadOnly);
        }

        slot.direction = direction;
        slot.pending_lba = lba;
        slot.pending_block_count = blocks.min(MAX_BLOCK_COUNT);
        slot.phase = DrivePhase::Idle;
        trace!(
            "Drive {drive} request {direction:?} lba {lba} blocks {}",
            slot.pending_block_count
        );
        Ok(())
    }

    /// Status of `drive`, without side effects.
    pub fn status_query(&self, drive: u8) -> Option<DriveStatus> {
        let slot = self.drive(drive)?;
        Some(DriveStatus {
            index: slot.index,
            pending_block_count: slot.pending_block_count,
            block_size_class: self.block_size_class.class(),
            direction: slot.direction,
            mounted: slot.mounted,
            read_only: slot.read_only,
            acknowledged: self.acknowledged == Some(drive),
        })
    }

    /// Select the next drive with pending work and advance `rrb` past it.
    ///
    /// The scan runs downward from `rrb` with wrap, and `rrb` then moves one step on in
    /// that same scan order, to the drive below the selected one.  Selecting drive 2 of 3
    /// leaves `rrb` at 1, so the next scan starts with the next drive in line.
    pub fn arbitrate(&mut self) -> Option<Arbitration> {
        let count = self.drives.len();
        let found = (0..count)
            .map(|step| (self.rrb + count - step) % count)
            .find(|&idx| self.drives[idx].has_pending())?;

        self.rrb = (found + count - 1) % count;

        if let Some(previous) = self.selected.filter(|&p| p as usize != found) {
            let slot = &mut self.drives[previous as usize];
            if slot.phase == DrivePhase::Selected {
                slot.phase = DrivePhase::Idle;
            }
        }

        let drive = found as u8;
        self.selected = Some(drive);
        let slot = &mut self.drives[found];
        if slot.phase == DrivePhase::Idle {
            slot.phase = DrivePhase::Selected;
        }
        let lba = slot.pending_lba;
        debug!("Arbitration selected drive {drive}, lba {lba}, rrb now {}", self.rrb);

        self.status_query(drive)
            .map(|status| Arbitration { status, lba })
    }

    /// Grant the sector buffer to `drive`.  Only the drive most recently selected by
    /// arbitration can be acknowledged, and only while no other drive holds the buffer.
    ///
    /// Returns whether the acknowledgment was granted.
    pub fn ack<S: StorageBackend>(
        &mut self,
        drive: u8,
        storage: &mut S,
        diag: &mut Diagnostics,
    ) -> bool {
        if let Some(current) = self.acknowledged.filter(|&c| c != drive) {
            warn!("Ack for drive {drive} while drive {current} holds the buffer");
            diag.rejected_acks = diag.rejected_acks.wrapping_add(1);
            return false;
        }
        if self.selected != Some(drive) {
            warn!("Ack for drive {drive} which arbitration has not selected");
            diag.rejected_acks = diag.rejected_acks.wrapping_add(1);
            return false;
        }
        let Some(slot) = self.drives.get_mut(drive as usize) else {
            diag.rejected_acks = diag.rejected_acks.wrapping_add(1);
            return false;
        };
        if !slot.has_pending() {
            warn!("Ack for drive {drive} with no pending work");
            diag.rejected_acks = diag.rejected_acks.wrapping_add(1);
            return false;
        }

        slot.phase = DrivePhase::Transferring;
        let direction = slot.direction;
        self.acknowledged = Some(drive);
        self.buffer.address = 0;
        if direction == DriveDirection::Write {
            self.load_sector(drive, storage, diag);
        }
        debug!("Drive {drive} acknowledged for {direction:?}");
        true
    }

    /// Release the acknowledged drive.  Work it has not finished stays pending and will
    /// be offered again by arbitration.
    pub fn release(&mut self) {
        if let Some(drive) = self.acknowledged.take() {
            let slot = &mut self.drives[drive as usize];
            if slot.phase == DrivePhase::Transferring {
                slot.phase = DrivePhase::Idle;
            }
            if self.selected == Some(drive) {
                self.selected = None;
            }
            debug!("Drive {drive} released");
        }
    }

    /// Move one byte through the sector buffer for the acknowledged drive.
    ///
    /// For [`SectorDirection::Write`] `byte` is stored; for [`SectorDirection::Read`] the
    /// buffer byte is returned.  The buffer address auto-increments and a completed block
    /// is exchanged with `storage`.  Traffic with no acknowledged drive, in the wrong
    /// direction, or past the end of the request is dropped.
    pub fn sector_byte<S: StorageBackend>(
        &mut self,
        direction: SectorDirection,
        byte: u8,
        storage: &mut S,
        diag: &mut Diagnostics,
    ) -> Option<u8> {
        let Some(drive) = self.acknowledged else {
            warn!("Sector {direction:?} with no acknowledged drive");
            diag.rejected_sector_bytes = diag.rejected_sector_bytes.wrapping_add(1);
            return None;
        };

        let slot = self.drives[drive as usize];
        if slot.direction == DriveDirection::Idle || self.buffer.address >= self.block_size() {
            trace!("Sector {direction:?} past end of drive {drive} request");
            diag.clamped_sector_bytes = diag.clamped_sector_bytes.wrapping_add(1);
            return None;
        }

        let expected = match slot.direction {
            DriveDirection::Read => SectorDirection::Write,
            _ => SectorDirection::Read,
        };
        if direction != expected {
            warn!(
                "Sector {direction:?} for drive {drive} with {:?} request",
                slot.direction
            );
            diag.rejected_sector_bytes = diag.rejected_sector_bytes.wrapping_add(1);
            return None;
        }

        let address = self.buffer.address;
        let result = match direction {
            SectorDirection::Write => {
                self.buffer.data[address] = byte;
                None
            }
            SectorDirection::Read => Some(self.buffer.data[address]),
        };
        self.buffer.address += 1;

        if self.buffer.address == self.block_size() {
            self.complete_block(drive, storage, diag);
        }

        result
    }

    fn complete_block<S: StorageBackend>(
        &mut self,
        drive: u8,
        storage: &mut S,
        diag: &mut Diagnostics,
    ) {
        let slot = self.drives[drive as usize];
        if slot.direction == DriveDirection::Read {
            if let Err(e) = storage.write_sector(drive, slot.pending_lba, &self.buffer.data) {
                warn!("Drive {drive} sector {} store failed: {e:?}", slot.pending_lba);
                diag.backend_failures = diag.backend_failures.wrapping_add(1);
            }
        }

        let slot = &mut self.drives[drive as usize];
        slot.pending_lba = slot.pending_lba.wrapping_add(1);
        slot.pending_block_count -= 1;
        trace!(
            "Drive {drive} block done, {} remaining",
            slot.pending_block_count
        );

        if slot.pending_block_count == 0 {
            debug!("Drive {drive} request complete");
            slot.clear_request();
            // Address stays at the block boundary, so further traffic is clamped
            return;
        }

        let direction = slot.direction;
        self.buffer.address = 0;
        if direction == DriveDirection::Write {
            self.load_sector(drive, storage, diag);
        }
    }

    fn load_sector<S: StorageBackend>(
        &mut self,
        drive: u8,
        storage: &mut S,
        diag: &mut Diagnostics,
    ) {
        let lba = self.drives[drive as usize].pending_lba;
        if let Err(e) = storage.read_sector(drive, lba, &mut self.buffer.data) {
            warn!("Drive {drive} sector {lba} load failed: {e:?}");
            diag.backend_failures = diag.backend_failures.wrapping_add(1);
            self.buffer.data.fill(0);
        }
    }

    /// Handle a payload word of a drive namespace frame, returning the reply.
    pub fn on_word<S: StorageBackend>(
        &mut self,
        opcode: Opcode,
        position: u32,
        word: u16,
        storage: &mut S,
        diag: &mut Diagnostics,
    ) -> u16 {
        match (opcode, position) {
            (Opcode::DriveStatus, 1) => {
                let status = u8::try_from(word)
                    .ok()
                    .and_then(|drive| self.status_query(drive));
                self.status_latch = status;
                status.map_or(0, |s| s.to_word())
            }
            (Opcode::DriveStatus, 2) => self
                .status_latch
                .map_or(0, |s| s.pending_block_count as u16),

            (Opcode::DriveArbitrate, 1) => {
                let arbitration = self.arbitrate();
                self.arbitration_latch = Some(arbitration);
                arbitration.map_or(0, |a| a.status.to_word())
            }
            (Opcode::DriveArbitrate, 2) => self.latched_lba() as u16,
            (Opcode::DriveArbitrate, 3) => (self.latched_lba() >> 16) as u16,

            (Opcode::DriveAck, 1) => match u8::try_from(word) {
                Ok(drive) => self.ack(drive, storage, diag) as u16,
                Err(_) => {
                    diag.rejected_acks = diag.rejected_acks.wrapping_add(1);
                    0
                }
            },

            (Opcode::SectorWrite, _) => {
                let [lo, hi] = word.to_le_bytes();
                self.sector_byte(SectorDirection::Write, lo, storage, diag);
                if self.word_width == WordWidth::Word {
                    self.sector_byte(SectorDirection::Write, hi, storage, diag);
                }
                0
            }
            (Opcode::SectorRead, _) => {
                let lo = self
                    .sector_byte(SectorDirection::Read, 0, storage, diag)
                    .unwrap_or(0);
                let hi = if self.word_width == WordWidth::Word {
                    self.sector_byte(SectorDirection::Read, 0, storage, diag)
                        .unwrap_or(0)
                } else {
                    0
                };
                u16::from_le_bytes([lo, hi])
            }

            (Opcode::DriveMount, _) => {
                let staging = self.mount_staging.get_or_insert_with(MountStaging::default);
                let offset = position as usize - 1;
                if offset < MOUNT_WORDS {
                    staging.words[offset] = word;
                    staging.received = staging.received.max(offset + 1);
                }
                0
            }

            _ => 0,
        }
    }

    fn latched_lba(&self) -> u32 {
        self.arbitration_latch.flatten().map_or(0, |a| a.lba)
    }

    /// Completion hook for drive namespace frames.
    pub fn on_frame_complete<S: StorageBackend>(
        &mut self,
        frame: CompletedFrame,
        storage: &mut S,
        diag: &mut Diagnostics,
    ) {
        self.status_latch = None;
        self.arbitration_latch = None;
        let staging = self.mount_staging.take();

        match frame.opcode {
            Opcode::DriveRelease => self.release(),
            Opcode::DriveMount => match staging {
                Some(staging) if staging.received == MOUNT_WORDS => {
                    self.commit_mount(&staging.words, storage)
                }
                _ => {
                    warn!(
                        "Discarding partial mount command ({} of {MOUNT_WORDS} words)",
                        frame.payload_words
                    );
                    diag.discarded_commands = diag.discarded_commands.wrapping_add(1);
                }
            },
            _ => {}
        }
    }

    fn commit_mount<S: StorageBackend>(&mut self, words: &[u16; MOUNT_WORDS], storage: &mut S) {
        let Ok(drive) = u8::try_from(words[0]) else {
            warn!("Mount for invalid drive {}", words[0]);
            return;
        };
        let size = words[2..]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &w)| acc | (w as u64) << (i * 16));

        let result = if size == 0 {
            self.unmount(drive)
        } else {
            let backend_read_only = storage.mount_info(drive).is_some_and(|info| info.read_only);
            self.mount(drive, size, words[1] & 1 != 0 || backend_read_only)
        };
        if let Err(e) = result {
            warn!("Mount command for drive {drive} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryImage, MemoryStorage};

    fn arbiter(drives: u8) -> DriveArbiter {
        // 128 byte blocks, one byte per word
        DriveArbiter::new(&BridgeConfig::new(drives, 0, 1).unwrap())
    }

    fn mount_all(arbiter: &mut DriveArbiter) {
        for drive in 0..arbiter.drives().len() as u8 {
            arbiter.mount(drive, 1 << 20, false).unwrap();
        }
    }

    #[test]
    fn test_scan_downward_from_rrb() {
        let mut arbiter = arbiter(3);
        mount_all(&mut arbiter);
        arbiter.request(1, DriveDirection::Read, 10, 1).unwrap();
        arbiter.request(2, DriveDirection::Read, 20, 1).unwrap();
        assert_eq!(arbiter.rrb(), 0);

        let first = arbiter.arbitrate().unwrap();
        assert_eq!(first.status.index, 2);
        assert_eq!(first.lba, 20);
        assert_eq!(arbiter.rrb(), 1);

        let second = arbiter.arbitrate().unwrap();
        assert_eq!(second.status.index, 1);
        assert_eq!(second.lba, 10);
        assert_eq!(arbiter.rrb(), 0);
    }

    #[test]
    fn test_fairness_with_persistent_work() {
        for count in 1..=10u8 {
            let mut arbiter = arbiter(count);
            mount_all(&mut arbiter);
            for drive in 0..count {
                arbiter
                    .request(drive, DriveDirection::Read, drive as u32, 1)
                    .unwrap();
            }

            let mut seen = [false; 10];
            for _ in 0..count {
                let selected = arbiter.arbitrate().unwrap().status.index;
                seen[selected as usize] = true;
            }
            assert!(seen[..count as usize].iter().all(|&s| s), "count {count}");
        }
    }

    #[test]
    fn test_status_query_does_not_perturb_rrb() {
        let mut arbiter = arbiter(4);
        mount_all(&mut arbiter);
        arbiter.request(3, DriveDirection::Write, 7, 5).unwrap();
        let mut storage = MemoryStorage::new(4);
        let mut diag = Diagnostics::default();

        for _ in 0..5 {
            let reply = arbiter.on_word(Opcode::DriveStatus, 1, 3, &mut storage, &mut diag);
            assert_eq!(reply & FLAG_WRITE, FLAG_WRITE);
            assert_eq!(reply >> INDEX_SHIFT, 3);
            assert_eq!(
                arbiter.on_word(Opcode::DriveStatus, 2, 0, &mut storage, &mut diag),
                5
            );
        }
        assert_eq!(arbiter.rrb(), 0);
        assert_eq!(arbiter.selected(), None);
        assert_eq!(arbiter.status_query(9), None);
    }

    #[test]
    fn test_arbitrate_with_no_work() {
        let mut arbiter = arbiter(2);
        assert_eq!(arbiter.arbitrate(), None);
        assert_eq!(arbiter.rrb(), 0);
    }

    #[test]
    fn test_request_validation() {
        let mut arbiter = arbiter(2);
        assert_eq!(
            arbiter.request(0, DriveDirection::Read, 0, 1),
            Err(Error::NotMounted)
        );
        assert_eq!(
            arbiter.request(5, DriveDirection::Read, 0, 1),
            Err(Error::NoSuchDrive)
        );
        arbiter.mount(0, 4096, true).unwrap();
        assert_eq!(
            arbiter.request(0, DriveDirection::Write, 0, 1),
            Err(Error::ReadOnly)
        );
        assert_eq!(
            arbiter.request(0, DriveDirection::Read, 0, 0),
            Err(Error::InvalidArgument)
        );
        arbiter.request(0, DriveDirection::Read, 0, 200).unwrap();
        assert_eq!(arbiter.drive(0).unwrap().pending_block_count, MAX_BLOCK_COUNT);
        assert_eq!(
            arbiter.request(0, DriveDirection::Read, 1, 1),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_read_request_fills_storage() {
        let mut arbiter = arbiter(2);
        mount_all(&mut arbiter);
        let mut storage = MemoryStorage::new(2);
        storage.attach(1, MemoryImage::new(vec![0; 512], false));
        let mut diag = Diagnostics::default();

        arbiter.request(1, DriveDirection::Read, 2, 2).unwrap();
        assert_eq!(arbiter.arbitrate().unwrap().status.index, 1);
        assert!(arbiter.ack(1, &mut storage, &mut diag));
        assert_eq!(arbiter.drive(1).unwrap().phase, DrivePhase::Transferring);

        for i in 0..256usize {
            let byte = (i % 128) as u8 + if i < 128 { 0 } else { 0x80 };
            arbiter.sector_byte(SectorDirection::Write, byte, &mut storage, &mut diag);
        }

        let image = storage.image(1).unwrap().data();
        assert_eq!(image[256], 0);
        assert_eq!(image[256 + 127], 127);
        assert_eq!(image[384], 0x80);
        assert_eq!(image[511], 0xFF);

        let drive = arbiter.drive(1).unwrap();
        assert_eq!(drive.direction, DriveDirection::Idle);
        assert_eq!(drive.pending_lba, 4);
        assert_eq!(drive.phase, DrivePhase::Idle);

        // Overrun is clamped, not wrapped
        assert_eq!(arbiter.buffer_address(), 128);
        arbiter.sector_byte(SectorDirection::Write, 0xEE, &mut storage, &mut diag);
        assert_eq!(arbiter.buffer_address(), 128);
        assert_eq!(diag.clamped_sector_bytes, 1);
        assert_eq!(diag.backend_failures, 0);
    }

    #[test]
    fn test_write_request_drains_storage() {
        let mut arbiter = arbiter(1);
        mount_all(&mut arbiter);
        let mut storage = MemoryStorage::new(1);
        let image: Vec<u8> = (0..=255u8).collect();
        storage.attach(0, MemoryImage::new(image, false));
        let mut diag = Diagnostics::default();

        arbiter.request(0, DriveDirection::Write, 1, 1).unwrap();
        arbiter.arbitrate().unwrap();
        assert!(arbiter.ack(0, &mut storage, &mut diag));

        let first = arbiter.sector_byte(SectorDirection::Read, 0, &mut storage, &mut diag);
        assert_eq!(first, Some(128));
        for _ in 1..128 {
            arbiter.sector_byte(SectorDirection::Read, 0, &mut storage, &mut diag);
        }
        assert_eq!(arbiter.drive(0).unwrap().direction, DriveDirection::Idle);
        assert_eq!(
            arbiter.sector_byte(SectorDirection::Read, 0, &mut storage, &mut diag),
            None
        );
    }

    #[test]
    fn test_sector_traffic_requires_ack() {
        let mut arbiter = arbiter(2);
        mount_all(&mut arbiter);
        let mut storage = MemoryStorage::new(2);
        let mut diag = Diagnostics::default();

        arbiter.request(0, DriveDirection::Read, 0, 1).unwrap();
        arbiter.sector_byte(SectorDirection::Write, 1, &mut storage, &mut diag);
        assert_eq!(arbiter.buffer_address(), 0);
        assert_eq!(diag.rejected_sector_bytes, 1);

        // Not selected yet
        assert!(!arbiter.ack(0, &mut storage, &mut diag));
        arbiter.arbitrate().unwrap();
        assert!(arbiter.ack(0, &mut storage, &mut diag));

        // Wrong direction for a read request
        assert_eq!(
            arbiter.sector_byte(SectorDirection::Read, 0, &mut storage, &mut diag),
            None
        );
        assert_eq!(diag.rejected_sector_bytes, 2);
        assert_eq!(arbiter.buffer_address(), 0);
    }

    #[test]
    fn test_single_acknowledged_drive() {
        let mut arbiter = arbiter(2);
        mount_all(&mut arbiter);
        let mut storage = MemoryStorage::new(2);
        let mut diag = Diagnostics::default();

        arbiter.request(0, DriveDirection::Read, 0, 1).unwrap();
        arbiter.request(1, DriveDirection::Read, 0, 1).unwrap();
        assert_eq!(arbiter.arbitrate().unwrap().status.index, 0);
        assert!(arbiter.ack(0, &mut storage, &mut diag));
        assert_eq!(arbiter.arbitrate().unwrap().status.index, 1);
        assert!(!arbiter.ack(1, &mut storage, &mut diag));
        assert_eq!(arbiter.acknowledged(), Some(0));

        arbiter.release();
        assert_eq!(arbiter.acknowledged(), None);
        assert!(arbiter.ack(1, &mut storage, &mut diag));
        // Drive 0's unfinished read is still pending
        assert!(arbiter.drive(0).unwrap().has_pending());
        assert_eq!(diag.rejected_acks, 1);
    }

    #[test]
    fn test_backend_failure_zero_fills() {
        let mut arbiter = arbiter(1);
        mount_all(&mut arbiter);
        let mut storage = MemoryStorage::new(1);
        let mut diag = Diagnostics::default();

        arbiter.request(0, DriveDirection::Write, 0, 1).unwrap();
        arbiter.arbitrate().unwrap();
        assert!(arbiter.ack(0, &mut storage, &mut diag));
        assert_eq!(diag.backend_failures, 1);
        assert_eq!(
            arbiter.sector_byte(SectorDirection::Read, 0, &mut storage, &mut diag),
            Some(0)
        );
    }

    #[test]
    fn test_mount_command() {
        let mut arbiter = arbiter(2);
        let mut storage = MemoryStorage::new(2);
        storage.attach(1, MemoryImage::new(vec![0; 16], true));
        let mut diag = Diagnostics::default();

        let words = [1u16, 0, 0x0000, 0x0010, 0, 0];
        for (i, word) in words.iter().enumerate() {
            arbiter.on_word(Opcode::DriveMount, i as u32 + 1, *word, &mut storage, &mut diag);
        }
        arbiter.on_frame_complete(
            CompletedFrame {
                opcode: Opcode::DriveMount,
                payload_words: 6,
            },
            &mut storage,
            &mut diag,
        );
        let drive = arbiter.drive(1).unwrap();
        assert!(drive.mounted);
        assert_eq!(drive.size_bytes, 0x10_0000);
        // Backend forces read-only
        assert!(drive.read_only);

        // Truncated mount is discarded
        arbiter.on_word(Opcode::DriveMount, 1, 0, &mut storage, &mut diag);
        arbiter.on_frame_complete(
            CompletedFrame {
                opcode: Opcode::DriveMount,
                payload_words: 1,
            },
            &mut storage,
            &mut diag,
        );
        assert!(!arbiter.drive(0).unwrap().mounted);
        assert_eq!(diag.discarded_commands, 1);
    }

    #[test]
    fn test_unmount_cancels_work() {
        let mut arbiter = arbiter(1);
        mount_all(&mut arbiter);
        let mut storage = MemoryStorage::new(1);
        let mut diag = Diagnostics::default();

        arbiter.request(0, DriveDirection::Read, 0, 3).unwrap();
        arbiter.arbitrate().unwrap();
        assert!(arbiter.ack(0, &mut storage, &mut diag));
        arbiter.unmount(0).unwrap();

        assert_eq!(arbiter.acknowledged(), None);
        assert!(!arbiter.drive(0).unwrap().has_pending());
        assert_eq!(arbiter.arbitrate(), None);
    }

    #[test]
    fn test_status_word_layout() {
        let status = DriveStatus {
            index: 9,
            pending_block_count: 3,
            block_size_class: 2,
            direction: DriveDirection::Write,
            mounted: true,
            read_only: false,
            acknowledged: true,
        };
        assert_eq!(status.to_word(), 0x0900 | 0x80 | 0x20 | 0x04 | 0x02);
    }
}

//! Collaborator traits for the peer-local side of the bridge.
//!
//! The engine moves sectors and transfer bytes between the channel and the peer's own
//! memories through these traits.  It never needs to know what backs them.
//!
//! # Possible implementations
//!
//! - For simulation and tests: [`MemoryStorage`] and [`MemoryRegion`] in this module
//! - For a board: block RAM or SDRAM windows the emulated core reads and writes
//! - For a process pair: shared memory or memory-mapped image files
//!
//! # Failure handling
//!
//! The channel protocol has no NACK path, so backend failures are never reported to the
//! Host.  The engine logs them, zero-fills sectors that could not be read, drops bytes
//! that could not be stored, and counts each occurrence in
//! [`crate::engine::Diagnostics`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec;
use alloc::vec::Vec;

/// Mount information a storage backend holds for one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountInfo {
    /// Image size in bytes
    pub size: u64,
    /// Whether the image may be written
    pub read_only: bool,
}

/// Sector storage behind the virtual drives.
pub trait StorageBackend {
    /// The error type returned by sector operations.
    ///
    /// This allows implementations to use their own error types
    /// (e.g., `std::io::Error` for image files).
    type Error: core::fmt::Debug;

    /// Read one sector into `buf`.  `buf` is exactly one block long.
    ///
    /// # Arguments
    ///
    /// * `drive` - Drive index
    /// * `lba` - Sector number, in units of the configured block size
    /// * `buf` - Buffer to fill
    fn read_sector(&mut self, drive: u8, lba: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Write one sector from `data`.  `data` is exactly one block long.
    fn write_sector(&mut self, drive: u8, lba: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Mount information for `drive`, or `None` if the backend has no image for it.
    fn mount_info(&mut self, drive: u8) -> Option<MountInfo>;
}

/// Byte memory behind the bulk transfer controller.
pub trait TransferBackend {
    /// The error type returned by byte operations.
    type Error: core::fmt::Debug;

    /// Store a downloaded byte at `addr`.
    fn sink_byte(&mut self, addr: u32, byte: u8) -> Result<(), Self::Error>;

    /// Fetch the byte at `addr` for upload.
    fn source_byte(&mut self, addr: u32) -> Result<u8, Self::Error>;

    /// Whether the memory can accept or supply a data word right now.  A `false` return
    /// stalls the transfer controller for the current turn.
    fn ready(&mut self) -> bool;
}

/// Errors from the in-memory backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No image attached to the drive
    NoImage,
    /// Image is read-only
    ReadOnly,
    /// Access outside the image or region
    OutOfRange,
}

/// A disk image held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    data: Vec<u8>,
    read_only: bool,
}

impl MemoryImage {
    pub fn new(data: Vec<u8>, read_only: bool) -> Self {
        Self { data, read_only }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// [`StorageBackend`] keeping one optional [`MemoryImage`] per drive.
///
/// Reads past the end of an image zero-fill the remainder of the sector, as reading a
/// short final sector from a file would.  Writes past the end are truncated.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    images: Vec<Option<MemoryImage>>,
}

impl MemoryStorage {
    pub fn new(drive_count: u8) -> Self {
        Self {
            images: vec![None; drive_count as usize],
        }
    }

    /// Attach an image to `drive`, replacing any existing one.
    pub fn attach(&mut self, drive: u8, image: MemoryImage) {
        let idx = drive as usize;
        if idx >= self.images.len() {
            self.images.resize(idx + 1, None);
        }
        self.images[idx] = Some(image);
    }

    /// Detach and return the image on `drive`.
    pub fn detach(&mut self, drive: u8) -> Option<MemoryImage> {
        self.images.get_mut(drive as usize).and_then(Option::take)
    }

    pub fn image(&self, drive: u8) -> Option<&MemoryImage> {
        self.images.get(drive as usize).and_then(Option::as_ref)
    }

    fn image_mut(&mut self, drive: u8) -> Result<&mut MemoryImage, MemoryError> {
        self.images
            .get_mut(drive as usize)
            .and_then(Option::as_mut)
            .ok_or(MemoryError::NoImage)
    }
}

impl StorageBackend for MemoryStorage {
    type Error = MemoryError;

    fn read_sector(&mut self, drive: u8, lba: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let image = self.image_mut(drive)?;
        let start = lba as usize * buf.len();
        if start >= image.data.len() {
            return Err(MemoryError::OutOfRange);
        }

        let end = (start + buf.len()).min(image.data.len());
        let len = end - start;
        buf[..len].copy_from_slice(&image.data[start..end]);
        buf[len..].fill(0);
        Ok(())
    }

    fn write_sector(&mut self, drive: u8, lba: u32, data: &[u8]) -> Result<(), MemoryError> {
        let image = self.image_mut(drive)?;
        if image.read_only {
            return Err(MemoryError::ReadOnly);
        }

        let start = lba as usize * data.len();
        if start >= image.data.len() {
            return Err(MemoryError::OutOfRange);
        }

        let end = (start + data.len()).min(image.data.len());
        image.data[start..end].copy_from_slice(&data[..end - start]);
        Ok(())
    }

    fn mount_info(&mut self, drive: u8) -> Option<MountInfo> {
        self.image(drive).map(|image| MountInfo {
            size: image.data.len() as u64,
            read_only: image.read_only,
        })
    }
}

/// [`TransferBackend`] over a flat byte region starting at `base`.
///
/// [`MemoryRegion::set_ready()`] simulates a slow target memory for backpressure.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    base: u32,
    data: Vec<u8>,
    ready: bool,
}

impl MemoryRegion {
    /// Create a zeroed, ready region of `size` bytes at `base`.
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
            ready: true,
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn offset(&self, addr: u32) -> Result<usize, MemoryError> {
        let offset = addr.checked_sub(self.base).ok_or(MemoryError::OutOfRange)? as usize;
        if offset < self.data.len() {
            Ok(offset)
        } else {
            Err(MemoryError::OutOfRange)
        }
    }
}

impl TransferBackend for MemoryRegion {
    type Error = MemoryError;

    fn sink_byte(&mut self, addr: u32, byte: u8) -> Result<(), MemoryError> {
        let offset = self.offset(addr)?;
        self.data[offset] = byte;
        Ok(())
    }

    fn source_byte(&mut self, addr: u32) -> Result<u8, MemoryError> {
        let offset = self.offset(addr)?;
        Ok(self.data[offset])
    }

    fn ready(&mut self) -> bool {
        self.ready
    }
}

//! Engine configuration, agreed between Host and peer before the first frame.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Maximum number of virtual drives
pub const MAX_DRIVES: u8 = 10;

/// Bytes carried by each data word on the sector and transfer paths.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    /// Low byte of each word only
    Byte,
    /// Both bytes of each word, little endian
    #[default]
    Word,
}

impl WordWidth {
    /// Address advance per data word
    pub const fn stride(self) -> u32 {
        match self {
            WordWidth::Byte => 1,
            WordWidth::Word => 2,
        }
    }
}

impl TryFrom<u8> for WordWidth {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WordWidth::Byte),
            2 => Ok(WordWidth::Word),
            _ => Err(Error::InvalidConfig),
        }
    }
}

/// Sector size class.  Block size is `128 << class` bytes, so classes 0-7 cover
/// 128 bytes to 16KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeClass(u8);

impl BlockSizeClass {
    /// Largest supported class (16KB blocks)
    pub const MAX: u8 = 7;

    pub fn new(class: u8) -> Result<Self> {
        if class > Self::MAX {
            Err(Error::InvalidConfig)
        } else {
            Ok(Self(class))
        }
    }

    /// Raw class value, as reported in drive status words
    pub const fn class(self) -> u8 {
        self.0
    }

    /// Block size in bytes
    pub const fn block_size(self) -> usize {
        128 << self.0
    }
}

impl Default for BlockSizeClass {
    /// 512 byte sectors
    fn default() -> Self {
        Self(2)
    }
}

/// Bridge configuration.
///
/// Use [`BridgeConfig::new()`] to validate values received from elsewhere, or
/// [`BridgeConfig::default()`] for a single 512 byte sector drive with 16-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    drive_count: u8,
    block_size_class: BlockSizeClass,
    word_width: WordWidth,
}

impl BridgeConfig {
    /// Create a validated configuration.
    ///
    /// Arguments:
    /// - `drive_count` - Number of virtual drive slots, 1 to [`MAX_DRIVES`]
    /// - `block_size_class` - Sector size class, 0 to [`BlockSizeClass::MAX`]
    /// - `word_width` - Bytes per data word, 1 or 2
    pub fn new(drive_count: u8, block_size_class: u8, word_width: u8) -> Result<Self> {
        if drive_count == 0 || drive_count > MAX_DRIVES {
            return Err(Error::InvalidConfig);
        }

        Ok(Self {
            drive_count,
            block_size_class: BlockSizeClass::new(block_size_class)?,
            word_width: WordWidth::try_from(word_width)?,
        })
    }

    pub fn drive_count(&self) -> u8 {
        self.drive_count
    }

    pub fn block_size_class(&self) -> BlockSizeClass {
        self.block_size_class
    }

    pub fn block_size(&self) -> usize {
        self.block_size_class.block_size()
    }

    pub fn word_width(&self) -> WordWidth {
        self.word_width
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            drive_count: 1,
            block_size_class: BlockSizeClass::default(),
            word_width: WordWidth::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = BridgeConfig::new(3, 0, 1).unwrap();
        assert_eq!(config.drive_count(), 3);
        assert_eq!(config.block_size(), 128);
        assert_eq!(config.word_width(), WordWidth::Byte);
        assert_eq!(config.word_width().stride(), 1);
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.drive_count(), 1);
        assert_eq!(config.block_size(), 512);
        assert_eq!(config.word_width().stride(), 2);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert_eq!(BridgeConfig::new(0, 2, 2), Err(Error::InvalidConfig));
        assert_eq!(BridgeConfig::new(11, 2, 2), Err(Error::InvalidConfig));
        assert_eq!(BridgeConfig::new(1, 8, 2), Err(Error::InvalidConfig));
        assert_eq!(BridgeConfig::new(1, 2, 4), Err(Error::InvalidConfig));
        assert!(BridgeConfig::new(10, 7, 2).is_ok());
        assert_eq!(BlockSizeClass::new(7).unwrap().block_size(), 16384);
    }
}

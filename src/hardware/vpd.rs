//! VPD (vital product data) image.
//!
//! The identity image is a fixed 256-byte block. The module barcode lives in
//! the first 40 bytes (ASCII, zero padded) and the last byte is a
//! two's-complement checksum, so a valid image sums to zero modulo 256.

use std::path::Path;

use crate::error::{AppResult, StationError};

/// Size of the identity image in bytes.
pub const VPD_SIZE: usize = 256;

/// Serial number (barcode) field.
pub const SERIAL_RANGE: std::ops::Range<usize> = 0x00..0x28;

/// Offset in the DUT EEPROM where the measured capacitance is stored.
pub const CAPACITANCE_OFFSET: u16 = 0x100;

/// 256-byte identity image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpdImage {
    bytes: Vec<u8>,
}

impl VpdImage {
    /// Blank image with a valid checksum.
    pub fn blank() -> Self {
        let mut image = Self {
            bytes: vec![0; VPD_SIZE],
        };
        image.seal();
        image
    }

    /// Wrap raw bytes read from a DUT or a file.
    pub fn from_bytes(bytes: Vec<u8>) -> AppResult<Self> {
        if bytes.len() != VPD_SIZE {
            return Err(StationError::Configuration(format!(
                "VPD image must be {} bytes, got {}",
                VPD_SIZE,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Load an image template from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Write the serial number into the image and recompute the checksum.
    pub fn stamp_serial(&mut self, serial: &str) {
        let field = &mut self.bytes[SERIAL_RANGE];
        field.fill(0);
        for (dst, src) in field.iter_mut().zip(serial.bytes()) {
            *dst = src;
        }
        self.seal();
    }

    /// Serial number stored in the image.
    pub fn serial(&self) -> String {
        self.bytes[SERIAL_RANGE]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect()
    }

    fn seal(&mut self) {
        let last = VPD_SIZE - 1;
        self.bytes[last] = checksum(&self.bytes[..last]);
    }

    /// Checksum and structure check.
    pub fn is_valid(&self) -> bool {
        self.bytes.len() == VPD_SIZE
            && self.bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
            && self.bytes[SERIAL_RANGE].iter().all(|b| *b == 0 || b.is_ascii_graphic())
    }
}

/// Two's-complement checksum over `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_image_is_valid() {
        let mut image = VpdImage::blank();
        image.stamp_serial("AGIGA9822-004BCA02144800000002-06");
        assert!(image.is_valid());
        assert_eq!(image.serial(), "AGIGA9822-004BCA02144800000002-06");
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut image = VpdImage::blank();
        image.stamp_serial("00000002");
        let mut bytes = image.as_bytes().to_vec();
        bytes[0x40] ^= 0x01;
        assert!(!VpdImage::from_bytes(bytes).unwrap().is_valid());
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(VpdImage::from_bytes(vec![0; 128]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpd.bin");
        std::fs::write(&path, VpdImage::blank().as_bytes()).unwrap();
        assert!(VpdImage::load(&path).unwrap().is_valid());
    }
}

//! Progressive JPEG support: a streaming marker parser that counts complete
//! scans, and the policy deciding which scans are worth a partial decode.

use crate::config::DecodeConfig;
use crate::image::QualityInfo;

/// Decides which progressive scans to decode.
pub trait ProgressiveDecodePolicy: Send + Sync {
    /// Smallest scan number worth decoding after `scan_number`.
    fn next_scan_to_decode(&self, scan_number: u32) -> u32;

    /// Quality reported for an image decoded up to `scan_number`.
    fn quality_info(&self, scan_number: u32) -> QualityInfo;
}

/// Decode an explicit list of scans.
#[derive(Debug, Clone)]
pub struct ProgressiveJpegConfig {
    scans_to_decode: Vec<u32>,
    good_enough_scan: u32,
}

impl ProgressiveJpegConfig {
    pub fn new(mut scans_to_decode: Vec<u32>, good_enough_scan: u32) -> Self {
        scans_to_decode.sort_unstable();
        scans_to_decode.dedup();
        Self {
            scans_to_decode,
            good_enough_scan,
        }
    }

    pub fn from_config(config: &DecodeConfig) -> Self {
        Self::new(config.scans_to_decode.clone(), config.good_enough_scan)
    }
}

impl ProgressiveDecodePolicy for ProgressiveJpegConfig {
    fn next_scan_to_decode(&self, scan_number: u32) -> u32 {
        self.scans_to_decode
            .iter()
            .copied()
            .find(|&scan| scan > scan_number)
            .unwrap_or(u32::MAX)
    }

    fn quality_info(&self, scan_number: u32) -> QualityInfo {
        QualityInfo {
            scan_number,
            is_good_enough: scan_number >= self.good_enough_scan,
            is_full_quality: false,
        }
    }
}

const MARKER_FIRST_BYTE: u8 = 0xFF;
const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;
const MARKER_TEM: u8 = 0x01;
const MARKER_ESCAPE: u8 = 0x00;

fn is_restart_marker(marker: u8) -> bool {
    (0xD0..=0xD7).contains(&marker)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FirstByte,
    SecondByte,
    MarkerFirstByteOrEntropy,
    MarkerSecondByte,
    SizeFirstByte,
    SizeSecondByte { high: u8 },
    Skip { remaining: usize },
    NotAJpeg,
}

/// Incremental JPEG marker parser.
///
/// Feed it the whole buffer received so far; it resumes where it stopped.
/// A scan is complete once the next SOS marker or the EOI marker is seen.
#[derive(Debug, Clone)]
pub struct ProgressiveJpegParser {
    state: State,
    bytes_parsed: usize,
    next_full_scan_number: u32,
    best_scan_number: u32,
    best_scan_end_offset: usize,
    end_marker_read: bool,
}

impl Default for ProgressiveJpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressiveJpegParser {
    pub fn new() -> Self {
        Self {
            state: State::FirstByte,
            bytes_parsed: 0,
            next_full_scan_number: 0,
            best_scan_number: 0,
            best_scan_end_offset: 0,
            end_marker_read: false,
        }
    }

    /// Number of the last complete scan.
    pub fn best_scan_number(&self) -> u32 {
        self.best_scan_number
    }

    /// Byte offset at which the last complete scan ends.
    pub fn best_scan_end_offset(&self) -> usize {
        self.best_scan_end_offset
    }

    pub fn is_end_marker_read(&self) -> bool {
        self.end_marker_read
    }

    pub fn is_jpeg(&self) -> bool {
        self.state != State::NotAJpeg
    }

    /// Parse bytes past the previous call. Returns whether a new complete
    /// scan was found.
    pub fn parse_more_data(&mut self, data: &[u8]) -> bool {
        if !self.is_jpeg() || data.len() <= self.bytes_parsed {
            return false;
        }
        let before = self.best_scan_number;
        while self.bytes_parsed < data.len() && self.is_jpeg() {
            let byte = data[self.bytes_parsed];
            self.step(byte);
            self.bytes_parsed += 1;
        }
        self.best_scan_number != before
    }

    fn step(&mut self, byte: u8) {
        let state = self.state;
        self.state = match state {
            State::FirstByte if byte == MARKER_FIRST_BYTE => State::SecondByte,
            State::SecondByte if byte == MARKER_SOI => State::MarkerFirstByteOrEntropy,
            State::FirstByte | State::SecondByte => State::NotAJpeg,
            State::MarkerFirstByteOrEntropy if byte == MARKER_FIRST_BYTE => State::MarkerSecondByte,
            State::MarkerFirstByteOrEntropy => State::MarkerFirstByteOrEntropy,
            State::MarkerSecondByte => match byte {
                MARKER_FIRST_BYTE => State::MarkerSecondByte,
                MARKER_ESCAPE | MARKER_TEM => State::MarkerFirstByteOrEntropy,
                m if is_restart_marker(m) => State::MarkerFirstByteOrEntropy,
                MARKER_EOI => {
                    self.end_marker_read = true;
                    self.scan_or_image_end_found(self.bytes_parsed - 1);
                    State::MarkerFirstByteOrEntropy
                }
                MARKER_SOS => {
                    self.scan_or_image_end_found(self.bytes_parsed - 1);
                    State::SizeFirstByte
                }
                _ => State::SizeFirstByte,
            },
            State::SizeFirstByte => State::SizeSecondByte { high: byte },
            State::SizeSecondByte { high } => {
                let size = (usize::from(high) << 8) | usize::from(byte);
                match size.saturating_sub(2) {
                    0 => State::MarkerFirstByteOrEntropy,
                    remaining => State::Skip { remaining },
                }
            }
            State::Skip { remaining: 1 } => State::MarkerFirstByteOrEntropy,
            State::Skip { remaining } => State::Skip {
                remaining: remaining - 1,
            },
            State::NotAJpeg => State::NotAJpeg,
        };
    }

    /// `offset` is the position of the marker's 0xFF byte.
    fn scan_or_image_end_found(&mut self, offset: usize) {
        if self.next_full_scan_number > 0 {
            self.best_scan_end_offset = offset;
        }
        self.best_scan_number = self.next_full_scan_number;
        self.next_full_scan_number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jpeg_bytes, synthetic_progressive_jpeg};

    #[test]
    fn test_next_scan_follows_list() {
        let config = ProgressiveJpegConfig::new(vec![5, 1, 3, 10], 5);
        assert_eq!(config.next_scan_to_decode(0), 1);
        assert_eq!(config.next_scan_to_decode(1), 3);
        assert_eq!(config.next_scan_to_decode(4), 5);
        assert_eq!(config.next_scan_to_decode(10), u32::MAX);
        assert!(config.quality_info(5).is_good_enough);
        assert!(!config.quality_info(3).is_good_enough);
        assert!(!config.quality_info(10).is_full_quality);
    }

    #[test]
    fn test_counts_scans_incrementally() {
        let (bytes, scan_ends) = synthetic_progressive_jpeg(3);
        let mut parser = ProgressiveJpegParser::new();

        // Header and first SOS only: no complete scan yet.
        assert!(!parser.parse_more_data(&bytes[..scan_ends[0] - 1]));
        assert_eq!(parser.best_scan_number(), 0);

        assert!(parser.parse_more_data(&bytes[..scan_ends[0] + 2]));
        assert_eq!(parser.best_scan_number(), 1);
        assert_eq!(parser.best_scan_end_offset(), scan_ends[0]);

        assert!(parser.parse_more_data(&bytes));
        assert_eq!(parser.best_scan_number(), 3);
        assert_eq!(parser.best_scan_end_offset(), scan_ends[2]);
        assert!(parser.is_end_marker_read());
    }

    #[test]
    fn test_baseline_jpeg_has_one_scan() {
        let bytes = jpeg_bytes(8, 8);
        let mut parser = ProgressiveJpegParser::new();
        parser.parse_more_data(&bytes);
        assert_eq!(parser.best_scan_number(), 1);
        assert!(parser.is_end_marker_read());
    }

    #[test]
    fn test_non_jpeg_is_rejected() {
        let mut parser = ProgressiveJpegParser::new();
        assert!(!parser.parse_more_data(b"\x89PNG\r\n\x1a\n"));
        assert!(!parser.is_jpeg());
    }
}

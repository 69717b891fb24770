//! Masked byte patterns for spotting function prologues in executable sections.
//!
//! Patterns are written as space separated items: `0x` hex groups where `.`
//! stands for a wildcard nibble, 8-character binary groups where `.` stands for
//! a wildcard bit, and a single `*` marking where the function starts.

use crate::evidence::PatternMatch;
use crate::image::Image;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("hex group '{0}' must have an even number of digits")]
    OddHexGroup(String),
    #[error("binary group '{0}' must have exactly 8 bits")]
    BadBinaryGroup(String),
    #[error("invalid digit in '{0}'")]
    InvalidDigit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    name: String,
    bytes: Vec<u8>,
    masks: Vec<u8>,
    mark: usize,
}

pub const DEFAULT_X64_PATTERNS: &[&str] = &[
    // int3 padding, push of a non-volatile register, sub rsp
    "0xcc * 0100000. 01010... 0x4883ec",
    // ret; int3, push, push rbp
    "0xc3cc * 0100000. 01010... 0x55",
    // tail jmp, push, push rbp
    "0xe9........ * 0100000. 01010... 0x55",
];

impl BytePattern {
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let mut bytes = Vec::new();
        let mut masks = Vec::new();
        let mut mark = 0;

        for item in text.split_whitespace() {
            if let Some(hex) = item.strip_prefix("0x") {
                parse_hex_group(item, hex, &mut bytes, &mut masks)?;
            } else if item == "*" {
                mark = bytes.len();
            } else {
                parse_binary_group(item, &mut bytes, &mut masks)?;
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self {
            name: text.to_string(),
            bytes,
            masks,
            mark,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the function start within a match.
    pub fn mark(&self) -> usize {
        self.mark
    }

    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(&self.masks)
                .zip(window)
                .all(|((&b, &m), &w)| w & m == b)
    }

    /// Offsets into `haystack` at which the marked function start of a match lies.
    pub fn find_all<'a>(&'a self, haystack: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        haystack
            .windows(self.bytes.len())
            .enumerate()
            .filter(|(_, window)| self.matches(window))
            .map(|(offset, _)| offset + self.mark)
    }
}

fn parse_hex_group(
    item: &str,
    hex: &str,
    bytes: &mut Vec<u8>,
    masks: &mut Vec<u8>,
) -> Result<(), PatternError> {
    if hex.len() % 2 != 0 {
        return Err(PatternError::OddHexGroup(item.to_string()));
    }
    let digits = hex.as_bytes();
    for pair in digits.chunks(2) {
        let mut value = 0u8;
        let mut mask = 0u8;
        for (shift, &digit) in [4u8, 0].iter().zip(pair) {
            if digit == b'.' {
                continue;
            }
            let nibble = (digit as char)
                .to_digit(16)
                .ok_or_else(|| PatternError::InvalidDigit(item.to_string()))?
                as u8;
            value |= nibble << shift;
            mask |= 0xf << shift;
        }
        bytes.push(value);
        masks.push(mask);
    }
    Ok(())
}

fn parse_binary_group(
    item: &str,
    bytes: &mut Vec<u8>,
    masks: &mut Vec<u8>,
) -> Result<(), PatternError> {
    if item.len() != 8 {
        return Err(PatternError::BadBinaryGroup(item.to_string()));
    }
    let mut value = 0u8;
    let mut mask = 0u8;
    for (i, digit) in item.bytes().enumerate() {
        let bit = 0x80 >> i;
        match digit {
            b'1' => {
                value |= bit;
                mask |= bit;
            }
            b'0' => mask |= bit,
            b'.' => {}
            _ => return Err(PatternError::InvalidDigit(item.to_string())),
        }
    }
    bytes.push(value);
    masks.push(mask);
    Ok(())
}

pub fn default_patterns() -> Vec<BytePattern> {
    DEFAULT_X64_PATTERNS
        .iter()
        .filter_map(|text| BytePattern::parse(text).ok())
        .collect()
}

/// Scan every executable section for the given patterns.
///
/// Results are sorted by address; an address matched by several patterns is
/// reported once, for the first pattern that hit it.
pub fn scan_image(image: &Image, patterns: &[BytePattern]) -> Vec<PatternMatch> {
    let mut matches: Vec<PatternMatch> = image
        .sections()
        .par_iter()
        .filter(|section| section.is_executable())
        .flat_map_iter(|section| {
            let start = image.base() + section.virtual_address as u64;
            let bytes = image
                .read(start, section.virtual_size as usize)
                .unwrap_or_else(|| image.bytes_from(start));
            patterns
                .iter()
                .flat_map(move |pattern| {
                    pattern.find_all(bytes).map(move |offset| PatternMatch {
                        address: start + offset as u64,
                        pattern: pattern.name().to_string(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect();

    matches.sort_by_key(|m| m.address);
    matches.dedup_by_key(|m| m.address);
    matches
}

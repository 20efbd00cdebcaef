//! Bytecode image loader
//!
//! A bytecode file is a single binary blob: four little-endian `i32` prefix
//! fields, a table of public symbols, a NUL-terminated string table, and the
//! code section running to end of file. The loader reads the whole file into
//! one owned buffer and publishes named sub-ranges; nothing aliases the raw
//! header struct.
//!
//! The image is immutable after load, with one exception: the verifier
//! back-patches the stack reservation into each function prologue.

use std::ops::Range;
use std::path::Path;
use thiserror::Error;

/// Size in bytes of the fixed file prefix: string table size, global area
/// size and public symbol count, each a little-endian `i32`.
const PREFIX_LEN: usize = 12;

/// Errors detected while loading an image. All are fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("file too short: {0} bytes")]
    Truncated(usize),
    #[error("unreasonable number of public symbols (an error?): {0}")]
    NegativePublicCount(i32),
    #[error("unreasonable size of stringtab (an error?): {0}")]
    NegativeStringTabSize(i32),
    #[error("unreasonable size of global area (an error?): {0}")]
    NegativeGlobalArea(i32),
    #[error("public symbol at index {index} points outside code area (offset {offset})")]
    PublicOutOfCode { index: usize, offset: i32 },
    #[error("public symbol at index {index} has name offset {offset} outside string table")]
    PublicNameOutOfTable { index: usize, offset: i32 },
    #[error("empty code section")]
    EmptyCode,
    #[error("i/o error: {0}")]
    Io(String),
}

/// An in-memory bytecode image with derived section boundaries.
#[derive(Debug, PartialEq)]
pub struct Image {
    bytes: Vec<u8>,
    publics: Range<usize>,
    stringtab: Range<usize>,
    code: Range<usize>,
    /// Number of entries in the public-symbol table.
    pub public_count: usize,
    /// Size of the globals region requested by the file, in words.
    pub global_area_size: i32,
    /// Offset (within the string table) of the last NUL byte, if any.
    /// String reads beyond it would run off the table.
    pub last_string_terminator: Option<usize>,
}

impl Image {
    /// Read a bytecode file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let bytes = std::fs::read(path).map_err(|e| ImageError::Io(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Parse an in-memory bytecode blob.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.len() < PREFIX_LEN {
            return Err(ImageError::Truncated(bytes.len()));
        }
        let stringtab_size = read_i32(&bytes, 0);
        let global_area_size = read_i32(&bytes, 4);
        let public_count = read_i32(&bytes, 8);

        if public_count < 0 {
            return Err(ImageError::NegativePublicCount(public_count));
        }
        if stringtab_size < 0 {
            return Err(ImageError::NegativeStringTabSize(stringtab_size));
        }
        if global_area_size < 0 {
            return Err(ImageError::NegativeGlobalArea(global_area_size));
        }

        let publics_start = PREFIX_LEN;
        let publics_end = publics_start + public_count as usize * 8;
        let stringtab_end = publics_end + stringtab_size as usize;
        if stringtab_end > bytes.len() {
            return Err(ImageError::Truncated(bytes.len()));
        }
        let code = stringtab_end..bytes.len();
        if code.is_empty() {
            return Err(ImageError::EmptyCode);
        }

        let stringtab = publics_end..stringtab_end;
        let last_string_terminator = bytes[stringtab.clone()]
            .iter()
            .rposition(|&b| b == 0);

        let image = Self {
            bytes,
            publics: publics_start..publics_end,
            stringtab,
            code,
            public_count: public_count as usize,
            global_area_size,
            last_string_terminator,
        };

        for i in 0..image.public_count {
            let (name_offset, code_offset) = image.public_entry(i);
            if code_offset < 0 || code_offset as usize >= image.code().len() {
                return Err(ImageError::PublicOutOfCode {
                    index: i,
                    offset: code_offset,
                });
            }
            if name_offset < 0
                || image
                    .last_string_terminator
                    .map_or(true, |z| name_offset as usize > z)
            {
                return Err(ImageError::PublicNameOutOfTable {
                    index: i,
                    offset: name_offset,
                });
            }
        }

        Ok(image)
    }

    /// The code section.
    pub fn code(&self) -> &[u8] {
        &self.bytes[self.code.clone()]
    }

    /// The raw string table.
    pub fn string_table(&self) -> &[u8] {
        &self.bytes[self.stringtab.clone()]
    }

    /// The `(name_offset, code_offset)` pair of public symbol `i`.
    ///
    /// Panics if `i` is out of range; the count was validated at load.
    pub fn public_entry(&self, i: usize) -> (i32, i32) {
        assert!(i < self.public_count, "public index {i} out of range");
        let base = self.publics.start + i * 8;
        (read_i32(&self.bytes, base), read_i32(&self.bytes, base + 4))
    }

    /// The name of public symbol `i` (bytes up to its NUL terminator).
    pub fn public_name(&self, i: usize) -> &[u8] {
        let (name_offset, _) = self.public_entry(i);
        let tab = self.string_table();
        let start = name_offset as usize;
        let end = tab[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(tab.len(), |n| start + n);
        &tab[start..end]
    }

    /// Code offset of the entry point: the first public symbol.
    ///
    /// `None` when the image exports no symbols; execution then halts
    /// immediately.
    pub fn entry_offset(&self) -> Option<usize> {
        (self.public_count > 0).then(|| self.public_entry(0).1 as usize)
    }

    /// Write `reserve` into the high 16 bits of the first operand of the
    /// prologue at `entry`. Verifier use only.
    pub(crate) fn patch_begin_reservation(&mut self, entry: usize, reserve: u16) {
        let at = self.code.start + entry + 1;
        let old = read_i32(&self.bytes, at);
        let new = old + ((reserve as i32) << 16);
        self.bytes[at..at + 4].copy_from_slice(&new.to_le_bytes());
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(bytes[at..at + 4].try_into().expect("4 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a minimal image: one public `main` at code offset 0.
    fn blob(code: &[u8]) -> Vec<u8> {
        let strings = b"main\0";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(strings.len() as i32).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes()); // global area
        bytes.extend_from_slice(&1i32.to_le_bytes()); // public count
        bytes.extend_from_slice(&0i32.to_le_bytes()); // name offset
        bytes.extend_from_slice(&0i32.to_le_bytes()); // code offset
        bytes.extend_from_slice(strings);
        bytes.extend_from_slice(code);
        bytes
    }

    #[test]
    fn test_sections_are_split() {
        let image = Image::from_bytes(blob(&[0xF0])).unwrap();
        assert_eq!(image.public_count, 1);
        assert_eq!(image.string_table(), b"main\0");
        assert_eq!(image.code(), &[0xF0]);
        assert_eq!(image.public_name(0), b"main");
        assert_eq!(image.entry_offset(), Some(0));
    }

    #[test]
    fn test_last_terminator_is_found() {
        let image = Image::from_bytes(blob(&[0xF0])).unwrap();
        assert_eq!(image.last_string_terminator, Some(4));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        assert_eq!(
            Image::from_bytes(vec![1, 2, 3]),
            Err(ImageError::Truncated(3))
        );
    }

    #[test]
    fn test_negative_prefix_fields_are_rejected() {
        let mut bytes = blob(&[0xF0]);
        bytes[8..12].copy_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(
            Image::from_bytes(bytes),
            Err(ImageError::NegativePublicCount(-1))
        );
    }

    #[test]
    fn test_empty_code_is_rejected() {
        // Zero publics so the public check cannot fire first.
        let strings = b"\0";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(strings.len() as i32).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(strings);
        assert_eq!(Image::from_bytes(bytes), Err(ImageError::EmptyCode));
    }

    #[test]
    fn test_public_outside_code_is_rejected() {
        let mut bytes = blob(&[0xF0]);
        bytes[16..20].copy_from_slice(&99i32.to_le_bytes());
        assert!(matches!(
            Image::from_bytes(bytes),
            Err(ImageError::PublicOutOfCode { index: 0, offset: 99 })
        ));
    }

    #[test]
    fn test_patch_begin_reservation() {
        // BEGIN 2 0 at offset 0, then STOP.
        let mut code = vec![0x52];
        code.extend_from_slice(&2i32.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.push(0xF0);
        let mut image = Image::from_bytes(blob(&code)).unwrap();
        image.patch_begin_reservation(0, 3);
        let patched = i32::from_le_bytes(image.code()[1..5].try_into().unwrap());
        assert_eq!(patched, 2 | (3 << 16));
    }
}

//! Intel HEX decoding into a sparse memory image

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

/// Data record
const RECORD_DATA: u8 = 0x00;
/// End-of-file record
const RECORD_EOF: u8 = 0x01;
/// Extended segment address record (base = value << 4)
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
/// Extended linear address record (base = value << 16)
const RECORD_EXTENDED_LINEAR: u8 = 0x04;

/// Number of data bytes per record emitted by `encode`
const ENCODE_RECORD_LEN: usize = 16;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum HexError {
    #[error("line {}: record contains a non-hex character", _0)]
    InvalidDigit(usize),
    #[error("line {}: record is {} bytes, expected {}", line, actual, expected)]
    LengthMismatch {
        line: usize,
        expected: usize,
        actual: usize,
    },
    #[error(
        "line {}: checksum mismatch, expected {:#04x} but got {:#04x}",
        line,
        expected,
        actual
    )]
    Checksum { line: usize, expected: u8, actual: u8 },
    #[error("line {}: record extends past the 32-bit address space", _0)]
    AddressOverflow(usize),
}

/// A sparse mapping of addresses to byte values
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MemoryImage {
    bytes: BTreeMap<u32, u8>,
}

/// A fixed-size page of a memory image, padded where the image has no data
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Page {
    /// Byte address of the first byte in the page
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemoryImage {
    pub fn new() -> MemoryImage {
        MemoryImage::default()
    }

    pub fn insert(&mut self, address: u32, value: u8) {
        self.bytes.insert(address, value);
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.bytes.get(&address).copied()
    }

    /// Returns the number of populated addresses
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the lowest populated address, or 0 for an empty image
    pub fn start_address(&self) -> u32 {
        self.bytes.keys().next().copied().unwrap_or(0)
    }

    /// Returns the address one past the highest populated address, or 0 for an empty image
    pub fn end_address(&self) -> u64 {
        self.bytes
            .keys()
            .next_back()
            .map(|&address| u64::from(address) + 1)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.bytes.iter().map(|(&address, &value)| (address, value))
    }

    /// Number of bytes between the lowest and one past the highest populated address
    pub fn span(&self) -> u64 {
        self.end_address() - u64::from(self.start_address())
    }

    /// Flattens the image into a contiguous buffer that starts at `start_address`, filling holes
    /// with `fill`
    pub fn to_flat(&self, fill: u8) -> Vec<u8> {
        let start = self.start_address();
        let mut flat = vec![fill; self.span() as usize];

        for (address, value) in self.iter() {
            flat[(address - start) as usize] = value;
        }

        flat
    }

    /// Slices the image into `page_size` pages starting at address 0
    ///
    /// Pages without data are included, filled with `fill`. The last page is right-padded with
    /// `fill` up to exactly `page_size` bytes.
    pub fn pages(&self, page_size: usize, fill: u8) -> Vec<Page> {
        let end = self.end_address();
        let count = ((end + page_size as u64 - 1) / page_size as u64) as usize;

        (0..count)
            .map(|index| {
                let address = (index * page_size) as u32;
                let page_end = u64::from(address) + page_size as u64;
                let mut data = vec![fill; page_size];

                let populated = self.bytes.range(address..);
                for (&at, &value) in populated.take_while(|&(&at, _)| u64::from(at) < page_end) {
                    data[(at - address) as usize] = value;
                }

                Page { address, data }
            })
            .collect()
    }
}

/// Decodes the bytes of a single record, i.e. everything after the leading `:`
fn decode_record(line: usize, record: &str) -> Result<Vec<u8>, HexError> {
    if record.len() % 2 != 0 || !record.is_ascii() {
        return Err(HexError::InvalidDigit(line));
    }

    let bytes = (0..record.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&record[i..i + 2], 16).map_err(|_| HexError::InvalidDigit(line))
        })
        .collect::<Result<Vec<u8>, HexError>>()?;

    // byte count, 2 address bytes, record type and checksum
    let expected = bytes.first().map(|&count| usize::from(count) + 5).unwrap_or(5);

    if bytes.len() != expected {
        return Err(HexError::LengthMismatch {
            line,
            expected,
            actual: bytes.len(),
        });
    }

    let (payload, checksum) = bytes.split_at(bytes.len() - 1);
    let computed = checksum_of(payload);

    if computed != checksum[0] {
        return Err(HexError::Checksum {
            line,
            expected: computed,
            actual: checksum[0],
        });
    }

    Ok(bytes)
}

/// Two's complement of the sum of `bytes`
fn checksum_of(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        .wrapping_neg()
}

/// Decodes Intel HEX `text` into a sparse memory image
///
/// Lines not starting with `:` are skipped. Every record's checksum is verified. Only data records
/// contribute bytes; extended segment and extended linear address records move the base address of
/// the data records that follow, and an end-of-file record stops decoding.
pub fn decode(text: &str) -> Result<MemoryImage, HexError> {
    let mut image = MemoryImage::new();
    let mut base: u32 = 0;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim_end();

        let record = match line.strip_prefix(':') {
            Some(record) => record,
            None => continue,
        };

        let bytes = decode_record(line_no, record)?;
        let offset = u32::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let data = &bytes[4..bytes.len() - 1];

        match bytes[3] {
            RECORD_DATA if !data.is_empty() => {
                let start = base
                    .checked_add(offset)
                    .filter(|start| start.checked_add(data.len() as u32 - 1).is_some())
                    .ok_or(HexError::AddressOverflow(line_no))?;

                for (i, &value) in data.iter().enumerate() {
                    image.insert(start + i as u32, value);
                }
            }
            RECORD_EOF => break,
            RECORD_EXTENDED_SEGMENT if data.len() == 2 => {
                base = u32::from(u16::from_be_bytes([data[0], data[1]])) << 4;
            }
            RECORD_EXTENDED_LINEAR if data.len() == 2 => {
                base = u32::from(u16::from_be_bytes([data[0], data[1]])) << 16;
            }
            _ => {}
        }
    }

    Ok(image)
}

fn push_record(out: &mut String, address: u16, record_type: u8, data: &[u8]) {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(record_type);
    bytes.extend_from_slice(data);
    bytes.push(checksum_of(&bytes));

    out.push(':');
    for byte in bytes {
        let _ = write!(out, "{:02X}", byte);
    }
    out.push('\n');
}

/// Encodes `image` as Intel HEX text
///
/// Contiguous runs are emitted as data records of up to 16 bytes that never cross a 64 KiB
/// boundary, preceded by an extended linear address record whenever the upper 16 address bits
/// change.
pub fn encode(image: &MemoryImage) -> String {
    let mut out = String::new();
    let mut upper: u16 = 0;
    let mut run: Vec<u8> = Vec::with_capacity(ENCODE_RECORD_LEN);
    let mut run_start: u32 = 0;

    let flush = |out: &mut String, upper: &mut u16, start: u32, run: &mut Vec<u8>| {
        if run.is_empty() {
            return;
        }
        let start_upper = (start >> 16) as u16;
        if start_upper != *upper {
            push_record(out, 0, RECORD_EXTENDED_LINEAR, &start_upper.to_be_bytes());
            *upper = start_upper;
        }
        push_record(out, start as u16, RECORD_DATA, run);
        run.clear();
    };

    for (address, value) in image.iter() {
        let contiguous = !run.is_empty() && run_start.wrapping_add(run.len() as u32) == address;
        let crosses_segment = address & 0xFFFF == 0;

        if !contiguous || run.len() == ENCODE_RECORD_LEN || crosses_segment {
            flush(&mut out, &mut upper, run_start, &mut run);
            run_start = address;
        }
        run.push(value);
    }
    flush(&mut out, &mut upper, run_start, &mut run);

    push_record(&mut out, 0, RECORD_EOF, &[]);
    out
}

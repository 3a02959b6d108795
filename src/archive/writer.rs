//! Forward-only ZIP encoder.
//!
//! Entries are written with the data-descriptor flag set, so sizes and CRC
//! follow the compressed data instead of being patched into the local header.
//! Nothing is ever rewritten, which lets the output go straight to a socket.
//! The central directory is only written by [`ZipStreamWriter::finish`]; a
//! writer that is dropped early leaves a truncated archive behind, never one
//! that looks complete.

use chrono::{DateTime, Datelike, Local, Timelike};
use flate2::{write::DeflateEncoder, Compression};
use std::{
    io::{self, Write},
    time::SystemTime,
};

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const ZIP64_END_SIGNATURE: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
const END_SIGNATURE: u32 = 0x0605_4b50;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
/// Upper byte 3 = Unix, so external attributes carry permission bits.
const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;
/// Bit 3: sizes in data descriptor. Bit 11: UTF-8 names.
const FLAGS: u16 = 0x0008 | 0x0800;
const METHOD_DEFLATE: u16 = 8;
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Entries at or above this size need ZIP64 size fields.
pub const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;
const DEFAULT_FILE_MODE: u32 = 0o100644;

#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOptions {
    pub modified: Option<SystemTime>,
    pub unix_mode: Option<u32>,
    /// Declare ZIP64 sizes up front. Required when the entry may reach 4 GiB.
    pub large: bool,
}

struct CentralRecord {
    name: Vec<u8>,
    time: u16,
    date: u16,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
    external_attributes: u32,
    zip64: bool,
}

struct ActiveEntry {
    record: CentralRecord,
    encoder: DeflateEncoder<Vec<u8>>,
    hasher: crc32fast::Hasher,
}

pub struct ZipStreamWriter<W: Write> {
    inner: W,
    offset: u64,
    records: Vec<CentralRecord>,
    current: Option<ActiveEntry>,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            records: Vec::new(),
            current: None,
        }
    }

    /// Bytes handed to the inner writer so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    pub fn entry_count(&self) -> usize {
        self.records.len()
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Writes the local header for a new entry. The previous entry must have
    /// been closed with [`finish_entry`](Self::finish_entry).
    pub fn start_entry(&mut self, name: &str, options: EntryOptions) -> io::Result<()> {
        if self.current.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "previous archive entry was not finished",
            ));
        }
        if name.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "archive entry name is too long",
            ));
        }
        let (time, date) = dos_datetime(options.modified);
        let record = CentralRecord {
            name: name.as_bytes().to_vec(),
            time,
            date,
            crc: 0,
            compressed: 0,
            uncompressed: 0,
            offset: self.offset,
            external_attributes: options.unix_mode.unwrap_or(DEFAULT_FILE_MODE) << 16,
            zip64: options.large,
        };

        let mut header = Vec::with_capacity(30 + record.name.len() + 20);
        put_u32(&mut header, LOCAL_HEADER_SIGNATURE);
        put_u16(&mut header, if record.zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
        put_u16(&mut header, FLAGS);
        put_u16(&mut header, METHOD_DEFLATE);
        put_u16(&mut header, record.time);
        put_u16(&mut header, record.date);
        put_u32(&mut header, 0);
        if record.zip64 {
            put_u32(&mut header, u32::MAX);
            put_u32(&mut header, u32::MAX);
        } else {
            put_u32(&mut header, 0);
            put_u32(&mut header, 0);
        }
        put_u16(&mut header, record.name.len() as u16);
        put_u16(&mut header, if record.zip64 { 20 } else { 0 });
        header.extend_from_slice(&record.name);
        if record.zip64 {
            put_u16(&mut header, ZIP64_EXTRA_ID);
            put_u16(&mut header, 16);
            put_u64(&mut header, 0);
            put_u64(&mut header, 0);
        }
        self.emit(&header)?;

        self.current = Some(ActiveEntry {
            record,
            encoder: DeflateEncoder::new(Vec::new(), Compression::default()),
            hasher: crc32fast::Hasher::new(),
        });
        Ok(())
    }

    /// Compresses `data` into the open entry and forwards whatever output the
    /// encoder has produced.
    pub fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(entry) = self.current.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no archive entry is open",
            ));
        };
        entry.hasher.update(data);
        entry.record.uncompressed += data.len() as u64;
        entry.encoder.write_all(data)?;
        let output = std::mem::take(entry.encoder.get_mut());
        entry.record.compressed += output.len() as u64;
        self.emit(&output)
    }

    /// Flushes the compressor and writes the data descriptor.
    pub fn finish_entry(&mut self) -> io::Result<()> {
        let Some(entry) = self.current.take() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no archive entry is open",
            ));
        };
        let ActiveEntry {
            mut record,
            encoder,
            hasher,
        } = entry;
        let tail = encoder.finish()?;
        record.compressed += tail.len() as u64;
        record.crc = hasher.finalize();
        self.emit(&tail)?;

        if !record.zip64
            && (record.compressed >= ZIP64_THRESHOLD || record.uncompressed >= ZIP64_THRESHOLD)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "archive entry grew past 4 GiB without ZIP64 sizes",
            ));
        }

        let mut descriptor = Vec::with_capacity(24);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIGNATURE);
        put_u32(&mut descriptor, record.crc);
        if record.zip64 {
            put_u64(&mut descriptor, record.compressed);
            put_u64(&mut descriptor, record.uncompressed);
        } else {
            put_u32(&mut descriptor, record.compressed as u32);
            put_u32(&mut descriptor, record.uncompressed as u32);
        }
        self.emit(&descriptor)?;
        self.records.push(record);
        Ok(())
    }

    /// Writes the central directory and end records, flushes, and hands back
    /// the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.current.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "archive finished with an entry still open",
            ));
        }

        let directory_offset = self.offset;
        let mut directory = Vec::new();
        for record in &self.records {
            write_central_header(&mut directory, record);
        }
        let directory_size = directory.len() as u64;
        let count = self.records.len() as u64;
        self.emit(&directory)?;

        let mut end = Vec::with_capacity(98);
        let needs_zip64 = count >= u16::MAX as u64
            || directory_offset >= ZIP64_THRESHOLD
            || directory_size >= ZIP64_THRESHOLD;
        if needs_zip64 {
            let zip64_end_offset = self.offset;
            put_u32(&mut end, ZIP64_END_SIGNATURE);
            put_u64(&mut end, 44);
            put_u16(&mut end, VERSION_MADE_BY);
            put_u16(&mut end, VERSION_ZIP64);
            put_u32(&mut end, 0);
            put_u32(&mut end, 0);
            put_u64(&mut end, count);
            put_u64(&mut end, count);
            put_u64(&mut end, directory_size);
            put_u64(&mut end, directory_offset);

            put_u32(&mut end, ZIP64_LOCATOR_SIGNATURE);
            put_u32(&mut end, 0);
            put_u64(&mut end, zip64_end_offset);
            put_u32(&mut end, 1);
        }
        put_u32(&mut end, END_SIGNATURE);
        put_u16(&mut end, 0);
        put_u16(&mut end, 0);
        put_u16(&mut end, count.min(u16::MAX as u64) as u16);
        put_u16(&mut end, count.min(u16::MAX as u64) as u16);
        put_u32(&mut end, directory_size.min(ZIP64_THRESHOLD) as u32);
        put_u32(&mut end, directory_offset.min(ZIP64_THRESHOLD) as u32);
        put_u16(&mut end, 0);
        self.emit(&end)?;

        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn write_central_header(out: &mut Vec<u8>, record: &CentralRecord) {
    let offset_overflows = record.offset >= ZIP64_THRESHOLD;
    let mut extra = Vec::new();
    if record.zip64 {
        put_u64(&mut extra, record.uncompressed);
        put_u64(&mut extra, record.compressed);
    }
    if offset_overflows {
        put_u64(&mut extra, record.offset);
    }

    put_u32(out, CENTRAL_HEADER_SIGNATURE);
    put_u16(out, VERSION_MADE_BY);
    put_u16(out, if extra.is_empty() { VERSION_DEFAULT } else { VERSION_ZIP64 });
    put_u16(out, FLAGS);
    put_u16(out, METHOD_DEFLATE);
    put_u16(out, record.time);
    put_u16(out, record.date);
    put_u32(out, record.crc);
    if record.zip64 {
        put_u32(out, u32::MAX);
        put_u32(out, u32::MAX);
    } else {
        put_u32(out, record.compressed as u32);
        put_u32(out, record.uncompressed as u32);
    }
    put_u16(out, record.name.len() as u16);
    put_u16(out, if extra.is_empty() { 0 } else { extra.len() as u16 + 4 });
    put_u16(out, 0);
    put_u16(out, 0);
    put_u16(out, 0);
    put_u32(out, record.external_attributes);
    put_u32(out, if offset_overflows { u32::MAX } else { record.offset as u32 });
    out.extend_from_slice(&record.name);
    if !extra.is_empty() {
        put_u16(out, ZIP64_EXTRA_ID);
        put_u16(out, extra.len() as u16);
        out.extend_from_slice(&extra);
    }
}

/// MS-DOS time and date words, in local time, clamped to 1980..=2107.
fn dos_datetime(modified: Option<SystemTime>) -> (u16, u16) {
    const EPOCH: (u16, u16) = (0, (1 << 5) | 1);
    let Some(modified) = modified else {
        return EPOCH;
    };
    let local: DateTime<Local> = modified.into();
    if local.year() < 1980 {
        return EPOCH;
    }
    if local.year() > 2107 {
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }
    let time = (local.hour() << 11) | (local.minute() << 5) | (local.second() / 2);
    let date = (((local.year() - 1980) as u32) << 9) | (local.month() << 5) | local.day();
    (time as u16, date as u16)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

//! Page-aligned bulk transfer codec and the byte-channel seam.
//!
//! The engine is transport-agnostic: it writes whole encoded pages to a
//! caller-supplied channel and reads them back from one. A page is never
//! split across a transferred byte range.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut};

use crate::error::{Result, VesperError};

use super::page::{LeafEntry, Page, PageData};
use super::replication::HostSet;

/// Leading marker of every transferred page record.
pub const PAGE_MAGIC: u32 = 0x5650_4731; // "VPG1"

const FLAG_COMPRESSED: u8 = 0x01;
const KIND_LEAF: u8 = 1;
const KIND_NODE: u8 = 2;

/// Framing overhead around a record payload: magic, flags, payload
/// length prefix and trailing checksum.
const RECORD_HEADER_LEN: usize = 4 + 1 + 4;
const RECORD_TRAILER_LEN: usize = 4;

/// Sequential sink/positioned source of raw bytes. The engine treats the
/// channel as a generic transport; closing it mid-transfer surfaces as an
/// ordinary I/O error.
pub trait ByteChannel {
    /// Writes the whole buffer at the channel's current position.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Reads exactly `buf.len()` bytes starting at absolute position
    /// `pos`, without disturbing the write position.
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl ByteChannel for File {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        let restore = self.stream_position()?;
        self.seek(SeekFrom::Start(pos))?;
        let outcome = self.read_exact(buf);
        self.seek(SeekFrom::Start(restore))?;
        outcome
    }
}

/// Growable in-memory channel, used in tests and for staging transfers.
#[derive(Default)]
pub struct MemoryChannel {
    data: Vec<u8>,
}

impl MemoryChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the underlying buffer, for fault injection.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl ByteChannel for MemoryChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(pos)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "position out of range"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"))?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// Decoded form of one transferred page.
#[derive(Debug)]
pub(crate) struct PageRecord {
    pub(crate) leaf: bool,
    pub(crate) hosts: HostSet,
    pub(crate) entries: Vec<LeafEntry>,
}

pub(crate) fn record_from_page(page: &Page) -> PageRecord {
    match &page.data {
        PageData::Leaf { entries } => PageRecord {
            leaf: true,
            hosts: page.hosts.clone(),
            entries: entries.clone(),
        },
        PageData::Node { separators, .. } => PageRecord {
            leaf: false,
            hosts: page.hosts.clone(),
            entries: separators
                .iter()
                .map(|sep| (sep.clone(), Vec::new()))
                .collect(),
        },
    }
}

pub(crate) fn encode_page_record(record: &PageRecord, compress: bool) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    payload.put_u8(if record.leaf { KIND_LEAF } else { KIND_NODE });
    let host_count = u16::try_from(record.hosts.len())
        .map_err(|_| VesperError::InvalidArgument("host set exceeds u16"))?;
    payload.put_u16(host_count);
    for host in record.hosts.iter() {
        let len = u16::try_from(host.len())
            .map_err(|_| VesperError::InvalidArgument("host identifier exceeds u16"))?;
        payload.put_u16(len);
        payload.put_slice(host.as_bytes());
    }
    let entry_count = u32::try_from(record.entries.len())
        .map_err(|_| VesperError::InvalidArgument("page entry count exceeds u32"))?;
    payload.put_u32(entry_count);
    for (key, value) in &record.entries {
        let klen = u32::try_from(key.len())
            .map_err(|_| VesperError::InvalidArgument("key exceeds u32"))?;
        let vlen = u32::try_from(value.len())
            .map_err(|_| VesperError::InvalidArgument("value exceeds u32"))?;
        payload.put_u32(klen);
        payload.put_u32(vlen);
        payload.put_slice(key);
        payload.put_slice(value);
    }

    let (flags, stored) = if compress {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&payload)
            .map_err(|_| VesperError::Corruption("page payload compression failed"))?;
        (FLAG_COMPRESSED, compressed)
    } else {
        (0, payload)
    };

    let stored_len = u32::try_from(stored.len())
        .map_err(|_| VesperError::InvalidArgument("page payload exceeds u32"))?;
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + stored.len() + RECORD_TRAILER_LEN);
    out.put_u32(PAGE_MAGIC);
    out.put_u8(flags);
    out.put_u32(stored_len);
    out.put_slice(&stored);
    out.put_u32(crc32fast::hash(&stored));
    Ok(out)
}

/// Decodes one page record from the front of `buf`, returning the record
/// and the number of bytes consumed. Every shape or integrity failure is
/// a [`VesperError::Corruption`], fatal to the call but not to the map.
pub(crate) fn decode_page_record(buf: &[u8]) -> Result<(PageRecord, usize)> {
    let mut cursor = buf;
    if cursor.remaining() < RECORD_HEADER_LEN {
        return Err(VesperError::Corruption("transfer record truncated"));
    }
    if cursor.get_u32() != PAGE_MAGIC {
        return Err(VesperError::Corruption("transfer record magic mismatch"));
    }
    let flags = cursor.get_u8();
    if flags & !FLAG_COMPRESSED != 0 {
        return Err(VesperError::Corruption("transfer record has unknown flags"));
    }
    let stored_len = cursor.get_u32() as usize;
    if cursor.remaining() < stored_len + RECORD_TRAILER_LEN {
        return Err(VesperError::Corruption("transfer record payload truncated"));
    }
    let stored = &cursor[..stored_len];
    cursor.advance(stored_len);
    let expected_crc = cursor.get_u32();
    if crc32fast::hash(stored) != expected_crc {
        return Err(VesperError::Corruption("transfer record checksum mismatch"));
    }
    let consumed = RECORD_HEADER_LEN + stored_len + RECORD_TRAILER_LEN;

    let payload;
    let mut body: &[u8] = if flags & FLAG_COMPRESSED != 0 {
        payload = snap::raw::Decoder::new()
            .decompress_vec(stored)
            .map_err(|_| VesperError::Corruption("transfer record decompression failed"))?;
        &payload
    } else {
        stored
    };

    if body.remaining() < 3 {
        return Err(VesperError::Corruption("transfer record body truncated"));
    }
    let leaf = match body.get_u8() {
        KIND_LEAF => true,
        KIND_NODE => false,
        _ => return Err(VesperError::Corruption("unknown transfer page kind")),
    };
    let host_count = body.get_u16() as usize;
    let mut hosts = HostSet::new();
    for _ in 0..host_count {
        if body.remaining() < 2 {
            return Err(VesperError::Corruption("transfer host list truncated"));
        }
        let len = body.get_u16() as usize;
        if body.remaining() < len {
            return Err(VesperError::Corruption("transfer host identifier truncated"));
        }
        let raw = &body[..len];
        let host = std::str::from_utf8(raw)
            .map_err(|_| VesperError::Corruption("transfer host identifier is not UTF-8"))?;
        hosts.insert(host);
        body.advance(len);
    }
    if body.remaining() < 4 {
        return Err(VesperError::Corruption("transfer entry count truncated"));
    }
    let entry_count = body.get_u32() as usize;
    let mut entries = Vec::with_capacity(entry_count.min(1024));
    for _ in 0..entry_count {
        if body.remaining() < 8 {
            return Err(VesperError::Corruption("transfer entry header truncated"));
        }
        let klen = body.get_u32() as usize;
        let vlen = body.get_u32() as usize;
        if body.remaining() < klen + vlen {
            return Err(VesperError::Corruption("transfer entry data truncated"));
        }
        let key = body[..klen].to_vec();
        body.advance(klen);
        let value = body[..vlen].to_vec();
        body.advance(vlen);
        entries.push((key, value));
    }
    if body.has_remaining() {
        return Err(VesperError::Corruption("transfer record has trailing bytes"));
    }

    Ok((
        PageRecord {
            leaf,
            hosts,
            entries,
        },
        consumed,
    ))
}

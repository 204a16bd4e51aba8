//! ZIP record layouts.
//!
//! All multi-byte integers are little-endian. Only single-disk ZIP32 archives
//! are produced or understood.

use super::dos_time::DosDateTime;
use crate::{BackupError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;

/// Fixed part of a local file header, signature included
pub const LOCAL_HEADER_LEN: usize = 30;
/// Fixed part of a central file header, signature included
pub const CENTRAL_HEADER_LEN: usize = 46;
/// Fixed part of the EOCD record, signature included
pub const EOCD_LEN: usize = 22;
/// EOCD plus the longest possible archive comment
pub const MAX_EOCD_SEARCH: u64 = EOCD_LEN as u64 + u16::MAX as u64;

/// CRC-32 + compressed size + uncompressed size
pub const DATA_DESCRIPTOR_LEN: usize = 12;

pub const METHOD_STORE: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;

/// General purpose bit 3: CRC and sizes are repeated after the data
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

pub const VERSION_STORE: u16 = 10;
pub const VERSION_DEFLATE: u16 = 20;
pub const VERSION_MADE_BY: u16 = 20;

/// Conventional external attributes for a directory (drwxrwxrwx + DOS dir bit)
pub const DIR_ATTRIBUTES: u32 = 0x41FF_0010;
/// Bare directory bit
pub const DIR_ATTRIBUTE_BIT: u32 = 0x10;
/// DOS archive bit, used for regular files
pub const FILE_ATTRIBUTES: u32 = 0x20;

/// Map a short read onto a format error naming the record being read
fn truncated(what: &'static str) -> impl FnOnce(io::Error) -> BackupError {
    move |err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            BackupError::ArchiveFormat(format!("truncated {what}"))
        } else {
            BackupError::Io(err)
        }
    }
}

fn read_bytes<R: Read>(reader: &mut R, len: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(truncated(what))?;
    Ok(buf)
}

fn expect_signature<R: Read>(reader: &mut R, expected: u32, what: &'static str) -> Result<()> {
    let signature = reader.read_u32::<LittleEndian>().map_err(truncated(what))?;
    if signature != expected {
        return Err(BackupError::ArchiveFormat(format!(
            "bad {what} signature {signature:#010x}"
        )));
    }
    Ok(())
}

/// Narrow a size or offset to its ZIP32 field
pub fn zip32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| BackupError::ArchiveFormat(format!("{what} {value} exceeds ZIP32 limits")))
}

/// Header written in front of every entry's data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHeader {
    pub version: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u32,
    pub size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

impl LocalHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(LOCAL_HEADER_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(self.modified.time)?;
        w.write_u16::<LittleEndian>(self.modified.date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u16::<LittleEndian>(self.name.len() as u16)?;
        w.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        w.write_all(&self.name)?;
        w.write_all(&self.extra)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        const WHAT: &str = "local file header";
        expect_signature(r, LOCAL_HEADER_SIGNATURE, WHAT)?;

        let mut fixed = [0u8; LOCAL_HEADER_LEN - 4];
        r.read_exact(&mut fixed).map_err(truncated(WHAT))?;
        let mut c = Cursor::new(&fixed[..]);

        let version = c.read_u16::<LittleEndian>()?;
        let flags = c.read_u16::<LittleEndian>()?;
        let method = c.read_u16::<LittleEndian>()?;
        let time = c.read_u16::<LittleEndian>()?;
        let date = c.read_u16::<LittleEndian>()?;
        let crc32 = c.read_u32::<LittleEndian>()?;
        let compressed_size = c.read_u32::<LittleEndian>()?;
        let size = c.read_u32::<LittleEndian>()?;
        let name_len = c.read_u16::<LittleEndian>()? as usize;
        let extra_len = c.read_u16::<LittleEndian>()? as usize;

        Ok(Self {
            version,
            flags,
            method,
            modified: DosDateTime { date, time },
            crc32,
            compressed_size,
            size,
            name: read_bytes(r, name_len, "local file name")?,
            extra: read_bytes(r, extra_len, "local extra field")?,
        })
    }
}

/// One entry's record in the central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralHeader {
    pub made_by: u16,
    pub version: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u32,
    pub size: u32,
    pub disk_start: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub local_header_offset: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralHeader {
    /// Serialized length of this record
    pub fn encoded_len(&self) -> usize {
        CENTRAL_HEADER_LEN + self.name.len() + self.extra.len() + self.comment.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        // writes into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(CENTRAL_HEADER_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.made_by)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(self.modified.time)?;
        w.write_u16::<LittleEndian>(self.modified.date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u16::<LittleEndian>(self.name.len() as u16)?;
        w.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        w.write_u16::<LittleEndian>(self.comment.len() as u16)?;
        w.write_u16::<LittleEndian>(self.disk_start)?;
        w.write_u16::<LittleEndian>(self.internal_attributes)?;
        w.write_u32::<LittleEndian>(self.external_attributes)?;
        w.write_u32::<LittleEndian>(self.local_header_offset)?;
        w.write_all(&self.name)?;
        w.write_all(&self.extra)?;
        w.write_all(&self.comment)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        const WHAT: &str = "central file header";
        expect_signature(r, CENTRAL_HEADER_SIGNATURE, WHAT)?;

        let mut fixed = [0u8; CENTRAL_HEADER_LEN - 4];
        r.read_exact(&mut fixed).map_err(truncated(WHAT))?;
        let mut c = Cursor::new(&fixed[..]);

        let made_by = c.read_u16::<LittleEndian>()?;
        let version = c.read_u16::<LittleEndian>()?;
        let flags = c.read_u16::<LittleEndian>()?;
        let method = c.read_u16::<LittleEndian>()?;
        let time = c.read_u16::<LittleEndian>()?;
        let date = c.read_u16::<LittleEndian>()?;
        let crc32 = c.read_u32::<LittleEndian>()?;
        let compressed_size = c.read_u32::<LittleEndian>()?;
        let size = c.read_u32::<LittleEndian>()?;
        let name_len = c.read_u16::<LittleEndian>()? as usize;
        let extra_len = c.read_u16::<LittleEndian>()? as usize;
        let comment_len = c.read_u16::<LittleEndian>()? as usize;
        let disk_start = c.read_u16::<LittleEndian>()?;
        let internal_attributes = c.read_u16::<LittleEndian>()?;
        let external_attributes = c.read_u32::<LittleEndian>()?;
        let local_header_offset = c.read_u32::<LittleEndian>()?;

        Ok(Self {
            made_by,
            version,
            flags,
            method,
            modified: DosDateTime { date, time },
            crc32,
            compressed_size,
            size,
            disk_start,
            internal_attributes,
            external_attributes,
            local_header_offset,
            name: read_bytes(r, name_len, "central file name")?,
            extra: read_bytes(r, extra_len, "central extra field")?,
            comment: read_bytes(r, comment_len, "central file comment")?,
        })
    }

    /// Directory sentinel attributes, the bare directory bit, or a trailing slash
    pub fn is_dir(&self) -> bool {
        self.external_attributes == DIR_ATTRIBUTES
            || self.external_attributes == DIR_ATTRIBUTE_BIT
            || self.name.last() == Some(&b'/')
    }

    /// Split a run of concatenated central records back into individual records
    pub fn split_records(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        let mut cursor = Cursor::new(bytes);
        while (cursor.position() as usize) < bytes.len() {
            let start = cursor.position() as usize;
            let header = Self::read_from(&mut cursor)?;
            let end = start + header.encoded_len();
            records.push(bytes[start..end].to_vec());
        }
        Ok(records)
    }
}

/// End-of-central-directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk: u16,
    pub central_disk: u16,
    pub disk_entries: u16,
    pub entries: u16,
    pub central_size: u32,
    pub central_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// Record for a single-disk archive
    pub fn single_disk(entries: u16, central_size: u32, central_offset: u32) -> Self {
        Self {
            disk: 0,
            central_disk: 0,
            disk_entries: entries,
            entries,
            central_size,
            central_offset,
            comment: Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(EOCD_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.disk)?;
        w.write_u16::<LittleEndian>(self.central_disk)?;
        w.write_u16::<LittleEndian>(self.disk_entries)?;
        w.write_u16::<LittleEndian>(self.entries)?;
        w.write_u32::<LittleEndian>(self.central_size)?;
        w.write_u32::<LittleEndian>(self.central_offset)?;
        w.write_u16::<LittleEndian>(self.comment.len() as u16)?;
        w.write_all(&self.comment)
    }

    /// Find the EOCD by scanning backwards from the end of the stream.
    ///
    /// The search window covers the record plus the longest possible comment.
    pub fn locate<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let len = r.seek(SeekFrom::End(0))?;
        if len < EOCD_LEN as u64 {
            return Err(BackupError::ArchiveFormat(format!(
                "{len} bytes is too short to be a ZIP archive"
            )));
        }

        let window = MAX_EOCD_SEARCH.min(len);
        r.seek(SeekFrom::Start(len - window))?;
        let mut tail = vec![0u8; window as usize];
        r.read_exact(&mut tail).map_err(truncated("end of central directory"))?;

        let signature = EOCD_SIGNATURE.to_le_bytes();
        for start in (0..=tail.len() - EOCD_LEN).rev() {
            if tail[start..start + 4] != signature {
                continue;
            }
            let mut c = Cursor::new(&tail[start + 4..start + EOCD_LEN]);
            let disk = c.read_u16::<LittleEndian>()?;
            let central_disk = c.read_u16::<LittleEndian>()?;
            let disk_entries = c.read_u16::<LittleEndian>()?;
            let entries = c.read_u16::<LittleEndian>()?;
            let central_size = c.read_u32::<LittleEndian>()?;
            let central_offset = c.read_u32::<LittleEndian>()?;
            let comment_len = c.read_u16::<LittleEndian>()? as usize;

            let comment_start = start + EOCD_LEN;
            if comment_start + comment_len > tail.len() {
                // signature bytes inside entry data, keep looking
                continue;
            }

            return Ok(Self {
                disk,
                central_disk,
                disk_entries,
                entries,
                central_size,
                central_offset,
                comment: tail[comment_start..comment_start + comment_len].to_vec(),
            });
        }

        Err(BackupError::ArchiveFormat(
            "end of central directory record not found".to_string(),
        ))
    }
}

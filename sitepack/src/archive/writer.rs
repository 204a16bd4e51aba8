//! Incremental ZIP writer.
//!
//! Entries are appended one at a time; their central-directory records are
//! kept pending until [`ZipWriter::close`] writes the central directory and
//! the EOCD record. A file-bound archive can be reopened mid-way with
//! [`ZipWriter::resume`] so that one archive can be built across many
//! short-lived processes.

use super::dos_time::DosDateTime;
use super::entry::ArchiveEntry;
use super::format::{
    zip32, CentralHeader, EndOfCentralDirectory, LocalHeader, DIR_ATTRIBUTES, FILE_ATTRIBUTES,
    FLAG_DATA_DESCRIPTOR, METHOD_DEFLATE, METHOD_STORE, VERSION_DEFLATE, VERSION_MADE_BY,
    VERSION_STORE,
};
use crate::{BackupError, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default deflate level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

enum Sink {
    File(BufWriter<File>),
    Memory(Vec<u8>),
    Released,
}

/// Write-mode archive session, bound either to a file or to a memory buffer
pub struct ZipWriter {
    sink: Sink,
    path: Option<PathBuf>,
    offset: u64,
    central: Vec<Vec<u8>>,
    level: u32,
    closed: bool,
}

impl ZipWriter {
    /// Create (or truncate) an archive file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        Ok(Self::with_sink(Sink::File(BufWriter::new(file)), Some(path.to_path_buf()), 0, Vec::new()))
    }

    /// Start an archive in memory
    pub fn in_memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()), None, 0, Vec::new())
    }

    /// Reopen an unfinished archive file.
    ///
    /// Anything past `offset` is discarded; `central` holds the records of
    /// every entry already written below `offset`.
    pub fn resume(path: impl AsRef<Path>, offset: u64, central: Vec<Vec<u8>>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < offset {
            return Err(BackupError::ArchiveFormat(format!(
                "{} is {len} bytes, expected at least {offset}",
                path.display()
            )));
        }
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;

        debug!("Resuming archive {} at offset {} ({} entries)", path.display(), offset, central.len());
        Ok(Self::with_sink(Sink::File(BufWriter::new(file)), Some(path.to_path_buf()), offset, central))
    }

    fn with_sink(sink: Sink, path: Option<PathBuf>, offset: u64, central: Vec<Vec<u8>>) -> Self {
        Self {
            sink,
            path,
            offset,
            central,
            level: DEFAULT_COMPRESSION_LEVEL,
            closed: false,
        }
    }

    /// Set the compression level for subsequent entries: 0 stores, 1-9 deflate
    pub fn set_compression(&mut self, level: u32) {
        self.level = level.min(9);
    }

    /// Current write offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Pending central-directory records, in entry order
    pub fn central_records(&self) -> &[Vec<u8>] {
        &self.central
    }

    pub fn entry_count(&self) -> usize {
        self.central.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Add an entry with the given content. Returns the entry as recorded.
    pub fn add_data(&mut self, entry: &ArchiveEntry, data: &[u8]) -> Result<ArchiveEntry> {
        self.write_entry(entry, data)
    }

    /// Add an entry whose content is read from `source`
    pub fn add_file(&mut self, source: &Path, entry: &ArchiveEntry) -> Result<ArchiveEntry> {
        if self.closed {
            return Err(BackupError::ArchiveClosed);
        }
        let data = std::fs::read(source)?;
        self.write_entry(entry, &data)
    }

    /// Add an empty directory entry
    pub fn add_empty_dir(&mut self, entry: &ArchiveEntry) -> Result<ArchiveEntry> {
        let mut dir = entry.clone();
        dir.set_dir(true);
        self.write_entry(&dir, &[])
    }

    fn write_entry(&mut self, entry: &ArchiveEntry, data: &[u8]) -> Result<ArchiveEntry> {
        if self.closed {
            return Err(BackupError::ArchiveClosed);
        }
        if entry.path().is_empty() {
            return Err(BackupError::ArchiveFormat("entry has an empty path".to_string()));
        }
        if self.central.len() >= u16::MAX as usize {
            return Err(BackupError::ArchiveFormat(format!(
                "archive already holds {} entries, the ZIP32 maximum",
                u16::MAX
            )));
        }

        let name = if entry.is_dir() {
            format!("{}/", entry.path())
        } else {
            entry.path().to_string()
        };
        if name.len() > u16::MAX as usize || entry.comment.len() > u16::MAX as usize {
            return Err(BackupError::ArchiveFormat(format!("name or comment of {} too long", entry.path())));
        }

        let crc32 = crc32fast::hash(data);
        let deflate = self.level > 0 && !entry.is_dir();
        let payload: Cow<[u8]> = if deflate {
            Cow::Owned(deflate_raw(data, self.level)?)
        } else {
            Cow::Borrowed(data)
        };
        let (method, version) = if deflate {
            (METHOD_DEFLATE, VERSION_DEFLATE)
        } else {
            (METHOD_STORE, VERSION_STORE)
        };

        // the central record points at the local header about to be written
        let local_offset = zip32(self.offset, "local header offset")?;
        let size = zip32(data.len() as u64, "entry size")?;
        let compressed_size = zip32(payload.len() as u64, "compressed entry size")?;
        let modified = DosDateTime::from_datetime(&entry.modified);

        let local = LocalHeader {
            version,
            flags: FLAG_DATA_DESCRIPTOR,
            method,
            modified,
            crc32,
            compressed_size,
            size,
            name: name.as_bytes().to_vec(),
            extra: Vec::new(),
        };
        let mut header = Vec::with_capacity(super::format::LOCAL_HEADER_LEN + name.len());
        local.write_to(&mut header)?;

        let mut descriptor = Vec::with_capacity(super::format::DATA_DESCRIPTOR_LEN);
        descriptor.extend_from_slice(&crc32.to_le_bytes());
        descriptor.extend_from_slice(&compressed_size.to_le_bytes());
        descriptor.extend_from_slice(&size.to_le_bytes());

        self.write_bytes(&header)?;
        self.write_bytes(&payload)?;
        self.write_bytes(&descriptor)?;

        let central = CentralHeader {
            made_by: VERSION_MADE_BY,
            version,
            flags: FLAG_DATA_DESCRIPTOR,
            method,
            modified,
            crc32,
            compressed_size,
            size,
            disk_start: 0,
            internal_attributes: 0,
            external_attributes: if entry.is_dir() { DIR_ATTRIBUTES } else { FILE_ATTRIBUTES },
            local_header_offset: local_offset,
            name: name.into_bytes(),
            extra: Vec::new(),
            comment: entry.comment.as_bytes().to_vec(),
        };
        self.central.push(central.encode());

        let mut recorded = entry.clone();
        recorded.size = data.len() as u64;
        recorded.compressed_size = payload.len() as u64;
        Ok(recorded)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.sink {
            Sink::File(w) => w.write_all(bytes)?,
            Sink::Memory(buf) => buf.extend_from_slice(bytes),
            Sink::Released => return Err(BackupError::ArchiveClosed),
        }
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Push buffered bytes to durable storage
    pub fn flush(&mut self) -> Result<()> {
        if let Sink::File(w) = &mut self.sink {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Write the central directory and EOCD, then release the file handle.
    ///
    /// Calling this more than once is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let central_offset = zip32(self.offset, "central directory offset")?;
        let central = self.central.concat();
        let central_size = zip32(central.len() as u64, "central directory size")?;
        let entries = self.central.len() as u16;

        self.write_bytes(&central)?;
        let mut eocd = Vec::new();
        EndOfCentralDirectory::single_disk(entries, central_size, central_offset).write_to(&mut eocd)?;
        self.write_bytes(&eocd)?;

        self.central.clear();
        self.flush()?;
        if let Sink::File(_) = self.sink {
            self.sink = Sink::Released;
        }
        self.closed = true;

        if let Some(path) = &self.path {
            debug!("Closed archive {} ({} entries, {} bytes)", path.display(), entries, self.offset);
        }
        Ok(())
    }

    /// Close an in-memory archive and hand back its bytes
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        self.close()?;
        match std::mem::replace(&mut self.sink, Sink::Released) {
            Sink::Memory(buf) => Ok(buf),
            _ => Err(BackupError::ArchiveFormat(
                "archive is bound to a file, not memory".to_string(),
            )),
        }
    }

    /// Close an in-memory archive and write its bytes to `path`
    pub fn save(self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.into_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// Deflate `data`, keeping only the raw stream ZIP expects.
///
/// The zlib wrapper adds a 2 byte header and a 4 byte Adler-32 trailer.
fn deflate_raw(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::new(level));
    encoder.write_all(data)?;
    let wrapped = encoder.finish()?;
    if wrapped.len() < 6 {
        return Err(BackupError::ArchiveFormat("zlib stream too short".to_string()));
    }
    Ok(wrapped[2..wrapped.len() - 4].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::format::{CENTRAL_HEADER_SIGNATURE, EOCD_LEN};
    use flate2::read::DeflateDecoder;
    use std::io::{Cursor, Read};

    #[test]
    fn test_central_directory_accuracy() {
        let mut zip = ZipWriter::in_memory();
        let names = ["a.txt", "dir/b.txt", "dir/c/d.bin"];
        for name in names {
            zip.add_data(&ArchiveEntry::new(name), name.repeat(20).as_bytes()).unwrap();
        }
        let expected_size: usize = zip.central_records().iter().map(Vec::len).sum();
        let bytes = zip.into_bytes().unwrap();

        let eocd = EndOfCentralDirectory::locate(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(eocd.entries as usize, names.len());
        assert_eq!(eocd.disk_entries as usize, names.len());
        assert_eq!(eocd.central_size as usize, expected_size);
        assert!(eocd.comment.is_empty());

        // the central directory sits right before the EOCD
        let start = eocd.central_offset as usize;
        assert_eq!(start + expected_size + EOCD_LEN, bytes.len());
        assert_eq!(&bytes[start..start + 4], &CENTRAL_HEADER_SIGNATURE.to_le_bytes());
    }

    #[test]
    fn test_deflate_payload_is_raw() {
        let content = b"hello hello hello hello hello hello".to_vec();
        let mut zip = ZipWriter::in_memory();
        zip.set_compression(6);
        let recorded = zip.add_data(&ArchiveEntry::new("x.txt"), &content).unwrap();
        assert_eq!(recorded.size, content.len() as u64);
        let bytes = zip.into_bytes().unwrap();

        let local = LocalHeader::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(local.method, METHOD_DEFLATE);
        assert_eq!(local.crc32, crc32fast::hash(&content));
        assert_eq!(local.compressed_size as u64, recorded.compressed_size);

        let start = 30 + local.name.len();
        let raw = &bytes[start..start + local.compressed_size as usize];
        let mut inflated = Vec::new();
        DeflateDecoder::new(raw).read_to_end(&mut inflated).unwrap();
        assert_eq!(inflated, content);

        // the data descriptor repeats crc and sizes
        let descriptor = &bytes[start + raw.len()..start + raw.len() + 12];
        assert_eq!(&descriptor[..4], &local.crc32.to_le_bytes());
        assert_eq!(&descriptor[8..12], &(content.len() as u32).to_le_bytes());
    }

    #[test]
    fn test_store_level_zero() {
        let mut zip = ZipWriter::in_memory();
        zip.set_compression(0);
        zip.add_data(&ArchiveEntry::new("plain.txt"), b"plain").unwrap();
        let bytes = zip.into_bytes().unwrap();

        let local = LocalHeader::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(local.method, METHOD_STORE);
        assert_eq!(&bytes[30 + 9..30 + 9 + 5], b"plain");
    }

    #[test]
    fn test_add_after_close_fails() {
        let mut zip = ZipWriter::in_memory();
        zip.add_data(&ArchiveEntry::new("one"), b"1").unwrap();
        zip.close().unwrap();
        zip.close().unwrap();
        assert!(zip.is_closed());

        let err = zip.add_data(&ArchiveEntry::new("two"), b"2").unwrap_err();
        assert!(matches!(err, BackupError::ArchiveClosed));
        let err = zip.add_empty_dir(&ArchiveEntry::directory("dir")).unwrap_err();
        assert!(matches!(err, BackupError::ArchiveClosed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut zip = ZipWriter::in_memory();
        zip.add_data(&ArchiveEntry::new("one"), b"1").unwrap();
        zip.close().unwrap();
        let len = zip.offset();
        zip.close().unwrap();
        assert_eq!(zip.offset(), len);
    }

    #[test]
    fn test_entry_limit_leaves_archive_untouched() {
        let mut zip = ZipWriter::in_memory();
        zip.set_compression(0);
        for i in 0..u16::MAX {
            zip.add_data(&ArchiveEntry::new(&format!("f{i}")), b"").unwrap();
        }
        let offset = zip.offset();

        let err = zip.add_data(&ArchiveEntry::new("one-too-many"), b"x").unwrap_err();
        assert!(err.to_string().contains("already holds 65535 entries"), "{err}");
        assert_eq!(zip.offset(), offset);
        assert_eq!(zip.entry_count(), u16::MAX as usize);

        let bytes = zip.into_bytes().unwrap();
        let eocd = EndOfCentralDirectory::locate(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(eocd.entries, u16::MAX);
    }

    #[test]
    fn test_empty_path_rejected() {
        let mut zip = ZipWriter::in_memory();
        let err = zip.add_data(&ArchiveEntry::new("/./"), b"x").unwrap_err();
        assert!(matches!(err, BackupError::ArchiveFormat(_)));
    }

    #[test]
    fn test_resume_discards_uncommitted_tail() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("out.zip.part");

        let mut zip = ZipWriter::create(&path)?;
        zip.add_data(&ArchiveEntry::new("first.txt"), b"first")?;
        zip.flush()?;
        let offset = zip.offset();
        let records = zip.central_records().to_vec();
        // written but never committed
        zip.add_data(&ArchiveEntry::new("torn.txt"), b"torn")?;
        zip.flush()?;
        drop(zip);

        let mut zip = ZipWriter::resume(&path, offset, records)?;
        assert_eq!(zip.entry_count(), 1);
        zip.add_data(&ArchiveEntry::new("second.txt"), b"second")?;
        zip.close()?;

        let bytes = std::fs::read(&path)?;
        let eocd = EndOfCentralDirectory::locate(&mut Cursor::new(&bytes))?;
        assert_eq!(eocd.entries, 2);
        Ok(())
    }

    #[test]
    fn test_resume_rejects_short_file() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("short.zip.part");
        std::fs::write(&path, b"abc")?;

        let err = ZipWriter::resume(&path, 10, Vec::new()).err().unwrap();
        assert!(matches!(err, BackupError::ArchiveFormat(_)));
        Ok(())
    }
}

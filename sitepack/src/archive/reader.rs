//! ZIP reader.
//!
//! Listing and extraction each consume the open handle: reopen the archive
//! to run another pass.

use super::entry::{ArchiveEntry, Strip};
use super::format::{CentralHeader, EndOfCentralDirectory, LocalHeader, METHOD_DEFLATE, METHOD_STORE};
use crate::{BackupError, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Minimal gzip member header: magic, deflate, no flags, no mtime, unix
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

/// Which entries to extract and where they land
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub strip: Strip,
    pub include: Option<Regex>,
    pub exclude: Option<Regex>,
}

impl ExtractOptions {
    /// Build options from optional include/exclude regular expressions
    pub fn new(strip: Strip, include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        Ok(Self {
            strip,
            include: include.map(Regex::new).transpose()?,
            exclude: exclude.map(Regex::new).transpose()?,
        })
    }
}

/// Read-mode archive session
pub struct ZipReader {
    path: PathBuf,
    file: Option<File>,
}

impl ZipReader {
    /// Open an archive for reading
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { path, file: Some(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the file handle
    pub fn close(&mut self) {
        self.file = None;
    }

    fn take_file(&mut self) -> Result<File> {
        self.file.take().ok_or(BackupError::ArchiveNotOpen)
    }

    /// List every entry recorded in the central directory, then close
    pub fn list_entries(&mut self) -> Result<Vec<ArchiveEntry>> {
        let mut file = self.take_file()?;
        let headers = read_central_directory(&mut file)?;

        Ok(headers
            .iter()
            .map(|h| {
                to_entry(
                    &h.name,
                    h.size,
                    h.compressed_size,
                    h.modified,
                    &h.comment,
                    h.is_dir(),
                )
            })
            .collect())
    }

    /// Extract entries below `out_dir`, then close.
    ///
    /// Returns the entries written, with paths as stripped.
    pub fn extract(&mut self, out_dir: &Path, options: &ExtractOptions) -> Result<Vec<ArchiveEntry>> {
        let mut file = self.take_file()?;
        fs::create_dir_all(out_dir)?;

        let headers = read_central_directory(&mut file)?;
        let mut extracted = Vec::new();

        for central in headers {
            file.seek(SeekFrom::Start(central.local_header_offset as u64))?;
            let local = LocalHeader::read_from(&mut file)?;

            // some producers zero these in the central record; the local header wins
            let crc32 = if local.crc32 != 0 { local.crc32 } else { central.crc32 };
            let size = if local.size != 0 { local.size } else { central.size };
            let compressed_size = if local.compressed_size != 0 {
                local.compressed_size
            } else {
                central.compressed_size
            };
            let is_dir = central.is_dir() || local.name.last() == Some(&b'/');

            let mut entry = to_entry(&local.name, size, compressed_size, local.modified, &central.comment, is_dir);
            entry.strip(&options.strip);
            if entry.path().is_empty() || !entry.matches(options.include.as_ref(), options.exclude.as_ref()) {
                continue;
            }

            let output = out_dir.join(entry.path());
            if entry.is_dir() {
                fs::create_dir_all(&output)?;
                extracted.push(entry);
                continue;
            }
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }

            match local.method {
                METHOD_STORE => {
                    let mut out = BufWriter::new(File::create(&output)?);
                    copy_exact(&mut file, &mut out, compressed_size as u64)?;
                    out.flush()?;
                }
                METHOD_DEFLATE => {
                    inflate_through_gzip(&mut file, compressed_size as u64, crc32, size, &output)?;
                }
                other => {
                    return Err(BackupError::ArchiveFormat(format!(
                        "{} uses unsupported compression method {other}",
                        entry.path()
                    )));
                }
            }

            let out = fs::OpenOptions::new().write(true).open(&output)?;
            out.set_modified(SystemTime::from(entry.modified))?;

            debug!("Extracted {} from {}", entry.path(), self.path.display());
            extracted.push(entry);
        }

        Ok(extracted)
    }
}

fn read_central_directory(file: &mut File) -> Result<Vec<CentralHeader>> {
    let eocd = EndOfCentralDirectory::locate(file)?;
    file.seek(SeekFrom::Start(eocd.central_offset as u64))?;

    let mut reader = BufReader::new(file);
    let mut headers = Vec::with_capacity(eocd.entries as usize);
    for _ in 0..eocd.entries {
        headers.push(CentralHeader::read_from(&mut reader)?);
    }
    Ok(headers)
}

fn to_entry(
    name: &[u8],
    size: u32,
    compressed_size: u32,
    modified: super::dos_time::DosDateTime,
    comment: &[u8],
    is_dir: bool,
) -> ArchiveEntry {
    let mut entry = ArchiveEntry::new(&String::from_utf8_lossy(name));
    entry.size = size as u64;
    entry.compressed_size = compressed_size as u64;
    entry.modified = modified.to_datetime().unwrap_or_else(Utc::now);
    entry.comment = String::from_utf8_lossy(comment).into_owned();
    entry.set_dir(is_dir);
    entry
}

fn copy_exact<R: Read, W: Write>(src: &mut R, dst: &mut W, len: u64) -> Result<()> {
    let copied = io::copy(&mut src.take(len), dst)?;
    if copied != len {
        return Err(BackupError::ArchiveFormat(format!(
            "entry data truncated: expected {len} bytes, found {copied}"
        )));
    }
    Ok(())
}

/// Wrap the raw deflate stream in a gzip member on disk, then inflate it
/// into `output`. The gzip trailer lets the decoder verify CRC and length.
fn inflate_through_gzip<R: Read>(src: &mut R, compressed_size: u64, crc32: u32, size: u32, output: &Path) -> Result<()> {
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = output.with_file_name(format!(".{file_name}.inflate.gz"));

    {
        let mut gz = BufWriter::new(File::create(&staging)?);
        gz.write_all(&GZIP_HEADER)?;
        copy_exact(src, &mut gz, compressed_size)?;
        gz.write_all(&crc32.to_le_bytes())?;
        gz.write_all(&size.to_le_bytes())?;
        gz.flush()?;
    }

    let inflated = (|| -> Result<()> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(&staging)?));
        let mut out = BufWriter::new(File::create(output)?);
        io::copy(&mut decoder, &mut out)?;
        out.flush()?;
        Ok(())
    })();

    let _ = fs::remove_file(&staging);
    inflated
}

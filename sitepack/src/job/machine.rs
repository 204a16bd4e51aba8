//! Backup phase driver.
//!
//! A job moves through `Files -> Tables -> Archive -> Complete`. Each
//! invocation of [`BackupMachine::resume`] runs batches of the current phase
//! until the tick budget is spent, persisting the checkpoint after every
//! batch, so the job survives being killed between invocations.

use super::checkpoint::{ArchiveCursor, BackupState, Phase};
use super::context::JobContext;
use super::log::JobLog;
use super::manifest::{self, JobFacts, Manifest};
use crate::archive::{ArchiveEntry, ZipWriter};
use crate::archive::format::{CentralHeader, EndOfCentralDirectory};
use crate::config::Config;
use crate::dump::{PageOutcome, RowSource, SqliteRowSource, TableClassifier, TableDumpExporter, DEFAULT_PAGE_SIZE};
use crate::fs::metadata::entry_from_path;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::fs::{ChrootMap, FileSource, LocalFileSource};
use crate::{BackupError, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Items handled per batch, per phase
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub files: usize,
    pub archive_items: usize,
    pub table_page: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            files: 100,
            archive_items: 100,
            table_page: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Everything the driver needs besides its two capabilities
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub data_dir: PathBuf,
    pub source_root: PathBuf,
    pub chroot: ChrootMap,
    pub table_prefix: String,
    pub self_prefix: String,
    pub inactive: Vec<String>,
    pub batch: BatchLimits,
    pub tick_budget: Duration,
    pub compression_level: u32,
}

impl MachineSettings {
    pub fn from_config(config: &Config) -> Self {
        let base_dir = config.source.base_dir.clone().unwrap_or_else(|| config.source.root.clone());
        let chroot = match &config.source.chroot_base_dir {
            Some(chroot_base_dir) => ChrootMap::new(base_dir, chroot_base_dir.clone()),
            None => ChrootMap::identity(base_dir),
        };

        Self {
            data_dir: config.agent.data_dir.clone(),
            source_root: config.source.root.clone(),
            chroot,
            table_prefix: config.database.table_prefix.clone(),
            self_prefix: config.source.self_prefix.clone(),
            inactive: config.source.inactive.clone(),
            batch: BatchLimits {
                files: config.batch.files,
                archive_items: config.batch.archive_items,
                table_page: config.batch.table_page,
            },
            tick_budget: Duration::from_secs(config.batch.tick_seconds),
            compression_level: config.archive.compression_level,
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub job_id: String,
    pub phase: Phase,
    /// Batches run during this tick
    pub batches: usize,
    /// Queue items consumed during this tick
    pub processed: usize,
    /// Items left in the current phase's queue
    pub remaining: usize,
    pub complete: bool,
}

pub struct BackupMachine {
    settings: MachineSettings,
    files: Box<dyn FileSource>,
    rows: Box<dyn RowSource>,
}

impl BackupMachine {
    pub fn new(settings: MachineSettings, files: Box<dyn FileSource>, rows: Box<dyn RowSource>) -> Self {
        Self { settings, files, rows }
    }

    /// Local filesystem and the configured SQLite database
    pub fn from_config(config: &Config) -> Result<Self> {
        let classifier = TableClassifier::new(&config.database.table_prefix, config.database.global_tables.clone());
        let rows = SqliteRowSource::open(&config.database.path, classifier)?;
        Ok(Self::new(
            MachineSettings::from_config(config),
            Box::new(LocalFileSource::new()),
            Box::new(rows),
        ))
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn context(&self, id: super::JobId) -> JobContext {
        JobContext::new(&self.settings.data_dir, id)
    }

    /// Begin a fresh job, discarding anything left by an earlier one with the
    /// same identifier.
    pub fn start(&self, ctx: &JobContext, extra_inactive: &[String]) -> Result<BackupState> {
        self.cleanup(ctx)?;
        fs::create_dir_all(&ctx.paths.work_dir)?;
        let log = JobLog::new(&ctx.paths.log);

        info!("Starting backup job {}", ctx.id);
        log.append(&format!("Backup {} started", ctx.id))?;

        let tables = self.rows.tables()?;
        let mut inactive = self.settings.inactive.clone();
        inactive.extend(extra_inactive.iter().cloned());

        let facts = JobFacts {
            job_id: ctx.id.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            db_version: self.rows.server_version()?,
            source_root: self.settings.source_root.clone(),
            chroot: self.settings.chroot.clone(),
            table_prefix: self.settings.table_prefix.clone(),
            tables: tables.iter().map(|t| (t.name.clone(), t.class)).collect::<BTreeMap<_, _>>(),
            inactive,
        };
        Manifest::update(&ctx.paths.manifest, &facts)?;
        stamp(&ctx.paths.manifest, "started")?;

        let root = self.settings.chroot.apply(&self.settings.source_root);
        let data_dir = &self.settings.data_dir;
        let files: Vec<PathBuf> = self
            .files
            .enumerate(&root)?
            .into_iter()
            .filter(|p| !p.starts_with(data_dir))
            .collect();

        let state = BackupState::new(files, tables.into_iter().map(|t| t.name));
        state.save(&ctx.paths.checkpoint)?;

        info!(
            "Job {} queued {} paths and {} tables",
            ctx.id,
            state.pending_files.len(),
            state.pending_tables.len()
        );
        log.append(&format!(
            "Queued {} paths and {} tables",
            state.pending_files.len(),
            state.pending_tables.len()
        ))?;
        Ok(state)
    }

    /// Current checkpoint of a job, if it has one
    pub fn status(&self, ctx: &JobContext) -> Result<Option<BackupState>> {
        BackupState::load(&ctx.paths.checkpoint)
    }

    /// Run batches until the tick budget is spent or the job completes.
    ///
    /// Unless the job is already complete at least one batch runs; the budget
    /// is only checked between batches.
    pub fn resume(&self, ctx: &JobContext) -> Result<TickReport> {
        let mut state = match BackupState::load(&ctx.paths.checkpoint)? {
            Some(state) => state,
            None => {
                info!("No checkpoint for job {}, starting it", ctx.id);
                self.start(ctx, &[])?
            }
        };
        let manifest = Manifest::load(&ctx.paths.manifest)?;
        let log = JobLog::new(&ctx.paths.log);
        let deadline = Instant::now() + self.settings.tick_budget;

        let mut batches = 0;
        let mut processed = 0;
        while state.phase != Phase::Complete {
            processed += self.run_batch(ctx, &manifest, &log, &mut state)?;
            state.save(&ctx.paths.checkpoint)?;
            batches += 1;
            if Instant::now() >= deadline {
                break;
            }
        }

        let report = TickReport {
            job_id: ctx.id.to_string(),
            phase: state.phase,
            batches,
            processed,
            remaining: state.remaining(),
            complete: state.phase == Phase::Complete,
        };
        info!(
            "Job {} tick: phase {}, {} batches, {} processed, {} remaining",
            ctx.id, report.phase, report.batches, report.processed, report.remaining
        );
        Ok(report)
    }

    /// Bytes of the completed archive. The job is cleaned up afterwards.
    pub fn fetch(&self, ctx: &JobContext) -> Result<Vec<u8>> {
        match BackupState::load(&ctx.paths.checkpoint)? {
            Some(state) if state.phase == Phase::Complete => {}
            Some(_) => return Err(BackupError::NotComplete(ctx.id.to_string())),
            None => return Err(BackupError::JobNotFound(ctx.id.to_string())),
        }

        let bytes = fs::read(&ctx.paths.archive)?;
        info!("Fetched archive of job {} ({} bytes)", ctx.id, bytes.len());
        self.cleanup(ctx)?;
        Ok(bytes)
    }

    /// Remove the working tree and every job-scoped file
    pub fn cleanup(&self, ctx: &JobContext) -> Result<()> {
        match fs::remove_dir_all(&ctx.paths.work_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let temporaries = [
            ctx.paths.checkpoint.with_extension("json.tmp"),
            ctx.paths.manifest.with_extension("json.tmp"),
        ];
        for path in ctx.paths.files().into_iter().chain(temporaries.iter().map(PathBuf::as_path)) {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("Cleaned up job {}", ctx.id);
        Ok(())
    }

    fn run_batch(&self, ctx: &JobContext, manifest: &Manifest, log: &JobLog, state: &mut BackupState) -> Result<usize> {
        let processed = match state.phase {
            Phase::Files => self.files_batch(ctx, manifest, log, state)?,
            Phase::Tables => self.tables_batch(ctx, manifest, log, state)?,
            // closes the archive itself once its queue drains
            Phase::Archive => return self.archive_batch(ctx, manifest, log, state),
            Phase::Complete => return Ok(0),
        };

        if state.remaining() == 0 {
            self.advance(ctx, log, state)?;
        }
        Ok(processed)
    }

    fn advance(&self, ctx: &JobContext, log: &JobLog, state: &mut BackupState) -> Result<()> {
        let finished = state.phase;
        state.phase = finished.next();
        info!("Job {}: {} phase complete, entering {}", ctx.id, finished, state.phase);
        log.append(&format!("Phase {finished} complete"))?;
        stamp(&ctx.paths.manifest, &state.phase.to_string())
    }

    fn files_batch(&self, ctx: &JobContext, manifest: &Manifest, log: &JobLog, state: &mut BackupState) -> Result<usize> {
        let root = source_view_root(manifest, &self.settings);
        let mut processed = 0;

        while processed < self.settings.batch.files {
            let Some(source) = state.pending_files.pop_front() else {
                break;
            };
            processed += 1;

            let rel = match source.strip_prefix(&root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    warn!("{} is outside the source root, skipping", source.display());
                    log.append(&format!("Failed to copy {}: outside the source root", source.display()))?;
                    continue;
                }
            };

            match self.copy_item(&source, &ctx.paths.work_dir.join(&rel)) {
                Ok(()) => {
                    debug!("Copied {}", rel.display());
                    log.append(&format!("Copied {}", rel.display()))?;
                }
                Err(e) => {
                    warn!("Failed to copy {}: {}", source.display(), e);
                    log.append(&format!("Failed to copy {}: {}", rel.display(), e))?;
                }
            }
        }
        Ok(processed)
    }

    fn copy_item(&self, source: &Path, dest: &Path) -> Result<()> {
        if self.files.is_dir(source)? {
            self.files.create_dir(dest)
        } else {
            let contents = self.files.read(source)?;
            self.files.write(dest, &contents)
        }
    }

    fn tables_batch(&self, ctx: &JobContext, manifest: &Manifest, log: &JobLog, state: &mut BackupState) -> Result<usize> {
        let Some((table, offset)) = state.pending_tables.iter().next().map(|(t, o)| (t.clone(), *o)) else {
            return Ok(0);
        };

        let dump = ctx.paths.dump();
        truncate_dump(&dump, state.dump_len)?;

        let exporter = TableDumpExporter::new(self.rows.as_ref(), &dump, self.settings.batch.table_page);
        let outcome = exporter.export_page(manifest, &table, offset)?;
        state.dump_len = dump_len(&dump)?;
        match outcome {
            PageOutcome::Next(next) => {
                state.pending_tables.insert(table.clone(), next);
                log.append(&format!("Dumped {table} rows {offset}..{next}"))?;
            }
            PageOutcome::Done => {
                state.pending_tables.remove(&table);
                log.append(&format!("Finished table {table}"))?;
            }
        }
        Ok(1)
    }

    fn archive_batch(&self, ctx: &JobContext, manifest: &Manifest, log: &JobLog, state: &mut BackupState) -> Result<usize> {
        let paths = &ctx.paths;

        if state.pending_archive_items.is_none() {
            self.begin_archive(ctx, log, state)?;
        } else if !paths.archive_part.exists() && paths.archive.exists() {
            // the archive was renamed into place but the checkpoint never recorded it
            self.finish_archive(ctx, log, state)?;
            return Ok(0);
        }

        let records = committed_central_records(&paths.central_sidecar, &state.archive)?;
        let mut writer = ZipWriter::resume(&paths.archive_part, state.archive.offset, records)?;
        writer.set_compression(self.settings.compression_level);

        let inactive = manifest.inactive();
        let mut processed = 0;
        let queue = state.pending_archive_items.get_or_insert_with(VecDeque::new);

        while processed < self.settings.batch.archive_items {
            let Some(item) = queue.pop_front() else {
                break;
            };
            processed += 1;

            let Some(name) = archive_name(&paths.work_dir, &item) else {
                warn!("{} is outside the working tree, skipping", item.display());
                continue;
            };
            if is_excluded(&name, &self.settings.self_prefix, &inactive) {
                debug!("Skipping {}", name);
                log.append(&format!("Skipped {name}"))?;
                continue;
            }

            let entry = match read_item(&item, &name) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to archive {}: {}", name, e);
                    log.append(&format!("Failed to archive {name}: {e}"))?;
                    continue;
                }
            };
            let added = match entry {
                (entry, None) => writer.add_empty_dir(&entry),
                (entry, Some(data)) => writer.add_data(&entry, &data),
            };
            match added {
                Ok(_) => log.append(&format!("Archived {name}"))?,
                // ZIP32 limits are checked before anything is written
                Err(e @ BackupError::ArchiveFormat(_)) => {
                    warn!("Failed to archive {}: {}", name, e);
                    log.append(&format!("Failed to archive {name}: {e}"))?;
                }
                Err(e) => return Err(e),
            }
        }

        writer.flush()?;
        let committed = state.archive.entries as usize;
        let fresh = writer.central_records()[committed..].concat();
        if !fresh.is_empty() {
            let mut sidecar = OpenOptions::new().append(true).open(&paths.central_sidecar)?;
            sidecar.write_all(&fresh)?;
            sidecar.sync_data()?;
        }
        state.archive = ArchiveCursor {
            offset: writer.offset(),
            central_len: state.archive.central_len + fresh.len() as u64,
            entries: writer.entry_count() as u64,
        };

        if queue.is_empty() {
            writer.close()?;
            self.finish_archive(ctx, log, state)?;
        }
        Ok(processed)
    }

    /// Move the closed archive to its final name and mark the job complete.
    ///
    /// Safe to repeat: a rename or sidecar removal that already happened is
    /// skipped.
    fn finish_archive(&self, ctx: &JobContext, log: &JobLog, state: &mut BackupState) -> Result<()> {
        let paths = &ctx.paths;
        if paths.archive_part.exists() {
            fs::rename(&paths.archive_part, &paths.archive)?;
        }
        match fs::remove_file(&paths.central_sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let eocd = EndOfCentralDirectory::locate(&mut fs::File::open(&paths.archive)?)?;
        state.archive.entries = u64::from(eocd.entries);
        state.pending_archive_items = Some(VecDeque::new());
        state.phase = Phase::Complete;
        stamp(&paths.manifest, "complete")?;

        info!("Job {} complete: {} ({} entries)", ctx.id, paths.archive.display(), eocd.entries);
        log.append(&format!("Backup complete: {} entries", eocd.entries))?;
        Ok(())
    }

    /// Snapshot the manifest into the working tree, queue the tree for
    /// archiving and start an empty archive.
    fn begin_archive(&self, ctx: &JobContext, log: &JobLog, state: &mut BackupState) -> Result<()> {
        let paths = &ctx.paths;
        stamp(&paths.manifest, "archive")?;
        Manifest::load(&paths.manifest)?.save(&paths.manifest_snapshot())?;

        let items: VecDeque<PathBuf> = walk_directory(&paths.work_dir, WalkOptions::default())?
            .into_iter()
            .map(|f| f.path)
            .collect();

        fs::File::create(&paths.archive_part)?;
        fs::File::create(&paths.central_sidecar)?;
        state.archive = ArchiveCursor::default();

        info!("Job {}: archiving {} working-tree items", ctx.id, items.len());
        log.append(&format!("Archiving {} items", items.len()))?;
        state.pending_archive_items = Some(items);
        Ok(())
    }
}

/// Root of the site as the file source sees it
fn source_view_root(manifest: &Manifest, settings: &MachineSettings) -> PathBuf {
    let root = manifest.source_root().unwrap_or_else(|| settings.source_root.clone());
    let chroot = manifest.chroot().unwrap_or_else(|| settings.chroot.clone());
    chroot.apply(&root)
}

/// Record when the job entered `event` in the manifest
fn stamp(manifest_path: &Path, event: &str) -> Result<()> {
    let timestamps = manifest::TIMESTAMPS;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    Manifest::update(manifest_path, &json!({ timestamps: { event: now } }))?;
    Ok(())
}

/// Central records of the committed entries; the sidecar is cut back to them
fn committed_central_records(sidecar: &Path, cursor: &ArchiveCursor) -> Result<Vec<Vec<u8>>> {
    let mut file = OpenOptions::new().read(true).write(true).open(sidecar)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < cursor.central_len {
        return Err(BackupError::ArchiveFormat(format!(
            "{} is {} bytes, expected at least {}",
            sidecar.display(),
            bytes.len(),
            cursor.central_len
        )));
    }
    bytes.truncate(cursor.central_len as usize);
    file.set_len(cursor.central_len)?;

    let records = CentralHeader::split_records(&bytes)?;
    if records.len() as u64 != cursor.entries {
        return Err(BackupError::ArchiveFormat(format!(
            "{} holds {} records, expected {}",
            sidecar.display(),
            records.len(),
            cursor.entries
        )));
    }
    Ok(records)
}

/// Cut the SQL dump back to the pages the checkpoint has committed
fn truncate_dump(dump: &Path, committed: u64) -> Result<()> {
    let file = match OpenOptions::new().write(true).open(dump) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && committed == 0 => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len < committed {
        return Err(BackupError::UnrecoverableCheckpoint {
            path: dump.to_path_buf(),
            reason: format!("dump is {len} bytes, expected at least {committed}"),
        });
    }
    if len > committed {
        debug!("Discarding {} uncommitted bytes of {}", len - committed, dump.display());
        file.set_len(committed)?;
    }
    Ok(())
}

fn dump_len(dump: &Path) -> Result<u64> {
    match fs::metadata(dump) {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Forward-slash path of `item` relative to the working tree
fn archive_name(work_dir: &Path, item: &Path) -> Option<String> {
    let rel = item.strip_prefix(work_dir).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_excluded(name: &str, self_prefix: &str, inactive: &[String]) -> bool {
    let under = |prefix: &str| {
        let prefix = prefix.trim_matches('/');
        !prefix.is_empty() && (name == prefix || name.starts_with(&format!("{prefix}/")))
    };
    under(self_prefix) || inactive.iter().any(|p| under(p))
}

/// Entry metadata and, for files, the content
fn read_item(item: &Path, name: &str) -> std::io::Result<(ArchiveEntry, Option<Vec<u8>>)> {
    let entry = entry_from_path(item, name)?;
    if entry.is_dir() {
        Ok((entry, None))
    } else {
        let data = fs::read(item)?;
        Ok((entry, Some(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ExtractOptions, Strip, ZipReader};
    use crate::job::JobId;
    use rusqlite::Connection;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let site = temp_dir.path().join("site");
            fs::create_dir_all(site.join("wp-content/uploads/2024")).unwrap();
            fs::create_dir_all(site.join("wp-content/plugins/sitepack")).unwrap();
            fs::create_dir_all(site.join("wp-content/plugins/legacy")).unwrap();
            fs::create_dir_all(site.join("empty")).unwrap();
            fs::write(site.join("index.php"), "<?php require 'wp-blog-header.php';").unwrap();
            fs::write(site.join("wp-config.php"), "define('DB_NAME', 'site');\n".repeat(50)).unwrap();
            fs::write(site.join("wp-content/uploads/2024/logo.png"), [0u8, 1, 2, 3, 255, 254]).unwrap();
            fs::write(site.join("wp-content/plugins/sitepack/sitepack.php"), "self").unwrap();
            fs::write(site.join("wp-content/plugins/legacy/legacy.php"), "old").unwrap();

            let conn = Connection::open(temp_dir.path().join("site.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE wp_posts (id INTEGER PRIMARY KEY, title TEXT);
                 INSERT INTO wp_posts (title) VALUES ('hello'), ('it''s'), ('third');
                 CREATE TABLE wp_users (id INTEGER PRIMARY KEY, login TEXT);
                 INSERT INTO wp_users (login) VALUES ('admin');
                 CREATE TABLE wp_sitemeta (k TEXT);
                 INSERT INTO wp_sitemeta VALUES ('network');
                 CREATE TABLE wp2_posts (id INTEGER);",
            )
            .unwrap();

            Self { temp_dir }
        }

        fn settings(&self, batch: usize, tick_budget: Duration) -> MachineSettings {
            let root = self.temp_dir.path();
            MachineSettings {
                data_dir: root.join(format!("data-{batch}")),
                source_root: root.join("site"),
                chroot: ChrootMap::identity(root.join("site")),
                table_prefix: "wp_".to_string(),
                self_prefix: "wp-content/plugins/sitepack".to_string(),
                inactive: vec!["wp-content/plugins/legacy".to_string()],
                batch: BatchLimits {
                    files: batch,
                    archive_items: batch,
                    table_page: 2,
                },
                tick_budget,
                compression_level: 6,
            }
        }

        fn machine(&self, settings: MachineSettings) -> BackupMachine {
            let rows = SqliteRowSource::open(
                &self.temp_dir.path().join("site.db"),
                TableClassifier::new("wp_", vec!["wp_sitemeta".to_string()]),
            )
            .unwrap();
            BackupMachine::new(settings, Box::new(LocalFileSource::new()), Box::new(rows))
        }

        fn unbounded(&self) -> BackupMachine {
            self.machine(self.settings(1000, Duration::from_secs(3600)))
        }
    }

    fn job(machine: &BackupMachine) -> JobContext {
        machine.context(JobId::parse("job1").unwrap())
    }

    fn run_to_completion(machine: &BackupMachine, ctx: &JobContext) -> Result<usize> {
        let mut ticks = 0;
        loop {
            ticks += 1;
            if machine.resume(ctx)?.complete {
                return Ok(ticks);
            }
            assert!(ticks < 1000, "job did not finish");
        }
    }

    fn tree(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        walk_directory(root, WalkOptions::default())
            .unwrap()
            .into_iter()
            .map(|f| {
                let name = archive_name(root, &f.path).unwrap();
                let data = if f.is_dir { None } else { Some(fs::read(&f.path).unwrap()) };
                (name, data)
            })
            .collect()
    }

    /// Tick until the tables are dumped, then scan the working tree
    fn enter_archive(machine: &BackupMachine, ctx: &JobContext) -> Result<BackupState> {
        let mut state = loop {
            machine.resume(ctx)?;
            let state = machine.status(ctx)?.unwrap();
            if state.phase == Phase::Archive {
                break state;
            }
        };
        machine.begin_archive(ctx, &JobLog::new(&ctx.paths.log), &mut state)?;
        state.save(&ctx.paths.checkpoint)?;
        Ok(state)
    }

    #[test]
    fn test_end_to_end() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.unbounded();
        let ctx = job(&machine);

        machine.start(&ctx, &[])?;
        let report = machine.resume(&ctx)?;
        assert!(report.complete);
        assert_eq!(report.phase, Phase::Complete);
        assert!(ctx.paths.archive.exists());
        assert!(!ctx.paths.archive_part.exists());
        assert!(!ctx.paths.central_sidecar.exists());

        let entries = ZipReader::open(&ctx.paths.archive)?.list_entries()?;
        let names: HashSet<&str> = entries.iter().map(|e| e.path()).collect();
        assert!(names.contains("index.php"));
        assert!(names.contains("wp-content/uploads/2024/logo.png"));
        assert!(names.contains("database.sql"));
        assert!(names.contains("backup-manifest.json"));
        assert!(entries.iter().any(|e| e.path() == "empty" && e.is_dir()));
        assert!(!names.iter().any(|n| n.starts_with("wp-content/plugins/sitepack")));
        assert!(!names.iter().any(|n| n.starts_with("wp-content/plugins/legacy")));

        let out = fixture.temp_dir.path().join("restored");
        ZipReader::open(&ctx.paths.archive)?.extract(&out, &ExtractOptions::new(Strip::None, None, None)?)?;
        assert_eq!(fs::read(out.join("wp-config.php"))?, fs::read(fixture.temp_dir.path().join("site/wp-config.php"))?);

        let sql = fs::read_to_string(out.join("database.sql"))?;
        assert!(sql.contains("DROP TABLE IF EXISTS `wp_posts`;"));
        assert!(sql.contains("('2', 'it''s')"));
        assert!(sql.contains("INSERT INTO `wp_users`"));
        assert!(!sql.contains("wp_sitemeta"));
        assert!(!sql.contains("wp2_posts"));

        let snapshot = Manifest::load(&out.join("backup-manifest.json"))?;
        assert_eq!(snapshot.table_prefix(), "wp_");
        assert!(snapshot.as_json()[manifest::TIMESTAMPS].get("archive").is_some());
        Ok(())
    }

    #[test]
    fn test_single_item_ticks_match_unbounded_run() -> Result<()> {
        let fixture = Fixture::new();

        let unbounded = fixture.unbounded();
        let ctx_a = job(&unbounded);
        unbounded.start(&ctx_a, &[])?;
        unbounded.resume(&ctx_a)?;

        // a zero budget stops every tick after its single batch
        let stepped = fixture.machine(fixture.settings(1, Duration::ZERO));
        let ctx_b = job(&stepped);
        stepped.start(&ctx_b, &[])?;
        let mut ticks = 0;
        while stepped.status(&ctx_b)?.map(|s| s.phase) == Some(Phase::Files) {
            let report = stepped.resume(&ctx_b)?;
            assert_eq!(report.batches, 1);
            assert!(report.processed <= 1);
            ticks += 1;
        }
        assert!(ticks > 5);

        // working tree as it stood when the files phase finished
        let mut files_a = tree(&ctx_a.paths.work_dir);
        files_a.remove("database.sql");
        files_a.remove("backup-manifest.json");
        assert_eq!(tree(&ctx_b.paths.work_dir), files_a);

        run_to_completion(&stepped, &ctx_b)?;
        let list = |path: &Path| -> Result<Vec<(String, u64)>> {
            Ok(ZipReader::open(path)?
                .list_entries()?
                .into_iter()
                .map(|e| (e.path().to_string(), e.size))
                .collect())
        };
        let mut a = list(&ctx_a.paths.archive)?;
        let mut b = list(&ctx_b.paths.archive)?;
        a.sort();
        b.sort();
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_items_processed_at_most_once() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(2, Duration::ZERO));
        let ctx = job(&machine);

        machine.start(&ctx, &[])?;
        run_to_completion(&machine, &ctx)?;

        let extra = machine.resume(&ctx)?;
        assert!(extra.complete);
        assert_eq!(extra.batches, 0);
        assert_eq!(extra.processed, 0);

        let messages = JobLog::new(&ctx.paths.log).messages()?;
        for verb in ["Copied ", "Archived ", "Finished table "] {
            let lines: Vec<&String> = messages.iter().filter(|m| m.starts_with(verb)).collect();
            let unique: HashSet<&&String> = lines.iter().collect();
            assert!(!lines.is_empty(), "{verb}");
            assert_eq!(unique.len(), lines.len(), "{verb}");
        }
        Ok(())
    }

    #[test]
    fn test_unreadable_file_is_dropped() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.unbounded();
        let ctx = job(&machine);

        let mut state = machine.start(&ctx, &[])?;
        let ghost = fixture.temp_dir.path().join("site/ghost.txt");
        state.pending_files.push_front(ghost);
        state.save(&ctx.paths.checkpoint)?;

        let report = machine.resume(&ctx)?;
        assert!(report.complete);
        let messages = JobLog::new(&ctx.paths.log).messages()?;
        assert!(messages.iter().any(|m| m.starts_with("Failed to copy ghost.txt")));
        assert!(messages.iter().any(|m| m == "Copied index.php"));
        Ok(())
    }

    #[test]
    fn test_archive_survives_interrupted_batch() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(2, Duration::ZERO));
        let ctx = job(&machine);
        machine.start(&ctx, &[])?;

        // run until the archive has committed some entries
        loop {
            machine.resume(&ctx)?;
            let state = machine.status(&ctx)?.unwrap();
            if state.phase == Phase::Archive && state.archive.entries > 0 {
                break;
            }
        }

        // a batch that wrote but died before its checkpoint was persisted
        let checkpoint = fs::read(&ctx.paths.checkpoint)?;
        machine.resume(&ctx)?;
        fs::write(&ctx.paths.checkpoint, checkpoint)?;
        for path in [&ctx.paths.archive_part, &ctx.paths.central_sidecar] {
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(b"torn half-written entry")?;
        }

        run_to_completion(&machine, &ctx)?;

        let entries = ZipReader::open(&ctx.paths.archive)?.list_entries()?;
        let names: Vec<&str> = entries.iter().map(|e| e.path()).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());

        let unbounded = fixture.unbounded();
        let reference = job(&unbounded);
        unbounded.start(&reference, &[])?;
        unbounded.resume(&reference)?;
        let expected = ZipReader::open(&reference.paths.archive)?.list_entries()?.len();
        assert_eq!(names.len(), expected);

        let out = fixture.temp_dir.path().join("restored");
        ZipReader::open(&ctx.paths.archive)?.extract(&out, &ExtractOptions::new(Strip::None, None, None)?)?;
        assert_eq!(fs::read(out.join("wp-content/uploads/2024/logo.png"))?, [0u8, 1, 2, 3, 255, 254]);
        Ok(())
    }

    #[test]
    fn test_table_dump_survives_interrupted_batch() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(2, Duration::ZERO));
        let ctx = job(&machine);
        machine.start(&ctx, &[])?;

        loop {
            machine.resume(&ctx)?;
            let state = machine.status(&ctx)?.unwrap();
            let first = state.pending_tables.first_key_value().map(|(t, o)| (t.as_str(), *o));
            if state.phase == Phase::Tables && first == Some(("wp_posts", 0)) {
                break;
            }
            assert!(state.phase <= Phase::Tables, "wp_posts was never reached");
        }

        // a page appended but never checkpointed, then a torn write
        let checkpoint = fs::read(&ctx.paths.checkpoint)?;
        machine.resume(&ctx)?;
        fs::write(&ctx.paths.checkpoint, checkpoint)?;
        let mut dump = OpenOptions::new().append(true).open(ctx.paths.dump())?;
        dump.write_all(b"INSERT INTO `wp_posts` VALUES (torn")?;
        drop(dump);

        run_to_completion(&machine, &ctx)?;

        let sql = fs::read_to_string(ctx.paths.dump())?;
        assert_eq!(sql.matches("DROP TABLE IF EXISTS `wp_posts`;").count(), 1);
        assert_eq!(sql.matches("'hello'").count(), 1);
        assert!(!sql.contains("(torn"));

        let unbounded = fixture.unbounded();
        let reference = job(&unbounded);
        unbounded.start(&reference, &[])?;
        unbounded.resume(&reference)?;
        assert_eq!(sql, fs::read_to_string(reference.paths.dump())?);
        Ok(())
    }

    #[test]
    fn test_completion_survives_lost_checkpoint() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(2, Duration::ZERO));
        let ctx = job(&machine);
        machine.start(&ctx, &[])?;

        // stop right before the batch that closes the archive
        loop {
            machine.resume(&ctx)?;
            let state = machine.status(&ctx)?.unwrap();
            if state.phase == Phase::Archive && state.pending_archive_items.as_ref().is_some_and(|q| q.len() <= 2) {
                break;
            }
        }

        // the archive was renamed into place, then the process died
        let checkpoint = fs::read(&ctx.paths.checkpoint)?;
        assert!(machine.resume(&ctx)?.complete);
        fs::write(&ctx.paths.checkpoint, checkpoint)?;
        fs::write(&ctx.paths.central_sidecar, b"stale")?;
        assert!(!ctx.paths.archive_part.exists());

        let report = machine.resume(&ctx)?;
        assert!(report.complete);
        assert_eq!(report.processed, 0);
        assert!(!ctx.paths.central_sidecar.exists());

        let entries = ZipReader::open(&ctx.paths.archive)?.list_entries()?;
        let state = machine.status(&ctx)?.unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert_eq!(state.archive.entries as usize, entries.len());

        let unbounded = fixture.unbounded();
        let reference = job(&unbounded);
        unbounded.start(&reference, &[])?;
        unbounded.resume(&reference)?;
        assert_eq!(entries.len(), ZipReader::open(&reference.paths.archive)?.list_entries()?.len());

        let bytes = machine.fetch(&ctx)?;
        assert_eq!(&bytes[..4], b"PK\x03\x04");
        Ok(())
    }

    #[test]
    fn test_entry_limit_drops_remaining_items() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(1000, Duration::ZERO));
        let ctx = job(&machine);
        machine.start(&ctx, &[])?;
        let mut state = enter_archive(&machine, &ctx)?;

        // an archive that is already full
        let mut writer = ZipWriter::create(&ctx.paths.archive_part)?;
        for i in 0..u16::MAX {
            writer.add_empty_dir(&ArchiveEntry::directory(&format!("filler/{i}")))?;
        }
        writer.flush()?;
        let central = writer.central_records().concat();
        fs::write(&ctx.paths.central_sidecar, &central)?;
        state.archive = ArchiveCursor {
            offset: writer.offset(),
            central_len: central.len() as u64,
            entries: u64::from(u16::MAX),
        };
        drop(writer);
        state.save(&ctx.paths.checkpoint)?;

        let report = machine.resume(&ctx)?;
        assert!(report.complete);

        let messages = JobLog::new(&ctx.paths.log).messages()?;
        assert!(messages.iter().any(|m| m.starts_with("Failed to archive index.php: ")));
        assert!(!messages.iter().any(|m| m == "Archived index.php"));

        let eocd = EndOfCentralDirectory::locate(&mut fs::File::open(&ctx.paths.archive)?)?;
        assert_eq!(eocd.entries, u16::MAX);
        Ok(())
    }

    #[test]
    fn test_vanished_item_is_dropped_from_archive() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(1000, Duration::ZERO));
        let ctx = job(&machine);
        machine.start(&ctx, &[])?;
        enter_archive(&machine, &ctx)?;

        fs::remove_file(ctx.paths.work_dir.join("index.php"))?;
        assert!(machine.resume(&ctx)?.complete);

        let messages = JobLog::new(&ctx.paths.log).messages()?;
        assert!(messages.iter().any(|m| m.starts_with("Failed to archive index.php: ")));
        assert!(messages.iter().any(|m| m == "Archived wp-config.php"));

        let entries = ZipReader::open(&ctx.paths.archive)?.list_entries()?;
        let names: HashSet<&str> = entries.iter().map(|e| e.path()).collect();
        assert!(!names.contains("index.php"));
        assert!(names.contains("wp-config.php"));
        assert!(names.contains("database.sql"));
        Ok(())
    }

    #[test]
    fn test_fetch_then_cleanup() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.machine(fixture.settings(1, Duration::ZERO));
        let ctx = job(&machine);

        assert!(matches!(machine.fetch(&ctx), Err(BackupError::JobNotFound(_))));
        machine.start(&ctx, &[])?;
        machine.resume(&ctx)?;
        assert!(matches!(machine.fetch(&ctx), Err(BackupError::NotComplete(_))));

        run_to_completion(&machine, &ctx)?;
        let bytes = machine.fetch(&ctx)?;
        assert_eq!(&bytes[..4], b"PK\x03\x04");

        assert!(!ctx.paths.work_dir.exists());
        for path in ctx.paths.files() {
            assert!(!path.exists(), "{}", path.display());
        }
        Ok(())
    }

    #[test]
    fn test_resume_without_checkpoint_starts_job() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.unbounded();
        let ctx = job(&machine);

        let report = machine.resume(&ctx)?;
        assert!(report.complete);
        assert!(ctx.paths.archive.exists());
        Ok(())
    }

    #[test]
    fn test_corrupt_checkpoint_fails_visibly() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.unbounded();
        let ctx = job(&machine);

        machine.start(&ctx, &[])?;
        fs::write(&ctx.paths.checkpoint, b"{\"phase\": 42")?;
        let err = machine.resume(&ctx).unwrap_err();
        assert!(matches!(err, BackupError::UnrecoverableCheckpoint { .. }), "{err}");
        // nothing was restarted behind our back
        assert_eq!(fs::read(&ctx.paths.checkpoint)?, b"{\"phase\": 42");
        Ok(())
    }

    #[test]
    fn test_extra_inactive_trees() -> Result<()> {
        let fixture = Fixture::new();
        let machine = fixture.unbounded();
        let ctx = job(&machine);

        machine.start(&ctx, &["wp-content/uploads".to_string()])?;
        machine.resume(&ctx)?;

        let entries = ZipReader::open(&ctx.paths.archive)?.list_entries()?;
        assert!(!entries.iter().any(|e| e.path().starts_with("wp-content/uploads")));
        assert!(entries.iter().any(|e| e.path() == "wp-content"));
        Ok(())
    }

    #[test]
    fn test_exclusion_rules() {
        let inactive = vec!["wp-content/plugins/legacy".to_string()];
        assert!(is_excluded("wp-content/plugins/legacy", "", &inactive));
        assert!(is_excluded("wp-content/plugins/legacy/a.php", "", &inactive));
        assert!(!is_excluded("wp-content/plugins/legacy2/a.php", "", &inactive));
        assert!(is_excluded("tools/sp/x", "tools/sp/", &inactive));
        assert!(!is_excluded("index.php", "", &[]));
    }
}

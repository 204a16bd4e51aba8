//! Configuration management for sitepack.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`SITEPACK__<SECTION>__<KEY>`, e.g. `SITEPACK__BATCH__FILES=50`).

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub source: SourceConfig,
    pub database: DatabaseConfig,
    pub batch: BatchConfig,
    pub archive: ArchiveConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Where job working trees, checkpoints and archives live
    pub data_dir: PathBuf,

    /// HTTP server port
    pub port: u16,

    /// Bearer token required by the job endpoints
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root of the site tree to back up
    pub root: PathBuf,

    /// The site's own idea of its base directory
    pub base_dir: Option<PathBuf>,

    /// Where that base directory is exposed to us, when it differs
    pub chroot_base_dir: Option<PathBuf>,

    /// Site-relative path of sitepack's own files, never archived.
    /// Set it to an empty string to archive everything.
    pub self_prefix: String,

    /// Site-relative trees that are disabled and left out of the archive
    pub inactive: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Prefix of the tables owned by this site
    pub table_prefix: String,

    /// Tables shared by every site of the installation
    pub global_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Files copied per batch
    pub files: usize,

    /// Working-tree items archived per batch
    pub archive_items: usize,

    /// Rows per table page
    pub table_page: u64,

    /// Wall-clock budget of one tick
    pub tick_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// 0 stores entries, 1-9 deflate
    pub compression_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/sitepack"),
            port: 9990,
            token: String::new(),
        }
    }
}

/// Where sitepack lives when installed as a site plugin
pub const DEFAULT_SELF_PREFIX: &str = "wp-content/plugins/sitepack";

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/www/html"),
            base_dir: None,
            chroot_base_dir: None,
            self_prefix: DEFAULT_SELF_PREFIX.to_string(),
            inactive: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sitepack/site.db"),
            table_prefix: "wp_".to_string(),
            global_tables: Vec::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            files: 100,
            archive_items: 100,
            table_page: crate::dump::DEFAULT_PAGE_SIZE,
            tick_seconds: 20,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: crate::archive::writer::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the optional file, then `SITEPACK__` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SITEPACK")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("source.inactive")
                .with_list_parse_key("database.global_tables"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive.compression_level > 9 {
            return Err(BackupError::Config(format!(
                "compression_level must be 0-9, got {}",
                self.archive.compression_level
            )));
        }
        if self.batch.files == 0 || self.batch.archive_items == 0 || self.batch.table_page == 0 {
            return Err(BackupError::Config("batch sizes must be greater than zero".to_string()));
        }
        Ok(())
    }
}

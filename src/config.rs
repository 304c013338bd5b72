use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default maximum file size: 2 GiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Default cap on chunks per session.
pub const DEFAULT_MAX_CHUNKS: u32 = 10_000;

/// Settings consumed by the upload core. The core never reads the
/// environment itself; everything it needs arrives through this struct.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Root for session chunk directories and assembly scratch files.
    pub temp_dir: PathBuf,
    /// Root of the content-addressed blob tree.
    pub blob_dir: PathBuf,
    /// Chunk size used when the client does not request one.
    pub chunk_size: u64,
    /// Upper bound on a declared or streamed file size.
    pub max_file_size: u64,
    /// Most chunks a single session may be split into.
    pub max_chunks: u32,
    /// Advisory only; handed to clients in the session descriptor.
    pub max_concurrent_chunks: u32,
    pub session_timeout: Duration,
    /// How long a completed session stays queryable.
    pub completed_retention: Duration,
    /// How long a soft-deleted file is kept before it is purged.
    pub deleted_file_grace: Duration,
    pub reaper_interval: std::time::Duration,
    /// Contexts whose files are public.
    pub public_contexts: Vec<String>,
    /// Assemble in the background as soon as the last chunk lands.
    pub auto_complete: bool,
}

impl UploadSettings {
    /// Defaults rooted at `base`: chunks under `base/tmp`, blobs under `base/blobs`.
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            temp_dir: base.join("tmp"),
            blob_dir: base.join("blobs"),
            ..Self::default()
        }
    }

    pub fn is_public_context(&self, context: &str) -> bool {
        self.public_contexts.iter().any(|c| c == context)
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./data/tmp"),
            blob_dir: PathBuf::from("./data/blobs"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_concurrent_chunks: 5,
            session_timeout: Duration::hours(24),
            completed_retention: Duration::hours(1),
            deleted_file_grace: Duration::days(7),
            reaper_interval: std::time::Duration::from_secs(300),
            public_contexts: vec!["public".to_string()],
            auto_complete: true,
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub upload: UploadSettings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable, deduplicating file upload service")]
pub struct Args {
    /// Host to bind to (overrides DEPOT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEPOT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides DEPOT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory holding content-addressed blobs (overrides DEPOT_BLOB_DIR)
    #[arg(long)]
    pub blob_dir: Option<PathBuf>,

    /// Directory holding in-flight chunks (overrides DEPOT_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Default chunk size in bytes (overrides DEPOT_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Maximum file size in bytes (overrides DEPOT_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Session timeout in seconds (overrides DEPOT_SESSION_TIMEOUT_SECS)
    #[arg(long)]
    pub session_timeout_secs: Option<i64>,

    /// Reaper interval in seconds (overrides DEPOT_REAPER_INTERVAL_SECS)
    #[arg(long)]
    pub reaper_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = UploadSettings::default();

        // --- Environment fallback ---
        let env_host = env::var("DEPOT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("DEPOT_PORT", 3000u16)?;
        let env_db = env::var("DEPOT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/depot.db".into());
        let env_blob = env_or("DEPOT_BLOB_DIR", defaults.blob_dir.clone())?;
        let env_temp = env_or("DEPOT_TEMP_DIR", defaults.temp_dir.clone())?;
        let env_chunk = env_or("DEPOT_CHUNK_SIZE", defaults.chunk_size)?;
        let env_max = env_or("DEPOT_MAX_FILE_SIZE", defaults.max_file_size)?;
        let env_max_chunks = env_or("DEPOT_MAX_CHUNKS", defaults.max_chunks)?;
        let env_concurrent = env_or("DEPOT_MAX_CONCURRENT_CHUNKS", defaults.max_concurrent_chunks)?;
        let env_timeout = env_or(
            "DEPOT_SESSION_TIMEOUT_SECS",
            defaults.session_timeout.num_seconds(),
        )?;
        let env_retention = env_or(
            "DEPOT_COMPLETED_RETENTION_SECS",
            defaults.completed_retention.num_seconds(),
        )?;
        let env_grace = env_or(
            "DEPOT_DELETED_GRACE_SECS",
            defaults.deleted_file_grace.num_seconds(),
        )?;
        let env_interval = env_or(
            "DEPOT_REAPER_INTERVAL_SECS",
            defaults.reaper_interval.as_secs(),
        )?;
        let public_contexts = match env::var("DEPOT_PUBLIC_CONTEXTS") {
            Ok(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => defaults.public_contexts.clone(),
        };

        // --- Merge ---
        let upload = UploadSettings {
            temp_dir: args.temp_dir.unwrap_or(env_temp),
            blob_dir: args.blob_dir.unwrap_or(env_blob),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            max_file_size: args.max_file_size.unwrap_or(env_max),
            max_chunks: env_max_chunks,
            max_concurrent_chunks: env_concurrent,
            session_timeout: Duration::seconds(args.session_timeout_secs.unwrap_or(env_timeout)),
            completed_retention: Duration::seconds(env_retention),
            deleted_file_grace: Duration::seconds(env_grace),
            reaper_interval: std::time::Duration::from_secs(
                args.reaper_interval_secs.unwrap_or(env_interval),
            ),
            public_contexts,
            auto_complete: true,
        };

        if upload.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if upload.max_chunks == 0 {
            anyhow::bail!("max chunks must be positive");
        }
        if upload.reaper_interval.is_zero() {
            anyhow::bail!("reaper interval must be positive");
        }

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            upload,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an environment variable, falling back when it is unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_settings() {
        let settings = UploadSettings::rooted_at("/srv/depot");
        assert_eq!(settings.temp_dir, PathBuf::from("/srv/depot/tmp"));
        assert_eq!(settings.blob_dir, PathBuf::from("/srv/depot/blobs"));
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_public_contexts() {
        let settings = UploadSettings::default();
        assert!(settings.is_public_context("public"));
        assert!(!settings.is_public_context("avatars"));
    }
}

//! Packaging of a staging directory into a single archive file.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors raised while producing an archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error while archiving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("staging conversion failed: {0}")]
    Conversion(String),
}

/// Container written for an export run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Uncompressed tar
    #[default]
    Tar,
    /// Gzip-compressed tar
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "application/x-tar",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }
}

/// Strategy that packages a directory tree into one file
#[async_trait]
pub trait Archiver: Send + Sync {
    /// File extension of produced archives, without the leading dot
    fn extension(&self) -> &str;

    /// MIME type used when the archive is uploaded
    fn content_type(&self) -> &str;

    /// Archive the contents of `source_dir` into `dest`, entries relative to `source_dir`
    async fn archive(&self, source_dir: &Path, dest: &Path) -> Result<(), ArchiveError>;
}

/// Optional rewrite of the staged tree that runs right before archiving
#[async_trait]
pub trait StagingConverter: Send + Sync {
    async fn convert(&self, staging_dir: &Path) -> Result<(), ArchiveError>;
}

/// Tar archiver, optionally gzip-compressed
#[derive(Debug, Clone, Copy, Default)]
pub struct TarArchiver {
    format: ArchiveFormat,
}

impl TarArchiver {
    pub fn new(format: ArchiveFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    fn extension(&self) -> &str {
        self.format.extension()
    }

    fn content_type(&self) -> &str {
        self.format.content_type()
    }

    #[instrument(skip(self), fields(format = ?self.format))]
    async fn archive(&self, source_dir: &Path, dest: &Path) -> Result<(), ArchiveError> {
        let format = self.format;
        let source_dir = source_dir.to_path_buf();
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || write_archive(format, &source_dir, &dest)).await?
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_archive(format: ArchiveFormat, source_dir: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::create(dest).map_err(io_err(dest))?;

    match format {
        ArchiveFormat::Tar => {
            let mut builder = tar::Builder::new(file);
            append_tree(&mut builder, source_dir, source_dir)?;
            builder.into_inner().map_err(io_err(dest))?.flush().map_err(io_err(dest))?;
        }
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_tree(&mut builder, source_dir, source_dir)?;
            builder
                .into_inner()
                .map_err(io_err(dest))?
                .finish()
                .map_err(io_err(dest))?
                .flush()
                .map_err(io_err(dest))?;
        }
    }

    debug!(dest = %dest.display(), "Archive written");
    Ok(())
}

/// Append every entry under `dir` with names relative to `root`, sorted for stable output
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
) -> Result<(), ArchiveError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(dir))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = path.strip_prefix(root).unwrap_or(&path);
        let file_type = entry.file_type().map_err(io_err(&path))?;

        if file_type.is_dir() {
            builder.append_dir(name, &path).map_err(io_err(&path))?;
            append_tree(builder, root, &path)?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(&path, name)
                .map_err(io_err(&path))?;
        }
    }

    Ok(())
}

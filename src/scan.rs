//! Directory listing and file reads, behind the [`FileSource`] trait so the
//! index manager can be driven by something other than the local disk.
//!
//! [`FsSource`] walks a source root with `walkdir` and filters relative
//! paths through include and exclude glob sets. `.git`, `node_modules` and
//! `target` directories are always excluded.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;

/// A file found by a listing, before its content is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Unix seconds.
    pub modified: i64,
}

#[async_trait]
pub trait FileSource: Send + Sync {
    /// List the files of one source, sorted by path. A root that does not
    /// exist lists as empty; any other failure to read the root is an error.
    async fn list(&self, source: &SourceConfig) -> Result<Vec<ScannedFile>>;

    async fn read(&self, path: &Path) -> Result<String>;
}

/// Local filesystem source.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSource;

#[async_trait]
impl FileSource for FsSource {
    async fn list(&self, source: &SourceConfig) -> Result<Vec<ScannedFile>> {
        let source = source.clone();
        tokio::task::spawn_blocking(move || scan_dir(&source))
            .await
            .context("directory scan task failed")?
    }

    /// Invalid UTF-8 is replaced with U+FFFD rather than failing the file.
    async fn read(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %path.display(), "file is not valid UTF-8, decoding lossily");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        })
    }
}

pub fn scan_dir(source: &SourceConfig) -> Result<Vec<ScannedFile>> {
    let root = &source.root;
    if !root.exists() {
        debug!(root = %root.display(), "source root does not exist, nothing to scan");
        return Ok(Vec::new());
    }

    let include_set = build_globset(&source.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ];
    default_excludes.extend(source.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(source.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                bail!("Failed to scan {}: {}", root.display(), e);
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy();

        if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping file without metadata");
                continue;
            }
        };
        let modified = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        files.push(ScannedFile {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            modified,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

//! Aggregate-only input from recorded entry files
//!
//! A replay directory holds `*.jsonl` files with one JSON `Entry` per line.
//! Files are read in name order; lines keep their order within a file.

use crate::{Result, TapscopeError};
use std::path::{Path, PathBuf};
use tapscope_common::Entry;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EXTENSIONS: &[&str] = &["jsonl", "ndjson"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    pub files: usize,
    pub entries: u64,
    pub malformed: u64,
}

pub struct EntryReader {
    dir: PathBuf,
}

impl EntryReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Entry files in the directory, sorted by name
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let read_dir = std::fs::read_dir(&self.dir).map_err(|e| {
            TapscopeError::ConfigError(format!(
                "cannot read replay directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        for dir_entry in read_dir {
            let path = dir_entry?.path();
            if path.is_file() && has_entry_extension(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Send every recorded entry to `output`.
    ///
    /// Stops early when `output` closes or `cancel` fires.
    pub async fn run(
        self,
        output: mpsc::Sender<Entry>,
        cancel: CancellationToken,
    ) -> Result<ReplaySummary> {
        let files = self.files()?;
        info!(dir = %self.dir.display(), files = files.len(), "Replaying recorded entries");

        let mut summary = ReplaySummary::default();
        for path in files {
            summary.files += 1;
            let mut lines = BufReader::new(File::open(&path).await?).lines();
            let mut line_no = 0usize;

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => return Ok(summary),
                    line = lines.next_line() => line?,
                };
                let Some(line) = line else {
                    break;
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<Entry>(&line) {
                    Ok(entry) => {
                        if output.send(entry).await.is_err() {
                            return Ok(summary);
                        }
                        summary.entries += 1;
                    }
                    Err(e) => {
                        summary.malformed += 1;
                        warn!(file = %path.display(), line = line_no, "Skipping malformed entry: {}", e);
                    }
                }
            }
            debug!(file = %path.display(), "Replay file done");
        }

        info!(
            entries = summary.entries,
            malformed = summary.malformed,
            "Replay finished"
        );
        Ok(summary)
    }
}

fn has_entry_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext))
}

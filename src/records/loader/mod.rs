
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use csv::{ErrorKind, ReaderBuilder, StringRecord};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{Document, RawRecord, normalize};
use crate::{RecallError, Result};

/// Counters collected while reading an archive folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub files_found: usize,
    pub files_failed: usize,
    pub records_read: usize,
    /// Rows that could not be split into the header's columns
    pub malformed: usize,
    pub accepted: usize,
    /// Rejected records keyed by [`super::Rejection::code`]
    pub rejected: BTreeMap<&'static str, usize>,
}

impl LoadReport {
    #[inline]
    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct LoadedArchive {
    pub documents: Vec<Document>,
    pub report: LoadReport,
}

/// Reads every `*.csv` file below a directory and normalizes its rows.
#[derive(Debug, Clone)]
pub struct ArchiveLoader {
    root: PathBuf,
    limit: Option<usize>,
}

impl ArchiveLoader {
    #[inline]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            limit: None,
        }
    }

    /// Stop once this many documents have been accepted.
    #[inline]
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    #[inline]
    pub fn load(&self) -> Result<LoadedArchive> {
        if !self.root.is_dir() {
            return Err(RecallError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("archive directory not found: {}", self.root.display()),
            )));
        }

        let files = self.discover_files();
        info!(
            "Found {} CSV files under {}",
            files.len(),
            self.root.display()
        );

        let mut report = LoadReport {
            files_found: files.len(),
            ..LoadReport::default()
        };
        let mut documents = Vec::new();

        for path in files {
            if self.limit_reached(documents.len()) {
                debug!("Record limit reached, skipping remaining files");
                break;
            }

            let (documents_before, report_before) = (documents.len(), report.clone());
            if let Err(e) = self.load_file(&path, &mut documents, &mut report) {
                warn!("Skipping {}: {}", path.display(), e);
                documents.truncate(documents_before);
                report = LoadReport {
                    files_failed: report_before.files_failed + 1,
                    ..report_before
                };
                continue;
            }

            info!(
                "Loaded {}: {} records read, {} accepted",
                path.display(),
                report.records_read - report_before.records_read,
                report.accepted - report_before.accepted
            );
        }

        info!(
            "Archive loaded: {} records read, {} accepted, {} rejected, {} malformed",
            report.records_read,
            report.accepted,
            report.total_rejected(),
            report.malformed
        );

        Ok(LoadedArchive { documents, report })
    }

    fn discover_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
            })
            .collect()
    }

    fn limit_reached(&self, accepted: usize) -> bool {
        self.limit.is_some_and(|limit| accepted >= limit)
    }

    fn load_file(
        &self,
        path: &Path,
        documents: &mut Vec<Document>,
        report: &mut LoadReport,
    ) -> Result<()> {
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Flexible so a row with the wrong field count is reported instead of ending the file.
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| csv_error("Failed to open CSV", e))?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| csv_error("Failed to read CSV header", e))?
            .iter()
            .map(|name| name.trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        if columns.iter().all(String::is_empty) {
            debug!("{} has no columns", path.display());
            return Ok(());
        }

        let mut row = StringRecord::new();
        while !self.limit_reached(documents.len()) {
            match reader.read_record(&mut row) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if matches!(e.kind(), ErrorKind::Io(_)) => {
                    return Err(csv_error("Failed to read CSV", e));
                }
                Err(e) => {
                    debug!("Malformed row in {}: {}", path.display(), e);
                    report.records_read += 1;
                    report.malformed += 1;
                    continue;
                }
            }
            report.records_read += 1;

            if row.len() > columns.len() {
                debug!(
                    "Malformed row in {} at line {}: expected {} fields, got {}",
                    path.display(),
                    row.position().map_or(0, csv::Position::line),
                    columns.len(),
                    row.len()
                );
                report.malformed += 1;
                continue;
            }

            // Short rows leave the trailing columns absent.
            let record = RawRecord::from_pairs(
                &source,
                columns.iter().map(String::as_str).zip(row.iter()),
            );
            match normalize(&record) {
                Ok(document) => {
                    report.accepted += 1;
                    documents.push(document);
                }
                Err(rejection) => {
                    *report.rejected.entry(rejection.code()).or_default() += 1;
                }
            }
        }

        Ok(())
    }
}

fn csv_error(context: &str, error: csv::Error) -> RecallError {
    RecallError::Other(anyhow::anyhow!("{context}: {error}"))
}

use ahash::{AHashMap, AHashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::models::{ManifestHeader, Record, MANIFEST_META_KEY};
use super::resume::ResumeIndex;
use super::writer::{ManifestWriter, RecordSink};
use crate::error::Error;

/// Where a read stopped trusting the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedTail {
    /// 1-based line number of the first unparseable entry.
    pub line: usize,
    /// Byte offset where that line starts.
    pub offset: u64,
    /// Bytes from `offset` to the end of the file.
    pub bytes: u64,
    pub reason: String,
}

/// Everything recoverable from a manifest file.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub header: Option<ManifestHeader>,
    /// Records in append (completion) order.
    pub records: Vec<Record>,
    pub discarded_tail: Option<DiscardedTail>,
}

impl Manifest {
    pub fn resume_index(&self) -> ResumeIndex {
        ResumeIndex::from_records(&self.records)
    }

    /// Number of paths with at least one record; superseded versions count once.
    pub fn distinct_paths(&self) -> usize {
        self.records
            .iter()
            .map(|record| record.path.as_str())
            .collect::<AHashSet<_>>()
            .len()
    }

    /// One record per path, the last appended one winning. Sorted by path.
    pub fn into_latest(self) -> Vec<Record> {
        let mut latest: AHashMap<String, Record> = AHashMap::with_capacity(self.records.len());
        for record in self.records {
            latest.insert(record.path.clone(), record);
        }
        let mut records: Vec<Record> = latest.into_values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }
}

/// JSON-lines manifest on disk: header line, then one record per line.
///
/// One writer per path is assumed; any number of concurrent readers.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Replaces whatever is at the path with a manifest holding only `header`.
    pub fn create(&self, header: &ManifestHeader) -> Result<(), Error> {
        self.replace_atomically(header, false)?;
        info!("Created manifest {}", self.path.display());
        Ok(())
    }

    /// Swaps the header line, keeping every record line. Readers see either the
    /// old file or the new one, never a partial header.
    pub fn write_header(&self, header: &ManifestHeader) -> Result<(), Error> {
        self.replace_atomically(header, true)?;
        debug!("Rewrote header of {}", self.path.display());
        Ok(())
    }

    pub fn open_writer(&self) -> Result<ManifestWriter, Error> {
        ManifestWriter::open(&self.path)
    }

    pub fn append_batch(&self, records: &[Record]) -> Result<(), Error> {
        self.open_writer()?.append_batch(records)
    }

    pub fn open_for_resume(&self) -> Result<ResumeIndex, Error> {
        Ok(self.read_all()?.resume_index())
    }

    /// Sequential, crash-tolerant read.
    ///
    /// The first unparseable line (typically a record torn by a crash
    /// mid-append) and everything after it are treated as absent. A missing
    /// file reads as an empty manifest.
    pub fn read_all(&self) -> Result<Manifest, Error> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(err) => return Err(err.into()),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut manifest = Manifest::default();
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let mut line_no = 0usize;
        let mut seen_entry = false;

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            let line_start = offset;
            offset += read as u64;

            let line = trim_ascii(&buf);
            if line.is_empty() {
                continue;
            }
            let first_entry = !seen_entry;
            seen_entry = true;

            match parse_entry(line) {
                Ok(Entry::Header(header)) if first_entry => manifest.header = Some(header),
                Ok(Entry::Header(_)) => {
                    warn!(
                        "Ignoring header marker on line {} of {}",
                        line_no,
                        self.path.display()
                    );
                }
                Ok(Entry::Record(record)) => manifest.records.push(*record),
                Err(reason) => {
                    manifest.discarded_tail = Some(DiscardedTail {
                        line: line_no,
                        offset: line_start,
                        bytes: total_len.saturating_sub(line_start),
                        reason,
                    });
                    break;
                }
            }
        }

        if let Some(tail) = &manifest.discarded_tail {
            warn!(
                "Recovered {} records from {}; discarded {} trailing bytes from line {} ({})",
                manifest.records.len(),
                self.path.display(),
                tail.bytes,
                tail.line,
                tail.reason,
            );
        } else if manifest.header.is_none() && !manifest.records.is_empty() {
            warn!("Manifest {} has no header line", self.path.display());
        }

        Ok(manifest)
    }

    /// Cuts the file at the start of a discarded tail so later appends are readable.
    pub fn truncate_discarded(&self, tail: &DiscardedTail) -> Result<(), Error> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(tail.offset)?;
        file.sync_all()?;
        warn!(
            "Truncated {} at byte {} (line {})",
            self.path.display(),
            tail.offset,
            tail.line
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn replace_atomically(&self, header: &ManifestHeader, keep_records: bool) -> Result<(), Error> {
        let tmp = self.temp_path();
        if let Err(err) = self.write_replacement(&tmp, header, keep_records) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }

    fn write_replacement(
        &self,
        tmp: &Path,
        header: &ManifestHeader,
        keep_records: bool,
    ) -> Result<(), Error> {
        let mut out = BufWriter::new(File::create(tmp)?);
        serde_json::to_writer(&mut out, header)?;
        out.write_all(b"\n")?;

        if keep_records {
            match File::open(&self.path) {
                Ok(existing) => {
                    let mut reader = BufReader::new(existing);
                    let mut first = Vec::new();
                    reader.read_until(b'\n', &mut first)?;
                    if !matches!(parse_entry(trim_ascii(&first)), Ok(Entry::Header(_))) {
                        out.write_all(&first)?;
                    }
                    io::copy(&mut reader, &mut out)?;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let file = out.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

pub(crate) enum Entry {
    Header(ManifestHeader),
    Record(Box<Record>),
}

/// Header lines are recognised by the marker field, not by position.
pub(crate) fn parse_entry(line: &[u8]) -> Result<Entry, String> {
    let value: serde_json::Value = serde_json::from_slice(line).map_err(|e| e.to_string())?;
    let is_header = value
        .get(MANIFEST_META_KEY)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if is_header {
        serde_json::from_value(value)
            .map(Entry::Header)
            .map_err(|e| e.to_string())
    } else {
        serde_json::from_value(value)
            .map(|record| Entry::Record(Box::new(record)))
            .map_err(|e| e.to_string())
    }
}

pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => File::open(".")?.sync_all(),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

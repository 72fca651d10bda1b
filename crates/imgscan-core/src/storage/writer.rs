use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::manifest::{parse_entry, trim_ascii};
use super::models::Record;
use crate::error::Error;

const TAIL_SCAN_CHUNK: usize = 8 * 1024;

/// Destination for completed record batches.
pub trait RecordSink {
    /// Durably appends one batch. An error is a storage failure and fatal to the scan.
    fn append_batch(&mut self, records: &[Record]) -> Result<(), Error>;
}

/// Append handle on a manifest file. Each batch ends with `sync_data`.
pub struct ManifestWriter {
    path: PathBuf,
    file: File,
    records_written: u64,
}

impl ManifestWriter {
    /// Opens (creating if needed) for append, first repairing a final line
    /// left without its newline by a crash.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        repair_tail(&mut file, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            records_written: 0,
        })
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for ManifestWriter {
    fn append_batch(&mut self, records: &[Record]) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }
        // Serialize the whole batch first so an encoding error writes nothing.
        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.records_written += records.len() as u64;
        debug!(
            "Appended {} records to {} ({} this session)",
            records.len(),
            self.path.display(),
            self.records_written
        );
        Ok(())
    }
}

/// Offset just past the last `\n`, or 0 when the file has none.
fn last_line_end(file: &mut File, len: u64) -> io::Result<u64> {
    let mut chunk = vec![0u8; TAIL_SCAN_CHUNK];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK as u64);
        let size = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk[..size])?;
        if let Some(i) = chunk[..size].iter().rposition(|b| *b == b'\n') {
            return Ok(start + i as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

fn repair_tail(file: &mut File, path: &Path) -> io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let line_end = last_line_end(file, len)?;
    if line_end == len {
        return Ok(());
    }

    let mut tail = Vec::with_capacity((len - line_end) as usize);
    file.seek(SeekFrom::Start(line_end))?;
    file.read_to_end(&mut tail)?;

    let tail = trim_ascii(&tail);
    if !tail.is_empty() && parse_entry(tail).is_ok() {
        file.write_all(b"\n")?;
        debug!("Terminated final line of {}", path.display());
    } else {
        file.set_len(line_end)?;
        if !tail.is_empty() {
            warn!(
                "Dropped {} bytes of a torn final line in {}",
                len - line_end,
                path.display()
            );
        }
    }
    file.sync_all()
}

//! CSV connector over a single file or a directory of `*.csv` files.
//!
//! For a single file the offset is the 1-based data row (header excluded).
//! For a directory, files are read in file-name order and the offset packs
//! the file's ordinal above [`ROW_BITS`] and the row below it, so offsets
//! stay strictly increasing across files. New files must sort after the
//! ones already ingested.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};
use tidewater_types::record::{Offset, Payload, Record, SourceId};

use crate::error::PipelineError;
use crate::source::{Poll, SourceConnector};

/// Low bits of a directory-mode offset that hold the row within one file.
pub const ROW_BITS: u32 = 32;

const MAX_DIRECTORY_ROWS: u64 = (1 << ROW_BITS) - 1;

/// The `*.csv` entries of `dir`, sorted by file name.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn list_csv_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list CSV directory: {}", dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("Failed to list CSV directory: {}", dir.display()))?;
        let path = entry.path();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv && !entry.file_type().is_ok_and(|t| t.is_dir()) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

struct Cursor {
    path: PathBuf,
    reader: ::csv::Reader<File>,
    headers: Vec<String>,
    base: u64,
    max_row: u64,
    row: u64,
}

impl Cursor {
    fn open(path: &Path, delimiter: u8, base: u64, max_row: u64) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open CSV source: {}", path.display()))?;
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(file);
        let headers = reader
            .byte_headers()
            .with_context(|| format!("Failed to read CSV header: {}", path.display()))?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            headers,
            base,
            max_row,
            row: 0,
        })
    }

    /// Append up to `max` rows past `skip_through` to `out`. Returns `true`
    /// at end of file.
    fn read(
        &mut self,
        id: &SourceId,
        skip_through: Offset,
        max: usize,
        out: &mut Vec<Record>,
    ) -> anyhow::Result<bool> {
        let mut row = ::csv::ByteRecord::new();
        let mut taken = 0;
        while taken < max {
            let more = self.reader.read_byte_record(&mut row).with_context(|| {
                format!("Failed to read CSV row {} of {}", self.row + 1, self.path.display())
            })?;
            if !more {
                return Ok(true);
            }
            self.row += 1;
            if self.row > self.max_row {
                anyhow::bail!(
                    "CSV file {} has more than {} rows",
                    self.path.display(),
                    self.max_row
                );
            }
            let offset = Offset::new(self.base + self.row);
            if offset <= skip_through {
                continue;
            }
            let object: Map<String, Value> = self
                .headers
                .iter()
                .zip(row.iter())
                .map(|(name, field)| {
                    (
                        name.clone(),
                        Value::String(String::from_utf8_lossy(field).into_owned()),
                    )
                })
                .collect();
            let payload = Payload::from_json(&object).context("Failed to encode CSV row")?;
            out.push(Record::new(id.clone(), offset, payload, crate::now()));
            taken += 1;
        }
        Ok(false)
    }
}

/// Files still to read and the open one. Moved onto the blocking pool for
/// each poll.
struct Reader {
    delimiter: u8,
    directory: bool,
    files: VecDeque<(u64, PathBuf)>,
    cursor: Option<Cursor>,
}

impl Reader {
    fn open(path: &Path, delimiter: u8) -> anyhow::Result<Self> {
        let directory = path.is_dir();
        let files = if directory {
            let files = list_csv_files(path)?;
            tracing::debug!(dir = %path.display(), files = files.len(), "Listed CSV directory");
            files
                .into_iter()
                .zip(0u64..)
                .map(|(file, ordinal)| (ordinal << ROW_BITS, file))
                .collect()
        } else {
            VecDeque::from([(0, path.to_path_buf())])
        };
        Ok(Self {
            delimiter,
            directory,
            files,
            cursor: None,
        })
    }

    /// Read up to `max` rows past `skip_through`. A directory source skips
    /// files it cannot read and carries on with the next one.
    fn read_batch(
        &mut self,
        id: &SourceId,
        skip_through: Offset,
        max: usize,
    ) -> anyhow::Result<(Vec<Record>, bool)> {
        let mut records = Vec::with_capacity(max);
        while records.len() < max {
            if self.cursor.is_none() {
                let Some((base, path)) = self.files.pop_front() else {
                    return Ok((records, true));
                };
                // Every row of an earlier file is covered by the checkpoint.
                if self.directory && base >> ROW_BITS < skip_through.get() >> ROW_BITS {
                    continue;
                }
                let max_row = if self.directory {
                    MAX_DIRECTORY_ROWS
                } else {
                    u64::MAX
                };
                match Cursor::open(&path, self.delimiter, base, max_row) {
                    Ok(cursor) => self.cursor = Some(cursor),
                    Err(e) if self.directory => {
                        tracing::error!(
                            source = %id,
                            file = %path.display(),
                            "Skipping unreadable CSV file: {:#}",
                            e
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(cursor) = self.cursor.as_mut() else {
                continue;
            };
            let remaining = max - records.len();
            match cursor.read(id, skip_through, remaining, &mut records) {
                Ok(true) => self.cursor = None,
                Ok(false) => {}
                Err(e) if self.directory => {
                    tracing::error!(
                        source = %id,
                        file = %cursor.path.display(),
                        "Skipping rest of CSV file: {:#}",
                        e
                    );
                    self.cursor = None;
                }
                Err(e) => return Err(e),
            }
        }
        let eof = self.cursor.is_none() && self.files.is_empty();
        Ok((records, eof))
    }
}

pub struct CsvSource {
    id: SourceId,
    path: PathBuf,
    delimiter: u8,
    resume_after: Offset,
    reader: Option<Reader>,
    exhausted: bool,
}

impl CsvSource {
    /// `path` is a CSV file or a directory of them. `delimiter` must be a
    /// single-byte character; anything else falls back to `,`.
    #[must_use]
    pub fn new(id: SourceId, path: &Path, delimiter: char) -> Self {
        Self {
            id,
            path: path.to_path_buf(),
            delimiter: u8::try_from(delimiter).unwrap_or(b','),
            resume_after: Offset::default(),
            reader: None,
            exhausted: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceConnector for CsvSource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn resume_after(&mut self, offset: Offset) {
        self.resume_after = self.resume_after.max(offset);
    }

    async fn poll(&mut self, max: usize) -> Result<Poll, PipelineError> {
        if self.exhausted {
            return Ok(Poll::Exhausted);
        }
        let reader = self.reader.take();
        let (path, delimiter, id, skip) =
            (self.path.clone(), self.delimiter, self.id.clone(), self.resume_after);
        let max = max.max(1);

        let (reader, result) = tokio::task::spawn_blocking(move || {
            let mut reader = match reader {
                Some(reader) => reader,
                None => match Reader::open(&path, delimiter) {
                    Ok(reader) => reader,
                    Err(e) => return (None, Err(e)),
                },
            };
            let result = reader.read_batch(&id, skip, max);
            (Some(reader), result)
        })
        .await
        .map_err(|e| PipelineError::task("csv source", &e))?;

        self.reader = reader;
        let (records, eof) = result.map_err(PipelineError::Infrastructure)?;
        if eof {
            self.exhausted = true;
        }
        if records.is_empty() {
            Ok(if eof { Poll::Exhausted } else { Poll::Idle })
        } else {
            Ok(Poll::Records(records))
        }
    }
}

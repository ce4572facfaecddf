//! JSON Lines file connector. Offset = 1-based line number.
//!
//! Blank lines are skipped but still consume a line number, so offsets stay
//! stable when a file is re-read. Lines are passed through verbatim; invalid
//! JSON is rejected later by the transformation engine.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tidewater_types::record::{Offset, Record, SourceId};

use crate::error::PipelineError;
use crate::source::{Poll, SourceConnector};

struct Cursor {
    reader: BufReader<File>,
    line: u64,
}

pub struct JsonLinesSource {
    id: SourceId,
    path: PathBuf,
    resume_after: Offset,
    cursor: Option<Cursor>,
    exhausted: bool,
}

impl JsonLinesSource {
    #[must_use]
    pub fn new(id: SourceId, path: &Path) -> Self {
        Self {
            id,
            path: path.to_path_buf(),
            resume_after: Offset::default(),
            cursor: None,
            exhausted: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_batch(
        cursor: &mut Cursor,
        id: &SourceId,
        skip_through: Offset,
        max: usize,
    ) -> anyhow::Result<(Vec<Record>, bool)> {
        let mut records = Vec::with_capacity(max);
        let mut buf = Vec::new();
        while records.len() < max {
            buf.clear();
            let read = cursor
                .reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("Failed to read line {}", cursor.line + 1))?;
            if read == 0 {
                return Ok((records, true));
            }
            cursor.line += 1;
            let offset = Offset::new(cursor.line);
            let line = buf.trim_ascii();
            if line.is_empty() || offset <= skip_through {
                continue;
            }
            records.push(Record::new(id.clone(), offset, line.to_vec(), crate::now()));
        }
        Ok((records, false))
    }
}

impl SourceConnector for JsonLinesSource {
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
        let cursor = self.cursor.take();
        let (path, id, skip) = (self.path.clone(), self.id.clone(), self.resume_after);
        let max = max.max(1);

        let (cursor, result) = tokio::task::spawn_blocking(move || {
            let mut cursor = match cursor {
                Some(cursor) => cursor,
                None => match File::open(&path) {
                    Ok(file) => Cursor {
                        reader: BufReader::new(file),
                        line: 0,
                    },
                    Err(e) => {
                        let err = anyhow::Error::new(e).context(format!(
                            "Failed to open JSON Lines source: {}",
                            path.display()
                        ));
                        return (None, Err(err));
                    }
                },
            };
            let result = Self::read_batch(&mut cursor, &id, skip, max);
            (Some(cursor), result)
        })
        .await
        .map_err(|e| PipelineError::task("jsonl source", &e))?;

        self.cursor = cursor;
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn offsets(source: &mut JsonLinesSource) -> Vec<u64> {
        let mut out = Vec::new();
        loop {
            match source.poll(2).await.unwrap() {
                Poll::Records(records) => out.extend(records.iter().map(|r| r.offset().get())),
                Poll::Idle => {}
                Poll::Exhausted => return out,
            }
        }
    }

    #[tokio::test]
    async fn blank_lines_consume_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\n{\"a\":3}\r\n   \n{\"a\":5}").unwrap();

        let mut source = JsonLinesSource::new(SourceId::new("events"), &path);
        assert_eq!(offsets(&mut source).await, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn lines_pass_through_verbatim_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"a\":1}\nnot json\n{\"a\":3}\n").unwrap();

        let mut source = JsonLinesSource::new(SourceId::new("events"), &path);
        source.resume_after(Offset::new(1));
        let Poll::Records(records) = source.poll(10).await.unwrap() else {
            panic!("expected records");
        };
        assert_eq!(records[0].offset(), Offset::new(2));
        assert_eq!(records[0].payload().as_bytes(), b"not json");
        assert_eq!(source.poll(10).await.unwrap(), Poll::Exhausted);
    }
}

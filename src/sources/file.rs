use crate::error::SyncError;
use crate::models::{normalize_key, Record, SourcedRecord};
use crate::source::{parse_cell, record_from_object, RecordSource};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

const KEY_COLUMN_CANDIDATES: [&str; 3] = ["symbol", "ticker", "key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    JsonLines,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self, SyncError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(Self::Csv),
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            other => Err(SyncError::SourceUnavailable(format!(
                "unsupported file type '{}' for {} (expected .csv, .jsonl or .ndjson)",
                other,
                path.display()
            ))),
        }
    }
}

enum OpenReader {
    Csv {
        reader: csv::Reader<File>,
        headers: Vec<String>,
        key_index: usize,
    },
    JsonLines(Lines<BufReader<File>>),
}

/// Streams records out of a CSV or JSON-lines file without loading it whole.
pub struct FileSource {
    path: PathBuf,
    format: FileFormat,
    key_field: Option<String>,
    chunk_size: usize,
    start_offset: u64,
    position: u64,
    reader: Option<OpenReader>,
    exhausted: bool,
}

impl FileSource {
    pub fn new<P: Into<PathBuf>>(path: P, chunk_size: usize) -> Result<Self, SyncError> {
        let path = path.into();
        let format = FileFormat::from_path(&path)?;
        Ok(Self {
            path,
            format,
            key_field: None,
            chunk_size: chunk_size.max(1),
            start_offset: 0,
            position: 0,
            reader: None,
            exhausted: false,
        })
    }

    /// Column (CSV) or property (JSON lines) holding the key; detected when unset.
    pub fn with_key_field<S: Into<String>>(mut self, key_field: S) -> Self {
        self.key_field = Some(key_field.into());
        self
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    fn open(&self) -> Result<OpenReader, SyncError> {
        let file = File::open(&self.path).map_err(|err| {
            SyncError::SourceUnavailable(format!("cannot open {}: {}", self.path.display(), err))
        })?;

        match self.format {
            FileFormat::Csv => {
                let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
                let headers: Vec<String> = reader
                    .headers()
                    .map_err(|err| {
                        SyncError::SourceUnavailable(format!(
                            "cannot read header of {}: {}",
                            self.path.display(),
                            err
                        ))
                    })?
                    .iter()
                    .map(|header| header.trim().to_string())
                    .collect();
                let key_index = self.find_key_column(&headers)?;
                Ok(OpenReader::Csv {
                    reader,
                    headers,
                    key_index,
                })
            }
            FileFormat::JsonLines => Ok(OpenReader::JsonLines(BufReader::new(file).lines())),
        }
    }

    fn find_key_column(&self, headers: &[String]) -> Result<usize, SyncError> {
        let position = match self.key_field.as_deref() {
            Some(name) => headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name)),
            None => KEY_COLUMN_CANDIDATES.iter().find_map(|candidate| {
                headers
                    .iter()
                    .position(|header| header.eq_ignore_ascii_case(candidate))
            }),
        };
        position.ok_or_else(|| {
            SyncError::SourceUnavailable(format!(
                "{} has no key column (looked for {})",
                self.path.display(),
                self.key_field
                    .clone()
                    .unwrap_or_else(|| KEY_COLUMN_CANDIDATES.join(", "))
            ))
        })
    }

    /// Reads the next raw entry; `Ok(None)` at end of file, `Ok(Some(None))` for a skipped line.
    fn read_entry(&mut self) -> Result<Option<Option<Record>>, SyncError> {
        let path = self.path.display().to_string();
        let key_field = self
            .key_field
            .clone()
            .unwrap_or_else(|| KEY_COLUMN_CANDIDATES[0].to_string());
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        match reader {
            OpenReader::Csv {
                reader,
                headers,
                key_index,
            } => {
                let mut row = csv::StringRecord::new();
                match reader.read_record(&mut row) {
                    Ok(false) => Ok(None),
                    Ok(true) => Ok(Some(csv_row_to_record(&row, headers, *key_index))),
                    Err(err) if err.is_io_error() => Err(SyncError::SourceUnavailable(format!(
                        "read error in {}: {}",
                        path, err
                    ))),
                    Err(err) => {
                        warn!("Skipping malformed row in {}: {}", path, err);
                        Ok(Some(None))
                    }
                }
            }
            OpenReader::JsonLines(lines) => match lines.next() {
                None => Ok(None),
                Some(Err(err)) => Err(SyncError::SourceUnavailable(format!(
                    "read error in {}: {}",
                    path, err
                ))),
                Some(Ok(line)) if line.trim().is_empty() => Ok(Some(None)),
                Some(Ok(line)) => match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Object(object)) => Ok(Some(record_from_object(object, &key_field))),
                    Ok(_) => {
                        warn!("Skipping non-object line in {}", path);
                        Ok(Some(None))
                    }
                    Err(err) => {
                        warn!("Skipping malformed line in {}: {}", path, err);
                        Ok(Some(None))
                    }
                },
            },
        }
    }
}

fn csv_row_to_record(row: &csv::StringRecord, headers: &[String], key_index: usize) -> Option<Record> {
    let key = normalize_key(row.get(key_index)?)?;
    let fields = headers
        .iter()
        .enumerate()
        .filter(|(idx, header)| *idx != key_index && !header.is_empty())
        .map(|(idx, header)| (header.clone(), parse_cell(row.get(idx).unwrap_or_default())))
        .collect();
    Some(Record {
        key,
        fields,
        prices: Vec::new(),
        dividends: Vec::new(),
    })
}

#[async_trait]
impl RecordSource for FileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn position(&self) -> u64 {
        self.position.max(self.start_offset)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<SourcedRecord>>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.reader.is_none() {
            self.reader = Some(self.open()?);
            if self.start_offset > 0 {
                info!(
                    "Skipping to offset {} in {}",
                    self.start_offset,
                    self.path.display()
                );
            }
        }

        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            let Some(entry) = self.read_entry()? else {
                self.exhausted = true;
                break;
            };
            let offset = self.position;
            self.position += 1;
            if offset < self.start_offset {
                continue;
            }
            match entry {
                Some(record) => chunk.push(SourcedRecord { offset, record }),
                None => warn!("Entry {} in {} has no usable key", offset, self.path.display()),
            }
        }

        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}

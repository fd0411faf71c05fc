use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde_json::json;
use smartvision_contracts::events::{EventPayload, LogLevel};
use smartvision_contracts::{
    CommitError, CommitStrategy, DescriptionResult, Emitter, FatalError, ImageTask,
};

use super::MetadataCommitter;

pub const LEDGER_HEADER: [&str; 4] = ["image_name", "title", "description", "keywords"];
const LEDGER_NAME_FORMAT: &str = "%d-%m-%Y--%H-%M-%S";

/// Appends one CSV row per described image. Images are never touched.
pub struct LedgerCommitter {
    dir: PathBuf,
    started_at: DateTime<Local>,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    rows: u64,
    events: Emitter,
}

impl LedgerCommitter {
    pub fn new(dir: impl Into<PathBuf>, started_at: DateTime<Local>, events: Emitter) -> Self {
        Self {
            dir: dir.into(),
            started_at,
            writer: None,
            path: None,
            rows: 0,
            events,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn create_unique(&self) -> io::Result<(PathBuf, File)> {
        let stamp = self.started_at.format(LEDGER_NAME_FORMAT).to_string();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stamp}.csv")
            } else {
                format!("{stamp}-{attempt}.csv")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl MetadataCommitter for LedgerCommitter {
    fn strategy(&self) -> CommitStrategy {
        CommitStrategy::Ledger
    }

    fn begin(&mut self) -> Result<(), FatalError> {
        let unavailable = |path: &Path, err: io::Error| FatalError::OutputUnavailable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        };
        fs::create_dir_all(&self.dir).map_err(|err| unavailable(&self.dir, err))?;
        let (path, file) = self
            .create_unique()
            .map_err(|err| unavailable(&self.dir, err))?;
        let mut writer = BufWriter::new(file);
        write_record(&mut writer, &LEDGER_HEADER).map_err(|err| unavailable(&path, err))?;

        let mut fields = EventPayload::new();
        fields.insert("path".to_string(), json!(path.display().to_string()));
        self.events.log(
            LogLevel::Info,
            "ledger_created",
            format!("CSV file created: {}", path.display()),
            fields,
        );
        self.writer = Some(writer);
        self.path = Some(path);
        Ok(())
    }

    fn commit(&mut self, task: &ImageTask, result: &DescriptionResult) -> Result<(), CommitError> {
        let path = self.path.clone().unwrap_or_else(|| self.dir.clone());
        let Some(writer) = self.writer.as_mut() else {
            return Err(CommitError::Io {
                step: "append ledger row",
                path,
                source: io::Error::new(io::ErrorKind::NotConnected, "ledger was not opened"),
            });
        };
        let keywords = result.keywords_joined();
        write_record(
            writer,
            &[task.name(), result.title(), result.description(), keywords.as_str()],
        )
        .map_err(|source| CommitError::Io {
            step: "append ledger row",
            path,
            source,
        })?;
        self.rows += 1;
        Ok(())
    }
}

/// Writes one CRLF-terminated record and flushes it.
fn write_record<W: Write>(writer: &mut W, fields: &[&str]) -> io::Result<()> {
    let line = fields
        .iter()
        .map(|field| escape_field(field))
        .collect::<Vec<String>>()
        .join(",");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

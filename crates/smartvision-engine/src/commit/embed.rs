use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::json;
use smartvision_contracts::events::{EventPayload, LogLevel};
use smartvision_contracts::{CommitError, CommitStrategy, DescriptionResult, Emitter, ImageTask};
use tempfile::NamedTempFile;

use super::MetadataCommitter;
use crate::iptc::{IptcContainer, BY_LINE, CAPTION_ABSTRACT, KEYWORDS, OBJECT_NAME};
use crate::lock::{normalize_path, LockReleaser};

const BACKUP_MARKER: &str = "~";

/// Rewrites each image's IPTC container through a private temporary copy.
///
/// The source is never opened for writing. The updated copy replaces the destination in
/// one rename, and the source is only removed after that rename succeeded. Dropping the
/// temporary file on any early return deletes it.
pub struct EmbedCommitter {
    author: Option<String>,
    releaser: LockReleaser,
    events: Emitter,
}

impl EmbedCommitter {
    pub fn new(author: Option<String>, releaser: LockReleaser, events: Emitter) -> Self {
        Self {
            author: author
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            releaser,
            events,
        }
    }

    fn stage(
        &self,
        source: &Path,
        dest_dir: &Path,
        result: &DescriptionResult,
    ) -> Result<NamedTempFile, CommitError> {
        let mut staged = tempfile::Builder::new()
            .prefix(".smartvision-")
            .suffix(".tmp")
            .tempfile_in(dest_dir)
            .map_err(|source| io_error("create temporary file", dest_dir, source))?;

        let mut original =
            File::open(source).map_err(|err| io_error("open source", source, err))?;
        io::copy(&mut original, staged.as_file_mut())
            .map_err(|err| io_error("copy source", staged.path(), err))?;
        drop(original);

        let bytes =
            fs::read(staged.path()).map_err(|err| io_error("read temporary file", staged.path(), err))?;
        let mut container = match IptcContainer::from_jpeg(&bytes) {
            Ok(Some(container)) => container,
            Ok(None) => IptcContainer::empty(),
            Err(err) => {
                self.events.debug(
                    "container_reset",
                    format!(
                        "Unreadable metadata in {}, starting from an empty container: {err}",
                        source.display()
                    ),
                );
                IptcContainer::empty()
            }
        };
        container.set(OBJECT_NAME, result.title());
        container.set(CAPTION_ABSTRACT, result.description());
        container.set_all(KEYWORDS, result.keywords());
        if let Some(author) = &self.author {
            container.set(BY_LINE, author);
        }

        let updated = container
            .embed_into(&bytes)
            .map_err(|err| CommitError::Container(err.to_string()))?;
        overwrite(staged.as_file_mut(), &updated)
            .map_err(|err| io_error("write temporary file", staged.path(), err))?;
        Ok(staged)
    }

    /// Runs after the destination is committed, so a leftover backup is only reported.
    fn remove_backup_artifact(&self, dest: &Path) {
        let backup = backup_path(dest);
        match fs::remove_file(&backup) {
            Ok(()) => self
                .events
                .debug("backup_removed", format!("Removed {}", backup.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let mut fields = EventPayload::new();
                fields.insert("path".to_string(), json!(backup.display().to_string()));
                self.events.log(
                    LogLevel::Warning,
                    "backup_remove_failed",
                    format!("Could not remove {}: {err}", backup.display()),
                    fields,
                );
            }
        }
    }
}

impl MetadataCommitter for EmbedCommitter {
    fn strategy(&self) -> CommitStrategy {
        CommitStrategy::Embed
    }

    fn commit(&mut self, task: &ImageTask, result: &DescriptionResult) -> Result<(), CommitError> {
        let source = task.source_path();
        let dest = task.destination_path();
        let dest_dir = dest
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dest_dir)
            .map_err(|err| io_error("create destination directory", dest_dir, err))?;

        self.releaser.release(source);

        let in_place = task.rewrites_in_place() || normalize_path(source) == normalize_path(dest);
        let staged = self.stage(source, dest_dir, result)?;
        staged.persist(dest).map_err(|err| CommitError::Move {
            path: dest.to_path_buf(),
            source: err.error,
        })?;

        self.remove_backup_artifact(dest);
        if !in_place {
            fs::remove_file(source).map_err(|err| io_error("remove source", source, err))?;
        }

        let mut fields = EventPayload::new();
        fields.insert("image".to_string(), json!(task.name()));
        fields.insert("path".to_string(), json!(dest.display().to_string()));
        fields.insert("keywords".to_string(), json!(result.keywords().len()));
        self.events.log(
            LogLevel::Debug,
            "metadata_embedded",
            format!("Embedded metadata into {}", dest.display()),
            fields,
        );
        Ok(())
    }
}

/// Sibling path some metadata writers leave behind: `<dest>~`.
pub fn backup_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(BACKUP_MARKER);
    PathBuf::from(name)
}

fn overwrite(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn io_error(step: &'static str, path: &Path, source: io::Error) -> CommitError {
    CommitError::Io {
        step,
        path: path.to_path_buf(),
        source,
    }
}

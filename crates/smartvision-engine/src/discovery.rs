use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use smartvision_contracts::ImageTask;

/// Lists regular files directly inside `source_dir` whose extension is in `extensions`
/// (case-insensitive). Subdirectories are not traversed.
///
/// Tasks are ordered by file name so repeated runs over an unchanged directory agree.
pub fn discover_images(
    source_dir: &Path,
    destination_dir: &Path,
    extensions: &[String],
) -> Result<Vec<ImageTask>> {
    let entries = fs::read_dir(source_dir)
        .with_context(|| format!("failed listing {}", source_dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed listing {}", source_dir.display()))?;
        let path = entry.path();
        let is_file = fs::metadata(&path)
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file || !has_allowed_extension(&path, extensions) {
            continue;
        }
        files.push(entry.file_name());
    }
    files.sort();

    // Paths keep the exact on-disk name; the task name is only for display.
    Ok(files
        .into_iter()
        .map(|file_name| {
            let source_path = source_dir.join(&file_name);
            let destination_path = destination_dir.join(&file_name);
            ImageTask::new(
                file_name.to_string_lossy().into_owned(),
                source_path,
                destination_path,
            )
        })
        .collect())
}

pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|ext| {
            extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

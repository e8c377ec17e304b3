use crate::error::{LoadError, SaveError};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes `value` as pretty JSON next to `path`, fsyncs, then renames over `path`.
/// On failure the previous file is left untouched.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SaveError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SaveError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = sibling_with_suffix(path, ".tmp");
    let write_result = (|| -> Result<(), SaveError> {
        let file = fs::File::create(&temp_path).map_err(|source| SaveError::Io {
            path: temp_path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n").map_err(|source| SaveError::Io {
            path: temp_path.clone(),
            source,
        })?;
        let file = writer.into_inner().map_err(|e| SaveError::Io {
            path: temp_path.clone(),
            source: e.into_error(),
        })?;
        file.sync_all().map_err(|source| SaveError::Io {
            path: temp_path.clone(),
            source,
        })?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        SaveError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Reads and parses a persisted document, returning `None` when the caller should
/// start from its empty default. Malformed files are moved aside to `<file>.corrupt`.
pub(crate) fn read_or_recover<T, F>(path: &Path, what: &str, parse: F) -> Option<T>
where
    F: FnOnce(&str) -> Result<T, LoadError>,
{
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("No {} at {}, starting empty", what, path.display());
            return None;
        }
        Err(err) => {
            warn!(
                "Failed to read {} at {}: {}",
                what,
                path.display(),
                LoadError::Io(err)
            );
            return None;
        }
    };

    match parse(&content) {
        Ok(parsed) => Some(parsed),
        Err(LoadError::Empty) => {
            warn!("{} at {} is empty, resetting", what, path.display());
            None
        }
        Err(err) => {
            let backup = sibling_with_suffix(path, ".corrupt");
            match fs::rename(path, &backup) {
                Ok(()) => warn!(
                    "{} at {} is unreadable ({}), moved to {} and resetting",
                    what,
                    path.display(),
                    err,
                    backup.display()
                ),
                Err(rename_err) => warn!(
                    "{} at {} is unreadable ({}), backup failed ({}), resetting",
                    what,
                    path.display(),
                    err,
                    rename_err
                ),
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{read_or_recover, write_json_atomic};
    use crate::error::LoadError;
    use std::collections::BTreeMap;

    #[test]
    fn atomic_write_replaces_target_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doc.json");

        let mut value = BTreeMap::new();
        value.insert("a", 1);
        write_json_atomic(&path, &value).expect("first write");
        value.insert("b", 2);
        write_json_atomic(&path, &value).expect("second write");

        let content = std::fs::read_to_string(&path).expect("read");
        let parsed: BTreeMap<String, i32> = serde_json::from_str(&content).expect("json");
        assert_eq!(parsed.len(), 2);
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[test]
    fn malformed_file_is_moved_aside() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{ not json").expect("seed");

        let parsed: Option<()> = read_or_recover(&path, "test document", |content| {
            serde_json::from_str::<serde_json::Value>(content)
                .map(|_| ())
                .map_err(LoadError::Malformed)
        });

        assert!(parsed.is_none());
        assert!(!path.exists());
        assert!(dir.path().join("doc.json.corrupt").exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parsed: Option<()> =
            read_or_recover(&dir.path().join("absent.json"), "test document", |_| Ok(()));
        assert!(parsed.is_none());
    }
}

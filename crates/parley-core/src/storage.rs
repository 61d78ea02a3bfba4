//! JSON file persistence
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so readers see either the old or the new content, never a torn one.

use crate::error::{ParleyError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Extension used for in-flight writes; readers skip these
pub const TEMP_EXTENSION: &str = "tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Ensure a directory exists
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            ParleyError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create directory {}: {}", dir.display(), e),
            ))
        })?;
    }
    Ok(())
}

/// Serialize `value` to `path` atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let content = serde_json::to_string_pretty(value)?;

    let temp_path = temp_path_for(path);
    fs::write(&temp_path, content).map_err(|e| {
        ParleyError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to write {}: {}", temp_path.display(), e),
        ))
    })?;

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        ParleyError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to save {}: {}", path.display(), e),
        ))
    })
}

/// Read and parse `path`; `Ok(None)` if it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_str(&content)
        .map_err(|e| ParleyError::Serialization(format!("{}: {}", path.display(), e)))?;
    Ok(Some(value))
}

/// Delete `path`, treating "already gone" as success
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A temp name no other write, in this process or another, is using
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}.{}.{}", std::process::id(), seq, TEMP_EXTENSION));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("value.json");
        let mut value = HashMap::new();
        value.insert("a".to_string(), 1);

        write_json_atomic(&path, &value).unwrap();
        let loaded: HashMap<String, i32> = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, value);

        // no temp file left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == TEMP_EXTENSION))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_writers_to_one_file() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("shared.json"));
        write_json_atomic(&*path, &vec![0u32; 64]).unwrap();

        let writers: Vec<_> = (0..4u32)
            .map(|n| {
                let path = path.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|_| write_json_atomic(&*path, &vec![n; 64]).is_err())
                        .count()
                })
            })
            .collect();

        let reader = {
            let path = path.clone();
            std::thread::spawn(move || {
                (0..400)
                    .filter(|_| match read_json::<Vec<u32>>(&path) {
                        Ok(Some(values)) => values.len() != 64 || values.iter().any(|v| *v != values[0]),
                        _ => true,
                    })
                    .count()
            })
        };

        let failed_writes: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(failed_writes, 0);
        assert_eq!(reader.join().unwrap(), 0);

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == TEMP_EXTENSION))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_temp_names_are_unique() {
        let path = Path::new("/state/agents/claude.json");
        assert_ne!(temp_path_for(path), temp_path_for(path));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Vec<u8>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
        remove_file(&dir.path().join("nope.json")).unwrap();
    }
}

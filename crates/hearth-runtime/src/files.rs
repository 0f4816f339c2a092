use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Filesystem access used by the module loader and the bootstrap step
pub trait FileSystem {
    fn read_text(&self, path: &Path) -> Result<String>;
    fn exists(&self, path: &Path) -> bool;
}

/// [`FileSystem`] backed by the process filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn read_text(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("Failed to open file: {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Resolves `path` against `base` and folds `.` and `..` components lexically.
///
/// Backslashes are treated as separators so Windows-style module paths resolve
/// on every platform. Drive-letter paths are kept as absolute.
pub fn to_absolute(path: &str, base: &Path) -> PathBuf {
    let normalized = path.replace('\\', "/");
    let candidate = if is_absolute(&normalized) {
        PathBuf::from(normalized)
    } else {
        base.join(normalized)
    };

    let mut folded = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match folded.components().next_back() {
                Some(Component::Normal(_)) => {
                    folded.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => folded.push(".."),
            },
            other => folded.push(other.as_os_str()),
        }
    }
    folded
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || (bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/')
}

/// Containing directory of `path`; a bare file name lives in the current directory
pub fn directory_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Appends `extension` (with its leading dot) unless `path` already ends with it
pub fn append_extension_if_missing(path: &str, extension: &str) -> String {
    if path.ends_with(extension) {
        path.to_string()
    } else {
        format!("{path}{extension}")
    }
}

//! Path sanitization for client-supplied relative paths.
//!
//! Upload targets arrive as untrusted relative paths. This module normalizes
//! them and verifies that the joined absolute path stays inside the portal's
//! destination directory. Checks are lexical; symlinks already present inside
//! the destination are the operator's responsibility.

use std::path::{Component, Path, PathBuf};

/// Errors returned by path validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// Input was empty, or cleaned down to nothing.
    RelpathEmpty,
    /// Input was absolute, contained `..`, a NUL byte, or a drive prefix.
    RelpathInvalid,
    /// Destination was not an absolute path.
    DestAbsInvalid,
    /// Joined path resolved outside the destination.
    RelpathEscapes,
}

/// Normalizes an untrusted relative path to a clean, slash-delimited form.
///
/// Backslashes are treated as separators, `.` segments and empty segments are
/// dropped. Rooted paths, `~/` prefixes, `..` segments, and Windows drive
/// prefixes are rejected outright.
pub fn sanitize_relpath(input: &str) -> Result<String, PathError> {
    if input.is_empty() {
        return Err(PathError::RelpathEmpty);
    }

    let normalized = input.replace('\\', "/");
    if normalized.contains('\0') {
        return Err(PathError::RelpathInvalid);
    }
    if normalized.starts_with('/') || normalized.starts_with("~/") {
        return Err(PathError::RelpathInvalid);
    }

    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        if segment == ".." {
            return Err(PathError::RelpathInvalid);
        }
        if has_windows_drive_prefix(segment) {
            return Err(PathError::RelpathInvalid);
        }
        if segment.is_empty() || segment == "." {
            continue;
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(PathError::RelpathEmpty);
    }

    Ok(segments.join("/"))
}

/// Joins a sanitized relative path onto an absolute destination and verifies
/// the result is still a descendant of the destination.
pub fn join_and_verify(dest_abs: &Path, cleaned_relpath: &str) -> Result<PathBuf, PathError> {
    if cleaned_relpath.is_empty() {
        return Err(PathError::RelpathEmpty);
    }
    if cleaned_relpath.starts_with('/') {
        return Err(PathError::RelpathInvalid);
    }

    let dest = lexical_clean(dest_abs);
    if !dest.is_absolute() {
        return Err(PathError::DestAbsInvalid);
    }

    let relative: PathBuf = cleaned_relpath.split('/').collect();
    let final_abs = lexical_clean(&dest.join(relative));
    if final_abs.strip_prefix(&dest).is_err() {
        return Err(PathError::RelpathEscapes);
    }

    Ok(final_abs)
}

/// Collapses `.` and `..` components without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => cleaned.push(prefix.as_os_str()),
            Component::RootDir => cleaned.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component.as_os_str());
                }
            }
            Component::Normal(segment) => cleaned.push(segment),
        }
    }
    cleaned
}

fn has_windows_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

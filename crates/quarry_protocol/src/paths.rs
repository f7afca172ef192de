//! Safe relative paths for raw files.
//!
//! Every user-supplied path into an upload's raw tree must be a safe relative
//! path: possibly empty, no leading or trailing `/`, no `.` or `..` element,
//! no doubled separator, no newline, no NUL. Absolute paths derived from them
//! must stay below the upload base folder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("unsafe relative path: {0:?}")]
    Unsafe(String),
}

/// Check the I7 rules without allocating.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    if path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    if path.contains("//") || path.contains('\n') || path.contains('\0') {
        return false;
    }
    path.split('/').all(|elem| elem != "." && elem != "..")
}

/// A validated safe relative path within an upload's raw directory.
///
/// The empty path addresses the raw directory itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
#[serde(try_from = "String", into = "String")]
pub struct RawPath(String);

impl RawPath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if !is_safe_relative_path(&path) {
            return Err(PathError::Unsafe(path));
        }
        Ok(Self(path))
    }

    /// The empty path, addressing the raw root.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Last path element; empty for the root path.
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent path; the root path is its own parent.
    pub fn parent(&self) -> RawPath {
        match self.0.rfind('/') {
            Some(idx) => RawPath(self.0[..idx].to_string()),
            None => RawPath::root(),
        }
    }

    /// Append a validated child element or sub-path.
    pub fn join(&self, child: &str) -> Result<RawPath, PathError> {
        if !is_safe_relative_path(child) || child.is_empty() {
            return Err(PathError::Unsafe(child.to_string()));
        }
        if self.0.is_empty() {
            return Ok(RawPath(child.to_string()));
        }
        Ok(RawPath(format!("{}/{}", self.0, child)))
    }

    /// True if `self` equals `other` or lies below it.
    pub fn starts_with(&self, other: &RawPath) -> bool {
        if other.is_root() {
            return true;
        }
        self.0 == other.0 || self.0.starts_with(&format!("{}/", other.0))
    }

    /// Resolve against a base directory on disk.
    pub fn to_os_path(&self, base: &Path) -> PathBuf {
        if self.0.is_empty() {
            base.to_path_buf()
        } else {
            base.join(&self.0)
        }
    }
}

impl fmt::Display for RawPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RawPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RawPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RawPath> for String {
    fn from(value: RawPath) -> Self {
        value.0
    }
}

/// Derive a safe relative path from a path produced by a directory walk.
///
/// Strips the base prefix and rejects anything that does not normalize to a
/// safe relative path (e.g. paths containing `..` after symlink tricks).
pub fn relativize(base: &Path, path: &Path) -> Result<RawPath, PathError> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| PathError::Unsafe(path.to_string_lossy().to_string()))?;
    let mut parts: Vec<String> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => continue,
            _ => return Err(PathError::Unsafe(path.to_string_lossy().to_string())),
        }
    }
    RawPath::new(parts.join("/"))
}

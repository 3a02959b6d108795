//! Path resolution against the shared root.
//!
//! Every path a client sends is treated as relative to [`Root`]. Resolution
//! happens in two steps: a lexical pass that collapses `.`/`..` segments and
//! refuses anything that climbs above the root, then a physical pass that
//! canonicalizes the joined path (following symlinks) and checks the result
//! is still inside the canonical root.

use crate::error::{Error, Result};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use tracing::{error, info};

/// The canonical directory the server is scoped to.
#[derive(Debug, Clone)]
pub struct Root {
    path: PathBuf,
}

impl Root {
    /// Canonicalizes `path` and checks it is a directory. Blocking; meant for
    /// startup.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path).map_err(|e| Error::from_io(e, path))?;
        if !canonical.is_dir() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        Ok(Self { path: canonical })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name shown to clients for the root itself.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Resolves a client-supplied relative path to a canonical absolute path
    /// inside the root.
    pub async fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let joined = self.path.join(normalize(relative)?);
        let canonical = tokio::fs::canonicalize(&joined).await;
        self.check(relative, &joined, canonical)
    }

    /// [`Root::resolve`] for callers already on the blocking pool.
    pub fn resolve_blocking(&self, relative: &str) -> Result<PathBuf> {
        let joined = self.path.join(normalize(relative)?);
        let canonical = fs::canonicalize(&joined);
        self.check(relative, &joined, canonical)
    }

    fn check(&self, relative: &str, joined: &Path, canonical: io::Result<PathBuf>) -> Result<PathBuf> {
        let canonical = match canonical {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Path not found during canonicalization: {}", joined.display());
                return Err(Error::NotFound(relative.to_string()));
            }
            Err(e) => {
                error!("Failed to canonicalize path '{}': {}", joined.display(), e);
                return Err(Error::Io(e));
            }
        };

        if !self.contains(&canonical) {
            error!(
                "Path traversal attempt: '{}' resolved to '{}' which is outside root '{}'",
                relative,
                canonical.display(),
                self.path.display()
            );
            return Err(Error::PathEscape(relative.to_string()));
        }
        Ok(canonical)
    }

    /// Whether an already canonical path is the root or one of its descendants.
    pub fn contains(&self, canonical: &Path) -> bool {
        canonical.starts_with(&self.path)
    }

    /// Root-relative, `/`-separated form of a canonical path inside the root.
    pub fn relative_of(&self, canonical: &Path) -> Option<String> {
        canonical.strip_prefix(&self.path).ok().map(to_slash)
    }
}

/// Lexically normalizes a client path: separators may be `/` or `\`, empty and
/// `.` segments are dropped, `..` pops the previous segment. Climbing above the
/// root fails with [`Error::PathEscape`] before the filesystem is touched.
pub fn normalize(relative: &str) -> Result<PathBuf> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::PathEscape(relative.to_string()));
                }
            }
            name => {
                // Drive prefixes and the like only show up as non-normal components.
                let mut components = Path::new(name).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(_)), None) => segments.push(name),
                    _ => return Err(Error::PathEscape(relative.to_string())),
                }
            }
        }
    }
    Ok(segments.iter().collect())
}

/// Joins path components with `/` regardless of platform.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

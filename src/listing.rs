//! Directory listings: one level at a time, classified and ordered.

use crate::{
    error::{Error, Result},
    resolve::{normalize, to_slash, Root},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{cmp::Ordering, fs::Metadata, path::Path};
use tokio::fs;
use tracing::{debug, error, warn};

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "ico",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "m4v", "wmv", "flv"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "md", "rst", "rtf", "doc", "docx", "odt", "xls", "xlsx", "ods", "ppt", "pptx",
    "odp", "csv", "epub",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    Image,
    Video,
    Document,
    Other,
}

impl EntryKind {
    /// Classifies a file by its extension.
    pub fn of_file(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase();
        let extension = extension.as_str();
        if IMAGE_EXTENSIONS.contains(&extension) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&extension) {
            Self::Video
        } else if DOCUMENT_EXTENSIONS.contains(&extension) {
            Self::Document
        } else {
            Self::Other
        }
    }

    fn of(path: &Path, metadata: &Metadata) -> Self {
        if metadata.is_dir() {
            Self::Directory
        } else {
            Self::of_file(path)
        }
    }
}

/// One item of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Root-relative, `/`-separated.
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub has_preview: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Include names starting with `.`.
    pub show_hidden: bool,
    /// Whether video frames can be extracted for previews.
    pub video_previews: bool,
}

impl ListOptions {
    pub fn has_preview(&self, kind: EntryKind) -> bool {
        match kind {
            EntryKind::Image => true,
            EntryKind::Video => self.video_previews,
            _ => false,
        }
    }
}

/// Listing order: case-insensitive, falling back to the raw name so that
/// names differing only by case still sort deterministically.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// Lists the immediate children of `relative_dir`: directories first, then
/// files, each group alphabetically.
pub async fn list(root: &Root, relative_dir: &str, options: ListOptions) -> Result<Vec<Entry>> {
    let full_path = root.resolve(relative_dir).await?;
    let is_dir = fs::metadata(&full_path)
        .await
        .map(|m| m.is_dir())
        .map_err(|e| Error::from_io(e, relative_dir))?;
    if !is_dir {
        debug!("Browse attempt on non-directory: {}", full_path.display());
        return Err(Error::NotFound(relative_dir.to_string()));
    }
    let prefix = to_slash(&normalize(relative_dir)?);

    let mut entries = fs::read_dir(&full_path).await.map_err(|e| {
        error!("Failed to read directory {}: {}", full_path.display(), e);
        Error::from_io(e, relative_dir)
    })?;

    let mut dir_items = Vec::new();
    let mut file_items = Vec::new();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read entry in {}: {}", full_path.display(), e);
                continue;
            }
        };
        let entry_path = entry.path();
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => {
                warn!(
                    "Skipping entry with non-UTF8 filename in {}",
                    full_path.display()
                );
                continue;
            }
        };
        if !options.show_hidden && name.starts_with('.') {
            continue;
        }

        // Symlinks are listed only when their target stays inside the root.
        if entry.file_type().await.map(|t| t.is_symlink()).unwrap_or(false) {
            match fs::canonicalize(&entry_path).await {
                Ok(target) if root.contains(&target) => {}
                Ok(target) => {
                    debug!(
                        "Hiding symlink {} pointing outside root ({})",
                        entry_path.display(),
                        target.display()
                    );
                    continue;
                }
                Err(e) => {
                    debug!("Hiding broken symlink {}: {}", entry_path.display(), e);
                    continue;
                }
            }
        }

        let metadata = match fs::metadata(&entry_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Failed to get metadata for {}: {}", entry_path.display(), e);
                continue;
            }
        };

        let kind = EntryKind::of(&entry_path, &metadata);
        let item = Entry {
            path: if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            },
            size: if kind == EntryKind::Directory { 0 } else { metadata.len() },
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            has_preview: options.has_preview(kind),
            kind,
            name,
        };
        if kind == EntryKind::Directory {
            dir_items.push(item);
        } else {
            file_items.push(item);
        }
    }

    dir_items.sort_by(|a, b| compare_names(&a.name, &b.name));
    file_items.sort_by(|a, b| compare_names(&a.name, &b.name));
    dir_items.extend(file_items);
    Ok(dir_items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs as sync_fs;

    fn fixture() -> (tempfile::TempDir, Root) {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = temp_dir.path();
        sync_fs::create_dir_all(base.join("docs/notes")).unwrap();
        sync_fs::create_dir_all(base.join("Albums")).unwrap();
        sync_fs::write(base.join("a.jpg"), b"not really a jpeg").unwrap();
        sync_fs::write(base.join("B.mp4"), b"0123456789").unwrap();
        sync_fs::write(base.join("notes.PDF"), b"%PDF").unwrap();
        sync_fs::write(base.join("data.bin"), b"\x00\x01").unwrap();
        sync_fs::write(base.join(".hidden"), b"shh").unwrap();
        sync_fs::write(base.join("docs/readme.txt"), b"read me").unwrap();
        sync_fs::write(base.join("docs/notes/x.txt"), b"x").unwrap();
        let root = Root::new(base).unwrap();
        (temp_dir, root)
    }

    #[rstest]
    #[case("photo.JPG", EntryKind::Image)]
    #[case("clip.webm", EntryKind::Video)]
    #[case("report.docx", EntryKind::Document)]
    #[case("archive.tar.gz", EntryKind::Other)]
    #[case("Makefile", EntryKind::Other)]
    fn test_classify(#[case] name: &str, #[case] expected: EntryKind) {
        assert_eq!(EntryKind::of_file(Path::new(name)), expected);
    }

    #[tokio::test]
    async fn test_list_order_and_kinds() {
        let (_temp_dir, root) = fixture();
        let entries = list(&root, "", ListOptions::default()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("Albums", EntryKind::Directory),
                ("docs", EntryKind::Directory),
                ("a.jpg", EntryKind::Image),
                ("B.mp4", EntryKind::Video),
                ("data.bin", EntryKind::Other),
                ("notes.PDF", EntryKind::Document),
            ]
        );
        let video = entries.iter().find(|e| e.name == "B.mp4").unwrap();
        assert_eq!(video.size, 10);
        assert!(!video.has_preview);
        assert!(entries.iter().find(|e| e.name == "a.jpg").unwrap().has_preview);
        assert!(entries.iter().all(|e| e.modified_at.is_some()));
    }

    #[tokio::test]
    async fn test_list_nested_paths() {
        let (_temp_dir, root) = fixture();
        let entries = list(&root, "docs", ListOptions::default()).await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/notes", "docs/readme.txt"]);
    }

    #[tokio::test]
    async fn test_list_is_idempotent() {
        let (_temp_dir, root) = fixture();
        let first = list(&root, "", ListOptions::default()).await.unwrap();
        let second = list(&root, "", ListOptions::default()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_list_hidden_and_video_previews() {
        let (_temp_dir, root) = fixture();
        let options = ListOptions {
            show_hidden: true,
            video_previews: true,
        };
        let entries = list(&root, "", options).await.unwrap();
        assert!(entries.iter().any(|e| e.name == ".hidden"));
        assert!(entries.iter().find(|e| e.name == "B.mp4").unwrap().has_preview);
    }

    #[tokio::test]
    async fn test_list_errors() {
        let (_temp_dir, root) = fixture();
        assert!(matches!(
            list(&root, "docs/readme.txt", ListOptions::default()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            list(&root, "missing", ListOptions::default()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            list(&root, "../..", ListOptions::default()).await,
            Err(Error::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_hides_escaping_symlinks() {
        let (temp_dir, root) = fixture();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("docs"), temp_dir.path().join("shortcut")).unwrap();
        let entries = list(&root, "", ListOptions::default()).await.unwrap();
        assert!(!entries.iter().any(|e| e.name == "escape"));
        let shortcut = entries.iter().find(|e| e.name == "shortcut").unwrap();
        assert_eq!(shortcut.kind, EntryKind::Directory);
    }
}

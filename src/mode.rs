use crate::resolve::Root;
use std::{fs, path::Path};
use tracing::{debug, warn};

/// Conventional entry documents, in order of preference.
pub const ENTRY_DOCUMENTS: [&str; 2] = ["index.html", "index.htm"];

/// How the root is served. Decided once, before the router is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Serve the root as a static site starting at `entry` (relative to the root).
    WebApp { entry: String },
    /// Serve the browsable file manager.
    FileManager,
}

/// Looks for an entry HTML document directly under the root.
pub fn detect(root: &Root) -> Mode {
    match find_entry_document(root.path()) {
        Some(entry) => {
            debug!("Found entry document '{}' under root", entry);
            Mode::WebApp { entry }
        }
        None => Mode::FileManager,
    }
}

/// Finds an entry document in `dir`, matching names case-insensitively.
/// Returns the name as it appears on disk.
pub(crate) fn find_entry_document(dir: &Path) -> Option<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read directory {}: {}", dir.display(), e);
            return None;
        }
    };

    let mut candidates: Vec<(usize, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| {
            let lower = name.to_lowercase();
            ENTRY_DOCUMENTS
                .iter()
                .position(|doc| *doc == lower)
                .map(|rank| (rank, name))
        })
        .collect();
    // Exact-case names first when a directory holds both `index.html` and `INDEX.HTML`.
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
    candidates.into_iter().next().map(|(_, name)| name)
}

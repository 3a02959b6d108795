//! Streaming bulk downloads.
//!
//! A download happens in two phases, both on the blocking pool:
//!
//! 1. [`ArchivePlan::build`] resolves every selected path, walks selected
//!    directories with an explicit worklist and produces the ordered,
//!    deduplicated list of files to archive. All path errors surface here,
//!    before a single byte is written.
//! 2. [`ArchiveJob::run`] reads each planned file in chunks and pushes it
//!    through the ZIP encoder into the sink.

pub mod sink;
pub mod writer;

use crate::{
    error::{Error, Result},
    listing::compare_names,
    resolve::{normalize, Root},
};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use writer::{EntryOptions, ZipStreamWriter, ZIP64_THRESHOLD};

pub const CONTENT_TYPE: &str = "application/zip";
const READ_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Archive dot-files found while walking selected directories.
    pub include_hidden: bool,
    /// Longest a single chunk read may stall before the download is given up.
    pub entry_timeout: Duration,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            entry_timeout: Duration::from_secs(30),
        }
    }
}

/// One file to archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    /// Canonical path on disk.
    pub source: PathBuf,
    /// Name inside the archive, `/`-separated.
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ArchivePlan {
    pub entries: Vec<PlannedEntry>,
    /// Children that could not be read while walking.
    pub skipped: usize,
}

struct Selected {
    segments: Vec<String>,
    canonical: PathBuf,
}

impl ArchivePlan {
    /// Resolves and expands a selection. Selection order is kept, directories
    /// are walked depth-first with each directory's files before its
    /// subdirectories, and every canonical file appears once.
    pub fn build(root: &Root, selection: &[String], include_hidden: bool) -> Result<Self> {
        if selection.is_empty() {
            return Err(Error::EmptySelection);
        }

        let mut selected = Vec::with_capacity(selection.len());
        for relative in selection {
            let segments = segments_of(relative)?;
            let canonical = root.resolve_blocking(relative)?;
            selected.push(Selected {
                segments,
                canonical,
            });
        }
        let context = common_context(selected.iter().map(|s| s.segments.as_slice()));

        let mut plan = ArchivePlan::default();
        let mut seen_files = HashSet::new();
        let mut visited_dirs = HashSet::new();

        for item in selected {
            let name = item.segments[context..].join("/");
            let metadata = fs::metadata(&item.canonical).map_err(|e| Error::from_io(e, &name))?;
            if metadata.is_dir() {
                plan.walk(root, item.canonical, name, include_hidden, &mut seen_files, &mut visited_dirs);
            } else if metadata.is_file() {
                if seen_files.insert(item.canonical.clone()) {
                    plan.entries.push(PlannedEntry {
                        source: item.canonical,
                        name,
                    });
                }
            } else {
                debug!("Skipping special file {}", item.canonical.display());
                plan.skipped += 1;
            }
        }
        Ok(plan)
    }

    fn walk(
        &mut self,
        root: &Root,
        start: PathBuf,
        prefix: String,
        include_hidden: bool,
        seen_files: &mut HashSet<PathBuf>,
        visited_dirs: &mut HashSet<PathBuf>,
    ) {
        let mut worklist = vec![(start, prefix)];
        while let Some((dir, prefix)) = worklist.pop() {
            // Symlink cycles and overlapping selections both end up here.
            if !visited_dirs.insert(dir.clone()) {
                continue;
            }
            let children = match sorted_children(root, &dir, include_hidden) {
                Ok(children) => children,
                Err(e) => {
                    warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                    self.skipped += 1;
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            for child in children {
                let name = if prefix.is_empty() {
                    child.name
                } else {
                    format!("{}/{}", prefix, child.name)
                };
                match child.kind {
                    ChildKind::Directory => subdirs.push((child.canonical, name)),
                    ChildKind::File => {
                        if seen_files.insert(child.canonical.clone()) {
                            self.entries.push(PlannedEntry {
                                source: child.canonical,
                                name,
                            });
                        }
                    }
                    ChildKind::Skipped => self.skipped += 1,
                }
            }
            worklist.extend(subdirs.into_iter().rev());
        }
    }
}

enum ChildKind {
    Directory,
    File,
    Skipped,
}

struct Child {
    name: String,
    canonical: PathBuf,
    kind: ChildKind,
}

/// Children of `dir` in listing order, with symlinks resolved and anything
/// pointing outside the root marked as skipped.
fn sorted_children(root: &Root, dir: &Path, include_hidden: bool) -> io::Result<Vec<Child>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let Ok(name) = entry.file_name().into_string() else {
            warn!("Skipping entry with non-UTF8 filename in {}", dir.display());
            continue;
        };
        if !include_hidden && name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        let (canonical, kind) = match fs::canonicalize(&path).and_then(|c| fs::metadata(&c).map(|m| (c, m))) {
            Ok((canonical, _)) if !root.contains(&canonical) => {
                debug!("Skipping {} which points outside root", path.display());
                (canonical, ChildKind::Skipped)
            }
            Ok((canonical, metadata)) if metadata.is_dir() => (canonical, ChildKind::Directory),
            Ok((canonical, metadata)) if metadata.is_file() => (canonical, ChildKind::File),
            Ok((canonical, _)) => {
                debug!("Skipping special file {}", path.display());
                (canonical, ChildKind::Skipped)
            }
            Err(e) => {
                warn!("Skipping unreadable entry {}: {}", path.display(), e);
                (path, ChildKind::Skipped)
            }
        };
        children.push(Child {
            name,
            canonical,
            kind,
        });
    }

    children.sort_by(|a, b| compare_names(&a.name, &b.name));
    Ok(children)
}

fn segments_of(relative: &str) -> Result<Vec<String>> {
    Ok(normalize(relative)?
        .iter()
        .map(|s| s.to_string_lossy().into_owned())
        .collect())
}

/// Number of leading directory segments shared by the parents of every
/// selected path. Archive names are taken relative to that directory.
fn common_context<'a>(mut selections: impl Iterator<Item = &'a [String]>) -> usize {
    let Some(first) = selections.next() else {
        return 0;
    };
    let mut context = &first[..first.len().saturating_sub(1)];
    for segments in selections {
        let parent = &segments[..segments.len().saturating_sub(1)];
        let shared = context
            .iter()
            .zip(parent)
            .take_while(|(a, b)| a == b)
            .count();
        context = &context[..shared];
    }
    context.len()
}

/// Download filename for a selection: the single selected item, else the
/// shared parent directory, else the root's own name.
pub fn suggested_name(root: &Root, selection: &[String]) -> String {
    let selected: Vec<Vec<String>> = selection
        .iter()
        .filter_map(|relative| segments_of(relative).ok())
        .collect();
    let stem = match selected.as_slice() {
        [only] if !only.is_empty() => only[only.len() - 1].clone(),
        _ => {
            let context = common_context(selected.iter().map(|s| s.as_slice()));
            selected
                .first()
                .filter(|_| context > 0)
                .map(|first| first[context - 1].clone())
                .unwrap_or_else(|| root.display_name())
        }
    };
    let stem = stem.strip_suffix(".zip").unwrap_or(&stem).to_string();
    format!("{}.zip", stem)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub skipped: usize,
    pub bytes_read: u64,
}

enum EntryFailure {
    /// Nothing of the entry reached the sink; carry on with the next one.
    Skip(io::Error),
    /// The stream cannot continue.
    Abort(io::Error),
}

/// State of one in-flight download.
pub struct ArchiveJob {
    id: Uuid,
    plan: ArchivePlan,
    cancel: CancellationToken,
    entry_timeout: Duration,
}

impl ArchiveJob {
    pub fn new(plan: ArchivePlan, cancel: CancellationToken, entry_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan,
            cancel,
            entry_timeout,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Streams the planned entries into `sink`. Blocking.
    ///
    /// Files that cannot be opened or read before their entry starts are
    /// logged and skipped. Sink failures, cancellation, and read failures
    /// after an entry's header went out abort the whole archive; the central
    /// directory is then never written, so the output is visibly truncated.
    pub fn run<W: Write>(self, sink: W) -> Result<ArchiveSummary> {
        let span = info_span!("archive", job = %self.id);
        let _enter = span.enter();
        info!("Archiving {} planned files", self.plan.entries.len());

        let mut zip = ZipStreamWriter::new(sink);
        let mut summary = ArchiveSummary {
            skipped: self.plan.skipped,
            ..ArchiveSummary::default()
        };
        let mut buffer = vec![0u8; READ_CHUNK];

        for entry in &self.plan.entries {
            match self.append(&mut zip, entry, &mut buffer) {
                Ok(read) => {
                    summary.entries += 1;
                    summary.bytes_read += read;
                }
                Err(EntryFailure::Skip(e)) => {
                    warn!("Skipping {}: {}", entry.source.display(), e);
                    summary.skipped += 1;
                }
                Err(EntryFailure::Abort(e)) => {
                    self.cancel.cancel();
                    warn!("Archive aborted at {}: {}", entry.name, e);
                    return Err(Error::Io(e));
                }
            }
        }

        if summary.entries == 0 && !self.plan.entries.is_empty() {
            self.cancel.cancel();
            return Err(Error::Io(io::Error::other(
                "none of the selected files could be read",
            )));
        }

        zip.finish().map_err(|e| {
            self.cancel.cancel();
            Error::Io(e)
        })?;
        info!(
            "Archive complete: {} entries ({} bytes read), {} skipped",
            summary.entries, summary.bytes_read, summary.skipped
        );
        Ok(summary)
    }

    fn check_cancelled(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "download cancelled",
            ));
        }
        Ok(())
    }

    fn append<W: Write>(
        &self,
        zip: &mut ZipStreamWriter<W>,
        entry: &PlannedEntry,
        buffer: &mut [u8],
    ) -> std::result::Result<u64, EntryFailure> {
        self.check_cancelled().map_err(EntryFailure::Abort)?;

        let mut file = File::open(&entry.source).map_err(EntryFailure::Skip)?;
        let metadata = file.metadata().map_err(EntryFailure::Skip)?;
        // Read ahead before committing the entry so that small unreadable
        // files can still be skipped cleanly.
        let mut filled = self.timed_fill(&mut file, buffer).map_err(EntryFailure::Skip)?;

        zip.start_entry(
            &entry.name,
            EntryOptions {
                modified: metadata.modified().ok(),
                unix_mode: unix_mode(&metadata),
                large: metadata.len() >= ZIP64_THRESHOLD,
            },
        )
        .map_err(EntryFailure::Abort)?;

        let mut total = 0u64;
        while filled > 0 {
            zip.write_data(&buffer[..filled]).map_err(EntryFailure::Abort)?;
            total += filled as u64;
            if filled < buffer.len() {
                break;
            }
            self.check_cancelled().map_err(EntryFailure::Abort)?;
            filled = self.timed_fill(&mut file, buffer).map_err(EntryFailure::Abort)?;
        }
        zip.finish_entry().map_err(EntryFailure::Abort)?;
        Ok(total)
    }

    /// One chunk read, bounded by the stall deadline. Time spent waiting on
    /// the sink is not counted.
    fn timed_fill(&self, file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
        let started = Instant::now();
        let filled = fill(file, buffer)?;
        if started.elapsed() > self.entry_timeout {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "reading the file stalled",
            ));
        }
        Ok(filled)
    }
}

/// Reads until `buffer` is full or the file ends.
fn fill(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

/// Plans and streams `selection` into `sink`. Blocking; call from
/// `spawn_blocking`.
pub fn stream<W: Write>(
    root: &Root,
    selection: &[String],
    options: &ArchiveOptions,
    sink: W,
    cancel: CancellationToken,
) -> Result<ArchiveSummary> {
    let plan = ArchivePlan::build(root, selection, options.include_hidden)?;
    let job = ArchiveJob::new(plan, cancel, options.entry_timeout);
    debug!("Starting archive job {}", job.id());
    job.run(sink)
}

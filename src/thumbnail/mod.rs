//! On-demand preview images.
//!
//! Previews are generated lazily, keyed by the source's canonical path and
//! requested size, and validated against a [`Fingerprint`] of the source so an
//! edited file never gets a stale preview. The cache is a bounded LRU (entry
//! count and total bytes). Concurrent requests for the same uncached preview
//! share a single generation.

pub mod video;

use crate::{
    error::{Error, Result},
    listing::EntryKind,
    resolve::Root,
};
use bytes::Bytes;
use dashmap::DashMap;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};
use lru::LruCache;
use parking_lot::Mutex;
use std::{
    fs::Metadata,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CONTENT_TYPE: &str = "image/jpeg";
const JPEG_QUALITY: u8 = 80;

/// Identifies one version of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub modified: Option<SystemTime>,
    pub size: u64,
}

impl Fingerprint {
    pub fn of(metadata: &Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            size: metadata.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ThumbnailConfig {
    pub max_entries: NonZeroUsize,
    pub max_bytes: usize,
    /// Frame extractor for video previews; `None` disables them.
    pub ffmpeg: Option<PathBuf>,
    pub frame_timeout: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_entries: NonZeroUsize::new(512).unwrap_or(NonZeroUsize::MIN),
            max_bytes: 64 * 1024 * 1024,
            ffmpeg: None,
            frame_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    max_dimension: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    key: CacheKey,
    fingerprint: Fingerprint,
}

struct Cached {
    fingerprint: Fingerprint,
    thumbnail: Arc<Thumbnail>,
}

/// LRU map plus a running byte total.
struct BoundedCache {
    entries: LruCache<CacheKey, Cached>,
    bytes: usize,
    max_bytes: usize,
}

impl BoundedCache {
    fn new(max_entries: NonZeroUsize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::new(max_entries),
            bytes: 0,
            max_bytes,
        }
    }

    fn get(&mut self, key: &CacheKey, fingerprint: &Fingerprint) -> Option<Arc<Thumbnail>> {
        match self.entries.get(key) {
            Some(cached) if cached.fingerprint == *fingerprint => Some(cached.thumbnail.clone()),
            _ => None,
        }
    }

    fn insert(&mut self, key: CacheKey, fingerprint: Fingerprint, thumbnail: Arc<Thumbnail>) {
        let size = thumbnail.bytes.len();
        if size > self.max_bytes {
            return;
        }
        if let Some(old) = self.entries.pop(&key) {
            self.bytes -= old.thumbnail.bytes.len();
        }
        while self.bytes + size > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.thumbnail.bytes.len(),
                None => break,
            }
        }
        if let Some((_, evicted)) = self.entries.push(
            key,
            Cached {
                fingerprint,
                thumbnail,
            },
        ) {
            self.bytes -= evicted.thumbnail.bytes.len();
        }
        self.bytes += size;
    }
}

type Flight = Arc<OnceCell<Result<Arc<Thumbnail>>>>;

/// Shared preview generator and cache.
pub struct Thumbnailer {
    config: ThumbnailConfig,
    cache: Mutex<BoundedCache>,
    in_flight: DashMap<FlightKey, Flight>,
    generations: AtomicU64,
}

impl Thumbnailer {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self {
            cache: Mutex::new(BoundedCache::new(config.max_entries, config.max_bytes)),
            in_flight: DashMap::new(),
            generations: AtomicU64::new(0),
            config,
        }
    }

    pub fn video_previews(&self) -> bool {
        self.config.ffmpeg.is_some()
    }

    /// Number of decode passes run so far.
    pub fn generation_count(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn cached_bytes(&self) -> usize {
        self.cache.lock().bytes
    }

    /// Returns a JPEG preview of `relative` whose longer edge is at most
    /// `max_dimension`.
    pub async fn preview(
        &self,
        root: &Root,
        relative: &str,
        max_dimension: u32,
    ) -> Result<Arc<Thumbnail>> {
        let path = root.resolve(relative).await?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::from_io(e, relative))?;
        if metadata.is_dir() {
            return Err(Error::UnsupportedType(relative.to_string()));
        }
        let kind = EntryKind::of_file(&path);
        match kind {
            EntryKind::Image => {}
            EntryKind::Video if self.video_previews() => {}
            _ => return Err(Error::UnsupportedType(relative.to_string())),
        }

        let fingerprint = Fingerprint::of(&metadata);
        let key = CacheKey {
            path,
            max_dimension,
        };
        if let Some(hit) = self.cache.lock().get(&key, &fingerprint) {
            return Ok(hit);
        }

        let flight_key = FlightKey {
            key: key.clone(),
            fingerprint,
        };
        let flight = self.in_flight.entry(flight_key.clone()).or_default().clone();
        let result = flight
            .get_or_init(|| async {
                // A previous flight may have finished between the lookup above
                // and joining this one.
                if let Some(hit) = self.cache.lock().get(&key, &fingerprint) {
                    return Ok(hit);
                }
                let generated = self.generate(&key.path, kind, relative, max_dimension).await;
                if let Ok(thumbnail) = &generated {
                    self.cache.lock().insert(key.clone(), fingerprint, thumbnail.clone());
                }
                generated
            })
            .await
            .clone();
        self.in_flight
            .remove_if(&flight_key, |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    async fn generate(
        &self,
        path: &Path,
        kind: EntryKind,
        relative: &str,
        max_dimension: u32,
    ) -> Result<Arc<Thumbnail>> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        debug!("Generating {}px preview for {}", max_dimension, path.display());

        let frame = match (kind, &self.config.ffmpeg) {
            (EntryKind::Video, Some(ffmpeg)) => Some(
                video::extract_frame(ffmpeg, path, relative, self.config.frame_timeout).await?,
            ),
            _ => None,
        };

        // Dropping this future cancels the token, which the blocking render
        // checks between stages.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let source = path.to_path_buf();
        let relative_owned = relative.to_string();
        let rendered = tokio::task::spawn_blocking(move || {
            render(&source, frame.as_deref(), &relative_owned, max_dimension, &cancel)
        })
        .await
        .map_err(|e| {
            warn!("Preview task for {} failed: {}", path.display(), e);
            Error::Io(std::io::Error::other(e))
        })??;
        Ok(Arc::new(rendered))
    }
}

fn interrupted() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Interrupted,
        "preview request cancelled",
    ))
}

/// Decodes, scales and re-encodes one preview. Runs on the blocking pool.
fn render(
    source: &Path,
    frame: Option<&[u8]>,
    relative: &str,
    max_dimension: u32,
    cancel: &CancellationToken,
) -> Result<Thumbnail> {
    let decoded = match frame {
        Some(bytes) => image::load_from_memory(bytes),
        None => image::open(source),
    };
    let image = decoded.map_err(|e| {
        debug!("Failed to decode {}: {}", source.display(), e);
        Error::UnsupportedType(relative.to_string())
    })?;
    if cancel.is_cancelled() {
        return Err(interrupted());
    }

    let image = scale(image, max_dimension);
    if cancel.is_cancelled() {
        return Err(interrupted());
    }

    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| {
            warn!("Failed to encode preview for {}: {}", source.display(), e);
            Error::UnsupportedType(relative.to_string())
        })?;

    Ok(Thumbnail {
        bytes: Bytes::from(bytes),
        content_type: CONTENT_TYPE,
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Shrinks so the longer edge equals `max_dimension`, preserving aspect
/// ratio. Images already within bounds are left at their own size.
fn scale(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let max_dimension = max_dimension.max(1);
    if image.width().max(image.height()) <= max_dimension {
        return image;
    }
    image.resize(max_dimension, max_dimension, FilterType::Triangle)
}

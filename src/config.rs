use crate::{archive::ArchiveOptions, mode::Mode, resolve::Root, thumbnail::ThumbnailConfig};

/// Smallest and largest preview edge a client may ask for.
pub const MIN_THUMBNAIL_SIZE: u32 = 16;
pub const MAX_THUMBNAIL_SIZE: u32 = 2048;

/// Everything the server needs, resolved before the router is built.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub root: Root,
    pub mode: Mode,
    /// Preview edge used when a request doesn't ask for one.
    pub thumbnail_size: u32,
    pub thumbnails: ThumbnailConfig,
    pub archive: ArchiveOptions,
    pub show_hidden: bool,
}

impl ServeConfig {
    /// File-manager defaults for `root`.
    pub fn new(root: Root, mode: Mode) -> Self {
        Self {
            root,
            mode,
            thumbnail_size: 256,
            thumbnails: ThumbnailConfig::default(),
            archive: ArchiveOptions::default(),
            show_hidden: false,
        }
    }
}

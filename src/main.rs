use clap::{Parser, ValueEnum};
use dirshare::{
    config::{ServeConfig, MAX_THUMBNAIL_SIZE, MIN_THUMBNAIL_SIZE},
    mode::{self, Mode},
    thumbnail::video,
    Root,
};
use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Web app when the root has an index.html, file manager otherwise
    Auto,
    WebApp,
    FileManager,
}

// --- Configuration ---
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The directory to share
    #[arg(short, long, value_name = "DIR", default_value = ".", env = "DIRSHARE_ROOT_DIR")]
    root_dir: PathBuf,

    /// The network address to bind to
    #[arg(short, long, value_name = "ADDR", default_value = "0.0.0.0:8000", env = "DIRSHARE_BIND_ADDR")]
    bind_addr: SocketAddr,

    /// How to serve the directory
    #[arg(long, value_enum, default_value_t = ModeArg::Auto, env = "DIRSHARE_MODE")]
    mode: ModeArg,

    /// Default preview edge in pixels
    #[arg(long, value_name = "PX", default_value_t = 256, env = "DIRSHARE_THUMBNAIL_SIZE")]
    thumbnail_size: u32,

    /// Maximum number of cached previews
    #[arg(long, value_name = "N", default_value_t = 512, env = "DIRSHARE_THUMBNAIL_CACHE_ENTRIES")]
    thumbnail_cache_entries: usize,

    /// Maximum total size of cached previews in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 64 * 1024 * 1024, env = "DIRSHARE_THUMBNAIL_CACHE_BYTES")]
    thumbnail_cache_bytes: usize,

    /// Seconds an archive entry may stall before the download is aborted
    #[arg(long, value_name = "SECS", default_value_t = 30, env = "DIRSHARE_ENTRY_TIMEOUT_SECS")]
    entry_timeout_secs: u64,

    /// List and archive dot-files
    #[arg(long, env = "DIRSHARE_SHOW_HIDDEN")]
    show_hidden: bool,

    /// ffmpeg binary for video previews (looked up on PATH when omitted)
    #[arg(long, value_name = "PATH", env = "DIRSHARE_FFMPEG")]
    ffmpeg: Option<PathBuf>,
}

fn exit_with(message: String) -> ! {
    error!("{}. Exiting.", message);
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: setting default subscriber failed: {}", e);
        std::process::exit(1);
    }

    let root = match Root::new(&args.root_dir) {
        Ok(root) => root,
        Err(e) => exit_with(format!(
            "Failed to use '{}' as the shared directory: {}",
            args.root_dir.display(),
            e
        )),
    };

    let detected = mode::detect(&root);
    let mode = match args.mode {
        ModeArg::Auto => detected,
        ModeArg::FileManager => Mode::FileManager,
        ModeArg::WebApp => match detected {
            Mode::WebApp { entry } => Mode::WebApp { entry },
            Mode::FileManager => exit_with(format!(
                "'{}' has no index.html to serve as a web app",
                root.path().display()
            )),
        },
    };

    let ffmpeg = args.ffmpeg.clone().or_else(video::discover);

    let mut config = ServeConfig::new(root, mode);
    let clamped = args
        .thumbnail_size
        .clamp(MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE);
    if clamped != args.thumbnail_size {
        warn!(
            "Thumbnail size {} out of range, using {}",
            args.thumbnail_size, clamped
        );
    }
    config.thumbnail_size = clamped;
    config.thumbnails.max_entries =
        NonZeroUsize::new(args.thumbnail_cache_entries).unwrap_or(NonZeroUsize::MIN);
    config.thumbnails.max_bytes = args.thumbnail_cache_bytes;
    config.thumbnails.ffmpeg = ffmpeg;
    config.archive.entry_timeout = Duration::from_secs(args.entry_timeout_secs.max(1));
    config.show_hidden = args.show_hidden;

    info!("Serving files from: {}", config.root.path().display());
    match &config.mode {
        Mode::WebApp { entry } => info!("Mode: web app (entry '{}')", entry),
        Mode::FileManager => info!("Mode: file manager"),
    }
    info!("Listening on: {}", args.bind_addr);

    let app = dirshare::router(config);

    let listener = match tokio::net::TcpListener::bind(args.bind_addr).await {
        Ok(l) => l,
        Err(e) => exit_with(format!("Failed to bind to address {}: {}", args.bind_addr, e)),
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        eprintln!("Server error: {}", e);
    }
}

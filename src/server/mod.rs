//! HTTP surface. Handlers only translate between HTTP and the core modules.

mod handlers;
mod ui;

use crate::{
    archive::ArchiveOptions,
    config::ServeConfig,
    listing::ListOptions,
    mode::Mode,
    resolve::Root,
    thumbnail::Thumbnailer,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub root: Root,
    pub mode: Mode,
    pub thumbnails: Thumbnailer,
    pub thumbnail_size: u32,
    pub archive: ArchiveOptions,
    pub show_hidden: bool,
}

impl AppState {
    pub fn new(config: ServeConfig) -> Self {
        let archive = ArchiveOptions {
            include_hidden: config.show_hidden,
            ..config.archive
        };
        Self {
            root: config.root,
            mode: config.mode,
            thumbnails: Thumbnailer::new(config.thumbnails),
            thumbnail_size: config.thumbnail_size,
            archive,
            show_hidden: config.show_hidden,
        }
    }

    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            show_hidden: self.show_hidden,
            video_previews: self.thumbnails.video_previews(),
        }
    }
}

/// Builds the router for the configured mode.
pub fn router(config: ServeConfig) -> Router {
    router_with_state(Arc::new(AppState::new(config)))
}

pub fn router_with_state(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_origin(Any);

    let routes = match state.mode {
        Mode::FileManager => Router::new()
            .route("/", get(ui::index_handler))
            .route("/files/*path", get(ui::directory_handler))
            .route("/browse", get(handlers::browse_root_handler))
            .route("/browse/", get(handlers::browse_root_handler))
            .route("/browse/*path", get(handlers::browse_handler))
            .route("/preview/*path", get(handlers::preview_handler))
            .route("/download", post(handlers::download_handler))
            .route("/raw/*path", get(handlers::raw_handler)),
        Mode::WebApp { .. } => Router::new()
            .route("/", get(handlers::webapp_index_handler))
            .route("/*path", get(handlers::webapp_asset_handler)),
    };

    routes
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

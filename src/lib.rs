//! Shares a directory over the local network, either as a static web app or
//! as a browsable file manager with previews and ZIP downloads.

pub mod archive;
pub mod config;
pub mod error;
pub mod listing;
pub mod mode;
pub mod resolve;
pub mod server;
pub mod thumbnail;

pub use config::ServeConfig;
pub use error::{Error, Result};
pub use mode::Mode;
pub use resolve::Root;
pub use server::router;

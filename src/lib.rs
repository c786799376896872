#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod feed;
pub mod gesture;
pub mod media;
pub mod playback;
pub mod prefetch;
pub mod source;
pub mod storage;
pub mod ui;
pub mod upload;
pub mod video;
pub mod viewport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;

//! url-kitchen: a url graph cooked by plugins, built into versioned files.

pub mod build;
pub mod cli;
pub mod config;
pub mod dev;
pub mod error;
pub mod export;
pub mod graph;
pub mod kitchen;
pub mod plugin;
pub mod plugins;
pub mod transformer;
pub mod url_meta;

pub use build::{BuildInfo, BuildOptions, build, write_build_files};
pub use error::{KitchenError, KitchenResult};
pub use kitchen::{Kitchen, KitchenContext};
pub use plugin::Plugin;

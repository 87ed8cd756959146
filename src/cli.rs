use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::build::VersioningMethod;
use crate::config::KitchenConfig;
use crate::export::ExportFormat;
use crate::transformer::SourcemapMode;

/// Browser-oriented build toolchain: cooks a url graph from html entry points and writes
/// content-hash versioned build files.
///
/// Settings come from `url-kitchen.toml` at the project root; flags override them.
#[derive(Parser, Debug)]
#[command(name = "url-kitchen", version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Log debug events (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command that reads a project.
#[derive(clap::Args, Debug, Default)]
pub struct ProjectArgs {
    /// Project root holding `url-kitchen.toml`.
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Source directory, relative to the project root.
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Entry point relative to the source directory (repeatable).
    #[arg(long = "entry")]
    pub entry_points: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the entry points into the build directory.
    Build {
        #[command(flatten)]
        project: ProjectArgs,

        /// Build directory, relative to the project root.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Base prepended to every build specifier.
        #[arg(long)]
        base: Option<String>,

        /// Disable content-hash versioning.
        #[arg(long)]
        no_versioning: bool,

        #[arg(long, value_enum)]
        versioning_method: Option<VersioningMethod>,

        #[arg(long, value_enum)]
        sourcemaps: Option<SourcemapMode>,

        /// Print the build manifest as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Cook the entry points and print the resulting url graph.
    Graph {
        #[command(flatten)]
        project: ProjectArgs,

        #[arg(long, value_enum, default_value_t = ExportFormat::Text)]
        format: ExportFormat,
    },

    /// Serve the source directory, cooking files on request.
    #[cfg(feature = "web")]
    Dev {
        #[command(flatten)]
        project: ProjectArgs,

        #[arg(long)]
        port: Option<u16>,
    },
}

impl ProjectArgs {
    /// Config file values with these flags applied on top.
    pub fn config(&self) -> KitchenConfig {
        let mut config = KitchenConfig::load(&self.path);
        if let Some(source) = &self.source {
            config.source_directory = source.clone();
        }
        if !self.entry_points.is_empty() {
            config.entry_points = self.entry_points.clone();
        }
        config
    }
}

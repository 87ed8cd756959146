use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::build::{BuildOptions, VersioningMethod};
use crate::dev::DevServerOptions;
use crate::transformer::SourcemapMode;

pub const CONFIG_FILE: &str = "url-kitchen.toml";

/// Configuration loaded from `url-kitchen.toml` at the project root.
///
/// Directories are relative to the project root.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct KitchenConfig {
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub entry_points: Vec<String>,
    pub base: String,
    pub assets_directory: String,
    pub versioning: bool,
    pub versioning_method: VersioningMethod,
    pub versioning_via_importmap: bool,
    pub runtime_supports_importmap: bool,
    /// Defaults to `none` for builds and `inline` in dev.
    pub sourcemaps: Option<SourcemapMode>,
    pub sourcemaps_sources_content: bool,
    pub ignore: Vec<String>,
    /// Pattern -> whether matching files are watched in dev.
    pub watch: BTreeMap<String, bool>,
    pub resource_hints: bool,
    pub service_worker_entries: Vec<String>,
    pub out_directory: Option<PathBuf>,
    pub http_port: u16,
}

impl Default for KitchenConfig {
    fn default() -> Self {
        Self {
            source_directory: PathBuf::from("src"),
            build_directory: PathBuf::from("dist"),
            entry_points: vec!["./index.html".to_owned()],
            base: "/".to_owned(),
            assets_directory: "assets/".to_owned(),
            versioning: true,
            versioning_method: VersioningMethod::Filename,
            versioning_via_importmap: true,
            runtime_supports_importmap: true,
            sourcemaps: None,
            sourcemaps_sources_content: true,
            ignore: Vec::new(),
            watch: BTreeMap::new(),
            resource_hints: true,
            service_worker_entries: Vec::new(),
            out_directory: None,
            http_port: 3456,
        }
    }
}

impl KitchenConfig {
    /// Load `url-kitchen.toml` from `root`.
    ///
    /// Returns the defaults if the file does not exist or cannot be parsed.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!(path = %config_path.display(), error = %err, "invalid config, using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(path = %config_path.display(), error = %err, "cannot read config, using defaults");
                Self::default()
            }
        }
    }

    pub fn build_options(&self, root: &Path) -> anyhow::Result<BuildOptions> {
        let mut options = BuildOptions::new(
            directory_url(root, &self.source_directory)?,
            directory_url(root, &self.build_directory)?,
            self.entry_points.clone(),
        );
        options.base = self.base.clone();
        options.assets_directory = self.assets_directory.clone();
        options.versioning = self.versioning;
        options.versioning_method = self.versioning_method;
        options.versioning_via_importmap = self.versioning_via_importmap;
        options.runtime_supports_importmap = self.runtime_supports_importmap;
        options.sourcemaps = self.sourcemaps.unwrap_or(SourcemapMode::None);
        options.sourcemaps_sources_content = self.sourcemaps_sources_content;
        options.resource_hints = self.resource_hints;
        options.service_worker_entries = self.service_worker_entries.clone();
        options.ignore = self.ignore.clone();
        Ok(options)
    }

    pub fn dev_options(&self, root: &Path) -> anyhow::Result<DevServerOptions> {
        let mut options = DevServerOptions::new(directory_url(root, &self.source_directory)?);
        if let Some(main_file) = self.main_file() {
            options.main_file = main_file.to_owned();
        }
        // Configured patterns refine the defaults.
        options
            .watch
            .extend(self.watch.iter().map(|(pattern, watched)| (pattern.clone(), *watched)));
        options.out_directory_url = self
            .out_directory
            .as_deref()
            .map(|dir| directory_url(root, dir))
            .transpose()?;
        Ok(options)
    }

    /// Main file served for `/`: the first html entry point.
    pub fn main_file(&self) -> Option<&str> {
        self.entry_points
            .iter()
            .find(|e| e.ends_with(".html"))
            .map(|e| e.trim_start_matches("./"))
    }
}

fn directory_url(root: &Path, relative: &Path) -> anyhow::Result<Url> {
    let path = std::path::absolute(root.join(relative))
        .with_context(|| format!("cannot resolve {}", relative.display()))?;
    Url::from_directory_path(&path).map_err(|()| anyhow::anyhow!("not a directory path: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(KitchenConfig::load(dir.path()), KitchenConfig::default());
    }

    #[test]
    fn test_invalid_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "versioning = \"maybe\"\n").unwrap();
        assert_eq!(KitchenConfig::load(dir.path()), KitchenConfig::default());
    }

    #[test]
    fn test_values_flow_into_build_options() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
source_directory = "app"
build_directory = "out"
entry_points = ["./main.html"]
base = "/site"
versioning_method = "search_param"
sourcemaps = "file"
ignore = ["./legacy/"]

[watch]
"./generated/" = false
"#,
        )
        .unwrap();
        let config = KitchenConfig::load(dir.path());
        assert_eq!(config.main_file(), Some("main.html"));

        let options = config.build_options(dir.path()).unwrap();
        assert!(options.source_directory_url.as_str().ends_with("/app/"));
        assert!(options.build_directory_url.as_str().ends_with("/out/"));
        assert_eq!(options.base, "/site");
        assert_eq!(options.versioning_method, VersioningMethod::SearchParam);
        assert_eq!(options.sourcemaps, SourcemapMode::File);
        assert_eq!(options.ignore, vec!["./legacy/".to_owned()]);

        let dev = config.dev_options(dir.path()).unwrap();
        assert_eq!(dev.watch.last(), Some(&("./generated/".to_owned(), false)));
    }
}

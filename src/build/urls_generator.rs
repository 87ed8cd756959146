use std::collections::HashMap;

use url::Url;

use crate::graph::url_info::UrlType;
use crate::url_meta::strip_search_and_hash;

/// Where a source url lands in the build directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Same relative path as in the source directory (html pages, service workers).
    KeepPath,
    /// Flattened into `<assets>/<js|css|other>/`.
    Assets,
}

/// Allocates build urls, one file name per source url and directory.
///
/// A name already taken by another source url gets an integer suffix starting at 2
/// (`main.js`, `main2.js`, ...).
#[derive(Debug)]
pub struct BuildUrlsGenerator {
    source_directory_url: Url,
    build_directory_url: Url,
    assets_directory: String,
    /// build url -> source url owning it
    taken: HashMap<String, String>,
    /// source url -> build url
    allocated: HashMap<String, String>,
}

impl BuildUrlsGenerator {
    pub fn new(source_directory_url: Url, build_directory_url: Url, assets_directory: &str) -> Self {
        let mut assets_directory = assets_directory.trim_start_matches('/').to_owned();
        if !assets_directory.is_empty() && !assets_directory.ends_with('/') {
            assets_directory.push('/');
        }
        Self {
            source_directory_url,
            build_directory_url,
            assets_directory,
            taken: HashMap::new(),
            allocated: HashMap::new(),
        }
    }

    pub fn build_directory_url(&self) -> &Url {
        &self.build_directory_url
    }

    /// Build url for `source_url`; the same source url always gets the same answer.
    pub fn generate(&mut self, source_url: &str, url_type: Option<UrlType>, placement: Placement) -> String {
        if let Some(existing) = self.allocated.get(source_url) {
            return existing.clone();
        }
        let without_search = strip_search_and_hash(source_url);
        let (directory, file_name) = match placement {
            Placement::KeepPath => match without_search.strip_prefix(self.source_directory_url.as_str()) {
                Some(relative) => match relative.rsplit_once('/') {
                    Some((dir, name)) => (format!("{dir}/"), name.to_owned()),
                    None => (String::new(), relative.to_owned()),
                },
                None => (String::new(), basename(without_search).to_owned()),
            },
            Placement::Assets => {
                let sub = match url_type {
                    Some(t) if t.is_js() => "js/",
                    Some(UrlType::Css) => "css/",
                    _ => "other/",
                };
                (format!("{}{sub}", self.assets_directory), basename(without_search).to_owned())
            }
        };
        let file_name = canonical_file_name(&file_name, url_type);
        let (stem, extension) = split_extension(&file_name);
        let mut candidate = format!("{}{directory}{file_name}", self.build_directory_url);
        let mut n = 2;
        while self.taken.get(&candidate).is_some_and(|owner| owner != source_url) {
            candidate = format!("{}{directory}{stem}{n}{extension}", self.build_directory_url);
            n += 1;
        }
        self.taken.insert(candidate.clone(), source_url.to_owned());
        self.allocated.insert(source_url.to_owned(), candidate.clone());
        candidate
    }

    /// Build url already allocated to `source_url`.
    pub fn allocated(&self, source_url: &str) -> Option<&str> {
        self.allocated.get(source_url).map(String::as_str)
    }

    /// Path of a build url relative to the build directory, with forward slashes.
    pub fn relative(&self, build_url: &str) -> Option<String> {
        build_url
            .strip_prefix(self.build_directory_url.as_str())
            .map(str::to_owned)
    }
}

fn basename(url: &str) -> &str {
    let name = url.rsplit('/').next().unwrap_or(url);
    if name.is_empty() { "index" } else { name }
}

/// Output extension for a source file: `.ts`, `.tsx`, `.jsx` and friends become `.js`.
fn canonical_file_name(file_name: &str, url_type: Option<UrlType>) -> String {
    let (stem, extension) = split_extension(file_name);
    match (url_type, extension) {
        (Some(t), ".ts" | ".tsx" | ".jsx" | ".mts" | ".cts") if t.is_js() => format!("{stem}.js"),
        (Some(t), "") if t.is_js() => format!("{stem}.js"),
        (Some(UrlType::Css), "") => format!("{stem}.css"),
        _ => file_name.to_owned(),
    }
}

/// Split `name.ext` into `("name", ".ext")`; dotfiles have no extension.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(0) | None => (file_name, ""),
        Some(i) => (&file_name[..i], &file_name[i..]),
    }
}

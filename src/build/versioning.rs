//! Content-addressed versions of build files.
//!
//! A version is computed in two passes. First every file gets a content-only hash, taken
//! with all placeholders set to the default one. Then a file's version hashes its own
//! content hash together with the content hashes of every file it embeds the url of,
//! transitively: changing such a file changes the bytes of the referrer once the
//! versioned specifiers are written.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::placeholders::with_default_placeholders;
use super::urls_generator::split_extension;
use crate::error::{KitchenError, KitchenResult};
use crate::graph::url_info::Content;

/// Number of hex chars of a version.
pub const VERSION_LENGTH: usize = 8;

/// Where the version goes in a build url.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VersioningMethod {
    /// `main-1a2b3c4d.js`
    #[default]
    Filename,
    /// `main.js?v=1a2b3c4d`
    SearchParam,
}

/// How a reference to a versioned file is written in the final content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningRendering {
    /// The specifier itself carries the version.
    Embedded,
    /// Unversioned specifier, the import map maps it to the versioned url.
    Importmap,
    /// `__v__("specifier")`, resolved by a table injected at entry points.
    Global,
    /// The target is not versioned (html pages, service workers, sourcemaps).
    Unversioned,
}

impl VersioningRendering {
    /// Whether the referrer's bytes depend on the target's version.
    pub fn propagates_version(&self) -> bool {
        matches!(self, VersioningRendering::Embedded)
    }
}

/// Hash of `content` with placeholders neutralized.
pub fn content_hash(content: &Content) -> String {
    let mut hasher = Sha256::new();
    match content {
        Content::Text(text) => hasher.update(with_default_placeholders(text).as_bytes()),
        Content::Binary(bytes) => hasher.update(bytes),
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Per-file input of the second pass.
#[derive(Debug, Clone, Default)]
pub struct VersionInput {
    /// `None` when the file has no content to hash.
    pub content_hash: Option<String>,
    /// Files whose versioned url is written into this file's content.
    pub embeds: BTreeSet<String>,
}

/// Version of every url in `versioned`, from the content hashes of `inputs`.
///
/// Every url reached through `embeds` must have a content hash; a missing one means the
/// graph lost a used file and aborts the versioning.
pub fn compute_versions(
    inputs: &BTreeMap<String, VersionInput>,
    versioned: &BTreeSet<String>,
) -> KitchenResult<BTreeMap<String, String>> {
    let mut versions = BTreeMap::new();
    for url in versioned {
        let own = hash_of(inputs, url, url)?;
        let mut influences = BTreeSet::new();
        let mut stack: Vec<&String> = inputs
            .get(url)
            .map(|i| i.embeds.iter().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if current == url || !influences.insert(current.clone()) {
                continue;
            }
            if let Some(input) = inputs.get(current) {
                stack.extend(input.embeds.iter());
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(own.as_bytes());
        for influence in &influences {
            hasher.update(hash_of(inputs, url, influence)?.as_bytes());
        }
        let digest = hex(&hasher.finalize());
        versions.insert(url.clone(), digest[..VERSION_LENGTH].to_owned());
    }
    Ok(versions)
}

fn hash_of<'a>(inputs: &'a BTreeMap<String, VersionInput>, url: &str, dependency: &str) -> KitchenResult<&'a str> {
    inputs
        .get(dependency)
        .and_then(|i| i.content_hash.as_deref())
        .ok_or_else(|| KitchenError::Versioning {
            url: url.to_owned(),
            missing: dependency.to_owned(),
        })
}

/// `build_url` carrying `version` the way `method` says.
pub fn versioned_url(build_url: &str, version: &str, method: VersioningMethod) -> String {
    match method {
        VersioningMethod::Filename => {
            let (before_search, search) = match build_url.find(['?', '#']) {
                Some(i) => build_url.split_at(i),
                None => (build_url, ""),
            };
            let (directory, file_name) = match before_search.rsplit_once('/') {
                Some((dir, name)) => (format!("{dir}/"), name),
                None => (String::new(), before_search),
            };
            let (stem, extension) = split_extension(file_name);
            format!("{directory}{stem}-{version}{extension}{search}")
        }
        VersioningMethod::SearchParam => {
            let separator = if build_url.contains('?') { '&' } else { '?' };
            format!("{build_url}{separator}v={version}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::placeholders::placeholder;

    fn input(content: &str, embeds: &[&str]) -> VersionInput {
        VersionInput {
            content_hash: Some(content_hash(&Content::Text(content.to_owned()))),
            embeds: embeds.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn set(urls: &[&str]) -> BTreeSet<String> {
        urls.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_content_hash_ignores_placeholder_ids() {
        let a = Content::Text(format!("import {};", placeholder(1)));
        let b = Content::Text(format!("import {};", placeholder(42)));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_embedded_dependencies_propagate_transitively() {
        let mut inputs = BTreeMap::from([
            ("page.css".to_owned(), input("body{}", &["bg.png"])),
            ("bg.png".to_owned(), input("png-1", &[])),
            ("lazy.js".to_owned(), input("lazy-1", &[])),
            ("main.js".to_owned(), input("main", &[])),
        ]);
        let all = set(&["page.css", "bg.png", "lazy.js", "main.js"]);
        let before = compute_versions(&inputs, &all).unwrap();

        inputs.insert("bg.png".to_owned(), input("png-2", &[]));
        inputs.insert("lazy.js".to_owned(), input("lazy-2", &[]));
        let after = compute_versions(&inputs, &all).unwrap();

        assert_ne!(before["page.css"], after["page.css"], "css embeds the png url");
        assert_ne!(before["lazy.js"], after["lazy.js"]);
        assert_eq!(before["main.js"], after["main.js"], "runtime-resolved import does not propagate");
        assert_eq!(after["main.js"].len(), VERSION_LENGTH);
    }

    #[test]
    fn test_cycles_terminate() {
        let inputs = BTreeMap::from([
            ("a.js".to_owned(), input("a", &["b.js"])),
            ("b.js".to_owned(), input("b", &["a.js"])),
        ]);
        let versions = compute_versions(&inputs, &set(&["a.js", "b.js"])).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn test_missing_hash_is_an_error() {
        let inputs = BTreeMap::from([("a.js".to_owned(), input("a", &["gone.js"]))]);
        let err = compute_versions(&inputs, &set(&["a.js"])).unwrap_err();
        assert!(matches!(err, KitchenError::Versioning { ref missing, .. } if missing == "gone.js"));
    }

    #[test]
    fn test_versioned_url_methods() {
        assert_eq!(
            versioned_url("file:///dist/assets/js/a.js", "1a2b3c4d", VersioningMethod::Filename),
            "file:///dist/assets/js/a-1a2b3c4d.js"
        );
        assert_eq!(
            versioned_url("file:///dist/assets/js/a.js", "1a2b3c4d", VersioningMethod::SearchParam),
            "file:///dist/assets/js/a.js?v=1a2b3c4d"
        );
    }
}

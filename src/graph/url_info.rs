use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sourcemap::SourceMap;

use crate::error::KitchenError;
use crate::graph::reference::{ReferenceId, search_params_of};
use crate::url_meta::strip_search_and_hash;

/// Content type category of a url.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlType {
    Html,
    Css,
    JsModule,
    JsClassic,
    Json,
    Webmanifest,
    Sourcemap,
    Svg,
    Text,
    Directory,
    Other,
}

impl UrlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlType::Html => "html",
            UrlType::Css => "css",
            UrlType::JsModule => "js_module",
            UrlType::JsClassic => "js_classic",
            UrlType::Json => "json",
            UrlType::Webmanifest => "webmanifest",
            UrlType::Sourcemap => "sourcemap",
            UrlType::Svg => "svg",
            UrlType::Text => "text",
            UrlType::Directory => "directory",
            UrlType::Other => "other",
        }
    }

    pub fn is_js(&self) -> bool {
        matches!(self, UrlType::JsModule | UrlType::JsClassic)
    }

    /// Types whose content is valid UTF-8 text.
    pub fn is_textual(&self) -> bool {
        !matches!(self, UrlType::Other)
    }

    /// Types that can carry a `sourceMappingURL` comment.
    pub fn supports_sourcemap(&self) -> bool {
        matches!(self, UrlType::JsModule | UrlType::JsClassic | UrlType::Css)
    }

    /// Infer the type from a content-type header value.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/html" => UrlType::Html,
            "text/css" => UrlType::Css,
            "text/javascript" | "application/javascript" | "application/x-javascript" => {
                UrlType::JsModule
            }
            "application/manifest+json" => UrlType::Webmanifest,
            "application/json" => UrlType::Json,
            "image/svg+xml" => UrlType::Svg,
            "inode/directory" => UrlType::Directory,
            other if other.starts_with("text/") => UrlType::Text,
            other if other.ends_with("+json") || other.ends_with("+xml") => UrlType::Text,
            _ => UrlType::Other,
        }
    }

    /// Whether content fetched as `fetched` satisfies a reference expecting `self`.
    ///
    /// `Other` and `Text` carry no information and are accepted for any expectation.
    pub fn accepts(&self, fetched: UrlType) -> bool {
        if *self == fetched || matches!(fetched, UrlType::Other | UrlType::Text) {
            return true;
        }
        let json_like = |t: UrlType| matches!(t, UrlType::Json | UrlType::Webmanifest | UrlType::Sourcemap);
        (self.is_js() && fetched.is_js()) || (json_like(*self) && json_like(fetched))
    }
}

impl fmt::Display for UrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bytes of a url, kept as text whenever the type is textual.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Binary(Vec<u8>),
}

impl Content {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(s) => s.as_bytes(),
            Content::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Binary(value)
    }
}

/// Value computed on first access and dropped on the next content change.
#[derive(Debug, Default)]
pub struct Lazy<T> {
    cell: OnceLock<T>,
}

impl<T: Clone> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        let cell = OnceLock::new();
        if let Some(v) = self.cell.get() {
            let _ = cell.set(v.clone());
        }
        Self { cell }
    }
}

impl<T> Lazy<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    pub fn get_or_init(&self, f: impl FnOnce() -> T) -> &T {
        self.cell.get_or_init(f)
    }

    pub fn is_computed(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn invalidate(&mut self) {
        self.cell = OnceLock::new();
    }

    /// Replace the cached value without computing it.
    pub fn set(&mut self, value: T) {
        self.cell = OnceLock::from(value);
    }
}

/// Where inline content lives inside the real file that embeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineUrlSite {
    /// Url of the non-inline file whose bytes contain the inline content.
    pub url: String,
    pub line: usize,
    pub column: usize,
}

/// Etag of a byte buffer: hex length and a truncated base64 sha256.
pub fn content_etag(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let encoded = STANDARD_NO_PAD.encode(digest);
    format!("{:x}-{}", bytes.len(), &encoded[..27])
}

/// Node of the url graph: one url, its content and its cooking state.
#[derive(Debug, Clone)]
pub struct UrlInfo {
    url: String,
    pub original_url: Option<String>,
    pub generated_url: Option<String>,
    pub filename_hint: Option<String>,
    pub url_type: Option<UrlType>,
    pub subtype: Option<String>,
    pub content_type: Option<String>,
    original_content: Option<Content>,
    content: Option<Content>,
    original_content_etag: Lazy<String>,
    content_etag: Lazy<String>,
    content_length: Lazy<usize>,
    pub sourcemap: Option<SourceMap>,
    pub is_inline: bool,
    pub inline_url_site: Option<InlineUrlSite>,
    pub is_entry_point: bool,
    pub is_root: bool,
    pub is_watched: bool,
    /// Content produced by the kitchen itself (sourcemap files); never fetched.
    pub kitchen_generated: bool,
    /// Urls of nodes that are this url with extra search params.
    pub search_param_variants: BTreeSet<String>,
    /// Urls this node depends on without mentioning them (package.json, ...).
    pub implicit_urls: BTreeSet<String>,
    pub first_reference: Option<ReferenceId>,
    pub content_finalized: bool,
    pub modified_timestamp: u64,
    /// `modified_timestamp` observed by the last cook that completed.
    pub cooked_timestamp: Option<u64>,
    pub dereferenced_timestamp: Option<u64>,
    pub error: Option<KitchenError>,
    pub headers: BTreeMap<String, String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl UrlInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            original_url: None,
            generated_url: None,
            filename_hint: None,
            url_type: None,
            subtype: None,
            content_type: None,
            original_content: None,
            content: None,
            original_content_etag: Lazy::new(),
            content_etag: Lazy::new(),
            content_length: Lazy::new(),
            sourcemap: None,
            is_inline: false,
            inline_url_site: None,
            is_entry_point: false,
            is_root: false,
            is_watched: false,
            kitchen_generated: false,
            search_param_variants: BTreeSet::new(),
            implicit_urls: BTreeSet::new(),
            first_reference: None,
            content_finalized: false,
            modified_timestamp: 0,
            cooked_timestamp: None,
            dereferenced_timestamp: None,
            error: None,
            headers: BTreeMap::new(),
            data: serde_json::Map::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn content_text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Content::as_text)
    }

    pub fn original_content(&self) -> Option<&Content> {
        self.original_content.as_ref()
    }

    pub fn set_content(&mut self, content: Content) {
        self.content_length.set(content.len());
        self.content = Some(content);
        self.content_etag.invalidate();
    }

    pub fn set_original_content(&mut self, content: Content) {
        self.original_content = Some(content);
        self.original_content_etag.invalidate();
    }

    pub fn content_etag(&self) -> Option<&str> {
        let content = self.content.as_ref()?;
        Some(
            self.content_etag
                .get_or_init(|| content_etag(content.as_bytes()))
                .as_str(),
        )
    }

    pub fn original_content_etag(&self) -> Option<&str> {
        let content = self.original_content.as_ref()?;
        Some(
            self.original_content_etag
                .get_or_init(|| content_etag(content.as_bytes()))
                .as_str(),
        )
    }

    pub fn content_length(&self) -> usize {
        match &self.content {
            Some(c) => *self.content_length.get_or_init(|| c.len()),
            None => 0,
        }
    }

    pub fn search_params(&self) -> Vec<(String, String)> {
        search_params_of(&self.url)
    }

    pub fn url_without_search(&self) -> &str {
        strip_search_and_hash(&self.url)
    }

    pub fn is_ignored(&self) -> bool {
        self.url.starts_with("ignore:")
    }

    pub fn is_data_url(&self) -> bool {
        self.url.starts_with("data:")
    }

    /// Cooked content can be served as-is: nothing changed since the last cook.
    pub fn is_valid(&self) -> bool {
        self.url.starts_with("file:")
            && self.content.is_some()
            && self.content_finalized
            && self.is_watched
            && self.error.is_none()
            && self.cooked_timestamp == Some(self.modified_timestamp)
    }

    /// Forget everything a previous cook produced.
    pub fn reset_content(&mut self) {
        self.content = None;
        self.original_content = None;
        self.content_etag.invalidate();
        self.original_content_etag.invalidate();
        self.content_length.invalidate();
        self.sourcemap = None;
        self.content_finalized = false;
        self.error = None;
        self.headers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_from_content_type_ignores_parameters() {
        assert_eq!(
            UrlType::from_content_type("text/javascript; charset=utf-8"),
            UrlType::JsModule
        );
        assert_eq!(UrlType::from_content_type("image/png"), UrlType::Other);
        assert_eq!(
            UrlType::from_content_type("application/manifest+json"),
            UrlType::Webmanifest
        );
    }

    #[test]
    fn test_accepts_groups_compatible_types() {
        assert!(UrlType::JsModule.accepts(UrlType::JsClassic));
        assert!(UrlType::Sourcemap.accepts(UrlType::Json));
        assert!(UrlType::Css.accepts(UrlType::Other));
        assert!(!UrlType::Css.accepts(UrlType::Html));
    }

    #[test]
    fn test_etag_recomputed_after_content_change() {
        let mut info = UrlInfo::new("file:///a.js");
        info.set_content(Content::from("a"));
        let first = info.content_etag().unwrap().to_owned();
        info.set_content(Content::from("b"));
        let second = info.content_etag().unwrap().to_owned();
        assert_ne!(first, second, "etag must follow content");
        assert!(first.starts_with("1-"));
        assert_eq!(info.content_length(), 1);
    }

    #[test]
    fn test_lazy_set_overrides_without_computing() {
        let mut lazy = Lazy::new();
        assert_eq!(*lazy.get_or_init(|| 1), 1);
        lazy.set(7);
        assert_eq!(*lazy.get_or_init(|| unreachable!("value already set")), 7);
        lazy.invalidate();
        assert!(!lazy.is_computed());

        let mut info = UrlInfo::new("file:///a.css");
        info.set_content(Content::from("body {}"));
        assert_eq!(info.content_length(), 7);
    }

    #[test]
    fn test_is_valid_requires_matching_cook_timestamp() {
        let mut info = UrlInfo::new("file:///a.js");
        info.set_content(Content::from("a"));
        info.content_finalized = true;
        info.is_watched = true;
        info.modified_timestamp = 3;
        info.cooked_timestamp = Some(3);
        assert!(info.is_valid());
        info.modified_timestamp = 4;
        assert!(!info.is_valid());
    }
}

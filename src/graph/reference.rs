use std::collections::BTreeSet;
use std::fmt;

use petgraph::stable_graph::{EdgeIndex, NodeIndex};
use serde::Serialize;

use crate::error::{KitchenError, KitchenResult, Trace};
use crate::graph::url_info::{Content, UrlType};

/// Stable identifier of a reference inside its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReferenceId(pub u64);

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// How a url is mentioned by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    EntryPoint,
    HttpRequest,
    JsImport,
    JsUrl,
    JsInlineContent,
    Script,
    Style,
    LinkHref,
    CssUrl,
    CssImport,
    AHref,
    ImgSrc,
    IframeSrc,
    WebmanifestIconSrc,
    SourcemapComment,
    PackageJson,
    SideEffectFile,
    Filesystem,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::EntryPoint => "entry_point",
            ReferenceKind::HttpRequest => "http_request",
            ReferenceKind::JsImport => "js_import",
            ReferenceKind::JsUrl => "js_url",
            ReferenceKind::JsInlineContent => "js_inline_content",
            ReferenceKind::Script => "script",
            ReferenceKind::Style => "style",
            ReferenceKind::LinkHref => "link_href",
            ReferenceKind::CssUrl => "css_url",
            ReferenceKind::CssImport => "css_@import",
            ReferenceKind::AHref => "a_href",
            ReferenceKind::ImgSrc => "img_src",
            ReferenceKind::IframeSrc => "iframe_src",
            ReferenceKind::WebmanifestIconSrc => "webmanifest_icon_src",
            ReferenceKind::SourcemapComment => "sourcemap_comment",
            ReferenceKind::PackageJson => "package_json",
            ReferenceKind::SideEffectFile => "side_effect_file",
            ReferenceKind::Filesystem => "filesystem",
        }
    }

    /// Specifier appears inside a JS or JSON string literal.
    pub fn is_string_literal(&self) -> bool {
        matches!(
            self,
            ReferenceKind::JsImport | ReferenceKind::JsUrl | ReferenceKind::WebmanifestIconSrc
        )
    }

    /// Specifier appears inside a CSS `url()` or `@import`.
    pub fn is_css(&self) -> bool {
        matches!(self, ReferenceKind::CssUrl | ReferenceKind::CssImport)
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a specifier sits in its owner's content.
///
/// `start..end` is a byte range; `line` is 1-based and `column` 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecifierPosition {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl SpecifierPosition {
    /// Compute the position of `start..end` inside `content`.
    pub fn in_content(content: &str, start: usize, end: usize) -> Self {
        let (line, column) = line_column(content, start);
        Self {
            start,
            end,
            line,
            column,
        }
    }
}

/// 1-based line and 0-based column of a byte offset.
pub fn line_column(content: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(content.len());
    let before = &content[..offset];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(i) => before[i + 1..].chars().count(),
        None => before.chars().count(),
    };
    (line, column)
}

/// Everything needed to create a reference, as found in (or injected into) an owner.
#[derive(Debug, Clone)]
pub struct ReferenceInit {
    pub kind: ReferenceKind,
    pub subtype: Option<String>,
    pub specifier: String,
    pub position: Option<SpecifierPosition>,
    pub base_url: Option<String>,
    pub expected_type: Option<UrlType>,
    pub expected_subtype: Option<String>,
    pub expected_content_type: Option<String>,
    pub integrity: Option<String>,
    pub is_weak: bool,
    pub is_implicit: bool,
    pub is_inline: bool,
    pub is_entry_point: bool,
    pub is_resource_hint: bool,
    pub is_dynamic: bool,
    pub injected: bool,
    pub content: Option<Content>,
    pub content_type: Option<String>,
    pub filename_hint: Option<String>,
}

impl ReferenceInit {
    pub fn new(kind: ReferenceKind, specifier: impl Into<String>) -> Self {
        Self {
            kind,
            subtype: None,
            specifier: specifier.into(),
            position: None,
            base_url: None,
            expected_type: None,
            expected_subtype: None,
            expected_content_type: None,
            integrity: None,
            is_weak: false,
            is_implicit: false,
            is_inline: false,
            is_entry_point: false,
            is_resource_hint: false,
            is_dynamic: false,
            injected: false,
            content: None,
            content_type: None,
            filename_hint: None,
        }
    }

    pub fn at(mut self, position: SpecifierPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn expect_type(mut self, url_type: UrlType) -> Self {
        self.expected_type = Some(url_type);
        self
    }

    pub fn expect_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.expected_subtype = Some(subtype.into());
        self
    }

    pub fn integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    pub fn weak(mut self) -> Self {
        self.is_weak = true;
        self
    }

    pub fn implicit(mut self) -> Self {
        self.is_implicit = true;
        self
    }

    pub fn entry_point(mut self) -> Self {
        self.is_entry_point = true;
        self
    }

    pub fn resource_hint(mut self) -> Self {
        self.is_resource_hint = true;
        self.is_weak = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    pub fn inline(mut self, content: Content, content_type: impl Into<String>) -> Self {
        self.is_inline = true;
        self.content = Some(content);
        self.content_type = Some(content_type.into());
        self
    }

    pub fn filename_hint(mut self, hint: impl Into<String>) -> Self {
        self.filename_hint = Some(hint.into());
        self
    }
}

/// A live or historical edge intent from an owner UrlInfo to a url.
///
/// References are stored in the graph's arena and never freed, so redirection chains
/// (`prev` / `original`) stay inspectable after a reference is superseded.
#[derive(Debug, Clone)]
pub struct Reference {
    pub id: ReferenceId,
    pub owner: NodeIndex,
    pub trace: Trace,
    pub kind: ReferenceKind,
    pub subtype: Option<String>,
    pub specifier: String,
    pub position: Option<SpecifierPosition>,
    pub base_url: Option<String>,
    pub expected_type: Option<UrlType>,
    pub expected_subtype: Option<String>,
    pub expected_content_type: Option<String>,
    pub integrity: Option<String>,
    pub is_weak: bool,
    pub is_implicit: bool,
    pub is_inline: bool,
    pub is_entry_point: bool,
    pub is_resource_hint: bool,
    pub is_dynamic: bool,
    pub injected: bool,
    pub content: Option<Content>,
    pub content_type: Option<String>,
    pub filename_hint: Option<String>,
    /// Specifier carries the `debug` search param: log every lifecycle step at info level.
    pub debug: bool,
    url: Option<String>,
    pub generated_url: Option<String>,
    pub generated_specifier: Option<String>,
    /// First reference of the redirection chain this one belongs to.
    pub original: ReferenceId,
    /// Reference this one replaced.
    pub prev: Option<ReferenceId>,
    /// References this one brings to life on its own (search-param base, package.json).
    pub implicit_references: BTreeSet<ReferenceId>,
    pub(crate) edge: Option<EdgeIndex>,
    pub(crate) target: Option<NodeIndex>,
    pub(crate) removed: bool,
}

impl Reference {
    pub(crate) fn from_init(id: ReferenceId, owner: NodeIndex, trace: Trace, init: ReferenceInit) -> Self {
        let debug = has_debug_param(&init.specifier);
        Self {
            id,
            owner,
            trace,
            kind: init.kind,
            subtype: init.subtype,
            specifier: init.specifier,
            position: init.position,
            base_url: init.base_url,
            expected_type: init.expected_type,
            expected_subtype: init.expected_subtype,
            expected_content_type: init.expected_content_type,
            integrity: init.integrity,
            is_weak: init.is_weak,
            is_implicit: init.is_implicit,
            is_inline: init.is_inline,
            is_entry_point: init.is_entry_point,
            is_resource_hint: init.is_resource_hint,
            is_dynamic: init.is_dynamic,
            injected: init.injected,
            content: init.content,
            content_type: init.content_type,
            filename_hint: init.filename_hint,
            debug,
            url: None,
            generated_url: None,
            generated_specifier: None,
            original: id,
            prev: None,
            implicit_references: BTreeSet::new(),
            edge: None,
            target: None,
            removed: false,
        }
    }

    /// Copy of this reference with a fresh id, chained after it.
    pub(crate) fn successor(&self, id: ReferenceId) -> Self {
        let mut next = self.clone();
        next.id = id;
        next.url = None;
        next.generated_url = None;
        next.generated_specifier = None;
        next.prev = Some(self.id);
        next.original = self.original;
        next.implicit_references = BTreeSet::new();
        next.edge = None;
        next.target = None;
        next.removed = false;
        next
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Assign the resolved url. A reference resolves exactly once.
    pub(crate) fn set_url(&mut self, url: String) -> KitchenResult<()> {
        if let Some(existing) = &self.url {
            return Err(KitchenError::ReferenceLifecycle(format!(
                "{} already resolved to {existing}, cannot resolve again to {url}",
                self.id
            )));
        }
        self.url = Some(url);
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.target.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn target(&self) -> Option<NodeIndex> {
        self.target
    }

    /// Search params of the resolved url, in order of appearance.
    pub fn search_params(&self) -> Vec<(String, String)> {
        self.url.as_deref().map(search_params_of).unwrap_or_default()
    }
}

/// Parse `?a=1&b` into pairs; a bare key yields an empty value.
pub fn search_params_of(url: &str) -> Vec<(String, String)> {
    let Some(query_start) = url.find('?') else {
        return Vec::new();
    };
    let query = &url[query_start + 1..];
    let query = query.split('#').next().unwrap_or("");
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

fn has_debug_param(specifier: &str) -> bool {
    search_params_of(specifier).iter().any(|(k, _)| k == "debug")
}

pub mod sourcemap;

use ::sourcemap::SourceMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::url_info::{Content, UrlInfo, UrlType};
use crate::plugin::ContentPatch;
use self::sourcemap::{
    SourcemapCommentMatch, append_sourcemap_comment, compose_sourcemaps, find_sourcemap_comment,
    normalize_sourcemap, remove_sourcemap_comment, sourcemap_data_url, sourcemap_to_json,
};

/// Where finalized sourcemaps end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourcemapMode {
    None,
    #[default]
    Inline,
    File,
}

impl SourcemapMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SourcemapMode::None)
    }
}

/// Initial content of a UrlInfo, as produced by a fetch hook.
#[derive(Debug, Default)]
pub struct InitialContent {
    pub content: Option<Content>,
    pub original_content: Option<Content>,
    pub sourcemap: Option<SourceMap>,
}

/// What `end_transformations` left for the caller to do.
#[derive(Debug, PartialEq, Eq)]
pub enum SourcemapOutput {
    /// Nothing to write: maps disabled, unsupported type, or no map.
    Nothing,
    /// Comment already points at an inline data url.
    Inlined,
    /// The map must be written next to the file; the comment is appended once its url is known.
    File { json: String },
}

/// Owns the content and sourcemap bookkeeping of UrlInfo across the cooking steps.
#[derive(Debug, Clone)]
pub struct UrlInfoTransformer {
    pub sourcemaps: SourcemapMode,
    pub sources_content: bool,
}

impl UrlInfoTransformer {
    pub fn new(sourcemaps: SourcemapMode, sources_content: bool) -> Self {
        Self {
            sourcemaps,
            sources_content,
        }
    }

    /// Install fetched content. Returns the sourcemap comment found in it, if the map
    /// should be loaded by the caller.
    pub fn set_content(&self, info: &mut UrlInfo, initial: InitialContent) -> Option<SourcemapCommentMatch> {
        let content = initial.content.unwrap_or(Content::Text(String::new()));
        info.set_original_content(initial.original_content.unwrap_or_else(|| content.clone()));

        let mut content = content;
        let mut found = None;
        if self.sourcemaps.is_enabled() {
            if let (Some(url_type), Content::Text(text)) = (info.url_type, &content) {
                if let Some(comment) = find_sourcemap_comment(text, url_type) {
                    content = Content::Text(remove_sourcemap_comment(text, &comment));
                    if initial.sourcemap.is_none() {
                        found = Some(comment);
                    }
                }
            }
        }
        info.sourcemap = initial
            .sourcemap
            .map(|map| normalize_sourcemap(map, info.url(), self.sources_content));
        info.set_content(content);
        found
    }

    /// Apply a hook result. A new map is composed onto the current one; content changed
    /// without a map drops the current map unless positions were kept.
    pub fn apply_transformations(&self, info: &mut UrlInfo, patch: ContentPatch) {
        if let Some(url_type) = patch.url_type {
            info.url_type = Some(url_type);
        }
        if let Some(content_type) = patch.content_type {
            info.content_type = Some(content_type);
        }
        let Some(content) = patch.content else {
            return;
        };
        let changed = info.content() != Some(&content);
        match patch.sourcemap {
            Some(map) if self.sourcemaps.is_enabled() => {
                let map = normalize_sourcemap(map, info.url(), self.sources_content);
                info.sourcemap = Some(match info.sourcemap.take() {
                    Some(previous) => compose_sourcemaps(&previous, &map),
                    None => map,
                });
            }
            _ if changed && !patch.keeps_positions && info.sourcemap.is_some() => {
                debug!(url = %info.url(), "content changed without sourcemap, dropping map");
                info.sourcemap = None;
            }
            _ => {}
        }
        info.set_content(content);
    }

    /// Seal the sourcemap: inline it, hand it back for a file, or do nothing.
    pub fn end_transformations(&self, info: &mut UrlInfo) -> anyhow::Result<SourcemapOutput> {
        let supports = info.url_type.is_some_and(|t| t.supports_sourcemap());
        if !self.sourcemaps.is_enabled() || !supports {
            return Ok(SourcemapOutput::Nothing);
        }
        let (Some(map), Some(text)) = (&info.sourcemap, info.content_text()) else {
            return Ok(SourcemapOutput::Nothing);
        };
        let json = sourcemap_to_json(map)?;
        match self.sourcemaps {
            SourcemapMode::Inline => {
                let url_type = info.url_type.unwrap_or(UrlType::JsModule);
                let content = append_sourcemap_comment(text, url_type, &sourcemap_data_url(&json));
                info.set_content(Content::Text(content));
                Ok(SourcemapOutput::Inlined)
            }
            SourcemapMode::File => Ok(SourcemapOutput::File { json }),
            SourcemapMode::None => Ok(SourcemapOutput::Nothing),
        }
    }

    /// Append the comment pointing at a map file written by the caller.
    pub fn link_sourcemap_file(&self, info: &mut UrlInfo, specifier: &str) {
        let url_type = info.url_type.unwrap_or(UrlType::JsModule);
        if let Some(text) = info.content_text() {
            let content = append_sourcemap_comment(text, url_type, specifier);
            info.set_content(Content::Text(content));
        }
    }
}

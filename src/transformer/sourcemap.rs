use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use sourcemap::SourceMap;
use url::Url;

use crate::graph::url_info::UrlType;

static JS_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*//[#@] sourceMappingURL=([^\s'\x22]+)[ \t]*$").expect("valid regex")
});

static CSS_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/\*[#@] sourceMappingURL=([^\s*]+)\s*\*/").expect("valid regex")
});

/// A `sourceMappingURL` comment found in content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcemapCommentMatch {
    pub specifier: String,
    /// Byte range of the whole comment.
    pub start: usize,
    pub end: usize,
    /// Byte range of the specifier alone.
    pub specifier_start: usize,
    pub specifier_end: usize,
}

/// Last sourcemap comment of `content`, for types that can carry one.
pub fn find_sourcemap_comment(content: &str, url_type: UrlType) -> Option<SourcemapCommentMatch> {
    let regex = match url_type {
        UrlType::JsModule | UrlType::JsClassic => &*JS_COMMENT,
        UrlType::Css => &*CSS_COMMENT,
        _ => return None,
    };
    let captures = regex.captures_iter(content).last()?;
    let whole = captures.get(0)?;
    let specifier = captures.get(1)?;
    Some(SourcemapCommentMatch {
        specifier: specifier.as_str().to_owned(),
        start: whole.start(),
        end: whole.end(),
        specifier_start: specifier.start(),
        specifier_end: specifier.end(),
    })
}

pub fn remove_sourcemap_comment(content: &str, found: &SourcemapCommentMatch) -> String {
    let mut out = String::with_capacity(content.len());
    out.push_str(content[..found.start].trim_end_matches([' ', '\t']));
    out.push_str(&content[found.end..]);
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}

pub fn sourcemap_comment(url_type: UrlType, specifier: &str) -> String {
    match url_type {
        UrlType::Css => format!("/*# sourceMappingURL={specifier} */"),
        _ => format!("//# sourceMappingURL={specifier}"),
    }
}

/// Append a sourcemap comment on its own line.
pub fn append_sourcemap_comment(content: &str, url_type: UrlType, specifier: &str) -> String {
    let mut out = content.to_owned();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&sourcemap_comment(url_type, specifier));
    out.push('\n');
    out
}

/// Map from original sources to the content after `next` was applied on top of `previous`.
pub fn compose_sourcemaps(previous: &SourceMap, next: &SourceMap) -> SourceMap {
    let mut composed = previous.clone();
    composed.adjust_mappings(next);
    composed
}

/// Make sources absolute against `url` and drop `sourcesContent` when it is redundant.
///
/// Contents are dropped only when `keep_sources_content` is false and every source is a
/// readable, non-inline `file:` url.
pub fn normalize_sourcemap(mut map: SourceMap, url: &str, keep_sources_content: bool) -> SourceMap {
    let base = Url::parse(url).ok();
    let count = map.get_source_count();
    let mut all_on_disk = true;
    for idx in 0..count {
        let Some(source) = map.get_source(idx).map(str::to_owned) else {
            all_on_disk = false;
            continue;
        };
        let absolute = match (&base, Url::parse(&source)) {
            (_, Ok(parsed)) => parsed.to_string(),
            (Some(base), Err(_)) => base
                .join(&source)
                .map(|u| u.to_string())
                .unwrap_or(source.clone()),
            (None, Err(_)) => source.clone(),
        };
        let on_disk = absolute.starts_with("file:")
            && !is_inline_url(&absolute)
            && Url::parse(&absolute)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .is_some_and(|p| p.is_file());
        all_on_disk &= on_disk;
        map.set_source(idx, &absolute);
    }
    if !keep_sources_content && all_on_disk {
        for idx in 0..count {
            map.set_source_contents(idx, None);
        }
    }
    map
}

/// Rewrite absolute sources relative to where the map file is served from.
pub fn relativize_sources(mut map: SourceMap, map_url: &str) -> SourceMap {
    let Ok(base) = Url::parse(map_url) else {
        return map;
    };
    for idx in 0..map.get_source_count() {
        let Some(source) = map.get_source(idx).map(str::to_owned) else {
            continue;
        };
        if let Ok(source_url) = Url::parse(&source) {
            if source_url.scheme() == base.scheme() {
                if let Some(relative) = base.make_relative(&source_url) {
                    map.set_source(idx, &relative);
                }
            }
        }
    }
    map
}

fn is_inline_url(url: &str) -> bool {
    url.rsplit('/')
        .next()
        .is_some_and(|name| name.contains("@L") && name.contains('C'))
}

pub fn sourcemap_to_json(map: &SourceMap) -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    map.to_writer(&mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn sourcemap_from_json(json: &str) -> anyhow::Result<SourceMap> {
    Ok(SourceMap::from_slice(json.as_bytes())?)
}

pub fn sourcemap_data_url(json: &str) -> String {
    format!(
        "data:application/json;charset=utf-8;base64,{}",
        STANDARD.encode(json.as_bytes())
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One-segment map: generated line 0 col 0 -> `source` line 0 col 0.
    pub(crate) fn identity_map(source: &str) -> SourceMap {
        let json = format!(
            r#"{{"version":3,"sources":["{source}"],"sourcesContent":["x"],"names":[],"mappings":"AAAA"}}"#
        );
        sourcemap_from_json(&json).unwrap()
    }

    #[test]
    fn test_finds_last_js_comment() {
        let content = "a\n//# sourceMappingURL=old.map\nb\n//# sourceMappingURL=main.js.map\n";
        let found = find_sourcemap_comment(content, UrlType::JsModule).unwrap();
        assert_eq!(found.specifier, "main.js.map");
        assert_eq!(remove_sourcemap_comment(content, &found), "a\n//# sourceMappingURL=old.map\nb\n");
    }

    #[test]
    fn test_css_comment_and_unsupported_types() {
        let css = "body{}\n/*# sourceMappingURL=a.css.map */";
        assert_eq!(
            find_sourcemap_comment(css, UrlType::Css).unwrap().specifier,
            "a.css.map"
        );
        assert!(find_sourcemap_comment(css, UrlType::Html).is_none());
    }

    #[test]
    fn test_normalize_makes_sources_absolute() {
        let map = identity_map("../src/a.ts");
        let map = normalize_sourcemap(map, "file:///app/dist/a.js", true);
        assert_eq!(map.get_source(0), Some("file:///app/src/a.ts"));
        assert_eq!(map.get_source_contents(0), Some("x"));
    }

    #[test]
    fn test_relativize_sources_against_map_location() {
        let map = identity_map("file:///app/src/a.ts");
        let map = relativize_sources(map, "file:///app/dist/assets/a.js.map");
        assert_eq!(map.get_source(0), Some("../../src/a.ts"));
    }

    #[test]
    fn test_json_round_trip_keeps_mappings() {
        let map = identity_map("a.ts");
        let json = sourcemap_to_json(&map).unwrap();
        let back = sourcemap_from_json(&json).unwrap();
        assert_eq!(back.get_token_count(), map.get_token_count());
        assert!(sourcemap_data_url(&json).starts_with("data:application/json"));
    }
}

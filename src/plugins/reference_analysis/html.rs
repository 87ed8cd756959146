use std::sync::LazyLock;

use regex::Regex;

use super::{FoundReference, InlineFound, is_external, within};
use crate::graph::reference::{ReferenceInit, ReferenceKind};
use crate::graph::url_info::UrlType;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").expect("valid regex"));
static STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b([^>]*)>(.*?)</style\s*>").expect("valid regex"));
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(link|img|a|iframe)\b([^>]*)>").expect("valid regex"));
static ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("valid regex")
});

/// One attribute with the absolute byte range of its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
    pub start: usize,
    pub end: usize,
}

/// Attributes of a tag whose attribute text starts at `offset` in the document.
pub fn attributes(text: &str, offset: usize) -> Vec<Attribute> {
    ATTR.captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4));
            Some(match value {
                Some(v) => Attribute {
                    name,
                    value: v.as_str().to_owned(),
                    start: offset + v.start(),
                    end: offset + v.end(),
                },
                None => Attribute {
                    name,
                    value: String::new(),
                    start: offset,
                    end: offset,
                },
            })
        })
        .collect()
}

fn attr<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes.iter().find(|a| a.name == name)
}

/// `None` for script types that are not javascript (importmap, json, templates).
fn script_type(attributes: &[Attribute]) -> Option<UrlType> {
    match attr(attributes, "type").map(|a| a.value.trim().to_ascii_lowercase()) {
        None => Some(UrlType::JsClassic),
        Some(t) if t.is_empty() || t == "text/javascript" || t == "application/javascript" => {
            Some(UrlType::JsClassic)
        }
        Some(t) if t == "module" => Some(UrlType::JsModule),
        Some(_) => None,
    }
}

fn link_reference(attributes: &[Attribute]) -> Option<ReferenceInit> {
    let href = attr(attributes, "href")?;
    let rel = attr(attributes, "rel")
        .map(|a| a.value.to_ascii_lowercase())
        .unwrap_or_default();
    let rels: Vec<&str> = rel.split_ascii_whitespace().collect();
    if rels.iter().any(|r| matches!(*r, "preconnect" | "dns-prefetch")) {
        return None;
    }
    let init = ReferenceInit::new(ReferenceKind::LinkHref, href.value.clone());
    let init = if rels.contains(&"stylesheet") {
        init.expect_type(UrlType::Css)
    } else if rels.contains(&"modulepreload") {
        init.resource_hint().expect_type(UrlType::JsModule)
    } else if rels.iter().any(|r| matches!(*r, "preload" | "prefetch")) {
        let init = init.resource_hint();
        match attr(attributes, "as").map(|a| a.value.as_str()) {
            Some("style") => init.expect_type(UrlType::Css),
            _ => init,
        }
    } else if rels.contains(&"manifest") {
        init.expect_type(UrlType::Webmanifest)
    } else {
        init
    };
    Some(match attr(attributes, "integrity") {
        Some(integrity) => init.integrity(integrity.value.clone()),
        None => init,
    })
}

/// Url mentions of an html document: external and inline scripts, inline styles,
/// `link[href]`, `img[src]`, `iframe[src]` and `a[href]`.
pub fn scan(text: &str) -> Vec<FoundReference> {
    let comments: Vec<(usize, usize)> = COMMENT.find_iter(text).map(|m| (m.start(), m.end())).collect();
    let mut raw_text: Vec<(usize, usize)> = Vec::new();
    let mut found = Vec::new();

    for caps in SCRIPT.captures_iter(text) {
        let (Some(whole), Some(attrs_match), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        if within(&comments, whole.start()) {
            continue;
        }
        raw_text.push((body.start(), body.end()));
        let attributes = attributes(attrs_match.as_str(), attrs_match.start());
        let Some(expected) = script_type(&attributes) else {
            continue;
        };
        match attr(&attributes, "src") {
            Some(src) if !is_external(&src.value) => {
                let mut init = ReferenceInit::new(ReferenceKind::Script, src.value.clone()).expect_type(expected);
                if let Some(integrity) = attr(&attributes, "integrity") {
                    init = init.integrity(integrity.value.clone());
                }
                found.push(FoundReference::new(init, src.start, src.end));
            }
            Some(_) => {}
            None if !body.as_str().trim().is_empty() => {
                found.push(FoundReference {
                    init: ReferenceInit::new(ReferenceKind::Script, "").expect_type(expected),
                    start: body.start(),
                    end: body.end(),
                    inline: Some(InlineFound {
                        content: body.as_str().to_owned(),
                        content_type: "text/javascript",
                        extension: "js",
                    }),
                });
            }
            None => {}
        }
    }

    for caps in STYLE.captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        if within(&comments, whole.start()) {
            continue;
        }
        raw_text.push((body.start(), body.end()));
        if body.as_str().trim().is_empty() {
            continue;
        }
        found.push(FoundReference {
            init: ReferenceInit::new(ReferenceKind::Style, "").expect_type(UrlType::Css),
            start: body.start(),
            end: body.end(),
            inline: Some(InlineFound {
                content: body.as_str().to_owned(),
                content_type: "text/css",
                extension: "css",
            }),
        });
    }

    for caps in TAG.captures_iter(text) {
        let (Some(whole), Some(tag), Some(attrs_match)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        if within(&comments, whole.start()) || within(&raw_text, whole.start()) {
            continue;
        }
        let attributes = attributes(attrs_match.as_str(), attrs_match.start());
        let (init, value) = match tag.as_str().to_ascii_lowercase().as_str() {
            "link" => match (link_reference(&attributes), attr(&attributes, "href")) {
                (Some(init), Some(href)) => (init, href),
                _ => continue,
            },
            "img" => match attr(&attributes, "src") {
                Some(src) => (ReferenceInit::new(ReferenceKind::ImgSrc, src.value.clone()), src),
                None => continue,
            },
            "iframe" => match attr(&attributes, "src") {
                Some(src) => (
                    ReferenceInit::new(ReferenceKind::IframeSrc, src.value.clone()).expect_type(UrlType::Html),
                    src,
                ),
                None => continue,
            },
            "a" => match attr(&attributes, "href") {
                // Navigation does not keep pages alive.
                Some(href) => (ReferenceInit::new(ReferenceKind::AHref, href.value.clone()).weak(), href),
                None => continue,
            },
            _ => continue,
        };
        if is_external(&value.value) {
            continue;
        }
        found.push(FoundReference::new(init, value.start, value.end));
    }

    found.sort_by_key(|f| f.start);
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"<!doctype html>
<html>
  <head>
    <link rel="stylesheet" href="./main.css" />
    <link rel="modulepreload" href="./lib.js" />
    <link rel="preconnect" href="https://fonts.example.com" />
    <!-- <script src="./commented.js"></script> -->
    <script type="importmap">{ "imports": {} }</script>
  </head>
  <body>
    <img src="logo.png" alt="logo">
    <a href="https://example.com">out</a>
    <script type="module" src="./main.js"></script>
    <script>window.ready = true</script>
  </body>
</html>"#;

    #[test]
    fn test_scan_finds_each_mention_once() {
        let found = scan(PAGE);
        let summary: Vec<(ReferenceKind, &str, bool)> = found
            .iter()
            .map(|f| (f.init.kind, f.init.specifier.as_str(), f.init.is_weak))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ReferenceKind::LinkHref, "./main.css", false),
                (ReferenceKind::LinkHref, "./lib.js", true),
                (ReferenceKind::ImgSrc, "logo.png", false),
                (ReferenceKind::Script, "./main.js", false),
                (ReferenceKind::Script, "", false),
            ]
        );
        assert_eq!(&PAGE[found[0].start..found[0].end], "./main.css");
        let inline = found[4].inline.as_ref().unwrap();
        assert_eq!(inline.content, "window.ready = true");
        assert_eq!(found[4].init.expected_type, Some(UrlType::JsClassic));
        assert_eq!(found[3].init.expected_type, Some(UrlType::JsModule));
    }

    #[test]
    fn test_attributes_keep_value_offsets() {
        let tag = r#" src='a.js' defer data-x=1"#;
        let attrs = attributes(tag, 10);
        assert_eq!(attrs[0].name, "src");
        assert_eq!(attrs[0].value, "a.js");
        assert_eq!((attrs[0].start, attrs[0].end), (16, 20));
        assert_eq!(attrs[1].name, "defer");
        assert_eq!(attrs[2].value, "1");
    }
}

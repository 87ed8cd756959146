use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{FoundReference, is_external, within};
use crate::graph::reference::{ReferenceInit, ReferenceKind};
use crate::graph::url_info::UrlType;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)@import\s+(?:url\(\s*)?(?:"([^"]*)"|'([^']*)'|([^\s'")]+))[^;]*;?"#)
        .expect("valid regex")
});
static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\burl\(\s*(?:"([^"]*)"|'([^']*)'|([^\s'")]+))\s*\)"#).expect("valid regex")
});

/// Specifier and the range to rewrite: quotes included when the source had them.
fn specifier_of(caps: &Captures<'_>) -> Option<(String, usize, usize)> {
    if let Some(quoted) = caps.get(1).or_else(|| caps.get(2)) {
        return Some((quoted.as_str().to_owned(), quoted.start() - 1, quoted.end() + 1));
    }
    caps.get(3).map(|bare| (bare.as_str().to_owned(), bare.start(), bare.end()))
}

/// `@import` and `url()` mentions of a stylesheet.
pub fn scan(text: &str) -> Vec<FoundReference> {
    let comments: Vec<(usize, usize)> = COMMENT.find_iter(text).map(|m| (m.start(), m.end())).collect();
    let mut imports: Vec<(usize, usize)> = Vec::new();
    let mut found = Vec::new();

    for caps in IMPORT.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if within(&comments, whole.start()) {
            continue;
        }
        imports.push((whole.start(), whole.end()));
        let Some((specifier, start, end)) = specifier_of(&caps) else {
            continue;
        };
        if is_external(&specifier) {
            continue;
        }
        found.push(FoundReference::new(
            ReferenceInit::new(ReferenceKind::CssImport, specifier).expect_type(UrlType::Css),
            start,
            end,
        ));
    }

    for caps in URL.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if within(&comments, whole.start()) || within(&imports, whole.start()) {
            continue;
        }
        let Some((specifier, start, end)) = specifier_of(&caps) else {
            continue;
        };
        if is_external(&specifier) {
            continue;
        }
        found.push(FoundReference::new(
            ReferenceInit::new(ReferenceKind::CssUrl, specifier),
            start,
            end,
        ));
    }

    found.sort_by_key(|f| f.start);
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_imports_and_urls() {
        let css = r#"@import url("./reset.css");
/* url(./ignored.png) */
body { background: url(./bg.png) no-repeat; }
.a { mask: url('#mask'); src: url("https://cdn.example.com/font.woff2"); }"#;
        let found = scan(css);
        let specifiers: Vec<&str> = found.iter().map(|f| f.init.specifier.as_str()).collect();
        assert_eq!(specifiers, vec!["./reset.css", "./bg.png", "#mask"]);
        assert_eq!(found[0].init.kind, ReferenceKind::CssImport);
        assert_eq!(&css[found[0].start..found[0].end], "\"./reset.css\"");
        assert_eq!(&css[found[1].start..found[1].end], "./bg.png");
    }
}

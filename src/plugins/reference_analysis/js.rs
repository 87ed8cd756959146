use std::sync::LazyLock;

use regex::Regex;

use super::{FoundReference, is_external, within};
use crate::graph::reference::{ReferenceInit, ReferenceKind};
use crate::graph::url_info::UrlType;

const LITERAL: &str = r#"("[^"\n]*"|'[^'\n]*')"#;

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/|(?m)^\s*//[^\n]*").expect("valid regex"));
static STATIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\bimport\s*(?:[\w*{{}}\s,$]+?\s*from\s*)?{LITERAL}")).expect("valid regex")
});
static EXPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\bexport\s*(?:\*\s*(?:as\s+[\w$]+\s*)?|\{{[^}}]*\}}\s*)from\s*{LITERAL}"))
        .expect("valid regex")
});
static DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bimport\s*\(\s*{LITERAL}\s*[,)]")).expect("valid regex"));
static NEW_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\bnew\s+URL\s*\(\s*{LITERAL}\s*,\s*import\.meta\.url\s*\)")).expect("valid regex")
});
static META_RESOLVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bimport\.meta\.resolve\s*\(\s*{LITERAL}\s*\)")).expect("valid regex"));
static SERVICE_WORKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\bnavigator\.serviceWorker\.register\s*\(\s*{LITERAL}")).expect("valid regex")
});
static WORKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bnew\s+(Shared)?Worker\s*\(\s*{LITERAL}")).expect("valid regex"));

/// Subtypes of js that run in a worker global scope.
pub const WORKER_SUBTYPES: &[&str] = &["worker", "shared_worker", "service_worker"];

fn push_literal(
    found: &mut Vec<FoundReference>,
    comments: &[(usize, usize)],
    text: &str,
    start: usize,
    end: usize,
    init: impl FnOnce(String) -> ReferenceInit,
) {
    if within(comments, start) {
        return;
    }
    let specifier = &text[start + 1..end - 1];
    if is_external(specifier) {
        return;
    }
    found.push(FoundReference::new(init(specifier.to_owned()), start, end));
}

/// Static and dynamic imports, re-exports, `new URL(.., import.meta.url)`,
/// `import.meta.resolve`, worker and service worker registrations.
pub fn scan(text: &str) -> Vec<FoundReference> {
    let comments: Vec<(usize, usize)> = COMMENT.find_iter(text).map(|m| (m.start(), m.end())).collect();
    let mut found = Vec::new();

    for regex in [&*STATIC_IMPORT, &*EXPORT_FROM] {
        for caps in regex.captures_iter(text) {
            let Some(literal) = caps.get(1) else { continue };
            push_literal(&mut found, &comments, text, literal.start(), literal.end(), |s| {
                ReferenceInit::new(ReferenceKind::JsImport, s).expect_type(UrlType::JsModule)
            });
        }
    }
    for caps in DYNAMIC_IMPORT.captures_iter(text) {
        let Some(literal) = caps.get(1) else { continue };
        push_literal(&mut found, &comments, text, literal.start(), literal.end(), |s| {
            ReferenceInit::new(ReferenceKind::JsImport, s)
                .expect_type(UrlType::JsModule)
                .dynamic()
        });
    }
    for caps in NEW_URL.captures_iter(text) {
        let Some(literal) = caps.get(1) else { continue };
        push_literal(&mut found, &comments, text, literal.start(), literal.end(), |s| {
            ReferenceInit::new(ReferenceKind::JsUrl, s)
        });
    }
    for caps in META_RESOLVE.captures_iter(text) {
        let Some(literal) = caps.get(1) else { continue };
        push_literal(&mut found, &comments, text, literal.start(), literal.end(), |s| {
            ReferenceInit::new(ReferenceKind::JsImport, s)
                .subtype("import_meta_resolve")
                .expect_type(UrlType::JsModule)
        });
    }
    for caps in SERVICE_WORKER.captures_iter(text) {
        let Some(literal) = caps.get(1) else { continue };
        push_literal(&mut found, &comments, text, literal.start(), literal.end(), |s| {
            ReferenceInit::new(ReferenceKind::JsUrl, s)
                .subtype("service_worker_register")
                .expect_type(UrlType::JsClassic)
                .expect_subtype("service_worker")
        });
    }
    for caps in WORKER.captures_iter(text) {
        let Some(literal) = caps.get(2) else { continue };
        let subtype = if caps.get(1).is_some() { "shared_worker" } else { "worker" };
        push_literal(&mut found, &comments, text, literal.start(), literal.end(), |s| {
            ReferenceInit::new(ReferenceKind::JsUrl, s)
                .subtype("new_worker")
                .expect_type(UrlType::JsClassic)
                .expect_subtype(subtype)
        });
    }

    found.sort_by_key(|f| f.start);
    found.dedup_by_key(|f| f.start);
    found
}

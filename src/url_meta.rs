use std::collections::BTreeMap;

use glob::{MatchOptions, Pattern};
use indexmap::IndexMap;
use serde_json::Value;
use url::Url;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct UrlPattern {
    source: String,
    pattern: Pattern,
    value: Value,
}

/// Url patterns associated with meta values, grouped by meta key (`ignore`, `watch`, ...).
///
/// Patterns are glob patterns resolved against a base url. For a given url the last
/// matching pattern of each key wins, so later entries refine earlier ones.
#[derive(Debug, Clone, Default)]
pub struct UrlAssociations {
    entries: IndexMap<String, Vec<UrlPattern>>,
}

impl UrlAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate every pattern of `patterns` with its value under `key`.
    ///
    /// Relative patterns (`./dist/`, `**/*.map`) are resolved against `base`. A pattern
    /// ending with `/` designates a whole directory.
    pub fn associate<'a>(
        &mut self,
        key: &str,
        patterns: impl IntoIterator<Item = (&'a str, Value)>,
        base: &Url,
    ) -> anyhow::Result<()> {
        let slot = self.entries.entry(key.to_owned()).or_default();
        for (raw, value) in patterns {
            let source = resolve_pattern(raw, base);
            let pattern = Pattern::new(&source)
                .map_err(|err| anyhow::anyhow!("invalid url pattern {raw:?}: {err}"))?;
            slot.push(UrlPattern {
                source,
                pattern,
                value,
            });
        }
        Ok(())
    }

    /// Shorthand for boolean associations.
    pub fn associate_flags<'a>(
        &mut self,
        key: &str,
        patterns: impl IntoIterator<Item = (&'a str, bool)>,
        base: &Url,
    ) -> anyhow::Result<()> {
        self.associate(
            key,
            patterns.into_iter().map(|(p, v)| (p, Value::Bool(v))),
            base,
        )
    }

    /// Meta values that apply to `url`.
    pub fn url_to_meta(&self, url: &str) -> BTreeMap<String, Value> {
        let candidate = strip_search_and_hash(url);
        let mut meta = BTreeMap::new();
        for (key, patterns) in &self.entries {
            let mut found = None;
            for p in patterns {
                if p.pattern.matches_with(candidate, MATCH_OPTIONS) {
                    found = Some(&p.value);
                }
            }
            if let Some(value) = found {
                meta.insert(key.clone(), value.clone());
            }
        }
        meta
    }

    /// True when the meta value for `key` is truthy.
    pub fn applies(&self, url: &str, key: &str) -> bool {
        match self.url_to_meta(url).get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn patterns(&self, key: &str) -> Vec<&str> {
        self.entries
            .get(key)
            .map(|v| v.iter().map(|p| p.source.as_str()).collect())
            .unwrap_or_default()
    }
}

fn resolve_pattern(raw: &str, base: &Url) -> String {
    let mut absolute = if raw.contains("://") || raw.starts_with("data:") {
        raw.to_owned()
    } else {
        let relative = raw.strip_prefix('/').unwrap_or(raw);
        let relative = relative.strip_prefix("./").unwrap_or(relative);
        format!("{}{}", directory_prefix(base), relative)
    };
    if absolute.ends_with('/') {
        absolute.push_str("**");
    }
    absolute
}

fn directory_prefix(base: &Url) -> String {
    let s = base.as_str();
    match s.rfind('/') {
        Some(i) => s[..=i].to_owned(),
        None => format!("{s}/"),
    }
}

pub(crate) fn strip_search_and_hash(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

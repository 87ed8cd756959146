//! Textual edits of build html: link tags, head injections and the import map.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("valid regex"));
static HEAD_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<head\b[^>]*>").expect("valid regex"));
static HEAD_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</head\s*>").expect("valid regex"));
static IMPORTMAP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script\b[^>]*\btype\s*=\s*["']?importmap["']?[^>]*>(.*?)</script\s*>"#)
        .expect("valid regex")
});

/// Remove the `<link>` tag mentioning `specifier`, with its line when it stands alone.
pub fn remove_link_tag(html: &str, specifier: &str) -> Option<String> {
    let tag = LINK.find_iter(html).find(|m| m.as_str().contains(specifier))?;
    let line_start = html[..tag.start()].rfind('\n').map_or(0, |i| i + 1);
    let line_end = html[tag.end()..].find('\n').map_or(html.len(), |i| tag.end() + i + 1);
    let alone = html[line_start..tag.start()].trim().is_empty() && html[tag.end()..line_end].trim().is_empty();
    let (start, end) = if alone { (line_start, line_end) } else { (tag.start(), tag.end()) };
    Some(format!("{}{}", &html[..start], &html[end..]))
}

/// Insert `snippet` right before `</head>`, or at the start when there is no head.
pub fn insert_before_head_end(html: &str, snippet: &str) -> String {
    match HEAD_CLOSE.find(html) {
        Some(close) => format!("{}{snippet}\n{}", &html[..close.start()], &html[close.start()..]),
        None => format!("{snippet}\n{html}"),
    }
}

/// Insert `snippet` right after `<head>`, or at the start when there is no head.
pub fn insert_at_head_start(html: &str, snippet: &str) -> String {
    match HEAD_OPEN.find(html) {
        Some(open) => format!("{}\n{snippet}{}", &html[..open.end()], &html[open.end()..]),
        None => format!("{snippet}\n{html}"),
    }
}

/// Merge `imports` into the document's import map, creating one when missing.
pub fn inject_importmap(html: &str, imports: &BTreeMap<String, String>) -> anyhow::Result<String> {
    if let Some(caps) = IMPORTMAP.captures(html) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            return Ok(html.to_owned());
        };
        let mut map: Value = if body.as_str().trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(body.as_str())?
        };
        let Some(root) = map.as_object_mut() else {
            anyhow::bail!("import map is not a json object");
        };
        let entries = root
            .entry("imports")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(entries) = entries.as_object_mut() else {
            anyhow::bail!("import map \"imports\" is not a json object");
        };
        for (from, to) in imports {
            entries.insert(from.clone(), Value::String(to.clone()));
        }
        let tag = importmap_tag(&map)?;
        return Ok(format!("{}{tag}{}", &html[..whole.start()], &html[whole.end()..]));
    }
    let mut entries = Map::new();
    for (from, to) in imports {
        entries.insert(from.clone(), Value::String(to.clone()));
    }
    let map = Value::Object(Map::from_iter([("imports".to_owned(), Value::Object(entries))]));
    Ok(insert_at_head_start(html, &importmap_tag(&map)?))
}

fn importmap_tag(map: &Value) -> anyhow::Result<String> {
    Ok(format!(
        "<script type=\"importmap\">\n{}\n</script>",
        serde_json::to_string_pretty(map)?
    ))
}

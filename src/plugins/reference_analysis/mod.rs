//! Stand-in parse collaborators: regex scanners turning html, css, js and webmanifest
//! text into reference descriptors, then rewriting each specifier in place.

pub mod css;
pub mod html;
pub mod js;
pub mod webmanifest;

use crate::graph::reference::{ReferenceInit, SpecifierPosition};
use crate::graph::url_info::Content;
use crate::kitchen::CookOptions;
use crate::plugin::{ContentPatch, HookInput, Plugin};
use crate::plugins::inline_content::inline_content_url;

/// Content embedded in the owner, cooked as a node of its own.
#[derive(Debug, Clone)]
pub struct InlineFound {
    pub content: String,
    pub content_type: &'static str,
    pub extension: &'static str,
}

/// One url mention found in a text.
///
/// `start..end` is the byte range replaced by the generated specifier (quotes included
/// for string literals), or by the cooked content for inline mentions.
#[derive(Debug, Clone)]
pub struct FoundReference {
    pub init: ReferenceInit,
    pub start: usize,
    pub end: usize,
    pub inline: Option<InlineFound>,
}

impl FoundReference {
    pub fn new(init: ReferenceInit, start: usize, end: usize) -> Self {
        Self {
            init,
            start,
            end,
            inline: None,
        }
    }
}

/// Mentions not worth a reference: external resources and script pseudo urls.
pub fn is_external(specifier: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "http://",
        "https://",
        "//",
        "mailto:",
        "tel:",
        "javascript:",
        "blob:",
        "about:",
    ];
    let lower = specifier.trim().to_ascii_lowercase();
    lower.is_empty() || PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// `true` when `offset` falls inside one of `ranges`.
pub(crate) fn within(ranges: &[(usize, usize)], offset: usize) -> bool {
    ranges.iter().any(|(start, end)| offset >= *start && offset < *end)
}

/// Create a reference for each mention and rewrite the content with the results.
pub async fn apply_found(input: &HookInput, found: Vec<FoundReference>) -> anyhow::Result<Option<ContentPatch>> {
    if found.is_empty() {
        return Ok(None);
    }
    let text = input.content_text()?.to_owned();
    let mut replacements: Vec<(usize, usize, String)> = Vec::with_capacity(found.len());
    for mention in found {
        let position = SpecifierPosition::in_content(&text, mention.start, mention.end);
        match mention.inline {
            None => {
                let handle = input
                    .kitchen
                    .found_reference(input.node, mention.init.at(position))?;
                replacements.push((mention.start, mention.end, handle.generated_specifier));
            }
            Some(inline) => {
                let mut init = mention.init;
                init.specifier =
                    inline_content_url(input.url(), &text, mention.start, mention.end, inline.extension);
                let init = init
                    .at(position)
                    .inline(Content::Text(inline.content.clone()), inline.content_type);
                let handle = input.kitchen.found_inline_reference(input.node, init)?;
                input
                    .kitchen
                    .cook(
                        handle.target,
                        CookOptions {
                            direct_request: false,
                            operation: input.operation.clone(),
                        },
                    )
                    .await?;
                let cooked = input
                    .kitchen
                    .url_info(handle.target)
                    .content_text()
                    .map(str::to_owned)
                    .unwrap_or(inline.content);
                replacements.push((mention.start, mention.end, cooked));
            }
        }
    }
    let rewritten = replace_ranges(&text, replacements);
    if rewritten == text {
        return Ok(None);
    }
    Ok(Some(ContentPatch::content(rewritten)))
}

/// Replace non-overlapping byte ranges; overlapping ones after the first are dropped.
pub fn replace_ranges(text: &str, mut replacements: Vec<(usize, usize, String)>) -> String {
    replacements.sort_by_key(|(start, _, _)| *start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, value) in replacements {
        if start < cursor || end > text.len() {
            continue;
        }
        out.push_str(&text[cursor..start]);
        out.push_str(&value);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Finds and rewrites url mentions in html, css, js and webmanifest content.
pub fn reference_analysis() -> Plugin {
    Plugin::new("reference_analysis")
        .on_transform_url_content_for("html", |input| async move {
            let found = html::scan(input.content_text()?);
            apply_found(&input, found).await
        })
        .on_transform_url_content_for("css", |input| async move {
            let found = css::scan(input.content_text()?);
            apply_found(&input, found).await
        })
        .on_transform_url_content_for("js_module", |input| async move {
            let found = js::scan(input.content_text()?);
            apply_found(&input, found).await
        })
        .on_transform_url_content_for("js_classic", |input| async move {
            let found = js::scan(input.content_text()?);
            apply_found(&input, found).await
        })
        .on_transform_url_content_for("webmanifest", |input| async move {
            let found = webmanifest::scan(input.content_text()?);
            apply_found(&input, found).await
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_ranges_in_any_order() {
        let out = replace_ranges(
            "import 'a'; import 'b';",
            vec![(19, 22, "\"/b.js\"".into()), (7, 10, "\"/a.js\"".into())],
        );
        assert_eq!(out, "import \"/a.js\"; import \"/b.js\";");
    }

    #[test]
    fn test_external_mentions_are_skipped() {
        assert!(is_external("https://cdn.example.com/x.js"));
        assert!(is_external("//cdn.example.com/x.js"));
        assert!(is_external("  "));
        assert!(!is_external("./x.js"));
        assert!(!is_external("data:text/css,a"));
    }
}

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Every placeholder has the same width so content hashed with defaults keeps its
/// layout once real specifiers are known.
pub const DEFAULT_PLACEHOLDER: &str = "!~{000000}~";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"("?)!~\{([0-9a-f]{6})\}~("?)"#).expect("valid regex"));

/// Opaque token written where a build specifier will go.
pub fn placeholder(id: u32) -> String {
    format!("!~{{{id:06x}}}~")
}

/// A placeholder occurrence in content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderMatch {
    pub id: u32,
    /// Written as a quoted string literal.
    pub quoted: bool,
}

/// What a placeholder turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// Specifier text; surrounding quotes stay.
    Specifier(String),
    /// Code replacing the whole literal, quotes included.
    Expression(String),
}

/// `text` with every placeholder swapped for the default one.
pub fn with_default_placeholders(text: &str) -> Cow<'_, str> {
    PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| format!("{}{DEFAULT_PLACEHOLDER}{}", &caps[1], &caps[3]))
}

pub fn contains_placeholder(text: &str) -> bool {
    PLACEHOLDER.is_match(text)
}

/// Ids of the placeholders found in `text`, in order of appearance.
pub fn placeholder_ids(text: &str) -> Vec<u32> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| u32::from_str_radix(&caps[2], 16).ok())
        .collect()
}

/// Replace every placeholder with what `render` returns for it.
///
/// Fails with the first id `render` has no answer for.
pub fn replace_placeholders(
    text: &str,
    mut render: impl FnMut(PlaceholderMatch) -> Option<Rendered>,
) -> Result<String, u32> {
    let mut unknown = None;
    let out = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
        let open = &caps[1];
        let close = &caps[3];
        let Ok(id) = u32::from_str_radix(&caps[2], 16) else {
            return caps[0].to_owned();
        };
        let quoted = !open.is_empty() && !close.is_empty();
        match render(PlaceholderMatch { id, quoted }) {
            Some(Rendered::Specifier(specifier)) => format!("{open}{specifier}{close}"),
            Some(Rendered::Expression(code)) if quoted => code,
            Some(Rendered::Expression(code)) => format!("{open}{code}{close}"),
            None => {
                unknown.get_or_insert(id);
                caps[0].to_owned()
            }
        }
    });
    match unknown {
        Some(id) => Err(id),
        None => Ok(out.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_have_fixed_width() {
        assert_eq!(placeholder(26), "!~{00001a}~");
        assert_eq!(placeholder(26).len(), DEFAULT_PLACEHOLDER.len());
        let text = format!("import {} from {};", placeholder(1), placeholder(0xabcdef));
        assert_eq!(placeholder_ids(&text), vec![1, 0xabcdef]);
        assert_eq!(
            with_default_placeholders(&text),
            format!("import {DEFAULT_PLACEHOLDER} from {DEFAULT_PLACEHOLDER};")
        );
    }

    #[test]
    fn test_expressions_swallow_quotes() {
        let text = format!(r#"import("{}"); <img src="{}">"#, placeholder(1), placeholder(2));
        let out = replace_placeholders(&text, |m| match m.id {
            1 => Some(Rendered::Expression(r#"__v__("/a.js")"#.to_owned())),
            _ => Some(Rendered::Specifier("/b.png".to_owned())),
        })
        .unwrap();
        assert_eq!(out, r#"import(__v__("/a.js")); <img src="/b.png">"#);
        assert!(!contains_placeholder(&out));
    }

    #[test]
    fn test_unknown_placeholder_is_reported() {
        let text = format!("a {} b", placeholder(7));
        assert_eq!(replace_placeholders(&text, |_| None), Err(7));
    }
}

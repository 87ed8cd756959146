use std::sync::LazyLock;

use regex::Regex;

use super::{FoundReference, is_external};
use crate::graph::reference::{ReferenceInit, ReferenceKind};

static SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""src"\s*:\s*("(?:[^"\\]|\\.)*")"#).expect("valid regex"));

/// `src` entries of a web app manifest (icons, screenshots).
pub fn scan(text: &str) -> Vec<FoundReference> {
    SRC.captures_iter(text)
        .filter_map(|caps| {
            let literal = caps.get(1)?;
            let specifier: String = serde_json::from_str(literal.as_str()).ok()?;
            if is_external(&specifier) {
                return None;
            }
            Some(FoundReference::new(
                ReferenceInit::new(ReferenceKind::WebmanifestIconSrc, specifier),
                literal.start(),
                literal.end(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_icon_sources() {
        let manifest = r#"{
  "name": "app",
  "icons": [
    { "src": "icons/192.png", "sizes": "192x192" },
    { "src" : "icons\/512.png", "sizes": "512x512" }
  ]
}"#;
        let found = scan(manifest);
        let specifiers: Vec<&str> = found.iter().map(|f| f.init.specifier.as_str()).collect();
        assert_eq!(specifiers, vec!["icons/192.png", "icons/512.png"]);
        assert_eq!(&manifest[found[0].start..found[0].end], "\"icons/192.png\"");
    }
}

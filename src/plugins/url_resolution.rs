use url::Url;

use crate::graph::reference::{Reference, ReferenceKind};
use crate::plugin::{Plugin, ReferenceHookContext};

/// Specifier names a package (`react`, `@scope/pkg/sub`) rather than a path or a url.
pub fn is_bare_specifier(specifier: &str) -> bool {
    !(specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
        || specifier == "."
        || specifier == ".."
        || has_scheme(specifier))
}

/// `scheme:` prefix as defined by the url standard; a Windows drive letter does not count.
pub fn has_scheme(specifier: &str) -> bool {
    match specifier.split_once(':') {
        Some((scheme, _)) => {
            scheme.len() > 1
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn resolve(reference: &Reference, ctx: &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>> {
    let specifier = reference.specifier.as_str();
    if has_scheme(specifier) {
        return Ok(Some(Url::parse(specifier)?.to_string()));
    }
    let root = &ctx.context.root_directory_url;
    let owner = ctx.owner(reference);
    let from_root = owner.is_root
        || matches!(reference.kind, ReferenceKind::EntryPoint | ReferenceKind::HttpRequest);
    if let Some(rest) = specifier.strip_prefix('/').filter(|r| !r.starts_with('/')) {
        return Ok(Some(root.join(rest)?.to_string()));
    }
    if from_root {
        return Ok(Some(root.join(specifier)?.to_string()));
    }
    // Bare imports are left to package resolution.
    if reference.kind == ReferenceKind::JsImport && is_bare_specifier(specifier) {
        return Ok(None);
    }
    let base = match &reference.base_url {
        Some(base) => Url::parse(base)?,
        None => Url::parse(owner.url())?,
    };
    Ok(Some(base.join(specifier)?.to_string()))
}

/// In dev, files under the root are written as server-relative paths.
fn format_for_dev(reference: &Reference, ctx: &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>> {
    if !ctx.context.dev {
        return Ok(None);
    }
    let Some(generated) = reference.generated_url.as_deref() else {
        return Ok(None);
    };
    let root = ctx.context.root_directory_url.as_str();
    Ok(generated
        .strip_prefix(root)
        .map(|relative| format!("/{relative}")))
}

/// Resolves relative, root-relative and absolute specifiers.
pub fn url_resolution() -> Plugin {
    Plugin::new("url_resolution")
        .on_resolve_reference(resolve)
        .on_format_reference(format_for_dev)
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use oxc_resolver::{ResolveOptions, Resolver};
use url::Url;

use crate::graph::reference::Reference;
use crate::plugin::{Plugin, ReferenceHookContext};
use crate::plugins::url_resolution::is_bare_specifier;

/// Build an `oxc_resolver::Resolver` following browser-first package conditions.
///
/// - `exports` are matched with `browser`, `import` then `default`.
/// - The `browser` field of package.json is honored.
/// - Extensionless specifiers probe `.js`, `.mjs` and `.json`.
pub fn build_resolver() -> Resolver {
    Resolver::new(ResolveOptions {
        extensions: vec![".js".into(), ".mjs".into(), ".json".into()],
        condition_names: vec!["browser".into(), "import".into(), "default".into()],
        main_fields: vec!["browser".into(), "module".into(), "main".into()],
        alias_fields: vec![vec!["browser".into()]],
        builtin_modules: true,
        ..ResolveOptions::default()
    })
}

/// Nearest `package.json` above `path`.
pub fn find_package_json(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .map(|dir| dir.join("package.json"))
        .find(|candidate| candidate.is_file())
}

fn resolve_bare(
    resolver: &Resolver,
    reference: &Reference,
    ctx: &ReferenceHookContext<'_>,
) -> anyhow::Result<Option<String>> {
    if !is_bare_specifier(&reference.specifier) {
        return Ok(None);
    }
    let owner = ctx.owner(reference);
    let owner_url = match ctx.graph.find_parent_if_inline(reference.owner) {
        Some(host) => ctx.graph.url_info(host).url(),
        None => owner.url(),
    };
    let Some(owner_path) = Url::parse(owner_url).ok().and_then(|u| u.to_file_path().ok()) else {
        return Ok(None);
    };
    let dir = owner_path
        .parent()
        .with_context(|| format!("{} has no parent directory", owner_path.display()))?;
    let resolved = match resolver.resolve(dir, &reference.specifier) {
        Ok(resolution) => resolution.into_path_buf(),
        Err(oxc_resolver::ResolveError::Builtin { resolved, .. }) => {
            bail!("\"{resolved}\" is a node builtin module, it cannot run in a browser")
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(package_json) = find_package_json(&resolved) {
        if let Ok(url) = Url::from_file_path(&package_json) {
            ctx.add_implicit_url(url.to_string());
        }
    }
    let url = Url::from_file_path(&resolved)
        .map_err(|_| anyhow::anyhow!("{} is not an absolute path", resolved.display()))?;
    Ok(Some(url.to_string()))
}

/// Resolves bare js imports the way node does for ES modules.
pub fn node_esm_resolution() -> Plugin {
    let resolver = Arc::new(build_resolver());
    Plugin::new("node_esm_resolution").on_resolve_reference_for("js_import", move |reference, ctx| {
        resolve_bare(&resolver, reference, ctx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_package_json_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/foo");
        fs::create_dir_all(pkg.join("dist")).unwrap();
        fs::write(pkg.join("package.json"), "{}").unwrap();
        fs::write(pkg.join("dist/index.js"), "").unwrap();
        assert_eq!(
            find_package_json(&pkg.join("dist/index.js")),
            Some(pkg.join("package.json"))
        );
    }

    #[test]
    fn test_resolver_uses_module_field() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/foo");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(
            pkg.join("package.json"),
            r#"{ "name": "foo", "main": "main.cjs", "module": "module.js" }"#,
        )
        .unwrap();
        fs::write(pkg.join("module.js"), "export default 1").unwrap();
        fs::write(pkg.join("main.cjs"), "module.exports = 1").unwrap();
        let resolver = build_resolver();
        let resolved = resolver.resolve(dir.path(), "foo").unwrap().into_path_buf();
        assert!(resolved.ends_with("node_modules/foo/module.js"), "got {}", resolved.display());
    }
}

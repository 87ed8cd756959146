//! Reference pipeline: create, resolve, redirect, finalize, then generate the specifier
//! written back into the owner's content.

use petgraph::stable_graph::NodeIndex;
use tracing::{debug, info};

use crate::error::{KitchenError, KitchenResult, ResolveErrorKind};
use crate::graph::UrlGraph;
use crate::graph::reference::{Reference, ReferenceId, ReferenceInit, ReferenceKind};
use crate::plugin::controller::{HookError, select};
use crate::plugin::{HookName, PluginController, ReferenceHookContext, SearchParamsPatch};

/// Run the whole reference lifecycle and return the id of the live reference (the tail
/// of the redirection chain).
pub(crate) fn create_resolve_and_finalize(
    graph: &mut UrlGraph,
    plugins: &PluginController,
    owner: NodeIndex,
    init: ReferenceInit,
) -> KitchenResult<ReferenceId> {
    let id = graph.create_reference(owner, init);
    let (url, implicit_urls) = resolve(graph, plugins, id)?;
    graph.set_reference_url(id, url)?;
    for implicit_url in implicit_urls {
        add_implicit_url(graph, id, owner, implicit_url)?;
    }
    let id = redirect(graph, plugins, id)?;
    graph.finalize_reference(id)?;
    generate(graph, plugins, id)?;
    Ok(id)
}

fn snapshot(graph: &UrlGraph, id: ReferenceId) -> KitchenResult<Reference> {
    graph
        .reference(id)
        .cloned()
        .ok_or_else(|| KitchenError::ReferenceLifecycle(format!("unknown reference {id}")))
}

fn resolve_error(reference: &Reference, kind: ResolveErrorKind, reason: String) -> KitchenError {
    KitchenError::ResolveUrl {
        kind,
        specifier: reference.specifier.clone(),
        trace: reference.trace.clone(),
        reason,
    }
}

fn hook_failure(reference: &Reference, err: HookError) -> KitchenError {
    if let Some(kitchen_error) = err.kitchen_error() {
        return kitchen_error.clone();
    }
    resolve_error(
        reference,
        ResolveErrorKind::PluginError,
        format!("\"{}\" hook of plugin \"{}\" failed: {:#}", err.hook, err.plugin, err.error),
    )
}

/// Resolved url plus the urls the resolving plugins declared as implicit dependencies.
fn resolve(
    graph: &UrlGraph,
    plugins: &PluginController,
    id: ReferenceId,
) -> KitchenResult<(String, Vec<String>)> {
    let reference = snapshot(graph, id)?;
    // `#foo` means something only to the JS import map machinery.
    if reference.specifier.starts_with('#') && reference.kind != ReferenceKind::JsImport {
        return Ok((format!("ignore:{}", reference.specifier), Vec::new()));
    }
    let ctx = ReferenceHookContext::new(plugins.context(), graph);
    let resolved = plugins
        .resolve_reference(&reference, &ctx)
        .map_err(|err| hook_failure(&reference, err))?;
    let Some((plugin, url)) = resolved else {
        return Err(resolve_error(
            &reference,
            ResolveErrorKind::NoResolve,
            "no plugin has handled the specifier during \"resolveReference\" hook".to_owned(),
        ));
    };
    debug!(specifier = %reference.specifier, url = %url, plugin = %plugin, "resolved");
    let implicit_urls = ctx.take_implicit_urls();
    if plugins.context().associations.applies(&url, "ignore") {
        return Ok((format!("ignore:{url}"), implicit_urls));
    }
    Ok((url, implicit_urls))
}

fn add_implicit_url(
    graph: &mut UrlGraph,
    parent: ReferenceId,
    owner: NodeIndex,
    url: String,
) -> KitchenResult<()> {
    let implicit = graph.create_reference(
        owner,
        ReferenceInit::new(ReferenceKind::PackageJson, url.clone())
            .weak()
            .implicit(),
    );
    graph.set_reference_url(implicit, url.clone())?;
    graph.finalize_reference(implicit)?;
    if let Some(r) = graph.reference_mut(parent) {
        r.implicit_references.insert(implicit);
    }
    graph.url_info_mut(owner).implicit_urls.insert(url);
    Ok(())
}

/// Give every redirect hook a chance, in order; each change yields a new reference.
fn redirect(graph: &mut UrlGraph, plugins: &PluginController, id: ReferenceId) -> KitchenResult<ReferenceId> {
    let mut current = id;
    let first = snapshot(graph, current)?;
    if first.url().is_some_and(|u| u.starts_with("ignore:")) {
        return Ok(current);
    }
    for (plugin, hook) in plugins.reference_hooks(select::redirect_reference, &first) {
        let reference = snapshot(graph, current)?;
        let redirected = {
            let ctx = ReferenceHookContext::new(plugins.context(), graph);
            hook(&reference, &ctx).map_err(|error| {
                hook_failure(
                    &reference,
                    HookError {
                        plugin: plugin.clone(),
                        hook: HookName::RedirectReference,
                        error,
                    },
                )
            })?
        };
        let Some(url) = redirected else {
            continue;
        };
        if reference.url() == Some(url.as_str()) {
            continue;
        }
        if url::Url::parse(&url).is_err() {
            return Err(KitchenError::PluginContract {
                plugin,
                hook: HookName::RedirectReference.as_str(),
                message: format!("returned {url:?}, expected an absolute url"),
            });
        }
        current = graph.redirect_reference(current, url)?;
    }
    Ok(current)
}

/// Compute `generated_url` and `generated_specifier` of a finalized reference.
fn generate(graph: &mut UrlGraph, plugins: &PluginController, id: ReferenceId) -> KitchenResult<()> {
    let reference = snapshot(graph, id)?;
    let url = reference.url().unwrap_or_default().to_owned();
    if url.starts_with("ignore:") {
        if let Some(r) = graph.reference_mut(id) {
            r.generated_url = Some(url);
            r.generated_specifier = Some(r.specifier.clone());
        }
        return Ok(());
    }

    let mut patch = SearchParamsPatch::new();
    {
        let ctx = ReferenceHookContext::new(plugins.context(), graph);
        plugins
            .call_reference_hooks(
                HookName::TransformReferenceSearchParams,
                select::transform_reference_search_params,
                &reference,
                &ctx,
                |_, params| patch.extend(params),
            )
            .map_err(|err| hook_failure(&reference, err))?;
    }
    let generated_url = inject_search_params(&url, &patch);
    if let Some(r) = graph.reference_mut(id) {
        r.generated_url = Some(generated_url.clone());
    }

    let reference = snapshot(graph, id)?;
    let formatted = {
        let ctx = ReferenceHookContext::new(plugins.context(), graph);
        plugins
            .call_reference_hooks_until(
                HookName::FormatReference,
                select::format_reference,
                &reference,
                &ctx,
            )
            .map_err(|err| hook_failure(&reference, err))?
    };
    let specifier = formatted.map(|(_, s)| s).unwrap_or(generated_url);
    let encoded = encode_specifier(reference.kind, &specifier);
    if reference.debug {
        info!(reference = %id, generated_specifier = %encoded, "reference generated");
    }
    if let Some(r) = graph.reference_mut(id) {
        r.generated_specifier = Some(encoded);
    }
    Ok(())
}

/// Apply a search params patch. Values set to `None` are removed; empty values are
/// written as bare keys (`?as_css_module`).
pub fn inject_search_params(url: &str, patch: &SearchParamsPatch) -> String {
    if patch.is_empty() {
        return url.to_owned();
    }
    let (without_hash, hash) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    let (base, query) = match without_hash.find('?') {
        Some(i) => (&without_hash[..i], &without_hash[i + 1..]),
        None => (without_hash, ""),
    };
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (p.to_owned(), String::new()),
        })
        .collect();
    for (key, value) in patch {
        match value {
            Some(value) => match pairs.iter_mut().find(|(k, _)| k == key) {
                Some(pair) => pair.1 = value.clone(),
                None => pairs.push((key.clone(), value.clone())),
            },
            None => pairs.retain(|(k, _)| k != key),
        }
    }
    if pairs.is_empty() {
        return format!("{base}{hash}");
    }
    let query = pairs
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}{hash}")
}

/// Encode a specifier for the syntax it is written back into.
pub fn encode_specifier(kind: ReferenceKind, specifier: &str) -> String {
    if kind.is_string_literal() {
        return serde_json::Value::String(specifier.to_owned()).to_string();
    }
    if kind.is_css() {
        let escaped = specifier.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("\"{escaped}\"");
    }
    specifier.to_owned()
}

//! Bridges the craft graph and the shape graph.
//!
//! The shape kitchen re-cooks every used craft file under its build url. While it does,
//! each reference is written as a placeholder; [`BuildSpecifierManager::finish`] then
//! computes versions and swaps every placeholder for its final specifier.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::stable_graph::NodeIndex;
use tracing::{debug, info, instrument};
use url::Url;

use super::build_info::BuildInfo;
use super::html;
use super::placeholders::{Rendered, placeholder, placeholder_ids, replace_placeholders};
use super::runtime::{ServiceWorkerResource, global_versioning_banner, service_worker_banner};
use super::urls_generator::{BuildUrlsGenerator, Placement};
use super::versioning::{
    VersionInput, VersioningMethod, VersioningRendering, compute_versions, content_hash, versioned_url,
};
use crate::error::{KitchenError, KitchenResult};
use crate::graph::UrlGraph;
use crate::graph::reference::{Reference, ReferenceId, ReferenceInit, ReferenceKind};
use crate::graph::url_info::{Content, UrlInfo, UrlType};
use crate::graph::visitor;
use crate::kitchen::Kitchen;
use crate::plugin::{BundleOutput, FetchResult, HookInput, Plugin, ReferenceHookContext};
use crate::plugins::file_urls::content_type_for_path;
use crate::plugins::reference_analysis::js::WORKER_SUBTYPES;
use crate::url_meta::strip_search_and_hash;

/// How the shape pass writes references.
#[derive(Debug, Clone)]
pub struct ShapeSettings {
    /// Prefix of every build specifier, ends with `/`.
    pub base: String,
    pub versioning: bool,
    pub versioning_method: VersioningMethod,
    /// Static js imports may be versioned through an import map.
    pub importmap: bool,
    pub resource_hints: bool,
    /// Source urls of service workers.
    pub service_worker_urls: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Replacement {
    target_url: String,
    /// Generated url, search params included.
    build_url: String,
    rendering: VersioningRendering,
}

#[derive(Debug)]
struct ManagerState {
    generator: BuildUrlsGenerator,
    build_to_raw: HashMap<String, String>,
    /// Build urls never versioned: pages, entry points, service workers.
    unversioned: HashSet<String>,
    replacements: HashMap<u32, Replacement>,
    next_placeholder: u32,
    /// Resource hints whose target got bundled into another file.
    bundled_hints: HashSet<ReferenceId>,
}

#[derive(Debug, Default)]
struct Injections {
    importmap: BTreeMap<String, String>,
    globals: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct BuildSpecifierManager {
    craft: Kitchen,
    settings: ShapeSettings,
    bundles: BundleOutput,
    /// Source url -> bundle url owning its content.
    redirections: HashMap<String, String>,
    build_directory_url: Url,
    state: Mutex<ManagerState>,
}

impl BuildSpecifierManager {
    pub fn new(
        craft: Kitchen,
        settings: ShapeSettings,
        bundles: BundleOutput,
        redirections: HashMap<String, String>,
        build_directory_url: Url,
        assets_directory: &str,
    ) -> Self {
        let generator = BuildUrlsGenerator::new(
            craft.context().root_directory_url.clone(),
            build_directory_url.clone(),
            assets_directory,
        );
        Self {
            craft,
            settings,
            bundles,
            redirections,
            build_directory_url,
            state: Mutex::new(ManagerState {
                generator,
                build_to_raw: HashMap::new(),
                unversioned: HashSet::new(),
                replacements: HashMap::new(),
                next_placeholder: 0,
                bundled_hints: HashSet::new(),
            }),
        }
    }

    /// Source url behind a build url.
    pub fn raw_url(&self, build_url: &str) -> Option<String> {
        self.state.lock().build_to_raw.get(build_url).cloned()
    }

    /// Build url allocated to a source url.
    pub fn build_url(&self, raw_url: &str) -> Option<String> {
        self.state.lock().generator.allocated(raw_url).map(str::to_owned)
    }

    fn is_service_worker(&self, raw_url: &str, subtype: Option<&str>) -> bool {
        subtype == Some("service_worker")
            || self
                .settings
                .service_worker_urls
                .contains(strip_search_and_hash(raw_url))
    }

    /// Craft files written to the build directory under a name of their own.
    fn has_own_file(&self, info: &UrlInfo) -> bool {
        !info.is_root
            && !info.is_inline
            && !info.is_ignored()
            && !info.kitchen_generated
            && info.url().starts_with("file:")
            && !self.redirections.contains_key(info.url())
    }

    fn placement(&self, raw_url: &str, url_type: Option<UrlType>, subtype: Option<&str>, is_entry_point: bool) -> Placement {
        if is_entry_point || url_type == Some(UrlType::Html) || self.is_service_worker(raw_url, subtype) {
            Placement::KeepPath
        } else {
            Placement::Assets
        }
    }

    /// Allocate the build url of every used craft file and every bundle.
    ///
    /// Sources are sorted first so collisions are settled the same way on every build.
    #[instrument(level = "debug", skip_all)]
    pub fn prepare_build_urls(&self) {
        let mut sources: Vec<(String, Option<UrlType>, Placement)> = self.craft.with_graph(|g| {
            visitor::strongly_referenced_from_root(g)
                .into_iter()
                .map(|node| g.url_info(node))
                .filter(|info| self.has_own_file(info))
                .map(|info| {
                    let placement = self.placement(info.url(), info.url_type, info.subtype.as_deref(), info.is_entry_point);
                    (info.url().to_owned(), info.url_type, placement)
                })
                .collect()
        });
        sources.extend(
            self.bundles
                .iter()
                .map(|(url, bundle)| (url.clone(), bundle.url_type, Placement::Assets)),
        );
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        sources.dedup_by(|a, b| a.0 == b.0);

        let mut state = self.state.lock();
        for (raw, url_type, placement) in sources {
            let build_url = state.generator.generate(&raw, url_type, placement);
            if placement == Placement::KeepPath {
                state.unversioned.insert(build_url.clone());
            }
            state.build_to_raw.insert(build_url, raw);
        }
        debug!(urls = state.build_to_raw.len(), "build urls allocated");
    }

    /// Build url of a source url the craft pass did not see as used (hints, late injections).
    fn build_url_for(&self, raw: &str, reference: &Reference) -> String {
        if let Some(existing) = self.build_url(raw) {
            return existing;
        }
        let known = self.craft.with_graph(|g| {
            g.get_url_info(raw).map(|node| {
                let info = g.url_info(node);
                (info.url_type, info.subtype.clone())
            })
        });
        let (known_type, subtype) = known.unwrap_or_default();
        let url_type = known_type.or(reference.expected_type).or_else(|| guess_type(raw));
        let subtype = subtype.or_else(|| reference.expected_subtype.clone());
        let placement = self.placement(raw, url_type, subtype.as_deref(), reference.is_entry_point);
        let mut state = self.state.lock();
        let build_url = state.generator.generate(raw, url_type, placement);
        if placement == Placement::KeepPath {
            state.unversioned.insert(build_url.clone());
        }
        state.build_to_raw.insert(build_url.clone(), raw.to_owned());
        build_url
    }

    /// Source url a reference's specifier is relative to.
    fn raw_base(&self, reference: &Reference, ctx: &ReferenceHookContext<'_>) -> anyhow::Result<Url> {
        let owner = ctx.owner(reference);
        if owner.is_root {
            return Ok(self.craft.context().root_directory_url.clone());
        }
        let host_url = ctx
            .graph
            .find_parent_if_inline(reference.owner)
            .map(|host| ctx.graph.url_info(host).url())
            .unwrap_or(owner.url());
        let raw = self.raw_url(host_url).unwrap_or_else(|| host_url.to_owned());
        Ok(Url::parse(&raw)?)
    }

    fn resolve(&self, reference: &Reference, ctx: &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>> {
        if reference.is_inline {
            return Ok(Some(reference.specifier.clone()));
        }
        if reference.kind == ReferenceKind::SourcemapComment {
            let owner = Url::parse(ctx.owner(reference).url())?;
            return Ok(Some(owner.join(&reference.specifier)?.to_string()));
        }
        let raw = match reference.specifier.strip_prefix('/').filter(|r| !r.starts_with('/')) {
            Some(rest) => self.craft.context().root_directory_url.join(rest)?,
            None => self.raw_base(reference, ctx)?.join(&reference.specifier)?,
        }
        .to_string();
        if !raw.starts_with("file:") || self.state.lock().build_to_raw.contains_key(&raw) {
            return Ok(Some(raw));
        }
        if self.craft.context().associations.applies(&raw, "ignore") {
            return Ok(Some(format!("ignore:{raw}")));
        }
        let raw = match self.redirections.get(&raw) {
            Some(bundle_url) => {
                if reference.is_resource_hint {
                    self.state.lock().bundled_hints.insert(reference.id);
                }
                bundle_url.clone()
            }
            None => raw,
        };
        let build_url = self.build_url_for(&raw, reference);
        debug!(specifier = %reference.specifier, raw = %raw, build_url = %build_url, "shape resolved");
        Ok(Some(build_url))
    }

    fn rendering_for(&self, reference: &Reference, ctx: &ReferenceHookContext<'_>, url: &str) -> VersioningRendering {
        if !self.settings.versioning || self.state.lock().unversioned.contains(url) {
            return VersioningRendering::Unversioned;
        }
        let in_worker = ctx
            .owner(reference)
            .subtype
            .as_deref()
            .is_some_and(|s| WORKER_SUBTYPES.contains(&s));
        if in_worker
            || reference.is_dynamic
            || reference.kind == ReferenceKind::JsUrl
            || reference.subtype.as_deref() == Some("import_meta_resolve")
        {
            return VersioningRendering::Global;
        }
        if reference.kind == ReferenceKind::JsImport && self.settings.importmap {
            return VersioningRendering::Importmap;
        }
        VersioningRendering::Embedded
    }

    fn format(&self, reference: &Reference, ctx: &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>> {
        if reference.is_inline || reference.kind == ReferenceKind::SourcemapComment {
            return Ok(None);
        }
        let Some(url) = reference.url() else {
            return Ok(None);
        };
        if !url.starts_with(self.build_directory_url.as_str()) {
            return Ok(None);
        }
        let rendering = self.rendering_for(reference, ctx, url);
        let build_url = reference.generated_url.clone().unwrap_or_else(|| url.to_owned());
        let mut state = self.state.lock();
        state.next_placeholder += 1;
        let id = state.next_placeholder;
        state.replacements.insert(
            id,
            Replacement {
                target_url: url.to_owned(),
                build_url,
                rendering,
            },
        );
        Ok(Some(placeholder(id)))
    }

    fn fetch(&self, input: &HookInput) -> anyhow::Result<Option<FetchResult>> {
        if input.first_reference.as_ref().is_some_and(|r| r.content.is_some()) {
            return Ok(None);
        }
        let Some(raw) = self.raw_url(input.url()) else {
            return Ok(None);
        };
        if let Some(bundle) = self.bundles.get(&raw) {
            return Ok(Some(FetchResult {
                content: Some(Content::Text(bundle.content.clone())),
                content_type: Some(bundle.content_type.clone()),
                url_type: bundle.url_type,
                original_url: Some(raw),
                sourcemap: bundle.sourcemap.clone(),
                data: bundle.data.clone(),
                ..FetchResult::default()
            }));
        }
        let info = self
            .craft
            .with_graph(|g| g.get_url_info(&raw).map(|node| g.url_info(node).clone()))
            .ok_or_else(|| KitchenError::BuildInvariant(format!("{raw} is not in the craft graph")))?;
        if let Some(error) = &info.error {
            return Err(error.clone().into());
        }
        let content = info
            .content()
            .cloned()
            .ok_or_else(|| KitchenError::BuildInvariant(format!("{raw} is used but was never cooked")))?;
        Ok(Some(FetchResult {
            content: Some(content),
            content_type: info.content_type.clone(),
            url_type: info.url_type,
            subtype: info.subtype.clone(),
            original_url: Some(raw),
            sourcemap: info.sourcemap.clone(),
            headers: info.headers.clone(),
            is_entry_point: Some(info.is_entry_point),
            filename_hint: info.filename_hint.clone(),
            data: info.data.clone(),
            ..FetchResult::default()
        }))
    }

    /// Plugin unshifted in front of the shape kitchen's plugins.
    pub fn shape_plugin(self: &Arc<Self>) -> Plugin {
        let resolver = Arc::clone(self);
        let formatter = Arc::clone(self);
        let fetcher = Arc::clone(self);
        Plugin::new("build_shape")
            .on_resolve_reference(move |reference, ctx| resolver.resolve(reference, ctx))
            .on_format_reference(move |reference, ctx| formatter.format(reference, ctx))
            .on_fetch_url_content(move |input| {
                let result = fetcher.fetch(&input);
                async move { result }
            })
    }

    // -----------------------------------------------------------------------
    // After the shape pass
    // -----------------------------------------------------------------------

    /// Version the shape graph, write final specifiers and collect the build files.
    #[instrument(level = "debug", skip_all)]
    pub fn finish(&self, shape: &Kitchen) -> KitchenResult<BuildInfo> {
        if self.settings.resource_hints {
            self.resync_resource_hints(shape)?;
        }
        let versions = if self.settings.versioning {
            self.prepare_versioning(shape)?
        } else {
            BTreeMap::new()
        };
        let injections = self.write_specifiers(shape, &versions)?;
        self.inject_runtime(shape, &injections)?;
        self.inject_service_worker_resources(shape, &versions)?;
        Ok(self.build_info(shape, &versions))
    }

    /// Used shape nodes living in the build directory, ordered by url.
    fn used_nodes(&self, graph: &UrlGraph) -> Vec<NodeIndex> {
        let prefix = self.build_directory_url.as_str();
        let mut nodes: Vec<NodeIndex> = visitor::strongly_referenced_from_root(graph)
            .into_iter()
            .filter(|&node| {
                let info = graph.url_info(node);
                !info.is_root && !info.is_ignored() && info.url().starts_with(prefix)
            })
            .collect();
        nodes.sort_by(|a, b| graph.url_info(*a).url().cmp(graph.url_info(*b).url()));
        nodes
    }

    fn pages(&self, shape: &Kitchen) -> Vec<NodeIndex> {
        shape.with_graph(|g| {
            self.used_nodes(g)
                .into_iter()
                .filter(|&node| {
                    let info = g.url_info(node);
                    !info.is_inline && info.url_type == Some(UrlType::Html)
                })
                .collect()
        })
    }

    /// Drop hints to files that ended up unused or bundled; preload shared chunks the
    /// bundlers created where the page already preloads modules.
    fn resync_resource_hints(&self, shape: &Kitchen) -> KitchenResult<()> {
        let bundled_hints = self.state.lock().bundled_hints.clone();
        let pages = self.pages(shape);
        for &page in &pages {
            shape.with_graph(|g| -> KitchenResult<()> {
                let hints: Vec<Reference> = g
                    .references_to_others(page)
                    .into_iter()
                    .filter_map(|id| g.reference(id))
                    .filter(|r| r.is_resource_hint)
                    .cloned()
                    .collect();
                let Some(mut text) = g.url_info(page).content_text().map(str::to_owned) else {
                    return Ok(());
                };
                let mut changed = false;
                for hint in hints {
                    let used = hint.target().is_some_and(|t| g.is_used(t));
                    let bundled = bundled_hints.contains(&hint.id)
                        || bundled_hints.contains(&hint.original);
                    if used && !bundled {
                        continue;
                    }
                    if let Some(specifier) = &hint.generated_specifier {
                        if let Some(updated) = html::remove_link_tag(&text, specifier) {
                            text = updated;
                            changed = true;
                        }
                    }
                    g.remove_reference(hint.id)?;
                    debug!(page = %g.url_info(page).url(), hint = %hint.specifier, used, bundled, "resource hint removed");
                }
                if changed {
                    g.url_info_mut(page).set_content(Content::Text(text));
                }
                Ok(())
            })?;
        }

        let shared_chunks: Vec<String> = self
            .bundles
            .iter()
            .filter(|(_, bundle)| bundle.is_shared_chunk)
            .map(|(url, _)| url.clone())
            .collect();
        for raw_chunk in shared_chunks {
            let Some(build_url) = self.build_url(&raw_chunk) else {
                continue;
            };
            for &page in &pages {
                let needs_hint = shape.with_graph(|g| {
                    let Some(chunk) = g.get_url_info(&build_url) else {
                        return false;
                    };
                    let hints: Vec<&Reference> = g
                        .references_to_others(page)
                        .into_iter()
                        .filter_map(|id| g.reference(id))
                        .filter(|r| r.is_resource_hint)
                        .collect();
                    let preloads_modules = hints.iter().any(|r| r.expected_type == Some(UrlType::JsModule));
                    let already_hinted = hints.iter().any(|r| r.target() == Some(chunk));
                    preloads_modules
                        && !already_hinted
                        && g.is_used(chunk)
                        && visitor::find_dependency(g, page, |node, _| node == chunk).is_some()
                });
                if !needs_hint {
                    continue;
                }
                let handle = shape.inject_reference(
                    page,
                    ReferenceInit::new(ReferenceKind::LinkHref, raw_chunk.clone())
                        .resource_hint()
                        .expect_type(UrlType::JsModule),
                )?;
                shape.with_graph(|g| {
                    let info = g.url_info_mut(page);
                    if let Some(text) = info.content_text() {
                        let tag = format!("<link rel=\"modulepreload\" href=\"{}\" />", handle.generated_specifier);
                        let updated = html::insert_before_head_end(text, &tag);
                        info.set_content(Content::Text(updated));
                    }
                });
                debug!(chunk = %build_url, "modulepreload added for shared chunk");
            }
        }
        Ok(())
    }

    fn prepare_versioning(&self, shape: &Kitchen) -> KitchenResult<BTreeMap<String, String>> {
        let (files, unused) = shape.with_graph(|g| {
            let used = self.used_nodes(g);
            let used_set: HashSet<NodeIndex> = used.iter().copied().collect();
            let unused: HashSet<String> = g
                .url_infos()
                .filter(|(node, _)| !used_set.contains(node))
                .map(|(_, info)| info.url().to_owned())
                .collect();
            let files: Vec<(String, Option<Content>, bool, bool)> = used
                .into_iter()
                .map(|node| g.url_info(node))
                .filter(|info| !info.is_inline)
                .map(|info| {
                    let never_versioned = info.kitchen_generated || info.url_type == Some(UrlType::Sourcemap);
                    (
                        info.url().to_owned(),
                        info.content().cloned(),
                        never_versioned,
                        receives_globals_banner(info),
                    )
                })
                .collect();
            (files, unused)
        });

        let state = self.state.lock();
        let file_urls: HashSet<&str> = files.iter().map(|(url, ..)| url.as_str()).collect();
        // Workers get the `__v__` table prepended after versioning, so their bytes depend on
        // the version of every file that table can list.
        let global_targets: BTreeSet<String> = state
            .replacements
            .values()
            .filter(|r| r.rendering == VersioningRendering::Global)
            .filter(|r| !unused.contains(&r.target_url) && file_urls.contains(r.target_url.as_str()))
            .map(|r| r.target_url.clone())
            .collect();
        let mut inputs = BTreeMap::new();
        let mut versioned = BTreeSet::new();
        for (url, content, never_versioned, gets_banner) in files {
            let mut embeds: BTreeSet<String> = content
                .as_ref()
                .and_then(Content::as_text)
                .map(|text| {
                    placeholder_ids(text)
                        .into_iter()
                        .filter_map(|id| state.replacements.get(&id))
                        .filter(|r| r.rendering.propagates_version() && !unused.contains(&r.target_url))
                        .map(|r| r.target_url.clone())
                        .collect()
                })
                .unwrap_or_default();
            if gets_banner {
                embeds.extend(global_targets.iter().filter(|target| **target != url).cloned());
            }
            inputs.insert(
                url.clone(),
                VersionInput {
                    content_hash: content.as_ref().map(content_hash),
                    embeds,
                },
            );
            if !never_versioned && !state.unversioned.contains(&url) {
                versioned.insert(url);
            }
        }
        drop(state);
        let versions = compute_versions(&inputs, &versioned)?;
        info!(files = versions.len(), "versions computed");
        Ok(versions)
    }

    /// `base` followed by the path of `build_url` inside the build directory.
    fn specifier_for(&self, build_url: &str) -> String {
        let relative = build_url
            .strip_prefix(self.build_directory_url.as_str())
            .unwrap_or(build_url);
        format!("{}{relative}", self.settings.base)
    }

    fn render(
        &self,
        replacement: &Replacement,
        quoted: bool,
        versions: &BTreeMap<String, String>,
        injections: &mut Injections,
    ) -> Rendered {
        let unversioned = self.specifier_for(&replacement.build_url);
        let versioned = versions.get(&replacement.target_url).map(|version| {
            self.specifier_for(&versioned_url(
                &replacement.build_url,
                version,
                self.settings.versioning_method,
            ))
        });
        match (replacement.rendering, versioned) {
            (VersioningRendering::Embedded, Some(versioned)) => Rendered::Specifier(versioned),
            (VersioningRendering::Importmap, Some(versioned)) => {
                injections.importmap.insert(unversioned.clone(), versioned);
                Rendered::Specifier(unversioned)
            }
            (VersioningRendering::Global, Some(versioned)) if quoted => {
                let literal = serde_json::Value::String(unversioned.clone()).to_string();
                injections.globals.insert(unversioned, versioned);
                Rendered::Expression(format!("__v__({literal})"))
            }
            (VersioningRendering::Global, Some(versioned)) => Rendered::Specifier(versioned),
            _ => Rendered::Specifier(unversioned),
        }
    }

    /// Replace every placeholder of every used node.
    fn write_specifiers(&self, shape: &Kitchen, versions: &BTreeMap<String, String>) -> KitchenResult<Injections> {
        let nodes: Vec<(NodeIndex, String, String)> = shape.with_graph(|g| {
            self.used_nodes(g)
                .into_iter()
                .filter_map(|node| {
                    let info = g.url_info(node);
                    let text = info.content_text()?;
                    Some((node, info.url().to_owned(), text.to_owned()))
                })
                .collect()
        });
        let state = self.state.lock();
        let mut injections = Injections::default();
        let mut rendered = Vec::with_capacity(nodes.len());
        for (node, url, text) in nodes {
            let out = replace_placeholders(&text, |found| {
                let replacement = state.replacements.get(&found.id)?;
                Some(self.render(replacement, found.quoted, versions, &mut injections))
            })
            .map_err(|id| {
                KitchenError::BuildInvariant(format!("{} in {url} has no replacement", placeholder(id)))
            })?;
            if out != text {
                rendered.push((node, out));
            }
        }
        drop(state);
        shape.with_graph(|g| {
            for (node, text) in rendered {
                g.url_info_mut(node).set_content(Content::Text(text));
            }
        });
        Ok(injections)
    }

    /// Import map into html entry points; the `__v__` table into entry points and workers.
    fn inject_runtime(&self, shape: &Kitchen, injections: &Injections) -> KitchenResult<()> {
        if injections.importmap.is_empty() && injections.globals.is_empty() {
            return Ok(());
        }
        let banner = if injections.globals.is_empty() {
            None
        } else {
            Some(global_versioning_banner(&injections.globals).map_err(invariant)?)
        };
        shape.with_graph(|g| -> KitchenResult<()> {
            for node in self.used_nodes(g) {
                let info = g.url_info(node);
                if info.is_inline {
                    continue;
                }
                let Some(text) = info.content_text() else {
                    continue;
                };
                let updated = match info.url_type {
                    Some(UrlType::Html) if info.is_entry_point => {
                        let mut page = text.to_owned();
                        if !injections.importmap.is_empty() {
                            page = html::inject_importmap(&page, &injections.importmap).map_err(invariant)?;
                        }
                        if let Some(banner) = &banner {
                            page = html::insert_at_head_start(&page, &format!("<script>\n{banner}</script>"));
                        }
                        Some(page)
                    }
                    Some(_) if receives_globals_banner(info) => {
                        banner.as_ref().map(|banner| format!("{banner}{text}"))
                    }
                    _ => None,
                };
                if let Some(updated) = updated {
                    g.url_info_mut(node).set_content(Content::Text(updated));
                }
            }
            Ok(())
        })
    }

    /// Prepend the list of build files to each service worker, itself excluded.
    fn inject_service_worker_resources(&self, shape: &Kitchen, versions: &BTreeMap<String, String>) -> KitchenResult<()> {
        let (workers, resources) = shape.with_graph(|g| {
            let files: Vec<&UrlInfo> = self
                .used_nodes(g)
                .into_iter()
                .map(|node| g.url_info(node))
                .filter(|info| !info.is_inline)
                .collect();
            let workers: Vec<String> = files
                .iter()
                .filter(|info| {
                    let raw = self.raw_url(info.url()).unwrap_or_else(|| info.url().to_owned());
                    self.is_service_worker(&raw, info.subtype.as_deref())
                })
                .map(|info| info.url().to_owned())
                .collect();
            let resources: BTreeMap<String, ServiceWorkerResource> = files
                .iter()
                .filter(|info| !info.kitchen_generated && info.url_type != Some(UrlType::Sourcemap))
                .map(|info| {
                    let version = versions.get(info.url()).cloned();
                    let versioned = version.as_ref().map(|v| {
                        self.specifier_for(&versioned_url(info.url(), v, self.settings.versioning_method))
                    });
                    (
                        self.specifier_for(info.url()),
                        ServiceWorkerResource {
                            version,
                            versioned_url: versioned,
                        },
                    )
                })
                .collect();
            (workers, resources)
        });
        for worker in workers {
            let mut own = resources.clone();
            own.remove(&self.specifier_for(&worker));
            let banner = service_worker_banner(&own).map_err(invariant)?;
            shape.with_graph(|g| {
                let Some(node) = g.get_url_info(&worker) else {
                    return;
                };
                let info = g.url_info_mut(node);
                if let Some(text) = info.content_text() {
                    let updated = format!("{banner}{text}");
                    info.set_content(Content::Text(updated));
                }
            });
            debug!(worker = %worker, resources = own.len(), "service worker resources injected");
        }
        Ok(())
    }

    fn relative(&self, build_url: &str) -> Option<String> {
        build_url
            .strip_prefix(self.build_directory_url.as_str())
            .map(str::to_owned)
    }

    fn build_info(&self, shape: &Kitchen, versions: &BTreeMap<String, String>) -> BuildInfo {
        shape.with_graph(|g| {
            let mut out = BuildInfo::default();
            for node in self.used_nodes(g) {
                let info = g.url_info(node);
                let (Some(content), Some(relative)) = (info.content(), self.relative(info.url())) else {
                    continue;
                };
                if info.is_inline {
                    if let Some(text) = content.as_text() {
                        out.build_inline_contents.insert(relative, text.to_owned());
                    }
                    continue;
                }
                match versions.get(info.url()) {
                    Some(version) => {
                        let versioned = versioned_url(info.url(), version, self.settings.versioning_method);
                        let versioned_relative = self.relative(&versioned).unwrap_or_else(|| relative.clone());
                        out.build_file_contents
                            .insert(strip_search_and_hash(&versioned_relative).to_owned(), content.clone());
                        out.build_manifest.insert(relative, versioned_relative);
                    }
                    None => {
                        out.build_file_contents
                            .insert(strip_search_and_hash(&relative).to_owned(), content.clone());
                    }
                }
            }
            out.sorted()
        })
    }
}

/// Js entry points and workers get the `__v__` table prepended.
fn receives_globals_banner(info: &UrlInfo) -> bool {
    let is_worker = info.subtype.as_deref().is_some_and(|s| WORKER_SUBTYPES.contains(&s));
    info.url_type.is_some_and(|t| t.is_js()) && (info.is_entry_point || is_worker)
}

fn invariant(err: anyhow::Error) -> KitchenError {
    KitchenError::BuildInvariant(format!("{err:#}"))
}

fn guess_type(raw: &str) -> Option<UrlType> {
    let path = Url::parse(raw).ok()?.to_file_path().ok()?;
    match UrlType::from_content_type(&content_type_for_path(&path)) {
        UrlType::Other => None,
        url_type => Some(url_type),
    }
}

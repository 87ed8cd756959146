pub mod integrity;
pub mod operation;
pub mod references;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use parking_lot::{Mutex, MutexGuard};
use petgraph::stable_graph::NodeIndex;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{
    FetchErrorKind, FetchFailure, KitchenError, KitchenResult, ParseError, Trace,
};
use crate::graph::UrlGraph;
use crate::graph::reference::{ReferenceId, ReferenceInit, ReferenceKind};
use crate::graph::url_info::{Content, UrlInfo, UrlType};
use crate::plugin::controller::select;
use crate::plugin::{ContentPatch, FetchResult, HookInput, PluginController, PluginSpec};
use crate::transformer::sourcemap::{
    normalize_sourcemap, relativize_sources, sourcemap_from_json, sourcemap_to_json,
};
use crate::transformer::{InitialContent, SourcemapMode, SourcemapOutput, UrlInfoTransformer};
use crate::url_meta::UrlAssociations;
use integrity::validate_integrity;
use operation::Operation;

/// Which of the two build passes a kitchen runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    /// Source-rooted graph: everything is cooked as authored.
    Craft,
    /// Build-directory graph: urls are final build urls.
    Shape,
}

/// Settings shared by every plugin and hook of one kitchen.
#[derive(Debug, Clone)]
pub struct KitchenContext {
    pub dev: bool,
    pub build: bool,
    pub build_step: Option<BuildStep>,
    pub root_directory_url: Url,
    pub build_directory_url: Option<Url>,
    /// Side directory receiving every cooked file, for debugging.
    pub out_directory_url: Option<Url>,
    pub sourcemaps: SourcemapMode,
    pub sourcemaps_sources_content: bool,
    /// `ignore` and `watch` url associations.
    pub associations: UrlAssociations,
    pub ignore_dynamic_import: bool,
    /// Extra flags matched by `AppliesDuring::Flags`.
    pub flags: BTreeMap<String, bool>,
}

impl KitchenContext {
    pub fn dev(root_directory_url: Url) -> Self {
        Self {
            dev: true,
            build: false,
            build_step: None,
            root_directory_url,
            build_directory_url: None,
            out_directory_url: None,
            sourcemaps: SourcemapMode::Inline,
            sourcemaps_sources_content: true,
            associations: UrlAssociations::new(),
            ignore_dynamic_import: false,
            flags: BTreeMap::new(),
        }
    }

    pub fn build(root_directory_url: Url, build_directory_url: Url, step: BuildStep) -> Self {
        Self {
            dev: false,
            build: true,
            build_step: Some(step),
            build_directory_url: Some(build_directory_url),
            sourcemaps: SourcemapMode::None,
            ..Self::dev(root_directory_url)
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        match name {
            "dev" => self.dev,
            "build" => self.build,
            _ => self.flags.get(name).copied().unwrap_or(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(root: &str) -> Self {
        let mut context = Self::dev(Url::parse(root).expect("valid test url"));
        context.dev = false;
        context.sourcemaps = SourcemapMode::None;
        context
    }
}

/// Options of a single cook.
#[derive(Debug, Clone, Default)]
pub struct CookOptions {
    /// The url was requested on its own (dev server request), not cooked as a dependency.
    pub direct_request: bool,
    pub operation: Operation,
}

#[derive(Debug, Clone, Default)]
pub struct CookDependenciesOptions {
    pub operation: Operation,
    pub ignore_dynamic_import: bool,
}

/// What a hook gets back after adding a reference to the graph.
#[derive(Debug, Clone)]
pub struct ReferenceHandle {
    pub id: ReferenceId,
    pub url: String,
    pub generated_url: String,
    pub generated_specifier: String,
    pub target: NodeIndex,
}

impl ReferenceHandle {
    fn of(graph: &UrlGraph, id: ReferenceId) -> KitchenResult<Self> {
        let r = graph
            .reference(id)
            .ok_or_else(|| KitchenError::ReferenceLifecycle(format!("unknown reference {id}")))?;
        let url = r.url().unwrap_or_default().to_owned();
        Ok(Self {
            id,
            generated_url: r.generated_url.clone().unwrap_or_else(|| url.clone()),
            generated_specifier: r.generated_specifier.clone().unwrap_or_else(|| url.clone()),
            url,
            target: r.target().ok_or_else(|| {
                KitchenError::ReferenceLifecycle(format!("{id} is not finalized"))
            })?,
        })
    }
}

/// Late content edit run right before `finalize_url_content` hooks.
pub type ContentCallback =
    Box<dyn FnOnce(&UrlInfo) -> anyhow::Result<Option<ContentPatch>> + Send>;

/// Work run once, after a whole `cook_dependencies` settled.
pub type LastCallback = Box<dyn FnOnce() -> BoxFuture<'static, KitchenResult<()>> + Send>;

type CookFuture = Shared<BoxFuture<'static, KitchenResult<()>>>;

struct CookEntry {
    modified_timestamp: u64,
    future: CookFuture,
}

struct KitchenInner {
    context: KitchenContext,
    graph: Mutex<UrlGraph>,
    plugins: PluginController,
    transformer: UrlInfoTransformer,
    cooks: Mutex<HashMap<NodeIndex, CookEntry>>,
    content_callbacks: Mutex<HashMap<NodeIndex, Vec<ContentCallback>>>,
    last_callbacks: Mutex<Vec<LastCallback>>,
}

/// One graph, its plugins and the cooking pipeline driving them.
///
/// Cheap to clone; clones share everything. The graph lock is never held across an
/// await point, so hooks may call back into the kitchen freely.
#[derive(Clone)]
pub struct Kitchen {
    inner: Arc<KitchenInner>,
}

impl std::fmt::Debug for Kitchen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kitchen")
            .field("graph", &*self.inner.graph.lock())
            .finish_non_exhaustive()
    }
}

impl Kitchen {
    pub fn new(context: KitchenContext, plugins: impl Into<PluginSpec>) -> anyhow::Result<Self> {
        let controller = PluginController::new(context, plugins)?;
        Ok(Self::from_controller(controller))
    }

    /// Kitchen over an already assembled controller (build passes unshift their own plugins).
    pub fn from_controller(plugins: PluginController) -> Self {
        let context = plugins.context().clone();
        let name = if context.build_step == Some(BuildStep::Shape) {
            "shape"
        } else if context.build {
            "craft"
        } else {
            "dev"
        };
        let mut graph = UrlGraph::new(name, context.root_directory_url.as_str());
        graph.is_build = context.build;
        graph.tracks_search_param_variants = context.build_step == Some(BuildStep::Shape);
        let transformer =
            UrlInfoTransformer::new(context.sourcemaps, context.sourcemaps_sources_content);
        Self {
            inner: Arc::new(KitchenInner {
                context,
                graph: Mutex::new(graph),
                plugins,
                transformer,
                cooks: Mutex::new(HashMap::new()),
                content_callbacks: Mutex::new(HashMap::new()),
                last_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn context(&self) -> &KitchenContext {
        &self.inner.context
    }

    pub fn plugins(&self) -> &PluginController {
        &self.inner.plugins
    }

    /// Lock the graph. Never hold the guard across an await point.
    pub fn graph(&self) -> MutexGuard<'_, UrlGraph> {
        self.inner.graph.lock()
    }

    pub fn with_graph<T>(&self, f: impl FnOnce(&mut UrlGraph) -> T) -> T {
        f(&mut self.inner.graph.lock())
    }

    /// Snapshot of a node.
    pub fn url_info(&self, node: NodeIndex) -> UrlInfo {
        self.with_graph(|g| g.url_info(node).clone())
    }

    pub fn node_for_url(&self, url: &str) -> Option<NodeIndex> {
        self.with_graph(|g| g.get_url_info(url))
    }

    // -----------------------------------------------------------------------
    // References
    // -----------------------------------------------------------------------

    /// Add an entry point referenced by the root.
    pub fn prepare_entry_point(&self, specifier: &str) -> KitchenResult<ReferenceHandle> {
        let root = self.with_graph(|g| g.root());
        self.add_reference(
            root,
            ReferenceInit::new(ReferenceKind::EntryPoint, specifier).entry_point(),
        )
    }

    /// Reference found by parsing the owner's content.
    pub fn found_reference(&self, owner: NodeIndex, init: ReferenceInit) -> KitchenResult<ReferenceHandle> {
        self.add_reference(owner, init)
    }

    /// Reference added by a plugin, with no textual counterpart in the owner.
    pub fn inject_reference(&self, owner: NodeIndex, mut init: ReferenceInit) -> KitchenResult<ReferenceHandle> {
        init.injected = true;
        self.add_reference(owner, init)
    }

    /// Reference whose content lives inside the owner. The new reference becomes the
    /// target's first reference so the latest content is what gets fetched.
    pub fn found_inline_reference(
        &self,
        owner: NodeIndex,
        init: ReferenceInit,
    ) -> KitchenResult<ReferenceHandle> {
        let mut graph = self.inner.graph.lock();
        let id = references::create_resolve_and_finalize(&mut graph, &self.inner.plugins, owner, init)?;
        let handle = ReferenceHandle::of(&graph, id)?;
        let info = graph.url_info_mut(handle.target);
        info.first_reference = Some(id);
        info.is_inline = true;
        Ok(handle)
    }

    fn add_reference(&self, owner: NodeIndex, init: ReferenceInit) -> KitchenResult<ReferenceHandle> {
        let mut graph = self.inner.graph.lock();
        let id = references::create_resolve_and_finalize(&mut graph, &self.inner.plugins, owner, init)?;
        ReferenceHandle::of(&graph, id)
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    /// Edit `node`'s content at the start of its next finalize step.
    pub fn add_content_transformation_callback(
        &self,
        node: NodeIndex,
        callback: impl FnOnce(&UrlInfo) -> anyhow::Result<Option<ContentPatch>> + Send + 'static,
    ) {
        self.inner
            .content_callbacks
            .lock()
            .entry(node)
            .or_default()
            .push(Box::new(callback));
    }

    /// Queue work for the end of the current `cook_dependencies`.
    pub fn add_last_transformation_callback(
        &self,
        callback: impl FnOnce() -> BoxFuture<'static, KitchenResult<()>> + Send + 'static,
    ) {
        self.inner.last_callbacks.lock().push(Box::new(callback));
    }

    // -----------------------------------------------------------------------
    // Cooking
    // -----------------------------------------------------------------------

    /// Cook `node`. Concurrent calls for the same node and modification share one cook;
    /// a modification observed mid-cook makes that cook restart.
    pub fn cook(&self, node: NodeIndex, options: CookOptions) -> BoxFuture<'static, KitchenResult<()>> {
        let (skip, modified) = self.with_graph(|g| {
            let info = g.url_info(node);
            (
                info.is_root || info.is_ignored() || info.kitchen_generated,
                info.modified_timestamp,
            )
        });
        if skip {
            return future::ready(Ok(())).boxed();
        }
        let shared = {
            let mut cooks = self.inner.cooks.lock();
            match cooks.get(&node) {
                Some(entry) if entry.modified_timestamp == modified => entry.future.clone(),
                _ => {
                    let kitchen = self.clone();
                    let cook_options = options.clone();
                    let future = async move { kitchen.cook_once(node, modified, cook_options).await }
                        .boxed()
                        .shared();
                    cooks.insert(
                        node,
                        CookEntry {
                            modified_timestamp: modified,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };
        let kitchen = self.clone();
        async move {
            shared.await?;
            if options.direct_request {
                // Errors swallowed for dependents still reach whoever asked for the url.
                if let Some(error) = kitchen.with_graph(|g| g.url_info(node).error.clone()) {
                    return Err(error);
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn cook_once(&self, node: NodeIndex, started_at: u64, options: CookOptions) -> KitchenResult<()> {
        let result = options
            .operation
            .run(self.cook_steps(node, started_at, &options))
            .await;
        match result {
            Ok(()) => {
                let stale = self.with_graph(|g| {
                    let info = g.url_info_mut(node);
                    if info.modified_timestamp != started_at {
                        return true;
                    }
                    info.cooked_timestamp = Some(started_at);
                    self.inner.plugins.call_cooked(info);
                    false
                });
                if stale {
                    return self.cook(node, options).await;
                }
                Ok(())
            }
            Err(KitchenError::Superseded { url }) => {
                debug!(url = %url, "cook superseded, cooking again");
                self.cook(node, options).await
            }
            Err(KitchenError::Aborted) => {
                let mut cooks = self.inner.cooks.lock();
                if cooks.get(&node).is_some_and(|e| e.modified_timestamp == started_at) {
                    cooks.remove(&node);
                }
                Err(KitchenError::Aborted)
            }
            Err(error) => {
                let outcome = self.with_graph(|g| {
                    let info = g.url_info_mut(node);
                    if info.modified_timestamp != started_at {
                        return None;
                    }
                    info.error = Some(error.clone());
                    info.cooked_timestamp = Some(started_at);
                    Some((info.is_inline, info.url().to_owned()))
                });
                let Some((is_inline, url)) = outcome else {
                    return self.cook(node, options).await;
                };
                if error.is_parse_error() && is_inline && !self.inner.context.build {
                    warn!(url = %url, error = %error, "syntax error in inline content");
                    return Ok(());
                }
                Err(error)
            }
        }
    }

    /// Run `f` on the graph unless `node` was modified since `started_at`.
    fn with_node<T>(
        &self,
        node: NodeIndex,
        started_at: u64,
        f: impl FnOnce(&mut UrlGraph) -> T,
    ) -> KitchenResult<T> {
        let mut graph = self.inner.graph.lock();
        let info = graph.url_info(node);
        if info.modified_timestamp != started_at {
            return Err(KitchenError::Superseded {
                url: info.url().to_owned(),
            });
        }
        Ok(f(&mut graph))
    }

    fn hook_input(&self, node: NodeIndex, options: &CookOptions) -> HookInput {
        let (url_info, first_reference) = self.with_graph(|g| {
            let info = g.url_info(node).clone();
            let first = info.first_reference.and_then(|id| g.reference(id)).cloned();
            (info, first)
        });
        HookInput {
            kitchen: self.clone(),
            node,
            url_info,
            first_reference,
            direct_request: options.direct_request,
            operation: options.operation.clone(),
        }
    }

    #[instrument(level = "debug", skip_all, fields(node = node.index()))]
    async fn cook_steps(&self, node: NodeIndex, started_at: u64, options: &CookOptions) -> KitchenResult<()> {
        let previous = self.with_node(node, started_at, |g| {
            let previous: Vec<ReferenceId> = g
                .references_to_others(node)
                .into_iter()
                .filter(|id| g.reference(*id).is_some_and(|r| !r.is_implicit))
                .collect();
            g.url_info_mut(node).reset_content();
            previous
        })?;

        self.fetch_url_content(node, started_at, options).await?;
        self.transform_url_content(node, started_at, options).await?;
        self.with_node(node, started_at, |g| -> KitchenResult<()> {
            for id in previous {
                g.remove_reference(id)?;
            }
            Ok(())
        })??;
        if self.inner.context.build_step == Some(BuildStep::Shape) {
            self.optimize_url_content(node, started_at, options).await?;
        }
        self.finalize_url_content(node, started_at, options).await
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    #[instrument(level = "debug", skip_all, fields(node = node.index()))]
    async fn fetch_url_content(&self, node: NodeIndex, started_at: u64, options: &CookOptions) -> KitchenResult<()> {
        let input = self.hook_input(node, options);
        let url = input.url().to_owned();
        let trace = input
            .first_reference
            .as_ref()
            .map(|r| r.trace.clone())
            .unwrap_or_else(|| Trace::from_url(&url));
        let fetch_error = |kind: FetchErrorKind, reason: String| KitchenError::FetchUrlContent {
            kind,
            url: url.clone(),
            trace: trace.clone(),
            reason,
        };

        let mut fetched = None;
        for (plugin, hook) in self.inner.plugins.content_hooks(select::fetch_url_content, &input.url_info) {
            let result = options
                .operation
                .run(async {
                    hook(input.clone()).await.map_err(|err| map_fetch_error(err, &fetch_error))
                })
                .await?;
            if let Some(result) = result {
                debug!(url = %url, plugin = %plugin, "fetched");
                fetched = Some(result);
                break;
            }
        }
        let Some(result) = fetched else {
            return Err(fetch_error(
                FetchErrorKind::NoHandler,
                "no plugin has handled the url during \"fetchUrlContent\" hook".to_owned(),
            ));
        };
        match result.status() {
            200 => {}
            404 => return Err(fetch_error(FetchErrorKind::NotFound, "status 404".to_owned())),
            403 => return Err(fetch_error(FetchErrorKind::NotAllowed, "status 403".to_owned())),
            status => {
                return Err(fetch_error(
                    FetchErrorKind::BadStatus(status),
                    format!("fetch returned status {status}, expected 200"),
                ));
            }
        }

        let content_type = result.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(Url::parse(&url).map(|u| u.path().to_owned()).unwrap_or_default())
                .first_or_octet_stream()
                .essence_str()
                .to_owned()
        });
        let fetched_type = result
            .url_type
            .unwrap_or_else(|| UrlType::from_content_type(&content_type));
        let first = input.first_reference.as_ref();
        let url_type = match first.and_then(|r| r.expected_type) {
            Some(expected) if expected.accepts(fetched_type) => {
                if result.url_type.is_some() { fetched_type } else { expected }
            }
            Some(expected) => {
                return Err(fetch_error(
                    FetchErrorKind::UnexpectedType,
                    format!("expected {expected}, got {fetched_type} ({content_type})"),
                ));
            }
            None => fetched_type,
        };
        if let Some(expected) = first.and_then(|r| r.expected_content_type.as_deref()) {
            if essence(expected) != essence(&content_type) {
                return Err(fetch_error(
                    FetchErrorKind::UnexpectedType,
                    format!("expected content type {expected}, got {content_type}"),
                ));
            }
        }
        // Shape content was validated when the craft pass fetched it.
        let validates_integrity = self.inner.context.build_step != Some(BuildStep::Shape);
        if let (true, Some(integrity), Some(content)) = (
            validates_integrity,
            first.and_then(|r| r.integrity.as_deref()),
            &result.content,
        ) {
            validate_integrity(content.as_bytes(), integrity)
                .map_err(|err| fetch_error(FetchErrorKind::IntegrityMismatch, err.to_string()))?;
        }

        let context = &self.inner.context;
        let is_watched = context.associations.applies(&url, "watch");
        let generated_url = self.generated_url_for(&url);
        let expected_subtype = first.and_then(|r| r.expected_subtype.clone());
        let comment = self.with_node(node, started_at, |g| {
            let info = g.url_info_mut(node);
            let FetchResult {
                content,
                subtype,
                original_url,
                original_content,
                sourcemap,
                headers,
                is_entry_point,
                filename_hint,
                data,
                ..
            } = result;
            info.content_type = Some(content_type);
            info.url_type = Some(url_type);
            info.subtype = subtype.or(expected_subtype);
            info.original_url = original_url.or_else(|| Some(url.clone()));
            info.headers = headers;
            info.data = data;
            if filename_hint.is_some() {
                info.filename_hint = filename_hint;
            }
            if is_entry_point == Some(true) {
                info.is_entry_point = true;
            }
            info.is_watched = is_watched;
            info.generated_url = Some(generated_url);
            self.inner.transformer.set_content(
                info,
                InitialContent {
                    content,
                    original_content,
                    sourcemap,
                },
            )
        })?;

        if let Some(comment) = comment {
            if let Err(err) = self.load_sourcemap(node, started_at, &comment.specifier, comment.specifier_start, options).await {
                if matches!(err, KitchenError::Superseded { .. } | KitchenError::Aborted) {
                    return Err(err);
                }
                warn!(url = %url, specifier = %comment.specifier, error = %err, "cannot load sourcemap");
            }
        }
        Ok(())
    }

    /// Cook the map a `sourceMappingURL` comment points at and adopt it.
    async fn load_sourcemap(
        &self,
        node: NodeIndex,
        started_at: u64,
        specifier: &str,
        start: usize,
        options: &CookOptions,
    ) -> KitchenResult<()> {
        let position = self.with_graph(|g| {
            g.url_info(node)
                .original_content()
                .and_then(Content::as_text)
                .map(|text| {
                    crate::graph::reference::SpecifierPosition::in_content(text, start, start + specifier.len())
                })
        });
        let mut init = ReferenceInit::new(ReferenceKind::SourcemapComment, specifier)
            .expect_type(UrlType::Sourcemap)
            .weak();
        init.position = position;
        let handle = self.found_reference(node, init)?;
        self.cook(
            handle.target,
            CookOptions {
                direct_request: false,
                operation: options.operation.clone(),
            },
        )
        .await?;
        let (map_url, json) = self.with_graph(|g| {
            let info = g.url_info(handle.target);
            (info.url().to_owned(), info.content_text().map(str::to_owned))
        });
        let Some(json) = json else {
            return Ok(());
        };
        let map = sourcemap_from_json(&json).map_err(|err| KitchenError::FetchUrlContent {
            kind: FetchErrorKind::ParseError,
            url: map_url.clone(),
            trace: Trace::from_url(&map_url),
            reason: format!("invalid sourcemap: {err:#}"),
        })?;
        let sources_content = self.inner.context.sourcemaps_sources_content;
        self.with_node(node, started_at, |g| {
            g.url_info_mut(node).sourcemap = Some(normalize_sourcemap(map, &map_url, sources_content));
        })
    }

    /// Where cooked content of `url` would be written in the out directory.
    fn generated_url_for(&self, url: &str) -> String {
        let context = &self.inner.context;
        let Some(out) = &context.out_directory_url else {
            return url.to_owned();
        };
        let root = context.root_directory_url.as_str();
        match url.strip_prefix(root) {
            Some(relative) if url.starts_with("file:") => out
                .join(relative)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| url.to_owned()),
            _ => url.to_owned(),
        }
    }

    // -----------------------------------------------------------------------
    // Transform / optimize
    // -----------------------------------------------------------------------

    #[instrument(level = "debug", skip_all, fields(node = node.index()))]
    async fn transform_url_content(&self, node: NodeIndex, started_at: u64, options: &CookOptions) -> KitchenResult<()> {
        self.run_content_hooks(node, started_at, options, select::transform_url_content)
            .await
    }

    #[instrument(level = "debug", skip_all, fields(node = node.index()))]
    async fn optimize_url_content(&self, node: NodeIndex, started_at: u64, options: &CookOptions) -> KitchenResult<()> {
        self.run_content_hooks(node, started_at, options, select::optimize_url_content)
            .await
    }

    /// Every matching hook runs, in registration order; each patch is applied at once.
    async fn run_content_hooks(
        &self,
        node: NodeIndex,
        started_at: u64,
        options: &CookOptions,
        select: fn(&crate::plugin::Plugin) -> Option<&crate::plugin::Hook<crate::plugin::ContentHook<ContentPatch>>>,
    ) -> KitchenResult<()> {
        let hooks = self.with_graph(|g| self.inner.plugins.content_hooks(select, g.url_info(node)));
        for (plugin, hook) in hooks {
            let input = self.hook_input(node, options);
            let patch = options
                .operation
                .run(async { hook(input).await.map_err(|err| self.transform_error(node, &plugin, err)) })
                .await?;
            if let Some(patch) = patch {
                self.with_node(node, started_at, |g| {
                    self.inner.transformer.apply_transformations(g.url_info_mut(node), patch);
                })?;
            }
        }
        Ok(())
    }

    fn transform_error(&self, node: NodeIndex, plugin: &str, err: anyhow::Error) -> KitchenError {
        if let Some(kitchen_error) = err.downcast_ref::<KitchenError>() {
            return kitchen_error.clone();
        }
        self.with_graph(|g| {
            let info = g.url_info(node);
            let url = info.url().to_owned();
            let Some(parse) = err.downcast_ref::<ParseError>() else {
                let trace = info
                    .first_reference
                    .and_then(|id| g.reference(id))
                    .map(|r| r.trace.clone())
                    .unwrap_or_else(|| Trace::from_url(&url));
                return KitchenError::TransformUrlContent {
                    plugin: plugin.to_owned(),
                    url,
                    trace,
                    reason: format!("{err:#}"),
                    parse: None,
                };
            };
            // Point at the file the content really lives in.
            let (trace, parse) = match &info.inline_url_site {
                Some(site) => {
                    let shifted = parse.offset_by(site.line, site.column);
                    let host_text = g
                        .get_url_info(&site.url)
                        .and_then(|host| g.url_info(host).original_content())
                        .and_then(Content::as_text);
                    (
                        Trace::at(&site.url, shifted.line, shifted.column, host_text),
                        shifted,
                    )
                }
                None => (
                    Trace::at(&url, parse.line, parse.column, info.content_text()),
                    parse.clone(),
                ),
            };
            KitchenError::TransformUrlContent {
                plugin: plugin.to_owned(),
                url,
                trace,
                reason: parse.message.clone(),
                parse: Some(parse),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    #[instrument(level = "debug", skip_all, fields(node = node.index()))]
    async fn finalize_url_content(&self, node: NodeIndex, started_at: u64, options: &CookOptions) -> KitchenResult<()> {
        let callbacks = self
            .inner
            .content_callbacks
            .lock()
            .remove(&node)
            .unwrap_or_default();
        for callback in callbacks {
            let patch = self
                .with_node(node, started_at, |g| callback(g.url_info(node)))?
                .map_err(|err| self.finalize_error(node, "content_transformation_callback", err))?;
            if let Some(patch) = patch {
                self.with_node(node, started_at, |g| {
                    self.inner.transformer.apply_transformations(g.url_info_mut(node), patch);
                })?;
            }
        }

        let hooks = self.with_graph(|g| {
            self.inner
                .plugins
                .content_hooks(select::finalize_url_content, g.url_info(node))
        });
        for (plugin, hook) in hooks {
            let input = self.hook_input(node, options);
            let patch = options
                .operation
                .run(async { hook(input).await.map_err(|err| self.finalize_error(node, &plugin, err)) })
                .await?;
            if let Some(patch) = patch {
                self.with_node(node, started_at, |g| {
                    self.inner.transformer.apply_transformations(g.url_info_mut(node), patch);
                })?;
                break;
            }
        }

        let output = self
            .with_node(node, started_at, |g| {
                self.inner.transformer.end_transformations(g.url_info_mut(node))
            })?
            .map_err(|err| self.finalize_error(node, "sourcemaps", err))?;
        if let SourcemapOutput::File { json } = output {
            self.write_sourcemap_file(node, started_at, json)?;
        }
        self.with_node(node, started_at, |g| {
            g.url_info_mut(node).content_finalized = true;
        })?;

        if self.inner.context.out_directory_url.is_some() && !options.operation.is_aborted() {
            self.write_out_file(node).await;
        }
        Ok(())
    }

    fn finalize_error(&self, node: NodeIndex, plugin: &str, err: anyhow::Error) -> KitchenError {
        if let Some(kitchen_error) = err.downcast_ref::<KitchenError>() {
            return kitchen_error.clone();
        }
        let url = self.with_graph(|g| g.url_info(node).url().to_owned());
        KitchenError::FinalizeUrlContent {
            plugin: plugin.to_owned(),
            trace: Trace::from_url(&url),
            url,
            reason: format!("{err:#}"),
        }
    }

    /// Put the map next to the file as its own node and point the content at it.
    fn write_sourcemap_file(&self, node: NodeIndex, started_at: u64, json: String) -> KitchenResult<()> {
        let (owner_url, map_url) = self.with_graph(|g| {
            let info = g.url_info(node);
            let owner_url = info
                .generated_url
                .clone()
                .unwrap_or_else(|| info.url().to_owned());
            let base = crate::url_meta::strip_search_and_hash(&owner_url).to_owned();
            (owner_url, format!("{base}.map"))
        });
        let handle = self.inject_reference(
            node,
            ReferenceInit::new(ReferenceKind::SourcemapComment, map_url.clone())
                .expect_type(UrlType::Sourcemap),
        )?;
        let map = sourcemap_from_json(&json)
            .map(|map| relativize_sources(map, &map_url))
            .and_then(|map| sourcemap_to_json(&map))
            .map_err(|err| self.finalize_error(node, "sourcemaps", err))?;
        let specifier = match (Url::parse(&owner_url), Url::parse(&handle.url)) {
            (Ok(owner), Ok(target)) => owner
                .make_relative(&target)
                .unwrap_or_else(|| handle.url.clone()),
            _ => handle.url.clone(),
        };
        self.with_node(node, started_at, |g| {
            let map_info = g.url_info_mut(handle.target);
            map_info.kitchen_generated = true;
            map_info.url_type = Some(UrlType::Sourcemap);
            map_info.content_type = Some("application/json".to_owned());
            map_info.set_original_content(Content::Text(map.clone()));
            map_info.set_content(Content::Text(map));
            map_info.content_finalized = true;
            map_info.cooked_timestamp = Some(map_info.modified_timestamp);
            self.inner
                .transformer
                .link_sourcemap_file(g.url_info_mut(node), &specifier);
        })
    }

    async fn write_out_file(&self, node: NodeIndex) {
        let (path, content) = self.with_graph(|g| {
            let info = g.url_info(node);
            let path = info
                .generated_url
                .as_deref()
                .filter(|u| *u != info.url())
                .and_then(|u| Url::parse(u).ok())
                .and_then(|u| u.to_file_path().ok());
            (path, info.content().map(|c| c.as_bytes().to_vec()))
        });
        let (Some(path), Some(content)) = (path, content) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %err, "cannot create out directory");
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&path, content).await {
            warn!(path = %path.display(), error = %err, "cannot write out file");
        }
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Cook everything `node` strongly depends on, level by level in parallel, then run
    /// the queued last transformation callbacks once.
    pub fn cook_dependencies(
        &self,
        node: NodeIndex,
        options: CookDependenciesOptions,
    ) -> BoxFuture<'static, KitchenResult<()>> {
        let kitchen = self.clone();
        async move {
            let seen = Arc::new(Mutex::new(HashSet::from([node])));
            kitchen.cook_dependencies_of(node, seen, options).await?;
            let callbacks = std::mem::take(&mut *kitchen.inner.last_callbacks.lock());
            for callback in callbacks {
                callback().await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn cook_dependencies_of(
        &self,
        node: NodeIndex,
        seen: Arc<Mutex<HashSet<NodeIndex>>>,
        options: CookDependenciesOptions,
    ) -> BoxFuture<'static, KitchenResult<()>> {
        let targets: Vec<NodeIndex> = self.with_graph(|g| {
            g.references_to_others(node)
                .into_iter()
                .filter_map(|id| g.reference(id))
                .filter(|r| {
                    !r.is_weak
                        && !r.is_implicit
                        && r.kind != ReferenceKind::SourcemapComment
                        && !(options.ignore_dynamic_import && r.is_dynamic)
                })
                .filter_map(|r| r.target())
                .collect()
        });
        let fresh: Vec<NodeIndex> = {
            let mut seen = seen.lock();
            targets.into_iter().filter(|t| seen.insert(*t)).collect()
        };
        let kitchen = self.clone();
        async move {
            let cooks = fresh.into_iter().map(|target| {
                let kitchen = kitchen.clone();
                let seen = seen.clone();
                let options = options.clone();
                async move {
                    kitchen
                        .cook(
                            target,
                            CookOptions {
                                direct_request: false,
                                operation: options.operation.clone(),
                            },
                        )
                        .await?;
                    kitchen.cook_dependencies_of(target, seen, options).await
                }
            });
            future::try_join_all(cooks).await?;
            Ok(())
        }
        .boxed()
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    /// The source of `url` changed: bump the modification timestamp of every node whose
    /// cooked content depends on it. Returns the invalidated urls.
    pub fn url_info_modified(&self, url: &str) -> Vec<String> {
        let invalidated: Vec<(NodeIndex, String)> = self.with_graph(|g| {
            let Some(node) = g.get_url_info(url) else {
                return Vec::new();
            };
            let set = g.invalidation_set(node);
            let now = g.tick();
            set.into_iter()
                .map(|n| {
                    let info = g.url_info_mut(n);
                    info.modified_timestamp = now;
                    (n, info.url().to_owned())
                })
                .collect()
        });
        let mut cooks = self.inner.cooks.lock();
        for (node, _) in &invalidated {
            cooks.remove(node);
        }
        debug!(url = %url, count = invalidated.len(), "url modified");
        invalidated.into_iter().map(|(_, u)| u).collect()
    }

    /// The file behind `url` is gone; the next cook reports it as not found.
    pub fn url_info_deleted(&self, url: &str) -> Vec<String> {
        self.url_info_modified(url)
    }
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Map what a fetch hook threw onto the fetch error taxonomy.
fn map_fetch_error(
    err: anyhow::Error,
    fetch_error: &impl Fn(FetchErrorKind, String) -> KitchenError,
) -> KitchenError {
    if let Some(kitchen_error) = err.downcast_ref::<KitchenError>() {
        return kitchen_error.clone();
    }
    if let Some(failure) = err.downcast_ref::<FetchFailure>() {
        return fetch_error(failure.kind, failure.reason.clone());
    }
    if let Some(parse) = err.downcast_ref::<ParseError>() {
        return fetch_error(FetchErrorKind::ParseError, parse.to_string());
    }
    if let Some(io_error) = err.downcast_ref::<io::Error>() {
        let kind = match io_error.kind() {
            io::ErrorKind::NotFound => FetchErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => FetchErrorKind::NotAllowed,
            io::ErrorKind::IsADirectory => FetchErrorKind::DirectoryReferenceNotAllowed,
            _ => FetchErrorKind::Failed,
        };
        return fetch_error(kind, io_error.to_string());
    }
    fetch_error(FetchErrorKind::Failed, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::reference::SpecifierPosition;
    use crate::plugin::Plugin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> KitchenContext {
        KitchenContext::for_tests("file:///app/")
    }

    fn resolver() -> Plugin {
        Plugin::new("join").on_resolve_reference(|r, ctx| {
            let owner = ctx.owner(r);
            let base = if owner.is_root {
                ctx.context.root_directory_url.clone()
            } else {
                Url::parse(owner.url())?
            };
            Ok(Some(base.join(&r.specifier)?.to_string()))
        })
    }

    /// Fetches from a fixed table of `url -> (content, content type)`.
    fn memory(files: &[(&str, &str, &str)], fetches: Arc<AtomicUsize>) -> Plugin {
        let files: HashMap<String, (String, String)> = files
            .iter()
            .map(|(u, c, t)| (u.to_string(), (c.to_string(), t.to_string())))
            .collect();
        Plugin::new("memory").on_fetch_url_content(move |input| {
            let found = files.get(input.url()).cloned();
            let fetches = fetches.clone();
            async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                match found {
                    Some((content, content_type)) => Ok(Some(FetchResult::new(content, content_type))),
                    None => Err(FetchFailure::new(FetchErrorKind::NotFound, "no such file").into()),
                }
            }
        })
    }

    /// Treats each `import "x"` line as a js import.
    fn imports() -> Plugin {
        Plugin::new("imports").on_transform_url_content_for("js_module", |input| async move {
            let text = input.content_text()?.to_owned();
            let mut offset = 0;
            for line in text.split_inclusive('\n') {
                if let Some(rest) = line.strip_prefix("import \"") {
                    let specifier = rest.split('"').next().unwrap_or_default();
                    let start = offset + "import ".len();
                    input.kitchen.found_reference(
                        input.node,
                        ReferenceInit::new(ReferenceKind::JsImport, specifier)
                            .at(SpecifierPosition::in_content(&text, start, start + specifier.len() + 2)),
                    )?;
                }
                offset += line.len();
            }
            Ok(None)
        })
    }

    async fn cook_entry(kitchen: &Kitchen, specifier: &str) -> KitchenResult<NodeIndex> {
        let entry = kitchen.prepare_entry_point(specifier)?;
        kitchen.cook(entry.target, CookOptions::default()).await?;
        Ok(entry.target)
    }

    #[tokio::test]
    async fn test_cook_runs_every_transform_in_order() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let upper = Plugin::new("upper").on_transform_url_content(|input| async move {
            Ok(Some(ContentPatch::content(input.content_text()?.to_uppercase())))
        });
        let suffix = Plugin::new("suffix").on_transform_url_content(|input| async move {
            Ok(Some(ContentPatch::content(format!("{}!", input.content_text()?))))
        });
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(&[("file:///app/a.txt", "hello", "text/plain")], fetches),
                upper,
                suffix,
            ],
        )
        .unwrap();
        let node = cook_entry(&kitchen, "./a.txt").await.unwrap();
        let info = kitchen.url_info(node);
        assert_eq!(info.content_text(), Some("HELLO!"));
        assert_eq!(info.original_content().and_then(|c| c.as_text()), Some("hello"));
        assert!(info.content_finalized);
        assert_eq!(info.url_type, Some(UrlType::Text));
    }

    #[tokio::test]
    async fn test_concurrent_cooks_share_one_fetch() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(&[("file:///app/a.js", "a()", "text/javascript")], fetches.clone()),
            ],
        )
        .unwrap();
        let entry = kitchen.prepare_entry_point("./a.js").unwrap();
        let (a, b) = tokio::join!(
            kitchen.cook(entry.target, CookOptions::default()),
            kitchen.cook(entry.target, CookOptions::default())
        );
        a.unwrap();
        b.unwrap();
        kitchen.cook(entry.target, CookOptions::default()).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1, "memoized until modified");

        let invalidated = kitchen.url_info_modified("file:///app/a.js");
        assert_eq!(invalidated, vec!["file:///app/a.js".to_owned()]);
        kitchen.cook(entry.target, CookOptions::default()).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2, "modification triggers a new cook");
    }

    #[tokio::test]
    async fn test_integrity_mismatch_fails_before_transform() {
        let transformed = Arc::new(AtomicUsize::new(0));
        let counter = transformed.clone();
        let spy = Plugin::new("spy").on_transform_url_content(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        });
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(&[("file:///app/a.js", "a()", "text/javascript")], Arc::new(AtomicUsize::new(0))),
                spy,
            ],
        )
        .unwrap();
        let root = kitchen.with_graph(|g| g.root());
        let handle = kitchen
            .inject_reference(
                root,
                ReferenceInit::new(ReferenceKind::Script, "./a.js").integrity("sha384-bad"),
            )
            .unwrap();
        let err = kitchen.cook(handle.target, CookOptions::default()).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::IntegrityMismatch));
        assert_eq!(transformed.load(Ordering::SeqCst), 0, "transform never ran");
    }

    #[tokio::test]
    async fn test_unexpected_type_and_missing_handler() {
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(&[("file:///app/a.css", "a {}", "text/css")], Arc::new(AtomicUsize::new(0))),
            ],
        )
        .unwrap();
        let root = kitchen.with_graph(|g| g.root());
        let handle = kitchen
            .inject_reference(
                root,
                ReferenceInit::new(ReferenceKind::Script, "./a.css").expect_type(UrlType::JsModule),
            )
            .unwrap();
        let err = kitchen.cook(handle.target, CookOptions::default()).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::UnexpectedType));

        let bare = Kitchen::new(context(), vec![resolver()]).unwrap();
        let err = cook_entry(&bare, "./a.js").await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NoHandler));
    }

    #[tokio::test]
    async fn test_missing_file_error_is_recorded_on_node() {
        let kitchen = Kitchen::new(
            context(),
            vec![resolver(), memory(&[], Arc::new(AtomicUsize::new(0)))],
        )
        .unwrap();
        let entry = kitchen.prepare_entry_point("./missing.js").unwrap();
        let err = kitchen.cook(entry.target, CookOptions::default()).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NotFound));
        assert!(kitchen.url_info(entry.target).error.is_some());
    }

    #[tokio::test]
    async fn test_inline_parse_error_is_swallowed_unless_requested_directly() {
        let strict = Plugin::new("strict").on_transform_url_content_for("js_module", |input| async move {
            if input.content_text()?.contains("}{") {
                return Err(ParseError::new("Unexpected token", 1, 2).into());
            }
            Ok(None)
        });
        let inline = Plugin::new("inline").on_fetch_url_content(|input| async move {
            Ok(input
                .first_reference
                .and_then(|r| r.content)
                .map(|c| FetchResult::new(c, "text/javascript")))
        });
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                inline,
                memory(&[("file:///app/index.html", "<script>}{</script>", "text/html")], Arc::new(AtomicUsize::new(0))),
                strict,
            ],
        )
        .unwrap();
        let html = cook_entry(&kitchen, "./index.html").await.unwrap();
        let script = kitchen
            .found_inline_reference(
                html,
                ReferenceInit::new(ReferenceKind::Script, "./index.html@L1C8-L1C10.js")
                    .at(SpecifierPosition { start: 8, end: 10, line: 1, column: 8 })
                    .inline(Content::from("}{"), "text/javascript"),
            )
            .unwrap();
        kitchen.cook(script.target, CookOptions::default()).await.unwrap();

        let err = kitchen
            .cook(
                script.target,
                CookOptions {
                    direct_request: true,
                    ..CookOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_parse_error());
        match err {
            KitchenError::TransformUrlContent { trace, .. } => {
                assert_eq!(trace.url, "file:///app/index.html");
                assert_eq!((trace.line, trace.column), (Some(1), Some(10)));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_cook_dependencies_skips_weak_and_flushes_last_callbacks_once() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(
                    &[
                        ("file:///app/main.js", "import \"./a.js\"\nimport \"./b.js\"\n", "text/javascript"),
                        ("file:///app/a.js", "import \"./b.js\"\n", "text/javascript"),
                        ("file:///app/b.js", "import \"./a.js\"\n", "text/javascript"),
                        ("file:///app/hint.js", "", "text/javascript"),
                    ],
                    fetches.clone(),
                ),
                imports(),
            ],
        )
        .unwrap();
        let main = cook_entry(&kitchen, "./main.js").await.unwrap();
        kitchen
            .inject_reference(main, ReferenceInit::new(ReferenceKind::LinkHref, "./hint.js").resource_hint())
            .unwrap();
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = flushed.clone();
        kitchen.add_last_transformation_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(())).boxed()
        });
        kitchen
            .cook_dependencies(main, CookDependenciesOptions::default())
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 3, "main, a, b once each; hint is weak");
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        let hint = kitchen.node_for_url("file:///app/hint.js").unwrap();
        assert!(kitchen.url_info(hint).content().is_none());
        let a = kitchen.node_for_url("file:///app/a.js").unwrap();
        assert!(kitchen.url_info(a).content_finalized);
    }

    #[tokio::test]
    async fn test_recook_replaces_references() {
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(
                    &[
                        ("file:///app/main.js", "import \"./a.js\"\n", "text/javascript"),
                        ("file:///app/a.js", "", "text/javascript"),
                    ],
                    Arc::new(AtomicUsize::new(0)),
                ),
                imports(),
            ],
        )
        .unwrap();
        let main = cook_entry(&kitchen, "./main.js").await.unwrap();
        let before = kitchen.with_graph(|g| g.references_to_others(main));
        kitchen.url_info_modified("file:///app/main.js");
        kitchen.cook(main, CookOptions::default()).await.unwrap();
        let after = kitchen.with_graph(|g| g.references_to_others(main));
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
        assert_ne!(before, after, "old reference replaced by the new one");
        let a = kitchen.node_for_url("file:///app/a.js").unwrap();
        assert!(kitchen.with_graph(|g| g.is_used(a)));
    }

    #[tokio::test]
    async fn test_aborted_operation_stops_cook() {
        let kitchen = Kitchen::new(
            context(),
            vec![
                resolver(),
                memory(&[("file:///app/a.js", "a()", "text/javascript")], Arc::new(AtomicUsize::new(0))),
            ],
        )
        .unwrap();
        let entry = kitchen.prepare_entry_point("./a.js").unwrap();
        let operation = Operation::new();
        operation.abort();
        let err = kitchen
            .cook(
                entry.target,
                CookOptions {
                    direct_request: false,
                    operation,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KitchenError::Aborted));
        kitchen.cook(entry.target, CookOptions::default()).await.unwrap();
        assert!(kitchen.url_info(entry.target).content_finalized, "abort does not poison later cooks");
    }

    #[tokio::test]
    async fn test_file_sourcemaps_become_generated_nodes() {
        let mut context = context();
        context.sourcemaps = SourcemapMode::File;
        let mapped = Plugin::new("mapped").on_transform_url_content_for("js_module", |input| async move {
            let map = crate::transformer::sourcemap::tests::identity_map(input.url());
            Ok(Some(ContentPatch::content(format!("{};", input.content_text()?)).with_sourcemap(map)))
        });
        let kitchen = Kitchen::new(
            context,
            vec![
                resolver(),
                memory(&[("file:///app/a.js", "a()", "text/javascript")], Arc::new(AtomicUsize::new(0))),
                mapped,
            ],
        )
        .unwrap();
        let node = cook_entry(&kitchen, "./a.js").await.unwrap();
        let info = kitchen.url_info(node);
        assert!(info.content_text().unwrap().ends_with("//# sourceMappingURL=a.js.map\n"));
        let map = kitchen.node_for_url("file:///app/a.js.map").unwrap();
        let map = kitchen.url_info(map);
        assert!(map.kitchen_generated);
        assert!(map.content_text().unwrap().contains("\"mappings\""));
    }
}

pub mod controller;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use petgraph::stable_graph::NodeIndex;
use sourcemap::SourceMap;

use crate::dev::{DevRequest, DevResponse};
use crate::graph::UrlGraph;
use crate::graph::reference::{Reference, ReferenceId};
use crate::graph::url_info::{Content, UrlInfo, UrlType};
use crate::kitchen::{Kitchen, KitchenContext};
use crate::kitchen::operation::Operation;

pub use controller::PluginController;

/// Hook names, used in logs and contract errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    Init,
    ResolveReference,
    RedirectReference,
    TransformReferenceSearchParams,
    FormatReference,
    FetchUrlContent,
    TransformUrlContent,
    OptimizeUrlContent,
    FinalizeUrlContent,
    Bundle,
    Cooked,
    Serve,
    Destroy,
}

impl HookName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::Init => "init",
            HookName::ResolveReference => "resolveReference",
            HookName::RedirectReference => "redirectReference",
            HookName::TransformReferenceSearchParams => "transformReferenceSearchParams",
            HookName::FormatReference => "formatReference",
            HookName::FetchUrlContent => "fetchUrlContent",
            HookName::TransformUrlContent => "transformUrlContent",
            HookName::OptimizeUrlContent => "optimizeUrlContent",
            HookName::FinalizeUrlContent => "finalizeUrlContent",
            HookName::Bundle => "bundle",
            HookName::Cooked => "cooked",
            HookName::Serve => "serve",
            HookName::Destroy => "destroy",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a plugin takes part in a kitchen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AppliesDuring {
    #[default]
    Always,
    Dev,
    Build,
    /// Applies when any flag set to `true` here is also set in the kitchen context.
    Flags(BTreeMap<String, bool>),
}

impl AppliesDuring {
    pub fn matches(&self, context: &KitchenContext) -> bool {
        match self {
            AppliesDuring::Always => true,
            AppliesDuring::Dev => context.dev,
            AppliesDuring::Build => context.build,
            AppliesDuring::Flags(flags) => flags
                .iter()
                .filter(|(_, enabled)| **enabled)
                .any(|(flag, _)| context.flag(flag)),
        }
    }
}

impl From<&str> for AppliesDuring {
    fn from(value: &str) -> Self {
        match value {
            "dev" => AppliesDuring::Dev,
            "build" => AppliesDuring::Build,
            _ => AppliesDuring::Always,
        }
    }
}

/// A hook is either one function for every type or a table keyed by type, `*` as fallback.
pub enum Hook<F> {
    All(F),
    ByType(HashMap<String, F>),
}

impl<F: Clone> Clone for Hook<F> {
    fn clone(&self) -> Self {
        match self {
            Hook::All(f) => Hook::All(f.clone()),
            Hook::ByType(map) => Hook::ByType(map.clone()),
        }
    }
}

impl<F> Hook<F> {
    /// Function to call for `type_key`, falling back on `*`.
    pub fn for_type(&self, type_key: Option<&str>) -> Option<&F> {
        match self {
            Hook::All(f) => Some(f),
            Hook::ByType(map) => type_key
                .and_then(|t| map.get(t))
                .or_else(|| map.get("*")),
        }
    }

    fn insert(slot: &mut Option<Hook<F>>, type_key: &str, f: F) {
        match slot {
            Some(Hook::ByType(map)) => {
                map.insert(type_key.to_owned(), f);
            }
            _ => {
                *slot = Some(Hook::ByType(HashMap::from([(type_key.to_owned(), f)])));
            }
        }
    }
}

/// Read access handed to synchronous reference hooks.
pub struct ReferenceHookContext<'a> {
    pub context: &'a KitchenContext,
    pub graph: &'a UrlGraph,
    implicit_urls: std::cell::RefCell<Vec<String>>,
}

impl<'a> ReferenceHookContext<'a> {
    pub fn new(context: &'a KitchenContext, graph: &'a UrlGraph) -> Self {
        Self {
            context,
            graph,
            implicit_urls: std::cell::RefCell::new(Vec::new()),
        }
    }

    pub fn owner(&self, reference: &Reference) -> &UrlInfo {
        self.graph.url_info(reference.owner)
    }

    pub fn target(&self, reference: &Reference) -> Option<&UrlInfo> {
        reference.target().map(|t| self.graph.url_info(t))
    }

    /// Record that the reference's owner implicitly depends on `url`.
    pub fn add_implicit_url(&self, url: impl Into<String>) {
        self.implicit_urls.borrow_mut().push(url.into());
    }

    pub(crate) fn take_implicit_urls(&self) -> Vec<String> {
        std::mem::take(&mut *self.implicit_urls.borrow_mut())
    }
}

/// Search params to set (`Some`) or remove (`None`) on a generated url.
pub type SearchParamsPatch = BTreeMap<String, Option<String>>;

pub type ReferenceHook<T> =
    Arc<dyn Fn(&Reference, &ReferenceHookContext<'_>) -> anyhow::Result<Option<T>> + Send + Sync>;

/// Snapshot handed to asynchronous content hooks.
#[derive(Clone)]
pub struct HookInput {
    pub kitchen: Kitchen,
    pub node: NodeIndex,
    pub url_info: UrlInfo,
    pub first_reference: Option<Reference>,
    pub direct_request: bool,
    pub operation: Operation,
}

impl HookInput {
    pub fn url(&self) -> &str {
        self.url_info.url()
    }

    pub fn content_text(&self) -> anyhow::Result<&str> {
        self.url_info
            .content_text()
            .ok_or_else(|| anyhow::anyhow!("{} has no text content", self.url_info.url()))
    }

    pub fn reference_id(&self) -> Option<ReferenceId> {
        self.first_reference.as_ref().map(|r| r.id)
    }
}

pub type ContentHook<T> =
    Arc<dyn Fn(HookInput) -> BoxFuture<'static, anyhow::Result<Option<T>>> + Send + Sync>;

/// Result of a fetch hook.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub content: Option<Content>,
    pub content_type: Option<String>,
    pub url_type: Option<UrlType>,
    pub subtype: Option<String>,
    pub original_url: Option<String>,
    pub original_content: Option<Content>,
    pub sourcemap: Option<SourceMap>,
    /// HTTP-like status; `None` means 200.
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub is_entry_point: Option<bool>,
    pub filename_hint: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl FetchResult {
    pub fn new(content: impl Into<Content>, content_type: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, url_type: UrlType) -> Self {
        self.url_type = Some(url_type);
        self
    }

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }
}

/// Result of transform, optimize and finalize hooks.
#[derive(Debug, Clone, Default)]
pub struct ContentPatch {
    pub content: Option<Content>,
    pub content_type: Option<String>,
    pub url_type: Option<UrlType>,
    /// Maps the new content to the content the hook received.
    pub sourcemap: Option<SourceMap>,
    /// Content changed without moving any existing mapping (appended lines, same-width edits).
    pub keeps_positions: bool,
}

impl ContentPatch {
    pub fn content(content: impl Into<Content>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_sourcemap(mut self, sourcemap: SourceMap) -> Self {
        self.sourcemap = Some(sourcemap);
        self
    }

    pub fn keeping_positions(mut self) -> Self {
        self.keeps_positions = true;
        self
    }
}

/// One file produced by a bundler.
#[derive(Debug, Clone, Default)]
pub struct BundleResult {
    pub content: String,
    pub content_type: String,
    pub url_type: Option<UrlType>,
    pub sourcemap: Option<SourceMap>,
    /// Urls whose content now lives in this bundle; references to them are redirected.
    pub source_urls: Vec<String>,
    /// Bundle is a chunk shared by several entries rather than an entry of its own.
    pub is_shared_chunk: bool,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Bundle url -> bundle, in emission order.
pub type BundleOutput = indexmap::IndexMap<String, BundleResult>;

pub type BundleHook =
    Arc<dyn Fn(Vec<UrlInfo>, Kitchen) -> BoxFuture<'static, anyhow::Result<BundleOutput>> + Send + Sync>;

pub type ServeHook = Arc<
    dyn Fn(DevRequest, Kitchen) -> BoxFuture<'static, anyhow::Result<Option<DevResponse>>> + Send + Sync,
>;

pub type CookedHook = Arc<dyn Fn(&UrlInfo, &KitchenContext) + Send + Sync>;

pub type DestroyFn = Arc<dyn Fn() + Send + Sync>;

/// What `init` decides about its plugin.
pub enum InitOutcome {
    Keep,
    /// Drop the plugin for this kitchen.
    Veto,
    KeepWithDestroy(DestroyFn),
}

pub type InitHook = Arc<dyn Fn(&KitchenContext) -> anyhow::Result<InitOutcome> + Send + Sync>;

/// A named set of optional hooks.
#[derive(Clone, Default)]
pub struct Plugin {
    pub name: String,
    pub applies_during: AppliesDuring,
    pub init: Option<InitHook>,
    pub destroy: Option<DestroyFn>,
    pub resolve_reference: Option<Hook<ReferenceHook<String>>>,
    pub redirect_reference: Option<Hook<ReferenceHook<String>>>,
    pub transform_reference_search_params: Option<Hook<ReferenceHook<SearchParamsPatch>>>,
    pub format_reference: Option<Hook<ReferenceHook<String>>>,
    pub fetch_url_content: Option<Hook<ContentHook<FetchResult>>>,
    pub transform_url_content: Option<Hook<ContentHook<ContentPatch>>>,
    pub optimize_url_content: Option<Hook<ContentHook<ContentPatch>>>,
    pub finalize_url_content: Option<Hook<ContentHook<ContentPatch>>>,
    pub bundle: Option<Hook<BundleHook>>,
    pub cooked: Option<Hook<CookedHook>>,
    pub serve: Option<ServeHook>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("applies_during", &self.applies_during)
            .finish_non_exhaustive()
    }
}

fn boxed<F, Fut, T>(f: F) -> ContentHook<T>
where
    F: Fn(HookInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    T: 'static,
{
    Arc::new(move |input| f(input).boxed())
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn applies_during(mut self, applies: impl Into<AppliesDuring>) -> Self {
        self.applies_during = applies.into();
        self
    }

    pub fn on_init(
        mut self,
        f: impl Fn(&KitchenContext) -> anyhow::Result<InitOutcome> + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Arc::new(f));
        self
    }

    pub fn on_destroy(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.destroy = Some(Arc::new(f));
        self
    }

    pub fn on_resolve_reference(
        mut self,
        f: impl Fn(&Reference, &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.resolve_reference = Some(Hook::All(Arc::new(f)));
        self
    }

    /// Resolve hook restricted to one reference kind (`js_import`, `css_url`, ...).
    pub fn on_resolve_reference_for(
        mut self,
        kind: &str,
        f: impl Fn(&Reference, &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let hook: ReferenceHook<String> = Arc::new(f);
        Hook::insert(&mut self.resolve_reference, kind, hook);
        self
    }

    pub fn on_redirect_reference(
        mut self,
        f: impl Fn(&Reference, &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.redirect_reference = Some(Hook::All(Arc::new(f)));
        self
    }

    pub fn on_transform_reference_search_params(
        mut self,
        f: impl Fn(&Reference, &ReferenceHookContext<'_>) -> anyhow::Result<Option<SearchParamsPatch>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.transform_reference_search_params = Some(Hook::All(Arc::new(f)));
        self
    }

    pub fn on_format_reference(
        mut self,
        f: impl Fn(&Reference, &ReferenceHookContext<'_>) -> anyhow::Result<Option<String>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.format_reference = Some(Hook::All(Arc::new(f)));
        self
    }

    pub fn on_fetch_url_content<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<FetchResult>>> + Send + 'static,
    {
        self.fetch_url_content = Some(Hook::All(boxed(f)));
        self
    }

    pub fn on_transform_url_content<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<ContentPatch>>> + Send + 'static,
    {
        self.transform_url_content = Some(Hook::All(boxed(f)));
        self
    }

    /// Transform hook for one url type (`html`, `css`, `js_module`, ... or `*`).
    pub fn on_transform_url_content_for<F, Fut>(mut self, url_type: &str, f: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<ContentPatch>>> + Send + 'static,
    {
        Hook::insert(&mut self.transform_url_content, url_type, boxed(f));
        self
    }

    pub fn on_optimize_url_content_for<F, Fut>(mut self, url_type: &str, f: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<ContentPatch>>> + Send + 'static,
    {
        Hook::insert(&mut self.optimize_url_content, url_type, boxed(f));
        self
    }

    pub fn on_finalize_url_content<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<ContentPatch>>> + Send + 'static,
    {
        self.finalize_url_content = Some(Hook::All(boxed(f)));
        self
    }

    pub fn on_bundle<F, Fut>(mut self, url_type: &str, f: F) -> Self
    where
        F: Fn(Vec<UrlInfo>, Kitchen) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<BundleOutput>> + Send + 'static,
    {
        let hook: BundleHook = Arc::new(move |infos, kitchen| f(infos, kitchen).boxed());
        Hook::insert(&mut self.bundle, url_type, hook);
        self
    }

    pub fn on_cooked(mut self, f: impl Fn(&UrlInfo, &KitchenContext) + Send + Sync + 'static) -> Self {
        self.cooked = Some(Hook::All(Arc::new(f)));
        self
    }

    pub fn on_serve<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DevRequest, Kitchen) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<DevResponse>>> + Send + 'static,
    {
        self.serve = Some(Arc::new(move |request, kitchen| f(request, kitchen).boxed()));
        self
    }
}

/// Plugins as users pass them: single plugins and nested lists, flattened at registration.
pub enum PluginSpec {
    One(Plugin),
    Many(Vec<PluginSpec>),
}

impl PluginSpec {
    pub fn flatten(self) -> Vec<Plugin> {
        match self {
            PluginSpec::One(p) => vec![p],
            PluginSpec::Many(specs) => specs.into_iter().flat_map(PluginSpec::flatten).collect(),
        }
    }
}

impl From<Plugin> for PluginSpec {
    fn from(value: Plugin) -> Self {
        PluginSpec::One(value)
    }
}

impl From<Vec<Plugin>> for PluginSpec {
    fn from(value: Vec<Plugin>) -> Self {
        PluginSpec::Many(value.into_iter().map(PluginSpec::One).collect())
    }
}

impl From<Vec<PluginSpec>> for PluginSpec {
    fn from(value: Vec<PluginSpec>) -> Self {
        PluginSpec::Many(value)
    }
}

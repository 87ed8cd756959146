use tracing::debug;

use super::{
    AppliesDuring, BundleHook, ContentHook, ContentPatch, CookedHook, DestroyFn, FetchResult,
    Hook, HookName, InitOutcome, Plugin, PluginSpec, ReferenceHook, ReferenceHookContext,
    SearchParamsPatch, ServeHook,
};
use crate::error::KitchenError;
use crate::graph::reference::Reference;
use crate::graph::url_info::UrlInfo;
use crate::kitchen::KitchenContext;

/// A hook threw. Carries the plugin name so callers can attribute the failure.
#[derive(Debug)]
pub struct HookError {
    pub plugin: String,
    pub hook: HookName,
    pub error: anyhow::Error,
}

impl HookError {
    /// The error as a kitchen error when the hook raised one itself.
    pub fn kitchen_error(&self) -> Option<&KitchenError> {
        self.error.downcast_ref::<KitchenError>()
    }
}

struct RegisteredPlugin {
    plugin: Plugin,
    destroy: Vec<DestroyFn>,
}

/// Ordered plugin registry with per-hook dispatch.
///
/// Hooks run in registration order. Typed hook tables are resolved against the
/// reference kind (reference hooks) or the url type (content hooks), `*` as fallback.
pub struct PluginController {
    context: KitchenContext,
    plugins: Vec<RegisteredPlugin>,
}

impl PluginController {
    pub fn new(context: KitchenContext, plugins: impl Into<PluginSpec>) -> anyhow::Result<Self> {
        let mut controller = Self {
            context,
            plugins: Vec::new(),
        };
        controller.push_plugin(plugins)?;
        Ok(controller)
    }

    /// Append plugins after the already registered ones.
    pub fn push_plugin(&mut self, plugins: impl Into<PluginSpec>) -> anyhow::Result<()> {
        for plugin in plugins.into().flatten() {
            if let Some(registered) = self.prepare(plugin)? {
                self.plugins.push(registered);
            }
        }
        Ok(())
    }

    /// Insert plugins before the already registered ones, keeping their relative order.
    pub fn unshift_plugin(&mut self, plugins: impl Into<PluginSpec>) -> anyhow::Result<()> {
        let mut prepared = Vec::new();
        for plugin in plugins.into().flatten() {
            if let Some(registered) = self.prepare(plugin)? {
                prepared.push(registered);
            }
        }
        prepared.append(&mut self.plugins);
        self.plugins = prepared;
        Ok(())
    }

    /// Apply `applies_during` and `init`; `None` means the plugin sits out this kitchen.
    fn prepare(&self, plugin: Plugin) -> anyhow::Result<Option<RegisteredPlugin>> {
        if !plugin.applies_during.matches(&self.context) {
            debug!(plugin = %plugin.name, applies_during = %plugin.applies_during.describe(), "plugin does not apply");
            if let Some(destroy) = &plugin.destroy {
                destroy();
            }
            return Ok(None);
        }
        let mut destroy: Vec<DestroyFn> = plugin.destroy.iter().cloned().collect();
        if let Some(init) = &plugin.init {
            match init(&self.context)
                .map_err(|err| anyhow::anyhow!("plugin \"{}\" init failed: {err:#}", plugin.name))?
            {
                InitOutcome::Keep => {}
                InitOutcome::Veto => {
                    debug!(plugin = %plugin.name, "plugin vetoed by init");
                    for f in &destroy {
                        f();
                    }
                    return Ok(None);
                }
                InitOutcome::KeepWithDestroy(f) => destroy.push(f),
            }
        }
        Ok(Some(RegisteredPlugin { plugin, destroy }))
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.plugin.name.as_str()).collect()
    }

    pub fn context(&self) -> &KitchenContext {
        &self.context
    }

    /// Functions registered for `select`, resolved for `type_key`, in call order.
    fn hooks<F: Clone + 'static>(
        &self,
        select: fn(&Plugin) -> Option<&Hook<F>>,
        type_key: Option<&str>,
    ) -> Vec<(String, F)> {
        self.plugins
            .iter()
            .filter_map(|p| {
                select(&p.plugin)
                    .and_then(|hook| hook.for_type(type_key))
                    .map(|f| (p.plugin.name.clone(), f.clone()))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Reference hooks
    // -----------------------------------------------------------------------

    /// Reference hooks applying to `reference`'s kind.
    pub fn reference_hooks<T: 'static>(
        &self,
        select: fn(&Plugin) -> Option<&Hook<ReferenceHook<T>>>,
        reference: &Reference,
    ) -> Vec<(String, ReferenceHook<T>)> {
        self.hooks(select, Some(reference.kind.as_str()))
    }

    /// callHooksUntil: first hook returning a value wins.
    pub fn call_reference_hooks_until<T: 'static>(
        &self,
        hook: HookName,
        select: fn(&Plugin) -> Option<&Hook<ReferenceHook<T>>>,
        reference: &Reference,
        context: &ReferenceHookContext<'_>,
    ) -> Result<Option<(String, T)>, HookError> {
        for (plugin, f) in self.reference_hooks(select, reference) {
            match f(reference, context) {
                Ok(Some(value)) => return Ok(Some((plugin, value))),
                Ok(None) => {}
                Err(error) => {
                    return Err(HookError {
                        plugin,
                        hook,
                        error,
                    });
                }
            }
        }
        Ok(None)
    }

    /// callHooks: every hook runs, each result is handed to `each`.
    pub fn call_reference_hooks<T: 'static>(
        &self,
        hook: HookName,
        select: fn(&Plugin) -> Option<&Hook<ReferenceHook<T>>>,
        reference: &Reference,
        context: &ReferenceHookContext<'_>,
        mut each: impl FnMut(&str, T),
    ) -> Result<(), HookError> {
        for (plugin, f) in self.reference_hooks(select, reference) {
            match f(reference, context) {
                Ok(Some(value)) => each(&plugin, value),
                Ok(None) => {}
                Err(error) => {
                    return Err(HookError {
                        plugin,
                        hook,
                        error,
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve through the first plugin that claims the reference.
    ///
    /// A returned value must be an absolute url.
    pub fn resolve_reference(
        &self,
        reference: &Reference,
        context: &ReferenceHookContext<'_>,
    ) -> Result<Option<(String, String)>, HookError> {
        let found = self.call_reference_hooks_until(
            HookName::ResolveReference,
            select::resolve_reference,
            reference,
            context,
        )?;
        match found {
            Some((plugin, url)) => {
                if url::Url::parse(&url).is_err() {
                    let message = format!("returned {url:?} for \"{}\", expected an absolute url", reference.specifier);
                    return Err(HookError {
                        plugin: plugin.clone(),
                        hook: HookName::ResolveReference,
                        error: KitchenError::PluginContract {
                            plugin,
                            hook: HookName::ResolveReference.as_str(),
                            message,
                        }
                        .into(),
                    });
                }
                Ok(Some((plugin, url)))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Content hooks
    // -----------------------------------------------------------------------

    pub fn content_hooks<T: 'static>(
        &self,
        select: fn(&Plugin) -> Option<&Hook<ContentHook<T>>>,
        url_info: &UrlInfo,
    ) -> Vec<(String, ContentHook<T>)> {
        self.hooks(select, url_info.url_type.map(|t| t.as_str()))
    }

    /// Bundlers keyed by the url type they bundle.
    pub fn bundle_hooks(&self) -> Vec<(String, String, BundleHook)> {
        let mut out = Vec::new();
        for p in &self.plugins {
            match &p.plugin.bundle {
                Some(Hook::All(f)) => out.push((p.plugin.name.clone(), "*".to_owned(), f.clone())),
                Some(Hook::ByType(map)) => {
                    let mut types: Vec<&String> = map.keys().collect();
                    types.sort();
                    for t in types {
                        out.push((p.plugin.name.clone(), t.clone(), map[t].clone()));
                    }
                }
                None => {}
            }
        }
        out
    }

    pub fn serve_hooks(&self) -> Vec<(String, ServeHook)> {
        self.plugins
            .iter()
            .filter_map(|p| p.plugin.serve.clone().map(|f| (p.plugin.name.clone(), f)))
            .collect()
    }

    pub fn call_cooked(&self, url_info: &UrlInfo) {
        for (_, f) in self.hooks::<CookedHook>(select::cooked, url_info.url_type.map(|t| t.as_str())) {
            f(url_info, &self.context);
        }
    }

    /// Run every destroy function once.
    pub fn destroy(&mut self) {
        for p in self.plugins.drain(..) {
            for f in p.destroy {
                f();
            }
        }
    }
}

impl Drop for PluginController {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Field accessors usable as `fn` pointers by the dispatch helpers.
pub mod select {
    use super::*;

    pub fn resolve_reference(p: &Plugin) -> Option<&Hook<ReferenceHook<String>>> {
        p.resolve_reference.as_ref()
    }

    pub fn redirect_reference(p: &Plugin) -> Option<&Hook<ReferenceHook<String>>> {
        p.redirect_reference.as_ref()
    }

    pub fn transform_reference_search_params(
        p: &Plugin,
    ) -> Option<&Hook<ReferenceHook<SearchParamsPatch>>> {
        p.transform_reference_search_params.as_ref()
    }

    pub fn format_reference(p: &Plugin) -> Option<&Hook<ReferenceHook<String>>> {
        p.format_reference.as_ref()
    }

    pub fn fetch_url_content(p: &Plugin) -> Option<&Hook<ContentHook<FetchResult>>> {
        p.fetch_url_content.as_ref()
    }

    pub fn transform_url_content(p: &Plugin) -> Option<&Hook<ContentHook<ContentPatch>>> {
        p.transform_url_content.as_ref()
    }

    pub fn optimize_url_content(p: &Plugin) -> Option<&Hook<ContentHook<ContentPatch>>> {
        p.optimize_url_content.as_ref()
    }

    pub fn finalize_url_content(p: &Plugin) -> Option<&Hook<ContentHook<ContentPatch>>> {
        p.finalize_url_content.as_ref()
    }

    pub fn cooked(p: &Plugin) -> Option<&Hook<CookedHook>> {
        p.cooked.as_ref()
    }
}

impl AppliesDuring {
    pub fn describe(&self) -> String {
        match self {
            AppliesDuring::Always => "*".to_owned(),
            AppliesDuring::Dev => "dev".to_owned(),
            AppliesDuring::Build => "build".to_owned(),
            AppliesDuring::Flags(flags) => flags
                .iter()
                .filter(|(_, v)| **v)
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

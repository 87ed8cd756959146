//! Two-pass build: a craft kitchen cooks the sources as authored, bundlers run over it,
//! then a shape kitchen re-cooks every used file under its build url.

pub mod build_info;
pub mod html;
pub mod placeholders;
pub mod runtime;
pub mod specifier_manager;
pub mod urls_generator;
pub mod versioning;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Context;
use futures::future;
use tracing::{info, instrument};
use url::Url;

use crate::graph::url_info::{UrlInfo, UrlType};
use crate::graph::visitor;
use crate::kitchen::operation::Operation;
use crate::kitchen::{BuildStep, CookDependenciesOptions, CookOptions, Kitchen, KitchenContext};
use crate::plugin::{BundleOutput, Plugin, PluginController};
use crate::plugins::{data_urls, default_plugins, inline_content, reference_analysis};
use crate::transformer::SourcemapMode;

pub use build_info::{BuildInfo, write_build_files};
pub use specifier_manager::{BuildSpecifierManager, ShapeSettings};
pub use versioning::VersioningMethod;

/// Everything one build needs.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub source_directory_url: Url,
    pub build_directory_url: Url,
    /// Specifiers relative to the source directory.
    pub entry_points: Vec<String>,
    pub base: String,
    pub assets_directory: String,
    pub versioning: bool,
    pub versioning_method: VersioningMethod,
    pub versioning_via_importmap: bool,
    pub runtime_supports_importmap: bool,
    pub sourcemaps: SourcemapMode,
    pub sourcemaps_sources_content: bool,
    pub resource_hints: bool,
    /// Service worker specifiers relative to the source directory.
    pub service_worker_entries: Vec<String>,
    /// Url patterns left untouched by the build.
    pub ignore: Vec<String>,
    pub plugins: Vec<Plugin>,
    pub operation: Operation,
}

impl BuildOptions {
    pub fn new(source_directory_url: Url, build_directory_url: Url, entry_points: Vec<String>) -> Self {
        Self {
            source_directory_url,
            build_directory_url,
            entry_points,
            base: "/".to_owned(),
            assets_directory: "assets/".to_owned(),
            versioning: true,
            versioning_method: VersioningMethod::Filename,
            versioning_via_importmap: true,
            runtime_supports_importmap: true,
            sourcemaps: SourcemapMode::None,
            sourcemaps_sources_content: true,
            resource_hints: true,
            service_worker_entries: Vec::new(),
            ignore: Vec::new(),
            plugins: Vec::new(),
            operation: Operation::new(),
        }
    }
}

fn normalized_base(base: &str) -> String {
    match base {
        "" => "/".to_owned(),
        b if b.ends_with('/') => b.to_owned(),
        b => format!("{b}/"),
    }
}

/// Cook every entry point and everything it depends on.
async fn cook_entries(kitchen: &Kitchen, entry_points: &[String], operation: &Operation) -> anyhow::Result<Vec<String>> {
    let mut urls = Vec::with_capacity(entry_points.len());
    let mut cooks = Vec::with_capacity(entry_points.len());
    for specifier in entry_points {
        let handle = kitchen
            .prepare_entry_point(specifier)
            .with_context(|| format!("cannot prepare entry point {specifier}"))?;
        urls.push(handle.url.clone());
        let kitchen = kitchen.clone();
        let operation = operation.clone();
        cooks.push(async move {
            kitchen
                .cook(
                    handle.target,
                    CookOptions {
                        direct_request: false,
                        operation: operation.clone(),
                    },
                )
                .await?;
            kitchen
                .cook_dependencies(
                    handle.target,
                    CookDependenciesOptions {
                        operation,
                        ignore_dynamic_import: false,
                    },
                )
                .await
        });
    }
    future::try_join_all(cooks).await?;
    Ok(urls)
}

/// Run the bundle hooks over the used craft files; returns the bundles and, for each
/// bundled source url, the bundle now holding its content.
#[instrument(level = "debug", skip_all)]
async fn run_bundlers(craft: &Kitchen) -> anyhow::Result<(BundleOutput, HashMap<String, String>)> {
    let mut bundles = BundleOutput::new();
    let mut redirections = HashMap::new();
    for (plugin, type_key, hook) in craft.plugins().bundle_hooks() {
        let infos: Vec<UrlInfo> = craft.with_graph(|g| {
            visitor::strongly_referenced_from_root(g)
                .into_iter()
                .map(|node| g.url_info(node))
                .filter(|info| {
                    !info.is_inline
                        && !info.is_ignored()
                        && info.url_type.is_some_and(|t| t.as_str() == type_key)
                })
                .cloned()
                .collect()
        });
        if infos.is_empty() {
            continue;
        }
        let count = infos.len();
        let output = hook(infos, craft.clone())
            .await
            .with_context(|| format!("\"bundle\" hook of plugin \"{plugin}\" failed for {type_key}"))?;
        info!(plugin = %plugin, url_type = %type_key, inputs = count, bundles = output.len(), "bundled");
        for (bundle_url, bundle) in output {
            for source_url in &bundle.source_urls {
                redirections.insert(source_url.clone(), bundle_url.clone());
            }
            bundles.insert(bundle_url, bundle);
        }
    }
    Ok((bundles, redirections))
}

/// Plugins of the shape kitchen: what re-cooking needs plus the user's optimizers.
fn shape_plugins(user_plugins: &[Plugin]) -> Vec<Plugin> {
    let mut plugins = vec![inline_content(), data_urls(), reference_analysis()];
    plugins.extend(
        user_plugins
            .iter()
            .filter(|p| p.optimize_url_content.is_some())
            .map(|p| Plugin {
                name: p.name.clone(),
                applies_during: p.applies_during.clone(),
                optimize_url_content: p.optimize_url_content.clone(),
                ..Plugin::default()
            }),
    );
    plugins
}

/// Build `options.entry_points` into build files. Nothing is written to disk; see
/// [`write_build_files`].
#[instrument(level = "debug", skip_all)]
pub async fn build(options: BuildOptions) -> anyhow::Result<BuildInfo> {
    let source = &options.source_directory_url;
    let build_directory = &options.build_directory_url;

    let mut craft_context = KitchenContext::build(source.clone(), build_directory.clone(), BuildStep::Craft);
    craft_context.sourcemaps = if options.sourcemaps.is_enabled() {
        SourcemapMode::File
    } else {
        SourcemapMode::None
    };
    craft_context.sourcemaps_sources_content = options.sourcemaps_sources_content;
    craft_context
        .associations
        .associate_flags("ignore", options.ignore.iter().map(|p| (p.as_str(), true)), source)?;
    let mut craft_plugins = options.plugins.clone();
    craft_plugins.extend(default_plugins());
    let craft = Kitchen::new(craft_context, craft_plugins)?;

    let entry_urls = cook_entries(&craft, &options.entry_points, &options.operation)
        .await
        .context("craft pass failed")?;
    info!(entries = entry_urls.len(), urls = craft.with_graph(|g| g.url_count()), "craft done");

    let (bundles, redirections) = run_bundlers(&craft).await?;

    let all_html_entries = craft.with_graph(|g| {
        entry_urls.iter().all(|url| {
            g.get_url_info(url)
                .is_some_and(|node| g.url_info(node).url_type == Some(UrlType::Html))
        })
    });
    let service_worker_urls = options
        .service_worker_entries
        .iter()
        .map(|specifier| source.join(specifier).map(|u| u.to_string()))
        .collect::<Result<BTreeSet<_>, _>>()?;
    let settings = ShapeSettings {
        base: normalized_base(&options.base),
        versioning: options.versioning,
        versioning_method: options.versioning_method,
        importmap: options.versioning_via_importmap && options.runtime_supports_importmap && all_html_entries,
        resource_hints: options.resource_hints,
        service_worker_urls,
    };
    let manager = Arc::new(BuildSpecifierManager::new(
        craft.clone(),
        settings,
        bundles,
        redirections,
        build_directory.clone(),
        &options.assets_directory,
    ));
    manager.prepare_build_urls();

    let mut shape_context = KitchenContext::build(build_directory.clone(), build_directory.clone(), BuildStep::Shape);
    shape_context.sourcemaps = options.sourcemaps;
    shape_context.sourcemaps_sources_content = options.sourcemaps_sources_content;
    let mut controller = PluginController::new(shape_context, shape_plugins(&options.plugins))?;
    controller.unshift_plugin(manager.shape_plugin())?;
    let shape = Kitchen::from_controller(controller);

    cook_entries(&shape, &entry_urls, &options.operation)
        .await
        .context("shape pass failed")?;
    let build_info = manager.finish(&shape)?;
    info!(
        files = build_info.build_file_contents.len(),
        inline = build_info.build_inline_contents.len(),
        versioned = build_info.build_manifest.len(),
        "build done"
    );
    options.operation.end();
    Ok(build_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use crate::graph::url_info::Content;
    use crate::plugin::{BundleResult, ContentPatch};

    fn site(files: &[(&str, &str)]) -> (tempfile::TempDir, Url, Url) {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join("src").join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        let source = Url::from_directory_path(dir.path().join("src")).unwrap();
        let build = Url::from_directory_path(dir.path().join("dist")).unwrap();
        (dir, source, build)
    }

    fn text<'a>(info: &'a BuildInfo, path: &str) -> &'a str {
        info.build_file_contents
            .get(path)
            .and_then(Content::as_text)
            .unwrap_or_else(|| panic!("{path} missing from {:?}", info.build_file_contents.keys()))
    }

    fn versioned_path<'a>(info: &'a BuildInfo, path: &str) -> &'a str {
        info.build_manifest
            .get(path)
            .unwrap_or_else(|| panic!("{path} missing from manifest {:?}", info.build_manifest))
    }

    fn is_versioned(versioned: &str, stem: &str, extension: &str) -> bool {
        versioned
            .strip_prefix(stem)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(extension))
            .is_some_and(|hash| hash.len() == 8 && hash.chars().all(|c| c.is_ascii_hexdigit()))
    }

    const INDEX: &str = r#"<html>
<head>
  <link rel="stylesheet" href="./b.css" />
</head>
<body>
  <script type="module" src="./a.js"></script>
</body>
</html>"#;

    #[tokio::test]
    async fn test_entry_and_two_assets_are_versioned() {
        let (_dir, source, build_dir) = site(&[
            ("index.html", INDEX),
            ("a.js", "console.log('a');\n"),
            ("b.css", "body { color: red; }\n"),
        ]);
        let info = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();

        let js = versioned_path(&info, "assets/js/a.js");
        let css = versioned_path(&info, "assets/css/b.css");
        assert!(is_versioned(js, "assets/js/a", ".js"), "got {js}");
        assert!(is_versioned(css, "assets/css/b", ".css"), "got {css}");
        assert!(!info.build_manifest.contains_key("index.html"), "pages are not versioned");

        let html = text(&info, "index.html");
        assert!(html.contains(&format!("src=\"/{js}\"")), "html: {html}");
        assert!(html.contains(&format!("href=\"/{css}\"")), "html: {html}");
        assert!(!placeholders::contains_placeholder(html));
        assert_eq!(text(&info, js), "console.log('a');\n");
        let keys: Vec<&str> = info.build_file_contents.keys().map(String::as_str).collect();
        assert_eq!(keys.first(), Some(&"index.html"), "files before directories: {keys:?}");
    }

    #[tokio::test]
    async fn test_unused_preload_is_dropped() {
        let (_dir, source, build_dir) = site(&[
            (
                "index.html",
                "<html>\n<head>\n  <link rel=\"preload\" href=\"./c.js\" as=\"script\" />\n</head>\n<body></body>\n</html>",
            ),
            ("c.js", "export const c = 1;\n"),
        ]);
        let info = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        assert!(
            info.build_file_contents.keys().all(|k| !k.contains("c.js") && !k.contains("/c-")),
            "c.js is only preloaded: {:?}",
            info.build_file_contents.keys()
        );
        let html = text(&info, "index.html");
        assert!(!html.contains("preload"), "stale hint removed: {html}");
    }

    #[tokio::test]
    async fn test_static_imports_go_through_importmap() {
        let (_dir, source, build_dir) = site(&[
            ("index.html", INDEX),
            ("a.js", "import { dep } from './dep.js';\nconsole.log(dep);\n"),
            ("dep.js", "export const dep = 1;\n"),
            ("b.css", "body {}\n"),
        ]);
        let info = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        let a = text(&info, versioned_path(&info, "assets/js/a.js"));
        assert!(a.contains("from \"/assets/js/dep.js\""), "unversioned static import: {a}");
        let dep = versioned_path(&info, "assets/js/dep.js");
        let html = text(&info, "index.html");
        assert!(html.contains("<script type=\"importmap\">"), "html: {html}");
        assert!(html.contains(&format!("\"/assets/js/dep.js\": \"/{dep}\"")), "html: {html}");
    }

    #[tokio::test]
    async fn test_dynamic_import_uses_global_lookup() {
        let (_dir, source, build_dir) = site(&[
            ("main.js", "const lazy = () => import('./lazy.js');\nlazy();\n"),
            ("lazy.js", "export default 1;\n"),
        ]);
        let info = build(BuildOptions::new(source, build_dir, vec!["./main.js".into()]))
            .await
            .unwrap();
        let main = text(&info, "main.js");
        assert!(main.contains("import(__v__(\"/assets/js/lazy.js\"))"), "main: {main}");
        assert!(main.starts_with(";(function () {"), "banner first: {main}");
        let lazy = versioned_path(&info, "assets/js/lazy.js");
        assert!(main.contains(&format!("\"/assets/js/lazy.js\":\"/{lazy}\"")), "main: {main}");
    }

    #[tokio::test]
    async fn test_css_version_follows_embedded_image() {
        let files = |png: &'static str| {
            site(&[
                ("index.html", INDEX),
                ("a.js", "console.log('a');\n"),
                ("b.css", "body { background: url(./bg.png); }\n"),
                ("bg.png", png),
            ])
        };
        let (_dir1, source, build_dir) = files("png-1");
        let first = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        let (_dir2, source, build_dir) = files("png-2");
        let second = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        assert_ne!(
            versioned_path(&first, "assets/css/b.css"),
            versioned_path(&second, "assets/css/b.css")
        );
        assert_eq!(
            versioned_path(&first, "assets/js/a.js"),
            versioned_path(&second, "assets/js/a.js"),
            "unrelated file keeps its version"
        );
    }

    #[tokio::test]
    async fn test_versioning_disabled_and_search_param_method() {
        let (_dir, source, build_dir) = site(&[
            ("index.html", INDEX),
            ("a.js", "console.log('a');\n"),
            ("b.css", "body {}\n"),
        ]);
        let mut options = BuildOptions::new(source.clone(), build_dir.clone(), vec!["./index.html".into()]);
        options.versioning = false;
        let info = build(options).await.unwrap();
        assert!(info.build_manifest.is_empty());
        assert!(text(&info, "index.html").contains("src=\"/assets/js/a.js\""));

        let mut options = BuildOptions::new(source, build_dir, vec!["./index.html".into()]);
        options.versioning_method = VersioningMethod::SearchParam;
        options.base = "/app".into();
        let info = build(options).await.unwrap();
        let js = versioned_path(&info, "assets/js/a.js");
        assert!(js.starts_with("assets/js/a.js?v="), "got {js}");
        assert!(info.build_file_contents.contains_key("assets/js/a.js"));
        assert!(text(&info, "index.html").contains(&format!("src=\"/app/{js}\"")));
    }

    #[tokio::test]
    async fn test_service_worker_lists_build_files() {
        let (_dir, source, build_dir) = site(&[
            (
                "index.html",
                "<html><head></head><body><script type=\"module\" src=\"./a.js\"></script></body></html>",
            ),
            ("a.js", "navigator.serviceWorker.register('./sw.js');\n"),
            ("sw.js", "self.addEventListener('fetch', () => {});\n"),
        ]);
        let mut options = BuildOptions::new(source, build_dir, vec!["./index.html".into()]);
        options.service_worker_entries = vec!["./sw.js".into()];
        let info = build(options).await.unwrap();
        let sw = text(&info, "sw.js");
        assert!(sw.starts_with("self.resourcesFromBuild = {"), "sw: {sw}");
        assert!(sw.contains("\"/index.html\""), "sw: {sw}");
        assert!(sw.contains("\"versionedUrl\": \"/assets/js/a-"), "sw: {sw}");
        assert!(!sw.contains("\"/sw.js\""), "no self reference: {sw}");
    }

    #[tokio::test]
    async fn test_bundled_sources_are_redirected() {
        let (_dir, source, build_dir) = site(&[
            ("main.js", "import './one.js';\nimport './two.js';\n"),
            ("one.js", "console.log(1);\n"),
            ("two.js", "console.log(2);\n"),
        ]);
        let bundle_root = source.clone();
        let bundler = Plugin::new("concat").on_bundle("js_module", move |infos, _kitchen| {
            let bundle_url = bundle_root.join("vendor.js").map(|u| u.to_string());
            async move {
                let bundle_url = bundle_url?;
                let sources: Vec<String> = infos
                    .iter()
                    .filter(|i| !i.url().ends_with("main.js"))
                    .map(|i| i.url().to_owned())
                    .collect();
                let content = infos
                    .iter()
                    .filter(|i| sources.iter().any(|s| s == i.url()))
                    .filter_map(|i| i.content_text())
                    .collect::<String>();
                Ok(BundleOutput::from([(
                    bundle_url,
                    BundleResult {
                        content,
                        content_type: "text/javascript".into(),
                        url_type: Some(UrlType::JsModule),
                        source_urls: sources,
                        ..BundleResult::default()
                    },
                )]))
            }
        });
        let mut options = BuildOptions::new(source, build_dir, vec!["./main.js".into()]);
        options.plugins = vec![bundler];
        options.versioning = false;
        let info = build(options).await.unwrap();
        let main = text(&info, "main.js");
        assert!(main.contains("\"/assets/js/vendor.js\""), "main: {main}");
        assert_eq!(text(&info, "assets/js/vendor.js"), "console.log(1);\nconsole.log(2);\n");
        assert!(!info.build_file_contents.contains_key("assets/js/one.js"));
    }

    #[tokio::test]
    async fn test_optimizers_run_in_shape_pass() {
        let (_dir, source, build_dir) = site(&[
            ("index.html", INDEX),
            ("a.js", "a()\n"),
            ("b.css", "body {\n  color: red;\n}\n"),
        ]);
        let minify = Plugin::new("minify_css").on_optimize_url_content_for("css", |input| async move {
            let text: String = input.content_text()?.split_whitespace().collect();
            Ok(Some(ContentPatch::content(text)))
        });
        let mut options = BuildOptions::new(source, build_dir, vec!["./index.html".into()]);
        options.plugins = vec![minify];
        let info = build(options).await.unwrap();
        assert_eq!(text(&info, versioned_path(&info, "assets/css/b.css")), "body{color:red;}");
    }

    #[tokio::test]
    async fn test_same_input_builds_identical_output() {
        let (_dir, source, build_dir) = site(&[
            ("index.html", INDEX),
            ("a.js", "import { dep } from './dep.js';\nimport('./lazy.js');\nconsole.log(dep);\n"),
            ("dep.js", "export const dep = 1;\n"),
            ("lazy.js", "export default 1;\n"),
            ("b.css", "body { background: url(./bg.png); }\n"),
            ("bg.png", "png"),
        ]);
        let first = build(BuildOptions::new(source.clone(), build_dir.clone(), vec!["./index.html".into()]))
            .await
            .unwrap();
        let second = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        let listing = |info: &BuildInfo| -> Vec<(String, Content)> {
            info.build_file_contents
                .iter()
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect()
        };
        assert_eq!(listing(&first), listing(&second));
        assert_eq!(
            first.build_manifest.iter().collect::<Vec<_>>(),
            second.build_manifest.iter().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_changing_dynamic_import_keeps_importer_version() {
        let files = |lazy: &'static str| {
            site(&[
                ("index.html", INDEX),
                ("a.js", "const load = () => import('./lazy.js');\nload();\n"),
                ("lazy.js", lazy),
                ("b.css", "body {}\n"),
            ])
        };
        let (_dir1, source, build_dir) = files("export default 1;\n");
        let first = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        let (_dir2, source, build_dir) = files("export default 2;\n");
        let second = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        assert_ne!(
            versioned_path(&first, "assets/js/lazy.js"),
            versioned_path(&second, "assets/js/lazy.js")
        );
        assert_eq!(
            versioned_path(&first, "assets/js/a.js"),
            versioned_path(&second, "assets/js/a.js"),
            "a.js resolves lazy.js through __v__ at runtime"
        );
        assert_eq!(
            versioned_path(&first, "assets/css/b.css"),
            versioned_path(&second, "assets/css/b.css")
        );
    }

    #[tokio::test]
    async fn test_worker_version_follows_its_globals_table() {
        let files = |lazy: &'static str| {
            site(&[
                ("main.js", "const worker = new Worker('./worker.js');\nworker.postMessage(1);\n"),
                ("worker.js", "self.onmessage = () => import('./lazy.js');\n"),
                ("lazy.js", lazy),
            ])
        };
        let (_dir1, source, build_dir) = files("export default 1;\n");
        let first = build(BuildOptions::new(source, build_dir, vec!["./main.js".into()]))
            .await
            .unwrap();
        let (_dir2, source, build_dir) = files("export default 2;\n");
        let second = build(BuildOptions::new(source, build_dir, vec!["./main.js".into()]))
            .await
            .unwrap();

        let lazy = versioned_path(&second, "assets/js/lazy.js");
        let worker = versioned_path(&second, "assets/js/worker.js");
        assert!(text(&second, worker).contains(&format!("\"/{lazy}\"")), "worker carries the table");
        assert_ne!(
            versioned_path(&first, "assets/js/worker.js"),
            worker,
            "worker bytes changed with the table, so must its url"
        );
    }

    #[tokio::test]
    async fn test_build_files_written_to_disk() {
        let (dir, source, build_dir) = site(&[("index.html", INDEX), ("a.js", "a()\n"), ("b.css", "b{}\n")]);
        let info = build(BuildOptions::new(source, build_dir, vec!["./index.html".into()]))
            .await
            .unwrap();
        let out = dir.path().join("dist");
        let written = write_build_files(&out, &info).unwrap();
        assert_eq!(written, 3);
        assert!(Path::new(&out.join("index.html")).exists());
    }
}

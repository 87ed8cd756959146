//! End-to-end scenarios through the public library API.

use std::fs;

use pretty_assertions::assert_eq;
use url::Url;

use url_kitchen::build::{BuildOptions, build};
use url_kitchen::dev::{DevRequest, DevServer, DevServerOptions};
use url_kitchen::graph::UrlGraph;
use url_kitchen::graph::reference::{ReferenceInit, ReferenceKind};
use url_kitchen::graph::url_info::Content;
use url_kitchen::graph::visitor;
use url_kitchen::kitchen::{CookDependenciesOptions, CookOptions, Kitchen, KitchenContext};
use url_kitchen::plugins::default_plugins;

fn write_all(root: &std::path::Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
}

fn hash_of<'a>(versioned: &'a str, prefix: &str, extension: &str) -> &'a str {
    versioned
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(extension))
        .unwrap_or_else(|| panic!("{versioned} is not {prefix}<hash>{extension}"))
}

#[tokio::test]
async fn dev_revalidation_answers_304() {
    let dir = tempfile::tempdir().unwrap();
    write_all(dir.path(), &[("app.js", "export const answer = 42;\n")]);
    let root = Url::from_directory_path(dir.path()).unwrap();
    let server = DevServer::new(DevServerOptions::new(root)).unwrap();

    let first = server.handle_request(DevRequest::get("/app.js")).await;
    assert_eq!(first.status, 200);
    let etag = first.header("etag").unwrap().to_owned();
    assert!(etag.starts_with('"') && etag.ends_with('"') && etag.contains('_'), "etag {etag}");

    let second = server
        .handle_request(DevRequest::get("/app.js").with_header("if-none-match", etag))
        .await;
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());
}

#[tokio::test]
async fn entry_with_two_assets_builds_versioned_files() {
    let dir = tempfile::tempdir().unwrap();
    write_all(
        dir.path(),
        &[
            (
                "src/index.html",
                r#"<html><head><link rel="stylesheet" href="./b.css"></head>
<body><script src="./a.js"></script></body></html>"#,
            ),
            ("src/a.js", "console.log('a');\n"),
            ("src/b.css", "p { margin: 0; }\n"),
        ],
    );
    let source = Url::from_directory_path(dir.path().join("src")).unwrap();
    let dist = Url::from_directory_path(dir.path().join("dist")).unwrap();
    let info = build(BuildOptions::new(source, dist, vec!["./index.html".into()]))
        .await
        .unwrap();

    let js = info.build_manifest["assets/js/a.js"].as_str();
    let css = info.build_manifest["assets/css/b.css"].as_str();
    for hash in [hash_of(js, "assets/js/a-", ".js"), hash_of(css, "assets/css/b-", ".css")] {
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()), "{hash}");
    }
    assert!(info.build_file_contents.contains_key(js));
    assert!(info.build_file_contents.contains_key(css));
}

#[tokio::test]
async fn weak_preload_does_not_keep_target_alive() {
    let dir = tempfile::tempdir().unwrap();
    write_all(
        dir.path(),
        &[
            (
                "index.html",
                r#"<html><head><link rel="preload" href="./c.js" as="script"></head><body></body></html>"#,
            ),
            ("c.js", "console.log('c');\n"),
        ],
    );
    let root = Url::from_directory_path(dir.path()).unwrap();
    let kitchen = Kitchen::new(KitchenContext::dev(root.clone()), default_plugins()).unwrap();
    let entry = kitchen.prepare_entry_point("./index.html").unwrap();
    kitchen.cook(entry.target, CookOptions::default()).await.unwrap();
    kitchen
        .cook_dependencies(entry.target, CookDependenciesOptions::default())
        .await
        .unwrap();

    let c_url = root.join("c.js").unwrap();
    let c = kitchen.node_for_url(c_url.as_str()).expect("c.js is in the graph");
    assert!(!kitchen.with_graph(|g| visitor::is_used(g, c)), "only a weak reference points at c.js");

    let dist = Url::from_directory_path(dir.path().join("dist")).unwrap();
    let info = build(BuildOptions::new(root, dist, vec!["./index.html".into()]))
        .await
        .unwrap();
    assert!(
        info.build_file_contents.keys().all(|path| !path.contains("c.js") && !path.contains("/c-")),
        "c.js absent from {:?}",
        info.build_file_contents.keys()
    );
}

#[test]
fn inline_content_follows_its_host_when_host_is_inlined() {
    let mut g = UrlGraph::new("scenario", "file:///site/");
    let root = g.root();
    let link = |g: &mut UrlGraph, owner, kind, url: &str| {
        let id = g.create_reference(owner, ReferenceInit::new(kind, url));
        g.set_reference_url(id, url.to_owned()).unwrap();
        g.finalize_reference(id).unwrap();
        id
    };
    let entry = link(&mut g, root, ReferenceKind::EntryPoint, "file:///site/index.html");
    let index = g.reference(entry).unwrap().target().unwrap();
    let widget_ref = link(&mut g, index, ReferenceKind::IframeSrc, "file:///site/widget.html");
    let widget = g.reference(widget_ref).unwrap().target().unwrap();

    let script_url = "file:///site/widget.html@L1C8-L1C22.js";
    let script_ref = g.create_reference(
        widget,
        ReferenceInit::new(ReferenceKind::Script, script_url).inline(Content::from("console.log(1)"), "text/javascript"),
    );
    g.set_reference_url(script_ref, script_url.to_owned()).unwrap();
    let script = g.finalize_reference(script_ref).unwrap();
    assert_eq!(g.find_parent_if_inline(script), Some(widget));

    g.reference_becomes_inline(widget_ref, Content::from("<script>console.log(1)</script>"), "text/html")
        .unwrap();
    assert_eq!(g.find_parent_if_inline(script), Some(index));
    assert_eq!(g.url_info(script).inline_url_site.as_ref().unwrap().url, "file:///site/index.html");
}

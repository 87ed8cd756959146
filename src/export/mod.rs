//! Rendering a cooked url graph for the `graph` command.

pub mod dot;
pub mod mermaid;

use anyhow::Context;
use percent_encoding::percent_decode_str;
use petgraph::stable_graph::NodeIndex;
use serde::Serialize;
use url::Url;

use crate::graph::UrlGraph;
use crate::kitchen::{CookDependenciesOptions, CookOptions, Kitchen, KitchenContext};
use crate::plugins::default_plugins;
use crate::transformer::SourcemapMode;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize)]
pub enum ExportFormat {
    /// One line per url, references indented below it.
    #[default]
    Text,
    Json,
    /// Graphviz DOT.
    Dot,
    /// Mermaid flowchart.
    Mermaid,
}

pub struct ExportResult {
    pub content: String,
    pub node_count: usize,
    pub edge_count: usize,
}

/// Node and edges as rendered, urls shown relative to the root directory.
#[derive(Debug, Serialize)]
pub struct ExportedUrl {
    #[serde(skip)]
    pub node: NodeIndex,
    pub url: String,
    #[serde(rename = "type")]
    pub url_type: Option<&'static str>,
    pub inline: bool,
    pub references: Vec<ExportedReference>,
}

#[derive(Debug, Serialize)]
pub struct ExportedReference {
    pub kind: &'static str,
    pub specifier: String,
    pub url: String,
    pub weak: bool,
    #[serde(skip)]
    pub target: NodeIndex,
}

/// Cook `entry_points` and everything they reference in a kitchen rooted at `root`.
pub async fn cook_graph(root: Url, entry_points: &[String]) -> anyhow::Result<Kitchen> {
    let mut context = KitchenContext::dev(root);
    context.sourcemaps = SourcemapMode::None;
    let kitchen = Kitchen::new(context, default_plugins())?;
    for specifier in entry_points {
        let entry = kitchen
            .prepare_entry_point(specifier)
            .with_context(|| format!("cannot prepare entry point {specifier}"))?;
        kitchen.cook(entry.target, CookOptions::default()).await?;
        kitchen
            .cook_dependencies(entry.target, CookDependenciesOptions::default())
            .await?;
    }
    Ok(kitchen)
}

/// Url relative to the root directory, percent-decoded for display.
pub fn display_url(url: &str, root_url: &str) -> String {
    match url.strip_prefix(root_url) {
        Some(relative) => percent_decode_str(relative).decode_utf8_lossy().into_owned(),
        None => url.to_owned(),
    }
}

/// Every url of the graph but the root, sorted by url, with its live references.
pub fn collect(graph: &UrlGraph) -> Vec<ExportedUrl> {
    let root_url = graph.url_info(graph.root()).url().to_owned();
    let mut urls: Vec<ExportedUrl> = graph
        .url_infos()
        .filter(|(_, info)| !info.is_root)
        .map(|(node, info)| {
            let references = graph
                .references_to_others(node)
                .into_iter()
                .filter_map(|id| graph.reference(id))
                .filter_map(|reference| {
                    let target = reference.target()?;
                    Some(ExportedReference {
                        kind: reference.kind.as_str(),
                        specifier: reference.specifier.clone(),
                        url: display_url(graph.url_info(target).url(), &root_url),
                        weak: reference.is_weak,
                        target,
                    })
                })
                .collect();
            ExportedUrl {
                node,
                url: display_url(info.url(), &root_url),
                url_type: info.url_type.map(|t| t.as_str()),
                inline: info.is_inline,
                references,
            }
        })
        .collect();
    urls.sort_by(|a, b| a.url.cmp(&b.url));
    urls
}

pub fn export_graph(graph: &UrlGraph, format: ExportFormat) -> anyhow::Result<ExportResult> {
    let urls = collect(graph);
    let node_count = urls.len();
    let edge_count = urls.iter().map(|u| u.references.len()).sum();
    let content = match format {
        ExportFormat::Text => render_text(&urls),
        ExportFormat::Json => serde_json::to_string_pretty(&urls)?,
        ExportFormat::Dot => dot::render_dot(&urls),
        ExportFormat::Mermaid => mermaid::render_mermaid(&urls),
    };
    Ok(ExportResult {
        content,
        node_count,
        edge_count,
    })
}

fn render_text(urls: &[ExportedUrl]) -> String {
    let mut out = String::new();
    for url in urls {
        out.push_str(&url.url);
        if let Some(url_type) = url.url_type {
            out.push_str(&format!(" ({url_type})"));
        }
        out.push('\n');
        for reference in &url.references {
            let weak = if reference.weak { " weak" } else { "" };
            out.push_str(&format!("  -> {} [{}{weak}]\n", reference.url, reference.kind));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_cooked_site_exports_urls_and_references() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.html"),
            r#"<html><head><link rel="stylesheet" href="./main.css"></head></html>"#,
        )
        .unwrap();
        fs::write(dir.path().join("main.css"), "body { background: url(./bg.png); }").unwrap();
        fs::write(dir.path().join("bg.png"), [0x89, 0x50]).unwrap();
        let root = Url::from_directory_path(dir.path()).unwrap();

        let kitchen = cook_graph(root, &["./index.html".to_owned()]).await.unwrap();
        let result = export_graph(&kitchen.graph(), ExportFormat::Text).unwrap();
        assert_eq!(result.node_count, 3);
        assert_eq!(result.edge_count, 2);
        assert!(result.content.starts_with("bg.png (other)\nindex.html (html)\n  -> main.css ["), "{}", result.content);

        let json = export_graph(&kitchen.graph(), ExportFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json.content).unwrap();
        assert_eq!(parsed[2]["url"], "main.css");
        assert_eq!(parsed[2]["references"][0]["url"], "bg.png");
    }

    #[test]
    fn test_display_url_is_relative_and_decoded() {
        assert_eq!(display_url("file:///app/my%20logo.png", "file:///app/"), "my logo.png");
        assert_eq!(display_url("data:text/plain,hi", "file:///app/"), "data:text/plain,hi");
    }
}

use std::fmt::Write;

use super::ExportedUrl;

/// Fill color of a node by url type.
fn type_fillcolor(url_type: Option<&str>) -> &'static str {
    match url_type {
        Some("html") => "#AED6F1",
        Some("css") => "#A9DFBF",
        Some("js_module" | "js_classic") => "#F9E79F",
        Some("json" | "webmanifest" | "sourcemap") => "#D7BDE2",
        _ => "#EAECEE",
    }
}

fn escape_dot_label(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn render_dot(urls: &[ExportedUrl]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph url_graph {{");
    let _ = writeln!(out, "    rankdir=LR;");
    let _ = writeln!(out, "    node [shape=box style=filled fontname=monospace];");
    for url in urls {
        let style = if url.inline { " style=\"filled,dashed\"" } else { "" };
        let _ = writeln!(
            out,
            "    n{} [label=\"{}\" fillcolor=\"{}\"{style}];",
            url.node.index(),
            escape_dot_label(&url.url),
            type_fillcolor(url.url_type)
        );
    }
    for url in urls {
        for reference in &url.references {
            let style = if reference.weak { "dashed" } else { "solid" };
            let _ = writeln!(
                out,
                "    n{} -> n{} [label=\"{}\" style={style}];",
                url.node.index(),
                reference.target.index(),
                reference.kind
            );
        }
    }
    let _ = writeln!(out, "}}");
    out
}

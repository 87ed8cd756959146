use std::fmt::Write;

use super::ExportedUrl;

/// Quotes and angle brackets break Mermaid labels.
fn escape_mermaid_label(s: &str) -> String {
    s.replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('{', "&#123;")
        .replace('}', "&#125;")
}

pub fn render_mermaid(urls: &[ExportedUrl]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "flowchart LR");
    for url in urls {
        let _ = writeln!(out, "    n{}[\"{}\"]", url.node.index(), escape_mermaid_label(&url.url));
    }
    for url in urls {
        for reference in &url.references {
            let arrow = if reference.weak { "-.->" } else { "-->" };
            let _ = writeln!(
                out,
                "    n{} {arrow}|{}| n{}",
                url.node.index(),
                reference.kind,
                reference.target.index()
            );
        }
    }
    out
}

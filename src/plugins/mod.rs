//! Built-in plugins making a kitchen usable without external collaborators.

pub mod data_urls;
pub mod file_urls;
pub mod inline_content;
pub mod node_esm;
pub mod reference_analysis;
pub mod url_resolution;

use crate::plugin::Plugin;

pub use data_urls::data_urls;
pub use file_urls::file_urls;
pub use inline_content::inline_content;
pub use node_esm::node_esm_resolution;
pub use reference_analysis::reference_analysis;
pub use url_resolution::url_resolution;

/// Plugins every kitchen starts with, in dispatch order.
///
/// Inline content is served before disk reads so an inline url never hits the
/// filesystem; package resolution runs before plain url resolution gives up on bare
/// specifiers.
pub fn default_plugins() -> Vec<Plugin> {
    vec![
        inline_content(),
        node_esm_resolution(),
        url_resolution(),
        data_urls(),
        file_urls(),
        reference_analysis(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use url::Url;

    use crate::graph::url_info::UrlType;
    use crate::kitchen::{CookDependenciesOptions, CookOptions, Kitchen, KitchenContext};

    #[tokio::test]
    async fn test_default_plugins_cook_a_small_site() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.html"),
            r#"<html><head><link rel="stylesheet" href="./main.css"></head>
<body><script type="module">import "./main.js";</script></body></html>"#,
        )
        .unwrap();
        fs::write(dir.path().join("main.css"), "body { background: url(./bg.png); }").unwrap();
        fs::write(dir.path().join("bg.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();
        fs::write(dir.path().join("main.js"), "import { x } from './dep.js';\nconsole.log(x);\n").unwrap();
        fs::write(dir.path().join("dep.js"), "export const x = 1;\n").unwrap();

        let root = Url::from_directory_path(dir.path()).unwrap();
        let kitchen = Kitchen::new(KitchenContext::dev(root.clone()), default_plugins()).unwrap();
        let entry = kitchen.prepare_entry_point("./index.html").unwrap();
        kitchen.cook(entry.target, CookOptions::default()).await.unwrap();
        kitchen
            .cook_dependencies(entry.target, CookDependenciesOptions::default())
            .await
            .unwrap();

        let html = kitchen.url_info(entry.target);
        let html_text = html.content_text().unwrap();
        assert!(html_text.contains(r#"href="/main.css""#), "dev specifiers are root relative: {html_text}");
        assert!(html_text.contains(r#"import "/main.js";"#), "inline script was cooked: {html_text}");

        let dep = kitchen.node_for_url(root.join("dep.js").unwrap().as_str()).unwrap();
        let dep = kitchen.url_info(dep);
        assert!(dep.content_finalized);
        assert_eq!(dep.url_type, Some(UrlType::JsModule));
        let png = kitchen.node_for_url(root.join("bg.png").unwrap().as_str()).unwrap();
        assert_eq!(kitchen.url_info(png).url_type, Some(UrlType::Other));
    }
}

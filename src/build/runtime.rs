//! Javascript injected into build files.

use std::collections::BTreeMap;

use serde::Serialize;

/// Defines `__v__`, mapping unversioned specifiers to versioned ones at runtime.
pub fn global_versioning_banner(mappings: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let table = serde_json::to_string(mappings)?;
    Ok(format!(
        r#";(function () {{
  var versionMappings = {table};
  globalThis.__v__ = function (specifier) {{
    return versionMappings[specifier] || specifier;
  }};
}})();
"#
    ))
}

/// One entry of the service worker resource manifest.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceWorkerResource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "versionedUrl", skip_serializing_if = "Option::is_none")]
    pub versioned_url: Option<String>,
}

/// `self.resourcesFromBuild = {...};` listing what a service worker may cache.
pub fn service_worker_banner(resources: &BTreeMap<String, ServiceWorkerResource>) -> anyhow::Result<String> {
    Ok(format!(
        "self.resourcesFromBuild = {};\n",
        serde_json::to_string_pretty(resources)?
    ))
}

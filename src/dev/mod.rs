//! Dev serving: turns a request into a cooked url, or a plugin's own response.

pub mod watcher;
#[cfg(feature = "web")]
pub mod web;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use petgraph::stable_graph::NodeIndex;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{FetchErrorKind, KitchenError, KitchenResult};
use crate::graph::reference::{ReferenceInit, ReferenceKind};
use crate::graph::url_info::UrlInfo;
use crate::kitchen::operation::Operation;
use crate::kitchen::{CookOptions, Kitchen, KitchenContext};
use crate::plugin::Plugin;
use crate::plugins::default_plugins;

/// Request as the http layer hands it over. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct DevRequest {
    pub method: String,
    /// Path and search, `/app.js?v=1`.
    pub resource: String,
    pub headers: BTreeMap<String, String>,
}

impl DevRequest {
    pub fn get(resource: impl Into<String>) -> Self {
        Self {
            method: "GET".to_owned(),
            resource: resource.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn path(&self) -> &str {
        self.resource
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.resource)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Named durations, exposed as `server-timing`.
    pub timing: BTreeMap<String, Duration>,
}

impl DevResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let body = body.into().into_bytes();
        let mut response = Self::new(status);
        response
            .headers
            .insert("content-type".to_owned(), "text/plain; charset=utf-8".to_owned());
        response
            .headers
            .insert("content-length".to_owned(), body.len().to_string());
        response.body = body;
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// What a dev server needs to build its kitchen.
#[derive(Debug, Clone)]
pub struct DevServerOptions {
    pub source_directory_url: Url,
    /// File served for `/`.
    pub main_file: String,
    /// Url patterns (relative to the source directory) whose changes are tracked.
    pub watch: Vec<(String, bool)>,
    /// Side directory receiving every cooked file.
    pub out_directory_url: Option<Url>,
    pub plugins: Vec<Plugin>,
}

impl DevServerOptions {
    pub fn new(source_directory_url: Url) -> Self {
        Self {
            source_directory_url,
            main_file: "index.html".to_owned(),
            watch: vec![
                ("./**/*".to_owned(), true),
                ("./**/node_modules/".to_owned(), false),
            ],
            out_directory_url: None,
            plugins: Vec::new(),
        }
    }
}

/// Serves cooked urls of a dev kitchen.
#[derive(Debug, Clone)]
pub struct DevServer {
    kitchen: Kitchen,
    main_file: String,
}

impl DevServer {
    pub fn new(options: DevServerOptions) -> anyhow::Result<Self> {
        let mut context = KitchenContext::dev(options.source_directory_url.clone());
        context.out_directory_url = options.out_directory_url;
        context.associations.associate_flags(
            "watch",
            options.watch.iter().map(|(pattern, value)| (pattern.as_str(), *value)),
            &options.source_directory_url,
        )?;
        let mut plugins = options.plugins;
        plugins.extend(default_plugins());
        Ok(Self {
            kitchen: Kitchen::new(context, plugins)?,
            main_file: options.main_file,
        })
    }

    pub fn kitchen(&self) -> &Kitchen {
        &self.kitchen
    }

    #[instrument(level = "debug", skip_all, fields(resource = %request.resource))]
    pub async fn handle_request(&self, request: DevRequest) -> DevResponse {
        for (plugin, hook) in self.kitchen.plugins().serve_hooks() {
            match hook(request.clone(), self.kitchen.clone()).await {
                Ok(Some(response)) => {
                    debug!(plugin = %plugin, status = response.status, "served by plugin");
                    return response;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(plugin = %plugin, error = %format!("{err:#}"), "serve hook failed");
                    return DevResponse::text(500, format!("{err:#}"));
                }
            }
        }

        let started = Instant::now();
        let node = match self.node_for_request(&request) {
            Ok(node) => node,
            Err(err) => return error_response(&err, None),
        };
        if let Some(response) = self.not_modified(&request, node) {
            return response;
        }
        let cooked = self
            .kitchen
            .cook(
                node,
                CookOptions {
                    direct_request: true,
                    operation: Operation::new(),
                },
            )
            .await;
        let info = self.kitchen.url_info(node);
        let mut response = match cooked {
            Ok(()) => ok_response(&info),
            Err(err) => error_response(&err, Some(&info)),
        };
        response.timing.insert("cook".to_owned(), started.elapsed());
        debug!(url = %info.url(), status = response.status, "served");
        response
    }

    /// Node a request designates: the reference the referer wrote for it, a node already
    /// known under that url, or a fresh request from the root.
    fn node_for_request(&self, request: &DevRequest) -> KitchenResult<NodeIndex> {
        let resource = if request.path() == "/" {
            format!("/{}", self.main_file)
        } else {
            request.resource.clone()
        };
        let root = &self.kitchen.context().root_directory_url;
        let parent_url = request
            .header("referer")
            .and_then(|referer| Url::parse(referer).ok())
            .and_then(|referer| root.join(referer.path().trim_start_matches('/')).ok())
            .map(|url| url.to_string());
        let inferred = self.kitchen.with_graph(|g| {
            let parent_url = parent_url.as_deref()?;
            let id = g.infer_reference(&resource, parent_url)?;
            g.reference(id)?.target()
        });
        if let Some(node) = inferred {
            return Ok(node);
        }
        let known = root
            .join(resource.trim_start_matches('/'))
            .ok()
            .and_then(|url| self.kitchen.node_for_url(url.as_str()));
        if let Some(node) = known {
            return Ok(node);
        }
        let root_node = self.kitchen.with_graph(|g| g.root());
        let handle = self
            .kitchen
            .found_reference(root_node, ReferenceInit::new(ReferenceKind::HttpRequest, resource))?;
        Ok(handle.target)
    }

    fn not_modified(&self, request: &DevRequest, node: NodeIndex) -> Option<DevResponse> {
        let if_none_match = request.header("if-none-match")?;
        self.kitchen.with_graph(|g| {
            let info = g.url_info(node);
            let etag = etag_of(info)?;
            if etag != if_none_match || !info.is_valid() {
                return None;
            }
            let mut response = DevResponse::new(304);
            response.headers.insert("etag".to_owned(), etag);
            debug!(url = %info.url(), "not modified");
            Some(response)
        })
    }
}

/// `"<original content etag>_<content etag>"`
fn etag_of(info: &UrlInfo) -> Option<String> {
    Some(format!(
        "\"{}_{}\"",
        info.original_content_etag()?,
        info.content_etag()?
    ))
}

fn ok_response(info: &UrlInfo) -> DevResponse {
    let body = info.content().map(|c| c.as_bytes().to_vec()).unwrap_or_default();
    let mut response = DevResponse::new(200);
    let headers = &mut response.headers;
    headers.insert(
        "content-type".to_owned(),
        info.content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_owned()),
    );
    headers.insert("content-length".to_owned(), body.len().to_string());
    headers.insert(
        "cache-control".to_owned(),
        "private,max-age=0,must-revalidate".to_owned(),
    );
    if let Some(etag) = etag_of(info) {
        headers.insert("etag".to_owned(), etag);
    }
    for (name, value) in &info.headers {
        headers.insert(name.to_ascii_lowercase(), value.clone());
    }
    response.body = body;
    response
}

fn error_response(err: &KitchenError, info: Option<&UrlInfo>) -> DevResponse {
    let status = match err.fetch_kind() {
        Some(FetchErrorKind::NotFound) => 404,
        Some(FetchErrorKind::NotAllowed | FetchErrorKind::DirectoryReferenceNotAllowed) => 403,
        // The browser reports the syntax error itself.
        Some(FetchErrorKind::ParseError) => match info {
            Some(info) if info.content().is_some() => return ok_response(info),
            _ => 500,
        },
        _ => 500,
    };
    if status == 500 {
        warn!(code = err.code(), error = %err, "cannot serve");
    }
    DevResponse::text(status, err.to_string())
}

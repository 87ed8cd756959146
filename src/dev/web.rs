//! Axum front for [`DevServer`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tower_http::cors::CorsLayer;
use tracing::info;

use super::{DevRequest, DevResponse, DevServer};

/// Every path goes to the dev server.
pub fn router(server: Arc<DevServer>) -> Router {
    Router::new()
        .fallback(serve)
        .layer(CorsLayer::permissive())
        .with_state(server)
}

pub async fn serve_on(server: DevServer, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(url = %format!("http://{}", listener.local_addr()?), "dev server started");
    axum::serve(listener, router(Arc::new(server))).await?;
    Ok(())
}

async fn serve(State(server): State<Arc<DevServer>>, request: Request) -> Response {
    let dev_request = to_dev_request(&request);
    to_response(server.handle_request(dev_request).await)
}

fn to_dev_request(request: &Request) -> DevRequest {
    let resource = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
        .collect();
    DevRequest {
        method: request.method().as_str().to_owned(),
        resource,
        headers,
    }
}

fn to_response(dev: DevResponse) -> Response {
    let status = StatusCode::from_u16(dev.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Body::from(dev.body)).into_response();
    let headers = response.headers_mut();
    for (name, value) in &dev.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    if !dev.timing.is_empty() {
        let timing = dev
            .timing
            .iter()
            .map(|(name, duration)| format!("{name};dur={:.1}", duration.as_secs_f64() * 1000.0))
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&timing) {
            headers.insert("server-timing", value);
        }
    }
    response
}

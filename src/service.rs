use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Response, StatusCode, Uri, body::Incoming};

use crate::{middleware::status_response, registry::Registry};

pub const ROUTE_ADD: &str = "/playback/add/";
pub const ROUTE_GET: &str = "/playback/get/";
pub const ROUTE_DELETE: &str = "/playback/delete/";
pub const ROUTE_LIST: &str = "/playback/list/";

/// CRUD over the cassette registry, exposed under `/playback/`.
pub async fn admin(
    registry: &Arc<Registry>,
    req: hyper::Request<Incoming>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("read admin body: {err}");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    admin_request(registry, &parts.method, &parts.uri, &body)
}

fn admin_request(
    registry: &Arc<Registry>,
    method: &Method,
    uri: &Uri,
    body: &[u8],
) -> Response<Full<Bytes>> {
    match uri.path() {
        ROUTE_ADD => {
            if method != Method::POST {
                return status_response(StatusCode::BAD_REQUEST);
            }
            match registry.cassette_from_yaml(body) {
                Ok(cassette) => text_response(cassette.id().to_owned()),
                Err(err) => {
                    tracing::debug!("register posted cassette: {err}");
                    status_response(StatusCode::BAD_REQUEST)
                }
            }
        }
        ROUTE_GET => {
            if method != Method::GET {
                return status_response(StatusCode::BAD_REQUEST);
            }
            let Some(id) = query_param(uri, "id") else {
                return status_response(StatusCode::BAD_REQUEST);
            };
            let Some(cassette) = registry.get(&id) else {
                return status_response(StatusCode::NOT_FOUND);
            };
            match cassette.marshal_to_yaml() {
                Ok(dump) => text_response(dump),
                Err(err) => {
                    tracing::warn!(cassette_id = %id, "serialize cassette: {err}");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        ROUTE_DELETE => {
            if method != Method::DELETE {
                return status_response(StatusCode::BAD_REQUEST);
            }
            let Some(id) = query_param(uri, "id") else {
                return status_response(StatusCode::BAD_REQUEST);
            };
            if !registry.delete(&id) {
                return status_response(StatusCode::NOT_FOUND);
            }
            status_response(StatusCode::OK)
        }
        ROUTE_LIST => {
            if method != Method::GET {
                return status_response(StatusCode::BAD_REQUEST);
            }
            match serde_yaml::to_string(&registry.list()) {
                Ok(listing) => text_response(listing),
                Err(err) => {
                    tracing::warn!("serialize cassette listing: {err}");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        _ => status_response(StatusCode::NOT_FOUND),
    }
}

fn text_response(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("static response parts are valid")
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    for segment in query.split('&') {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        if key == name && !value.is_empty() {
            return Some(value.to_owned());
        }
    }
    None
}

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    cassette::Cassette,
    context,
    httpwire::read_response,
    mode::{Mode, PathType},
    record::RecordKind,
    recorder::BoxFuture,
    registry::Registry,
    service,
};

pub const HEADER_CASSETTE_ID: &str = "x-playback-id";
pub const HEADER_CASSETTE_PATH_TYPE: &str = "x-playback-path-type";
pub const HEADER_CASSETTE_PATH_NAME: &str = "x-playback-path-name";
pub const HEADER_MODE: &str = "x-playback-mode";
pub const HEADER_SUCCESS: &str = "x-playback-success";

/// Admin routes live under this prefix; everything else goes to the wrapped
/// service handler.
pub const SERVICE_PREFIX: &str = "/playback/";

/// The wrapped service: a handler over buffered requests. The per-request
/// cassette arrives through the request extensions.
pub type Handler = Arc<dyn Fn(Request<Bytes>) -> BoxFuture<Response<Bytes>> + Send + Sync>;

#[derive(Debug)]
pub struct ServiceHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServiceHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Binds a listener and serves the playback-wrapped handler plus the admin
/// routes until shut down.
pub async fn serve(
    registry: Arc<Registry>,
    listen: SocketAddr,
    handler: Handler,
) -> anyhow::Result<ServiceHandle> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let registry = Arc::clone(&registry);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let registry = Arc::clone(&registry);
                            let handler = Arc::clone(&handler);
                            async move {
                                Ok::<_, Infallible>(handle(&registry, req, &handler).await)
                            }
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServiceHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn handle(
    registry: &Arc<Registry>,
    req: Request<Incoming>,
    handler: &Handler,
) -> Response<Full<Bytes>> {
    if req.uri().path().starts_with(SERVICE_PREFIX) {
        return service::admin(registry, req).await;
    }
    middleware(registry, req, handler).await
}

/// The inbound interception point: resolves the per-request cassette,
/// echoes the request in record mode, verifies (and substitutes) the
/// response in playback mode, and stamps the cassette tokens onto the
/// response.
pub async fn middleware(
    registry: &Arc<Registry>,
    req: Request<Incoming>,
    handler: &Handler,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("read inbound body: {err}");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    let mut req = Request::from_parts(parts, body);

    let cassette = match registry.incoming(
        context::cassette_from_request(&req),
        &header_str(&req, HEADER_CASSETTE_ID),
        &header_str(&req, HEADER_MODE),
        &header_str(&req, HEADER_CASSETTE_PATH_TYPE),
        &header_str(&req, HEADER_CASSETTE_PATH_NAME),
    ) {
        Ok(cassette) => cassette,
        Err(err) => {
            tracing::warn!("resolve inbound cassette: {err}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let mode = cassette.mode();
    context::install_cassette(&mut req, Arc::clone(&cassette));

    if mode == Mode::Record {
        if let Err(err) = cassette.set_http_request(&req) {
            tracing::warn!(cassette_id = %cassette.id(), "echo inbound request: {err}");
        }
    }

    // The handler's response is recorded and compared before any playback
    // token lands on it, so a cassette replayed under a different id still
    // matches on its own content.
    let mut res = handler(req).await;

    let success = match mode {
        Mode::Record => {
            if let Err(err) = cassette.set_http_response(&res) {
                tracing::warn!(cassette_id = %cassette.id(), "save observed response: {err}");
            }
            Some(true)
        }
        Mode::Playback => {
            let matched =
                cassette.is_http_response_correct(&res) && cassette.is_playback_succeeded();
            if let Some(expected) = recorded_response(&cassette) {
                res = expected;
            }
            Some(matched)
        }
        _ => None,
    };

    stamp_tokens(&mut res, &cassette, mode);
    if let Some(success) = success {
        set_header(&mut res, HEADER_SUCCESS, &success.to_string());
    }

    let (parts, body) = res.into_parts();
    Response::from_parts(parts, Full::new(body))
}

/// The response recorded for the inbound request, if the cassette has one.
/// Replacing the live response with it keeps the caller's view stable even
/// when the handler diverged; the success token reports the divergence.
fn recorded_response(cassette: &Cassette) -> Option<Response<Bytes>> {
    let rec = cassette.get_last(RecordKind::HttpRequest, "").ok()?;
    if rec.response.is_empty() {
        return None;
    }
    read_response(&rec.response).ok()
}

fn stamp_tokens(res: &mut Response<Bytes>, cassette: &Cassette, mode: Mode) {
    set_header(res, HEADER_MODE, mode.as_str());
    set_header(res, HEADER_CASSETTE_ID, cassette.id());
    if cassette.path_type() != PathType::Nil {
        set_header(res, HEADER_CASSETTE_PATH_TYPE, cassette.path_type().as_str());
    }
    let path_name = cassette.path_name();
    if !path_name.is_empty() {
        set_header(res, HEADER_CASSETTE_PATH_NAME, &path_name);
    }
}

fn set_header(res: &mut Response<Bytes>, name: &'static str, value: &str) {
    let Ok(value) = HeaderValue::from_str(value) else {
        return;
    };
    res.headers_mut()
        .insert(HeaderName::from_static(name), value);
}

fn header_str<B>(req: &Request<B>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_owned()
}

pub(crate) fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

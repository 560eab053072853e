use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::net::TcpListener;

use tapedeck::{
    context,
    http::{HttpPlayback, HyperTransport},
    middleware::{
        self, HEADER_CASSETTE_ID, HEADER_CASSETTE_PATH_NAME, HEADER_CASSETTE_PATH_TYPE,
        HEADER_MODE, HEADER_SUCCESS, Handler,
    },
    mode::Mode,
    registry::Registry,
};

type TestClient = Client<HttpConnector, Full<Bytes>>;

fn client() -> TestClient {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Upstream returning a fixed body; the handler under test calls it through
/// the recording transport.
async fn spawn_upstream(body: &'static str) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let join = tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                continue;
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .body(Full::new(Bytes::from_static(body.as_bytes())))
                            .unwrap(),
                    )
                });
                let _ = ConnectionBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    (addr, join)
}

/// The service handler: reads a captured value and an upstream response, and
/// answers with their concatenation.
fn service_handler(upstream: Uri) -> Handler {
    service_handler_with_suffix(upstream, "")
}

fn service_handler_with_suffix(upstream: Uri, suffix: &'static str) -> Handler {
    Arc::new(move |req: Request<Bytes>| {
        let upstream = upstream.clone();
        Box::pin(async move {
            let ctx = context::context_from_request(&req);

            let value = ctx.result("test", "10".to_owned()).await;

            let playback = HttpPlayback::new(Arc::new(HyperTransport::new()));
            let upstream_req = Request::builder()
                .method(Method::GET)
                .uri(upstream)
                .body(Bytes::new())
                .unwrap();
            let upstream_body = match playback.round_trip(&ctx, upstream_req).await {
                Ok(res) => String::from_utf8_lossy(res.body()).into_owned(),
                Err(err) => format!("upstream failed: {err}"),
            };

            Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::from(format!("{upstream_body}{value}{suffix}")))
                .unwrap()
        })
    })
}

fn header<'a>(res: &'a Response<Incoming>, name: &str) -> &'a str {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

#[tokio::test]
async fn record_pass_then_replay_by_id_and_by_file() {
    let (upstream_addr, upstream_join) = spawn_upstream("served").await;
    let registry = Registry::new();
    let service = middleware::serve(
        Arc::clone(&registry),
        "127.0.0.1:0".parse().unwrap(),
        service_handler(format!("http://{upstream_addr}/data").parse().unwrap()),
    )
    .await
    .unwrap();

    let client = client();
    let service_uri: Uri = format!("http://{}/foo", service.listen_addr).parse().unwrap();

    // Record pass: the caller asks for a recording into a file.
    let req = Request::builder()
        .method(Method::POST)
        .uri(service_uri.clone())
        .header(HEADER_MODE, "Record")
        .header(HEADER_CASSETTE_PATH_TYPE, "file")
        .body(Full::new(Bytes::from_static(b"bar")))
        .unwrap();
    let res = client.request(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, HEADER_MODE), "Record");
    assert_eq!(header(&res, HEADER_SUCCESS), "true");
    assert_eq!(header(&res, HEADER_CASSETTE_PATH_TYPE), "file");
    let cassette_id = header(&res, HEADER_CASSETTE_ID).to_owned();
    let cassette_path = header(&res, HEADER_CASSETTE_PATH_NAME).to_owned();
    assert_eq!(cassette_id.len(), 6);
    assert!(!cassette_path.is_empty());
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"served10");

    // The upstream goes away; replays must never miss it.
    upstream_join.abort();

    // Replay by id.
    let req = Request::builder()
        .method(Method::POST)
        .uri(service_uri.clone())
        .header(HEADER_CASSETTE_ID, &cassette_id)
        .body(Full::new(Bytes::from_static(b"bar")))
        .unwrap();
    let res = client.request(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, HEADER_MODE), "Playback");
    assert_eq!(header(&res, HEADER_SUCCESS), "true");
    assert_eq!(header(&res, HEADER_CASSETTE_ID), cassette_id);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"served10");

    // Replay from the cassette file through a fresh registry, as a second
    // process would.
    let fresh_registry = Registry::new();
    let fresh_service = middleware::serve(
        fresh_registry,
        "127.0.0.1:0".parse().unwrap(),
        service_handler(format!("http://{upstream_addr}/data").parse().unwrap()),
    )
    .await
    .unwrap();

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/foo", fresh_service.listen_addr))
        .header(HEADER_CASSETTE_PATH_TYPE, "file")
        .header(HEADER_CASSETTE_PATH_NAME, &cassette_path)
        .body(Full::new(Bytes::from_static(b"bar")))
        .unwrap();
    let res = client.request(req).await.unwrap();

    assert_eq!(header(&res, HEADER_MODE), "Playback");
    assert_eq!(header(&res, HEADER_SUCCESS), "true");
    assert_eq!(header(&res, HEADER_CASSETTE_PATH_NAME), cassette_path);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"served10");

    fresh_service.shutdown().await;
    service.shutdown().await;
    std::fs::remove_file(&cassette_path).ok();
}

#[tokio::test]
async fn diverging_handler_gets_the_recorded_answer_and_success_false() {
    let (upstream_addr, upstream_join) = spawn_upstream("stable").await;
    let registry = Registry::new();
    let service = middleware::serve(
        Arc::clone(&registry),
        "127.0.0.1:0".parse().unwrap(),
        service_handler(format!("http://{upstream_addr}/data").parse().unwrap()),
    )
    .await
    .unwrap();

    let client = client();
    let service_uri: Uri = format!("http://{}/foo", service.listen_addr).parse().unwrap();

    let req = Request::builder()
        .method(Method::POST)
        .uri(service_uri.clone())
        .header(HEADER_MODE, "Record")
        .body(Full::new(Bytes::from_static(b"x")))
        .unwrap();
    let res = client.request(req).await.unwrap();
    let cassette_id = header(&res, HEADER_CASSETTE_ID).to_owned();
    let recorded_body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&recorded_body[..], b"stable10");

    upstream_join.abort();

    // Replay against a newer build of the handler whose output diverges.
    let diverged_service = middleware::serve(
        Arc::clone(&registry),
        "127.0.0.1:0".parse().unwrap(),
        service_handler_with_suffix(
            format!("http://{upstream_addr}/data").parse().unwrap(),
            "-v2",
        ),
    )
    .await
    .unwrap();

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/foo", diverged_service.listen_addr))
        .header(HEADER_CASSETTE_ID, &cassette_id)
        .body(Full::new(Bytes::from_static(b"x")))
        .unwrap();
    let res = client.request(req).await.unwrap();

    assert_eq!(header(&res, HEADER_MODE), "Playback");
    assert_eq!(header(&res, HEADER_SUCCESS), "false");
    // The caller still sees the recorded answer, not the diverged one.
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"stable10");

    diverged_service.shutdown().await;
    service.shutdown().await;
}

#[tokio::test]
async fn admin_routes_transfer_cassettes_over_http() {
    let registry = Registry::builder().default_mode(Mode::Record).build();
    let seeded = registry.new_cassette().unwrap();
    seeded.result("k", 99u32).await;
    let dump = seeded.marshal_to_yaml().unwrap();

    let service = middleware::serve(
        Arc::clone(&registry),
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(|req: Request<Bytes>| {
            Box::pin(async move {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(req.into_body())
                    .unwrap()
            })
        }),
    )
    .await
    .unwrap();
    let base = format!("http://{}", service.listen_addr);
    let client = client();

    // add
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("{base}/playback/add/"))
        .body(Full::new(Bytes::from(dump)))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let id = String::from_utf8(
        res.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    assert_eq!(id.len(), 6);

    // get
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("{base}/playback/get/?id={id}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let returned = res.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&returned).contains("kind: result"));

    // list
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("{base}/playback/list/"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    let listing = res.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&listing).contains(&id));

    // delete
    let req = Request::builder()
        .method(Method::DELETE)
        .uri(format!("{base}/playback/delete/?id={id}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(registry.get(&id).is_none());

    // unknown id is a 404
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("{base}/playback/get/?id={id}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    service.shutdown().await;
}

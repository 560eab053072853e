use std::{fmt::Write as _, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Response};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use md5::{Digest as _, Md5};
use regex::Regex;

use crate::{
    cassette::Cassette,
    context::Context,
    errors::{Error, RecordedError, spawn_guarded},
    httpwire::{
        clone_request, clone_response, dump_request, dump_response, read_request, read_response,
        to_curl,
    },
    middleware::{HEADER_MODE, HEADER_SUCCESS},
    record::{Record, RecordKind},
    recorder::{BoxFuture, Recorder, run},
};

/// The outbound transport seam. Implementations own whatever client state
/// they need and return futures that do not borrow the adapter, so a record
/// pass can run the call on its own task.
pub trait HttpTransport: Send + Sync {
    fn round_trip(&self, req: Request<Bytes>) -> BoxFuture<Result<Response<Bytes>, RecordedError>>;
}

/// Wraps a transport with cassette-aware record/replay.
#[derive(Clone)]
pub struct HttpPlayback {
    transport: Arc<dyn HttpTransport>,
    exclude_header: Option<Regex>,
}

impl HttpPlayback {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            exclude_header: None,
        }
    }

    /// Headers matching the pattern are ignored while deriving the track key
    /// (trace ids, request ids). The forwarded request is not modified.
    pub fn with_exclude_header(mut self, pattern: Regex) -> Self {
        self.exclude_header = Some(pattern);
        self
    }

    /// Issues the round-trip through the context's cassette: live, recorded
    /// or replayed depending on the cassette mode.
    pub async fn round_trip(
        &self,
        ctx: &Context,
        req: Request<Bytes>,
    ) -> Result<Response<Bytes>, Error> {
        let mut recorder = HttpRecorder {
            playback: self.clone(),
            cassette: ctx.cassette().cloned(),
            req,
            res: None,
            err: None,
        };
        let run_outcome = run(ctx.cassette(), &mut recorder).await;

        if let Some(err) = recorder.err.take() {
            return Err(Error::Captured(err));
        }
        match recorder.res.take() {
            Some(res) => Ok(res),
            None => Err(run_outcome.err().unwrap_or(Error::PlaybackFailed)),
        }
    }

    /// Key and payload sides of a record for this request. The key hashes the
    /// filtered wire dump, so ignored headers do not perturb matching, while
    /// path stays a readable prefix for the diagnostic scanner.
    fn describe(&self, req: &Request<Bytes>) -> (String, String, String) {
        let filtered = self.filter_headers(req);
        let dump = dump_request(&filtered);
        let key = format!("{}?{}", req.uri().path(), md5_hex(dump.as_bytes()));
        (key, dump, to_curl(&filtered))
    }

    fn filter_headers(&self, req: &Request<Bytes>) -> Request<Bytes> {
        let mut filtered = clone_request(req);
        if let Some(pattern) = &self.exclude_header {
            let excluded: Vec<hyper::header::HeaderName> = filtered
                .headers()
                .keys()
                .filter(|name| pattern.is_match(name.as_str()))
                .cloned()
                .collect();
            for name in excluded {
                filtered.headers_mut().remove(name);
            }
        }
        filtered
    }
}

struct HttpRecorder {
    playback: HttpPlayback,
    cassette: Option<Arc<Cassette>>,
    req: Request<Bytes>,
    res: Option<Response<Bytes>>,
    err: Option<RecordedError>,
}

impl HttpRecorder {
    async fn call_real(&mut self) -> Result<(), String> {
        let transport = Arc::clone(&self.playback.transport);
        let req = clone_request(&self.req);
        let outcome = spawn_guarded(async move { transport.round_trip(req).await }).await?;
        match outcome {
            Ok(res) => self.res = Some(res),
            Err(err) => self.err = Some(err),
        }
        Ok(())
    }
}

impl Recorder for HttpRecorder {
    async fn call(&mut self) -> Result<(), Error> {
        if let Err(payload) = self.call_real().await {
            std::panic::panic_any(payload);
        }
        Ok(())
    }

    async fn record(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return self.call().await;
        };

        let (key, dump, curl) = self.playback.describe(&self.req);
        let mut rec = Record::new(RecordKind::Http, key);
        rec.request = dump;
        rec.request_meta = curl;
        rec.id = cassette.add(rec.clone())?;

        let panicked = self.call_real().await.err();
        if let Some(res) = &self.res {
            rec.response = dump_response(res);
        }
        rec.err = self.err.clone();
        rec.panic = panicked;

        let added = cassette.add(rec.clone());
        rec.panic_if_has();
        added.map(|_| ())
    }

    async fn playback(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return Err(Error::PlaybackFailed);
        };

        let (key, dump, _) = self.playback.describe(&self.req);
        let rec = cassette.get(RecordKind::Http, &key).map_err(|_| {
            if cassette.debug() {
                tracing::debug!(key = %key, request = %dump, "no recorded exchange for request");
            }
            Error::PlaybackFailed
        })?;

        if !rec.response.is_empty() {
            let res = read_response(&rec.response).map_err(|_| Error::PlaybackFailed)?;
            self.res = Some(res);
        }
        self.err = rec.err.clone();

        rec.panic_if_has();
        if self.res.is_none() && self.err.is_none() {
            return Err(Error::PlaybackFailed);
        }
        Ok(())
    }
}

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Ready-made transport over the hyper legacy client, for services that do
/// not bring their own.
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for HyperTransport {
    fn round_trip(&self, req: Request<Bytes>) -> BoxFuture<Result<Response<Bytes>, RecordedError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let req = Request::from_parts(parts, Full::new(body));
            let res = client
                .request(req)
                .await
                .map_err(|err| RecordedError::new(err.to_string()))?;
            let (parts, body) = res.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|err| RecordedError::new(err.to_string()))?
                .to_bytes();
            Ok(Response::from_parts(parts, body))
        })
    }
}

/// Removes the echo headers playback stamps onto every response, so recorded
/// and replayed responses compare on their own content.
pub fn strip_echo_headers(res: &mut Response<Bytes>) {
    res.headers_mut().remove(HEADER_MODE);
    res.headers_mut().remove(HEADER_SUCCESS);
}

impl Cassette {
    /// Echoes the inbound request into the `(HttpRequest, "")` slot.
    pub fn set_http_request(&self, req: &Request<Bytes>) -> Result<u64, Error> {
        let mut rec = Record::new(RecordKind::HttpRequest, "");
        rec.request = dump_request(req);
        rec.request_meta = to_curl(req);
        self.add(rec)
    }

    /// Attaches the observed response to the latest inbound-request record.
    pub fn set_http_response(&self, res: &Response<Bytes>) -> Result<(), Error> {
        let mut rec = self.get_last(RecordKind::HttpRequest, "")?;
        let mut stripped = clone_response(res);
        strip_echo_headers(&mut stripped);
        rec.response = dump_response(&stripped);
        self.add(rec)?;
        Ok(())
    }

    /// Reads the recorded inbound request back, advancing its track cursor.
    pub fn http_request(&self) -> Result<Request<Bytes>, Error> {
        let rec = self.get(RecordKind::HttpRequest, "")?;
        read_request(&rec.request).map_err(|_| Error::PlaybackFailed)
    }

    /// Byte-exact dump comparison of the observed response against the
    /// recorded one, both taken without the playback echo headers.
    pub fn is_http_response_correct(&self, observed: &Response<Bytes>) -> bool {
        let Ok(rec) = self.get_last(RecordKind::HttpRequest, "") else {
            return false;
        };
        let mut stripped = clone_response(observed);
        strip_echo_headers(&mut stripped);
        dump_response(&stripped) == rec.response
    }
}

use bytes::Bytes;
use hyper::{Request, Response, StatusCode, header};

/// Errors from the HTTP/1.1 text codec. Recorders promote these to
/// `PlaybackFailed`: a dump that cannot be parsed is as good as no record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Empty,
    Truncated,
    BadStartLine(String),
    BadHeader(String),
    BadStatus(String),
    Build(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("empty dump"),
            Self::Truncated => f.write_str("dump is missing the header/body separator"),
            Self::BadStartLine(line) => write!(f, "malformed start line `{line}`"),
            Self::BadHeader(line) => write!(f, "malformed header line `{line}`"),
            Self::BadStatus(status) => write!(f, "malformed status `{status}`"),
            Self::Build(message) => write!(f, "assemble parsed message: {message}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Serializes a request as an HTTP/1.1 wire dump: start line, headers in map
/// order, blank line, body. The dump is deterministic for equal requests,
/// which makes it safe to hash into the track key.
pub fn dump_request(req: &Request<Bytes>) -> String {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), target);
    if let Some(authority) = req.uri().authority()
        && !req.headers().contains_key(header::HOST)
    {
        out.push_str("host: ");
        out.push_str(authority.as_str());
        out.push_str("\r\n");
    }
    dump_headers(&mut out, req.headers());
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(req.body()));
    out
}

/// Serializes a response as an HTTP/1.1 wire dump.
pub fn dump_response(res: &Response<Bytes>) -> String {
    let status = res.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    dump_headers(&mut out, res.headers());
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(res.body()));
    out
}

fn dump_headers(out: &mut String, headers: &hyper::HeaderMap) {
    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
}

/// Parses a request wire dump back into a request.
pub fn read_request(dump: &str) -> Result<Request<Bytes>, WireError> {
    let (start_line, header_lines, body) = split_dump(dump)?;

    let mut parts = start_line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|method| !method.is_empty())
        .ok_or_else(|| WireError::BadStartLine(start_line.to_owned()))?;
    let target = parts
        .next()
        .ok_or_else(|| WireError::BadStartLine(start_line.to_owned()))?;

    let mut builder = Request::builder().method(method).uri(target);
    for line in header_lines {
        let (name, value) = split_header(line)?;
        builder = builder.header(name, value);
    }
    builder
        .body(Bytes::from(body.to_owned()))
        .map_err(|err| WireError::Build(err.to_string()))
}

/// Parses a response wire dump back into a response.
pub fn read_response(dump: &str) -> Result<Response<Bytes>, WireError> {
    let (start_line, header_lines, body) = split_dump(dump)?;

    let status_raw = start_line
        .split(' ')
        .nth(1)
        .ok_or_else(|| WireError::BadStartLine(start_line.to_owned()))?;
    let status: StatusCode = status_raw
        .parse()
        .map_err(|_| WireError::BadStatus(status_raw.to_owned()))?;

    let mut builder = Response::builder().status(status);
    for line in header_lines {
        let (name, value) = split_header(line)?;
        builder = builder.header(name, value);
    }
    builder
        .body(Bytes::from(body.to_owned()))
        .map_err(|err| WireError::Build(err.to_string()))
}

fn split_dump(dump: &str) -> Result<(&str, Vec<&str>, &str), WireError> {
    if dump.is_empty() {
        return Err(WireError::Empty);
    }
    let (head, body) = dump.split_once("\r\n\r\n").ok_or(WireError::Truncated)?;

    let mut lines = head.split("\r\n");
    let start_line = lines.next().ok_or(WireError::Empty)?;
    Ok((start_line, lines.collect(), body))
}

fn split_header(line: &str) -> Result<(&str, &str), WireError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| WireError::BadHeader(line.to_owned()))?;
    Ok((name.trim(), value.trim_start()))
}

/// Human-readable rendering of the request, stored as the record's request
/// meta so a missed exchange can be reproduced by hand.
pub fn to_curl(req: &Request<Bytes>) -> String {
    let url = req.uri().to_string();
    let mut out = format!("curl -X {} '{}'", req.method(), url);
    for (name, value) in req.headers() {
        out.push_str(&format!(
            " -H '{}: {}'",
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes())
        ));
    }
    if !req.body().is_empty() {
        out.push_str(&format!(" -d '{}'", String::from_utf8_lossy(req.body())));
    }
    out
}

pub fn clone_request(req: &Request<Bytes>) -> Request<Bytes> {
    let mut cloned = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version())
        .body(req.body().clone())
        .expect("cloning a valid request cannot fail");
    *cloned.headers_mut() = req.headers().clone();
    cloned.extensions_mut().clone_from(req.extensions());
    cloned
}

pub fn clone_response(res: &Response<Bytes>) -> Response<Bytes> {
    let mut cloned = Response::builder()
        .status(res.status())
        .version(res.version())
        .body(res.body().clone())
        .expect("cloning a valid response cannot fail");
    *cloned.headers_mut() = res.headers().clone();
    cloned
}

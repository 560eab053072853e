use std::sync::Arc;

use hyper::Request;

use crate::cassette::Cassette;

/// Per-request ambient state: the cassette the current call scope records to
/// or replays from. Cloning is cheap; the cassette handle is shared.
#[derive(Clone, Default)]
pub struct Context {
    cassette: Option<Arc<Cassette>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cassette(cassette: Arc<Cassette>) -> Self {
        Self {
            cassette: Some(cassette),
        }
    }

    pub fn cassette(&self) -> Option<&Arc<Cassette>> {
        self.cassette.as_ref()
    }

    /// A fresh context carrying the same cassette and nothing else, suitable
    /// for outbound calls issued on behalf of the inbound request.
    pub fn proxy(&self) -> Context {
        Context {
            cassette: self.cassette.clone(),
        }
    }
}

/// Installs the cassette into the request's extensions so downstream
/// recorders can find it.
pub fn install_cassette<B>(req: &mut Request<B>, cassette: Arc<Cassette>) {
    req.extensions_mut().insert(cassette);
}

/// The cassette previously installed into the request, if any.
pub fn cassette_from_request<B>(req: &Request<B>) -> Option<Arc<Cassette>> {
    req.extensions().get::<Arc<Cassette>>().cloned()
}

/// Context view of a request: what outbound recorders should run against.
pub fn context_from_request<B>(req: &Request<B>) -> Context {
    Context {
        cassette: cassette_from_request(req),
    }
}

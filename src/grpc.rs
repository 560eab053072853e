use std::{any::type_name, collections::HashMap, future::Future, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    cassette::Cassette,
    context::Context,
    errors::{Error, RecordedError},
    middleware::{
        HEADER_CASSETTE_ID, HEADER_CASSETTE_PATH_NAME, HEADER_CASSETTE_PATH_TYPE, HEADER_MODE,
        HEADER_SUCCESS,
    },
    mode::{Mode, PathType},
    record::{Record, RecordKind},
    registry::Registry,
};

/// Flat metadata map: the gRPC analog of the HTTP header contract, with the
/// same tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: HashMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> &str {
        self.entries.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl Cassette {
    /// Opens the request/response pair slot: the request side is stored now,
    /// the response side is patched onto the same record later.
    pub fn set_grpc_request<T: Serialize>(&self, req: &T) -> Result<u64, Error> {
        let mut rec = Record::new(RecordKind::GrpcRequest, "");
        rec.request_meta = type_name::<T>().to_owned();
        rec.request = serde_json::to_string(req)?;
        self.add(rec)
    }

    /// Fills the response side of the latest pair record, in place.
    pub fn set_grpc_response<T: Serialize>(&self, res: &T) -> Result<(), Error> {
        let mut rec = self.get_last(RecordKind::GrpcRequest, "")?;
        rec.response_meta = type_name::<T>().to_owned();
        rec.response = serde_json::to_string(res)?;
        self.add(rec)?;
        Ok(())
    }

    /// Reads the recorded inbound request back, advancing the pair track.
    pub fn grpc_request<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let rec = self.get(RecordKind::GrpcRequest, "")?;
        serde_json::from_str(&rec.request).map_err(|_| Error::PlaybackFailed)
    }

    /// Deep equality against the recorded response, after pushing both sides
    /// through the serializer twice so representation differences wash out.
    pub fn is_grpc_response_correct<T>(&self, observed: &T) -> bool
    where
        T: Serialize + DeserializeOwned,
    {
        let Ok(rec) = self.get_last(RecordKind::GrpcRequest, "") else {
            return false;
        };
        let Ok(stored) = serde_json::from_str::<T>(&rec.response) else {
            return false;
        };
        match (normalize(&stored), normalize(observed)) {
            (Ok(stored), Ok(observed)) => stored == observed,
            _ => false,
        }
    }
}

fn normalize<T: Serialize>(value: &T) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_string(value).and_then(|raw| serde_json::from_str(&raw))
}

/// Unary interceptor: resolves the per-call cassette from incoming metadata,
/// records or verifies the exchange, and returns the response metadata
/// tokens the caller should send back.
pub async fn intercept_unary<Req, Res, H, Fut>(
    registry: &Arc<Registry>,
    incoming: &Metadata,
    req: Req,
    handler: H,
) -> (Result<Res, RecordedError>, Metadata)
where
    Req: Serialize + DeserializeOwned,
    Res: Serialize + DeserializeOwned,
    H: FnOnce(Context, Req) -> Fut,
    Fut: Future<Output = Result<Res, RecordedError>>,
{
    let cassette = match registry.incoming(
        None,
        incoming.get(HEADER_CASSETTE_ID),
        incoming.get(HEADER_MODE),
        incoming.get(HEADER_CASSETTE_PATH_TYPE),
        incoming.get(HEADER_CASSETTE_PATH_NAME),
    ) {
        Ok(cassette) => cassette,
        Err(err) => return (Err(RecordedError::new(err.to_string())), Metadata::new()),
    };
    let mode = cassette.mode();
    let ctx = Context::with_cassette(Arc::clone(&cassette));

    if mode == Mode::Record {
        let _ = cassette.set_grpc_request(&req);
    }

    let outcome = handler(ctx, req).await;

    if mode == Mode::Record
        && let Ok(res) = &outcome
    {
        let _ = cassette.set_grpc_response(res);
    }

    let mut out = Metadata::new();
    out.set(HEADER_MODE, mode.as_str());
    out.set(HEADER_CASSETTE_ID, cassette.id());
    if cassette.path_type() != PathType::Nil {
        out.set(HEADER_CASSETTE_PATH_TYPE, cassette.path_type().as_str());
    }
    let path_name = cassette.path_name();
    if !path_name.is_empty() {
        out.set(HEADER_CASSETTE_PATH_NAME, path_name);
    }
    match mode {
        Mode::Record => out.set(HEADER_SUCCESS, "true"),
        Mode::Playback => {
            let correct = match &outcome {
                Ok(res) => cassette.is_grpc_response_correct(res),
                Err(_) => false,
            };
            out.set(
                HEADER_SUCCESS,
                (correct && cassette.is_playback_succeeded()).to_string(),
            );
        }
        _ => {}
    }

    (outcome, out)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde::{Deserialize, Serialize};

    use super::{Metadata, intercept_unary};
    use crate::{
        cassette::Cassette,
        errors::RecordedError,
        middleware::{HEADER_CASSETTE_ID, HEADER_MODE, HEADER_SUCCESS},
        mode::Mode,
        registry::Registry,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u64,
        answer: String,
    }

    #[test]
    fn pair_slot_stores_request_then_response_on_one_record() {
        let cassette = Cassette::new("grpc01", Mode::Record, false);
        let req = Ping {
            seq: 1,
            note: "hi".into(),
        };
        let id = cassette.set_grpc_request(&req).unwrap();

        let res = Pong {
            seq: 1,
            answer: "ho".into(),
        };
        cassette.set_grpc_response(&res).unwrap();

        let rec = cassette
            .get_last(crate::record::RecordKind::GrpcRequest, "")
            .unwrap();
        assert_eq!(rec.id, id, "response must land on the request's record");
        assert!(rec.request.contains("\"hi\""));
        assert!(rec.response.contains("\"ho\""));

        let replayed: Ping = cassette.grpc_request().unwrap();
        assert_eq!(replayed, req);
        assert!(cassette.is_grpc_response_correct(&res));
        assert!(!cassette.is_grpc_response_correct(&Pong {
            seq: 2,
            answer: "other".into()
        }));
    }

    #[tokio::test]
    async fn unary_interceptor_records_then_verifies_replay() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let handler = |hits: Arc<AtomicUsize>| {
            move |ctx: crate::context::Context, req: Ping| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let factor = ctx.result("factor", 2u64).await;
                Ok(Pong {
                    seq: req.seq * factor,
                    answer: "done".into(),
                })
            }
        };

        let mut incoming = Metadata::new();
        incoming.set(HEADER_MODE, "Record");
        let req = Ping {
            seq: 21,
            note: "n".into(),
        };
        let (outcome, out) = intercept_unary(
            &registry,
            &incoming,
            req.clone(),
            handler(Arc::clone(&hits)),
        )
        .await;
        let res = outcome.unwrap();
        assert_eq!(res.seq, 42);
        assert_eq!(out.get(HEADER_MODE), "Record");
        assert_eq!(out.get(HEADER_SUCCESS), "true");
        let id = out.get(HEADER_CASSETTE_ID).to_owned();
        assert_eq!(id.len(), 6);

        // Replay: select the cassette by id; the handler still runs, its
        // inner result comes off the cassette, and the response must match.
        let mut incoming = Metadata::new();
        incoming.set(HEADER_CASSETTE_ID, &id);
        let (outcome, out) =
            intercept_unary(&registry, &incoming, req, handler(Arc::clone(&hits))).await;
        assert_eq!(outcome.unwrap(), res);
        assert_eq!(out.get(HEADER_MODE), "Playback");
        assert_eq!(out.get(HEADER_SUCCESS), "true");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn diverging_replay_is_stamped_unsuccessful() {
        let registry = Registry::new();

        let mut incoming = Metadata::new();
        incoming.set(HEADER_MODE, "Record");
        let (outcome, out) = intercept_unary(
            &registry,
            &incoming,
            Ping {
                seq: 1,
                note: "n".into(),
            },
            |_ctx, req: Ping| async move {
                Ok(Pong {
                    seq: req.seq,
                    answer: "first".into(),
                })
            },
        )
        .await;
        outcome.unwrap();
        let id = out.get(HEADER_CASSETTE_ID).to_owned();

        let mut incoming = Metadata::new();
        incoming.set(HEADER_CASSETTE_ID, &id);
        let (outcome, out) = intercept_unary(
            &registry,
            &incoming,
            Ping {
                seq: 1,
                note: "n".into(),
            },
            |_ctx, req: Ping| async move {
                Ok(Pong {
                    seq: req.seq,
                    answer: "diverged".into(),
                })
            },
        )
        .await;
        outcome.unwrap();
        assert_eq!(out.get(HEADER_SUCCESS), "false");
    }

    #[tokio::test]
    async fn handler_error_round_trips_through_the_outcome() {
        let registry = Registry::new();
        let mut incoming = Metadata::new();
        incoming.set(HEADER_MODE, "Record");
        let (outcome, _) = intercept_unary(
            &registry,
            &incoming,
            Ping {
                seq: 1,
                note: "n".into(),
            },
            |_ctx, _req: Ping| async move {
                Err::<Pong, _>(RecordedError::new("handler exploded"))
            },
        )
        .await;
        assert_eq!(outcome.unwrap_err(), RecordedError::new("handler exploded"));
    }
}

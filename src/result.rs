use std::{
    any::type_name,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    cassette::Cassette,
    context::Context,
    errors::{Error, RecordedError, panic_payload},
    record::{Record, RecordKind},
    recorder::{Recorder, run},
};

type Thunk<T> = Box<dyn FnOnce() -> Result<T, RecordedError> + Send>;

/// Captures a plain value or the return of a zero-argument closure, keyed by
/// a caller-chosen string. The stored type name gates replay: a playback
/// whose `T` differs from the recorded one fails instead of guessing.
pub struct ResultRecorder<T> {
    cassette: Option<Arc<Cassette>>,
    key: String,
    value: Option<T>,
    thunk: Option<Thunk<T>>,
    err: Option<RecordedError>,
}

impl<T> ResultRecorder<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    pub fn new(cassette: Option<Arc<Cassette>>, key: impl Into<String>, value: T) -> Self {
        Self {
            cassette,
            key: key.into(),
            value: Some(value),
            thunk: None,
            err: None,
        }
    }

    pub fn from_thunk(
        cassette: Option<Arc<Cassette>>,
        key: impl Into<String>,
        thunk: Thunk<T>,
    ) -> Self {
        Self {
            cassette,
            key: key.into(),
            value: None,
            thunk: Some(thunk),
            err: None,
        }
    }

    /// The materialized value: the replayed one after playback, the produced
    /// one after call/record, the passed one when playback missed.
    pub fn into_outcome(self) -> (T, Option<RecordedError>) {
        (self.value.unwrap_or_default(), self.err)
    }

    fn invoke_thunk(&mut self) {
        let Some(thunk) = self.thunk.take() else {
            return;
        };
        match thunk() {
            Ok(value) => self.value = Some(value),
            Err(err) => {
                self.err = Some(err);
                self.value = Some(T::default());
            }
        }
    }

    /// Invokes the thunk under a panic catcher; on panic the zero value is
    /// substituted and the payload is returned for the record.
    fn invoke_thunk_guarded(&mut self) -> Option<String> {
        let Some(thunk) = self.thunk.take() else {
            return None;
        };
        match catch_unwind(AssertUnwindSafe(thunk)) {
            Ok(Ok(value)) => {
                self.value = Some(value);
                None
            }
            Ok(Err(err)) => {
                self.err = Some(err);
                self.value = Some(T::default());
                None
            }
            Err(payload) => {
                self.value = Some(T::default());
                Some(panic_payload(payload))
            }
        }
    }

    fn new_record(&self) -> Result<Record, Error> {
        let mut rec = Record::new(RecordKind::Result, self.key.clone());
        rec.response_meta = type_name::<T>().to_owned();
        rec.response = serde_json::to_string(&self.value)?;
        rec.err = self.err.clone();
        Ok(rec)
    }
}

impl<T> Recorder for ResultRecorder<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    async fn call(&mut self) -> Result<(), Error> {
        self.invoke_thunk();
        Ok(())
    }

    async fn record(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return self.call().await;
        };

        let panic = self.invoke_thunk_guarded();
        let mut rec = self.new_record()?;
        rec.panic = panic.clone();

        let added = cassette.add(rec);
        if let Some(payload) = panic {
            std::panic::panic_any(payload);
        }
        added.map(|_| ())
    }

    async fn playback(&mut self) -> Result<(), Error> {
        let Some(cassette) = self.cassette.clone() else {
            return Err(Error::PlaybackFailed);
        };

        let rec = cassette
            .get(RecordKind::Result, &self.key)
            .map_err(|_| Error::PlaybackFailed)?;
        if rec.response_meta != type_name::<T>() {
            return Err(Error::PlaybackFailed);
        }

        let value: T =
            serde_json::from_str(&rec.response).map_err(|_| Error::PlaybackFailed)?;
        self.value = Some(value);
        self.err = rec.err.clone();

        rec.panic_if_has();
        Ok(())
    }
}

impl Cassette {
    /// Records or replays an opaque value under `key`.
    pub async fn result<T>(self: &Arc<Self>, key: &str, value: T) -> T
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        let mut recorder = ResultRecorder::new(Some(Arc::clone(self)), key, value);
        let _ = self.run(&mut recorder).await;
        recorder.into_outcome().0
    }

    /// Records or replays the return of a zero-argument closure. The closure
    /// runs during call/record; playback materializes from the cassette and
    /// never invokes it.
    pub async fn result_fn<T>(self: &Arc<Self>, key: &str, f: impl FnOnce() -> T + Send + 'static) -> T
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        let mut recorder =
            ResultRecorder::from_thunk(Some(Arc::clone(self)), key, Box::new(|| Ok(f())));
        let _ = self.run(&mut recorder).await;
        recorder.into_outcome().0
    }

    /// Like [`Cassette::result_fn`] for fallible closures; the captured error
    /// replays as part of the outcome.
    pub async fn result_with_error<T>(
        self: &Arc<Self>,
        key: &str,
        f: impl FnOnce() -> Result<T, RecordedError> + Send + 'static,
    ) -> Result<T, RecordedError>
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        let mut recorder = ResultRecorder::from_thunk(Some(Arc::clone(self)), key, Box::new(f));
        let _ = self.run(&mut recorder).await;
        let (value, err) = recorder.into_outcome();
        match err {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

impl Context {
    /// [`Cassette::result`] against the context's cassette; with no cassette
    /// the value passes through untouched.
    pub async fn result<T>(&self, key: &str, value: T) -> T
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        let mut recorder = ResultRecorder::new(self.cassette().cloned(), key, value);
        let _ = run(self.cassette(), &mut recorder).await;
        recorder.into_outcome().0
    }
}

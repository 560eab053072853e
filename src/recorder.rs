use std::sync::Arc;

use crate::{cassette::Cassette, errors::Error, mode::Mode};

/// Owned future type the collaborator adapters return; owning futures let
/// record paths run them on their own task for panic containment.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

/// The uniform protocol every integration point implements.
///
/// `call` invokes the real collaborator and leaves the cassette untouched;
/// `record` calls the real collaborator and appends the exchange; `playback`
/// consumes the next record from the recorder's track and materializes the
/// result. The returned error covers the protocol only — captured
/// collaborator errors are part of the recorded outcome and are delivered
/// through the recorder's own result accessors.
#[allow(async_fn_in_trait)]
pub trait Recorder {
    async fn call(&mut self) -> Result<(), Error>;
    async fn record(&mut self) -> Result<(), Error>;
    async fn playback(&mut self) -> Result<(), Error>;
}

impl Cassette {
    /// Dispatches the recorder according to the cassette mode.
    pub async fn run<R: Recorder>(&self, recorder: &mut R) -> Result<(), Error> {
        match self.mode() {
            Mode::Off => recorder.call().await,
            Mode::Record => recorder.record().await,
            Mode::Playback => recorder.playback().await,
            Mode::PlaybackOrRecord => match recorder.playback().await {
                Err(Error::PlaybackFailed) => recorder.record().await,
                outcome => outcome,
            },
            Mode::PlaybackSuccessOrRecord => match recorder.playback().await {
                Err(_) => recorder.record().await,
                outcome => outcome,
            },
        }
    }
}

/// Runs a recorder against an optional cassette; a missing cassette behaves
/// as `Mode::Off`.
pub async fn run<R: Recorder>(
    cassette: Option<&Arc<Cassette>>,
    recorder: &mut R,
) -> Result<(), Error> {
    match cassette {
        Some(cassette) => cassette.run(recorder).await,
        None => recorder.call().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Recorder, run};
    use crate::{cassette::Cassette, errors::Error, mode::Mode};

    #[derive(Default)]
    struct Probe {
        calls: Vec<&'static str>,
        playback_err: Option<Error>,
    }

    impl Recorder for Probe {
        async fn call(&mut self) -> Result<(), Error> {
            self.calls.push("call");
            Ok(())
        }

        async fn record(&mut self) -> Result<(), Error> {
            self.calls.push("record");
            Ok(())
        }

        async fn playback(&mut self) -> Result<(), Error> {
            self.calls.push("playback");
            match self.playback_err.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn cassette(mode: Mode) -> Arc<Cassette> {
        Arc::new(Cassette::new("test", mode, false))
    }

    #[tokio::test]
    async fn dispatch_follows_the_mode_table() {
        for (mode, expected) in [
            (Mode::Off, "call"),
            (Mode::Record, "record"),
            (Mode::Playback, "playback"),
        ] {
            let mut probe = Probe::default();
            cassette(mode).run(&mut probe).await.unwrap();
            assert_eq!(probe.calls, vec![expected], "mode {mode:?}");
        }
    }

    #[tokio::test]
    async fn playback_or_record_falls_through_on_playback_failed_only() {
        let mut probe = Probe {
            playback_err: Some(Error::PlaybackFailed),
            ..Probe::default()
        };
        cassette(Mode::PlaybackOrRecord).run(&mut probe).await.unwrap();
        assert_eq!(probe.calls, vec!["playback", "record"]);

        let mut probe = Probe {
            playback_err: Some(Error::CassetteLocked),
            ..Probe::default()
        };
        let err = cassette(Mode::PlaybackOrRecord)
            .run(&mut probe)
            .await
            .unwrap_err();
        assert_eq!(err, Error::CassetteLocked);
        assert_eq!(probe.calls, vec!["playback"]);
    }

    #[tokio::test]
    async fn playback_success_or_record_falls_through_on_any_error() {
        let mut probe = Probe {
            playback_err: Some(Error::CassetteLocked),
            ..Probe::default()
        };
        cassette(Mode::PlaybackSuccessOrRecord)
            .run(&mut probe)
            .await
            .unwrap();
        assert_eq!(probe.calls, vec!["playback", "record"]);
    }

    #[tokio::test]
    async fn missing_cassette_behaves_as_off() {
        let mut probe = Probe::default();
        run(None, &mut probe).await.unwrap();
        assert_eq!(probe.calls, vec!["call"]);
    }
}

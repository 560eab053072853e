use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};

use rand::{Rng as _, distributions::Alphanumeric};
use regex::Regex;

use crate::{
    cassette::Cassette,
    errors::Error,
    http::{HttpPlayback, HttpTransport},
    mode::{Mode, PathType},
    record::unmarshal_records,
    writer::{FileWriter, NamedPlaceholder},
};

const CASSETTE_ID_LEN: usize = 6;
const DEFAULT_FILE_MASK: &str = "playback.*.yml";

/// Process-wide directory of live cassettes, keyed by short id.
///
/// The registry brokers cassettes between the recording and the replaying
/// process: a test records through one service instance, ships the id (or
/// the serialized cassette) to another, and replays there.
#[derive(Debug)]
pub struct Registry {
    cassettes: RwLock<HashMap<String, Arc<Cassette>>>,
    default_mode: Mode,
    with_file: bool,
    file_mask: String,
    ttl: Option<Duration>,
    debug: bool,
    exclude_header: Option<Regex>,
}

pub struct RegistryBuilder {
    default_mode: Mode,
    with_file: bool,
    file_mask: String,
    ttl: Option<Duration>,
    debug: bool,
    exclude_header: Option<Regex>,
}

impl RegistryBuilder {
    pub fn default_mode(mut self, mode: Mode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Attach a temp-file writer to every cassette created in a non-Off mode.
    pub fn with_file(mut self, with_file: bool) -> Self {
        self.with_file = with_file;
        self
    }

    /// Temp-file name mask, `prefix.*.suffix` style.
    pub fn file_mask(mut self, mask: impl Into<String>) -> Self {
        self.file_mask = mask.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Headers matching the pattern are ignored during HTTP key derivation.
    pub fn exclude_header(mut self, pattern: Regex) -> Self {
        self.exclude_header = Some(pattern);
        self
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            cassettes: RwLock::new(HashMap::new()),
            default_mode: self.default_mode,
            with_file: self.with_file,
            file_mask: self.file_mask,
            ttl: self.ttl,
            debug: self.debug,
            exclude_header: self.exclude_header,
        })
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            default_mode: Mode::from_env(),
            with_file: false,
            file_mask: DEFAULT_FILE_MASK.to_owned(),
            ttl: None,
            debug: false,
            exclude_header: None,
        }
    }

    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn default_mode(&self) -> Mode {
        self.default_mode
    }

    /// An outbound HTTP wrapper carrying the registry's header exclusion.
    pub fn http_playback(&self, transport: Arc<dyn HttpTransport>) -> HttpPlayback {
        let playback = HttpPlayback::new(transport);
        match &self.exclude_header {
            Some(pattern) => playback.with_exclude_header(pattern.clone()),
            None => playback,
        }
    }

    /// Creates and registers a fresh cassette under a new id, in the
    /// registry's default mode, with a temp-file writer when configured.
    pub fn new_cassette(self: &Arc<Self>) -> Result<Arc<Cassette>, Error> {
        let cassette = Arc::new(Cassette::new(
            self.unused_id(),
            self.default_mode,
            self.debug,
        ));
        if self.with_file && self.default_mode != Mode::Off {
            self.attach_file(&cassette)?;
        }
        self.add(Arc::clone(&cassette));
        Ok(cassette)
    }

    /// Registers a cassette and schedules its TTL expiry.
    pub fn add(self: &Arc<Self>, cassette: Arc<Cassette>) {
        let id = cassette.id().to_owned();
        self.cassettes
            .write()
            .expect("registry lock poisoned")
            .insert(id.clone(), cassette);
        self.schedule_ttl(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Cassette>> {
        self.cassettes
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn delete(&self, id: &str) -> bool {
        self.cassettes
            .write()
            .expect("registry lock poisoned")
            .remove(id)
            .is_some()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cassettes
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Deserializes a cassette document, registers the cassette and sets it
    /// up for playback.
    pub fn cassette_from_yaml(self: &Arc<Self>, dump: &[u8]) -> Result<Arc<Cassette>, Error> {
        if dump.is_empty() {
            return Err(Error::PlaybackFailed);
        }
        let records = unmarshal_records(dump)?;

        let cassette = Arc::new(Cassette::new(self.unused_id(), Mode::Playback, self.debug));
        cassette.load(records);
        self.add(Arc::clone(&cassette));
        Ok(cassette)
    }

    /// Loads a cassette file. The writer becomes a read-only placeholder
    /// bearing the file's name, so the path stays reportable while writes
    /// are discarded.
    pub fn cassette_from_file(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
    ) -> Result<Arc<Cassette>, Error> {
        let path = path.as_ref();
        let dump = std::fs::read(path)?;
        let cassette = self.cassette_from_yaml(&dump)?;
        cassette.set_writer(Box::new(NamedPlaceholder::file(path)));
        Ok(cassette)
    }

    /// Attaches a fresh temp-file writer named by the registry's file mask.
    pub fn attach_file(&self, cassette: &Arc<Cassette>) -> Result<(), Error> {
        let (prefix, suffix) = self
            .file_mask
            .split_once('*')
            .unwrap_or((DEFAULT_FILE_MASK, ""));
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile()
            .map_err(|err| Error::Io(err.to_string()))?;
        let (file, path) = file.keep().map_err(|err| Error::Io(err.to_string()))?;
        cassette.set_writer(Box::new(FileWriter::new(file, path)));
        Ok(())
    }

    /// Resolves the cassette an inbound call should run against, in header
    /// precedence order: context, registry id, file path, fresh cassette.
    pub fn incoming(
        self: &Arc<Self>,
        existing: Option<Arc<Cassette>>,
        id: &str,
        mode: &str,
        path_type: &str,
        path_name: &str,
    ) -> Result<Arc<Cassette>, Error> {
        if let Some(cassette) = existing {
            return Ok(cassette);
        }

        if !id.is_empty()
            && let Some(cassette) = self.get(id)
        {
            cassette.set_mode(Mode::Playback).rewind();
            return Ok(cassette);
        }

        if path_type.parse() == Ok(PathType::File)
            && !path_name.is_empty()
            && let Ok(cassette) = self.cassette_from_file(path_name)
        {
            return Ok(cassette);
        }

        let cassette = self.new_cassette()?;
        if mode.parse() == Ok(Mode::Record) {
            cassette.set_mode(Mode::Record);
            if path_type.parse() == Ok(PathType::File) && cassette.path_type() == PathType::Nil {
                self.attach_file(&cassette)?;
            }
        }
        Ok(cassette)
    }

    fn unused_id(&self) -> String {
        let cassettes = self.cassettes.read().expect("registry lock poisoned");
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(CASSETTE_ID_LEN)
                .map(char::from)
                .collect();
            if !cassettes.contains_key(&id) {
                return id;
            }
        }
    }

    fn schedule_ttl(self: &Arc<Self>, id: String) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(registry) = registry.upgrade()
                && registry.delete(&id)
            {
                tracing::debug!(cassette_id = %id, "cassette expired by ttl");
            }
        });
    }
}

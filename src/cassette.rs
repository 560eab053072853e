use std::{
    collections::HashMap,
    sync::RwLock,
};

use crate::{
    errors::Error,
    mode::{Mode, PathType, SyncMode},
    record::{Record, RecordKind, marshal_fragment},
    writer::CassetteWriter,
};

/// Ordered sequence of records sharing a `(kind, key)` with a replay cursor.
#[derive(Debug)]
struct Track {
    cursor: usize,
    records: Vec<Record>,
}

impl Track {
    fn new() -> Self {
        Self {
            cursor: 0,
            records: Vec::with_capacity(2),
        }
    }

    fn exhausted(&self) -> bool {
        self.cursor == self.records.len()
    }
}

/// Location of a record inside the track store; the per-id index and the
/// track vector address the same owned entry.
#[derive(Debug, Clone)]
struct Slot {
    kind: RecordKind,
    key: String,
    pos: usize,
}

#[derive(Debug)]
struct State {
    mode: Mode,
    sync_mode: SyncMode,
    debug: bool,
    locked: bool,
    err: Option<Error>,
    next_id: u64,
    tracks: HashMap<RecordKind, HashMap<String, Track>>,
    index: HashMap<u64, Slot>,
    writer: Option<Box<dyn CassetteWriter>>,
}

impl State {
    fn write_fragment(&mut self, rec: &Record) -> Result<(), Error> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if writer.read_only() {
            return Ok(());
        }

        let fragment = marshal_fragment(std::slice::from_ref(rec))?;
        writer.append(&fragment)?;
        if self.sync_mode == SyncMode::EveryChange {
            writer.sync()?;
        }
        Ok(())
    }
}

/// The ordered multi-track log for one test/request scope.
///
/// Shared as `Arc<Cassette>`; a single reader-writer lock guards all mutable
/// state, so a cassette may be driven from many tasks at once.
#[derive(Debug)]
pub struct Cassette {
    id: String,
    state: RwLock<State>,
}

impl Cassette {
    pub fn new(id: impl Into<String>, mode: Mode, debug: bool) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(State {
                mode,
                sync_mode: SyncMode::Default,
                debug,
                locked: false,
                err: None,
                next_id: 0,
                tracks: HashMap::with_capacity(5),
                index: HashMap::with_capacity(10),
                writer: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> Mode {
        self.state.read().expect("cassette lock poisoned").mode
    }

    pub fn set_mode(&self, mode: Mode) -> &Self {
        self.state.write().expect("cassette lock poisoned").mode = mode;
        self
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.state.read().expect("cassette lock poisoned").sync_mode
    }

    pub fn set_sync_mode(&self, sync_mode: SyncMode) -> &Self {
        self.state.write().expect("cassette lock poisoned").sync_mode = sync_mode;
        self
    }

    pub fn debug(&self) -> bool {
        self.state.read().expect("cassette lock poisoned").debug
    }

    pub fn set_debug(&self, debug: bool) -> &Self {
        self.state.write().expect("cassette lock poisoned").debug = debug;
        self
    }

    /// The last track failure, latched until `rewind` or `reset`.
    pub fn error(&self) -> Option<Error> {
        self.state
            .read()
            .expect("cassette lock poisoned")
            .err
            .clone()
    }

    pub fn set_writer(&self, writer: Box<dyn CassetteWriter>) {
        self.state.write().expect("cassette lock poisoned").writer = Some(writer);
    }

    pub fn path_type(&self) -> PathType {
        let state = self.state.read().expect("cassette lock poisoned");
        state
            .writer
            .as_ref()
            .map(|writer| writer.path_type())
            .unwrap_or(PathType::Nil)
    }

    pub fn path_name(&self) -> String {
        let state = self.state.read().expect("cassette lock poisoned");
        state
            .writer
            .as_ref()
            .map(|writer| writer.name().to_owned())
            .unwrap_or_default()
    }

    /// Appends a record, assigning an id when it has none. A record that
    /// already carries a known id is updated in place instead of appended;
    /// either way the serialized fragment goes to the writer.
    pub fn add(&self, mut rec: Record) -> Result<u64, Error> {
        let mut state = self.state.write().expect("cassette lock poisoned");
        if state.locked {
            state.err = Some(Error::CassetteLocked);
            return Err(Error::CassetteLocked);
        }

        let id = Self::place(&mut state, &mut rec);
        state.write_fragment(&rec)?;
        Ok(id)
    }

    /// Loads records parsed from a serialized document, preserving their ids
    /// and bypassing the writer.
    pub fn load(&self, records: Vec<Record>) {
        let mut state = self.state.write().expect("cassette lock poisoned");
        for mut rec in records {
            Self::place(&mut state, &mut rec);
        }
    }

    fn place(state: &mut State, rec: &mut Record) -> u64 {
        if rec.id == 0 {
            state.next_id += 1;
            rec.id = state.next_id;
        } else if rec.id > state.next_id {
            state.next_id = rec.id;
        }
        let id = rec.id;

        if let Some(slot) = state.index.get(&id).cloned() {
            let existing = state
                .tracks
                .get_mut(&slot.kind)
                .and_then(|keyed| keyed.get_mut(&slot.key))
                .and_then(|track| track.records.get_mut(slot.pos));
            if let Some(existing) = existing {
                *existing = rec.clone();
                return id;
            }
        }

        let track = state
            .tracks
            .entry(rec.kind)
            .or_insert_with(|| HashMap::with_capacity(5))
            .entry(rec.key.clone())
            .or_insert_with(Track::new);
        track.records.push(rec.clone());
        let slot = Slot {
            kind: rec.kind,
            key: rec.key.clone(),
            pos: track.records.len() - 1,
        };
        state.index.insert(id, slot);
        id
    }

    /// Returns the next due record of the `(kind, key)` track and advances
    /// its cursor. A miss latches the cassette error.
    pub fn get(&self, kind: RecordKind, key: &str) -> Result<Record, Error> {
        let mut state = self.state.write().expect("cassette lock poisoned");

        let due = state
            .tracks
            .get_mut(&kind)
            .and_then(|keyed| keyed.get_mut(key))
            .and_then(|track| {
                let rec = track.records.get(track.cursor).cloned()?;
                track.cursor += 1;
                Some(rec)
            });
        match due {
            Some(rec) => Ok(rec),
            None => {
                state.err = Some(Error::CassetteGetFailed);
                if state.debug {
                    log_miss(&state, kind, key);
                }
                Err(Error::CassetteGetFailed)
            }
        }
    }

    /// Returns the final record of the track without touching the cursor.
    pub fn get_last(&self, kind: RecordKind, key: &str) -> Result<Record, Error> {
        let state = self.state.read().expect("cassette lock poisoned");
        state
            .tracks
            .get(&kind)
            .and_then(|keyed| keyed.get(key))
            .and_then(|track| track.records.last())
            .cloned()
            .ok_or(Error::CassetteGetFailed)
    }

    /// Diagnostic lookup: the next due record of the first track of `kind`
    /// whose key starts with `prefix`.
    pub fn get_by_prefix(&self, kind: RecordKind, prefix: &str) -> Option<Record> {
        let state = self.state.read().expect("cassette lock poisoned");
        find_by_prefix(&state, kind, prefix)
    }

    /// Zeroes every cursor and clears the latched error; records survive.
    pub fn rewind(&self) -> &Self {
        let mut state = self.state.write().expect("cassette lock poisoned");
        state.err = None;
        for keyed in state.tracks.values_mut() {
            for track in keyed.values_mut() {
                track.cursor = 0;
            }
        }
        self
    }

    /// Drops every track, the id counter and the latched error.
    pub fn reset(&self) {
        let mut state = self.state.write().expect("cassette lock poisoned");
        state.err = None;
        state.next_id = 0;
        state.tracks = HashMap::with_capacity(5);
        state.index = HashMap::with_capacity(10);
    }

    /// Refuses further `add`s and flushes the writer.
    pub fn lock(&self) {
        let mut state = self.state.write().expect("cassette lock poisoned");
        state.locked = true;
        if let Some(writer) = state.writer.as_mut() {
            let _ = writer.sync();
        }
    }

    pub fn unlock(&self) {
        self.state.write().expect("cassette lock poisoned").locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.state.read().expect("cassette lock poisoned").locked
    }

    /// Locks the cassette and closes its writer.
    pub fn finalize(&self) -> Result<(), Error> {
        self.lock();
        let mut state = self.state.write().expect("cassette lock poisoned");
        if let Some(writer) = state.writer.as_mut() {
            writer.close()?;
        }
        Ok(())
    }

    /// True iff the cassette replayed cleanly: Playback mode, no latched
    /// error, and every track exhausted except the inbound-request echo
    /// slots, which are recorded once and never consumed by the handler.
    pub fn is_playback_succeeded(&self) -> bool {
        let state = self.state.read().expect("cassette lock poisoned");
        if state.mode != Mode::Playback || state.err.is_some() {
            return false;
        }

        for (kind, keyed) in &state.tracks {
            if kind.is_inbound_echo() {
                continue;
            }
            if keyed.values().any(|track| !track.exhausted()) {
                return false;
            }
        }
        true
    }

    /// Dumps every record grouped per track. Track iteration order is not
    /// defined; consumers treat the output as an unordered set of track
    /// blocks.
    pub fn marshal_to_yaml(&self) -> Result<String, Error> {
        let state = self.state.read().expect("cassette lock poisoned");
        let mut out = String::new();
        for keyed in state.tracks.values() {
            for track in keyed.values() {
                out.push_str(&marshal_fragment(&track.records)?);
            }
        }
        Ok(out)
    }
}

fn find_by_prefix(state: &State, kind: RecordKind, prefix: &str) -> Option<Record> {
    let keyed = state.tracks.get(&kind)?;
    for (key, track) in keyed {
        if key.starts_with(prefix) {
            return track.records.get(track.cursor).cloned();
        }
    }
    None
}

fn log_miss(state: &State, kind: RecordKind, key: &str) {
    let prefix = key.split('?').next().unwrap_or(key);
    if let Some(candidate) = find_by_prefix(state, kind, prefix) {
        tracing::debug!(
            kind = ?kind,
            requested_key = key,
            candidate_key = %candidate.key,
            diff = %diff_lines(key, &candidate.key),
            candidate_request = %candidate.request,
            "cassette miss; nearest candidate by key prefix"
        );
        return;
    }

    let known_keys: Vec<&String> = state
        .tracks
        .get(&kind)
        .map(|keyed| keyed.keys().collect())
        .unwrap_or_default();
    tracing::debug!(
        kind = ?kind,
        requested_key = key,
        known_keys = ?known_keys,
        "cassette miss; no candidate shares the key prefix"
    );
}

fn diff_lines(requested: &str, matched: &str) -> String {
    let mut out = String::new();
    let mut matched_lines = matched.lines();
    for requested_line in requested.lines() {
        match matched_lines.next() {
            Some(matched_line) if matched_line == requested_line => {
                out.push_str("  ");
                out.push_str(requested_line);
            }
            Some(matched_line) => {
                out.push_str("- ");
                out.push_str(requested_line);
                out.push_str("\n+ ");
                out.push_str(matched_line);
            }
            None => {
                out.push_str("- ");
                out.push_str(requested_line);
            }
        }
        out.push('\n');
    }
    for extra in matched_lines {
        out.push_str("+ ");
        out.push_str(extra);
        out.push('\n');
    }
    out
}

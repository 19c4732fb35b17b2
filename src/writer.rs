use anyhow::{format_err, Result};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::{
    io::Write,
    mem,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

use crate::{
    config::DataLogConfig,
    error::DataLogError,
    format,
    registry::{EntryInfo, EntryRegistry, StartOutcome, SCHEMA_PREFIX},
    sink::{ChunkOutcome, FileSink, LogSink, StreamSink},
};

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Source of "now" for callers that pass a timestamp of 0.
pub trait TimeProvider: Send + Sync {
    /// Current time in microseconds.
    fn get_time(&self) -> u64;
}

/// Microseconds elapsed since the clock was created.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}

impl TimeProvider for MonotonicClock {
    fn get_time(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// Counters for operators; none of these failures reach producers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataLogStats {
    /// Bytes the sink accepted for its destination.
    pub bytes_written: u64,
    /// Bytes the sink dropped because it could not take another segment.
    pub discarded_bytes: u64,
    pub write_failures: u64,
    pub dropped_records: u64,
    pub buffered_bytes: usize,
}

enum Command {
    /// Drain now instead of waiting for the period.
    Drain,
    Shutdown,
}

/// A binary data log written by a background thread.
///
/// The handle is cheap to clone and every method may be called from any
/// thread. Records from different threads land in the order their calls took
/// the internal lock, which need not match their timestamps.
///
/// Closing is final: [`DataLog::close`] writes out everything buffered, and
/// every later call fails with [`DataLogError::Closed`]. Dropping the last
/// clone closes the log.
#[derive(Clone)]
pub struct DataLog {
    inner: Arc<Handle>,
}

struct Handle {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    sink: Mutex<Box<dyn LogSink>>,
    clock: Arc<dyn TimeProvider>,
    extra_header: String,
    max_buffered_bytes: usize,
    commands: Sender<Command>,
    bytes_written: AtomicU64,
    discarded_bytes: AtomicU64,
    write_failures: AtomicU64,
    dropped_records: AtomicU64,
}

pub(crate) struct State {
    pub(crate) registry: EntryRegistry,
    buffer: Vec<u8>,
    /// Offsets into `buffer` where a segment ends.
    segment_ends: Vec<usize>,
    paused: bool,
    stopped: bool,
    closed: bool,
    /// Set once the buffer crossed half its bound, until a drain succeeds.
    drain_requested: bool,
    /// Set while data records are being dropped, to warn once per episode.
    overflowing: bool,
}

impl DataLog {
    /// Logs to a stream, such as an in-memory buffer or a socket.
    pub fn new(writer: impl Write + Send + 'static, config: DataLogConfig) -> Result<DataLog> {
        DataLog::with_sink(StreamSink::new(writer), config)
    }

    /// Logs to `dir/filename`. An empty filename picks a generated one.
    /// The file is created by the first flush, so a bad directory only shows
    /// up in [`DataLog::stats`].
    pub fn create_file(
        dir: impl AsRef<Path>,
        filename: &str,
        config: DataLogConfig,
    ) -> Result<DataLog> {
        DataLog::with_sink(FileSink::new(dir.as_ref(), filename), config)
    }

    pub fn with_sink(sink: impl LogSink + 'static, config: DataLogConfig) -> Result<DataLog> {
        let (sender, recv) = kanal::unbounded::<Command>();

        let mut buffer = Vec::with_capacity(INITIAL_BUFFER_CAPACITY);
        format::write_file_header(&mut buffer, &config.extra_header);

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                registry: EntryRegistry::default(),
                buffer,
                segment_ends: Vec::new(),
                paused: false,
                stopped: false,
                closed: false,
                drain_requested: false,
                overflowing: false,
            }),
            sink: Mutex::new(Box::new(sink)),
            clock: config
                .time_provider
                .unwrap_or_else(|| Arc::new(MonotonicClock::default())),
            extra_header: config.extra_header,
            max_buffered_bytes: config.max_buffered_bytes,
            commands: sender.clone(),
            bytes_written: AtomicU64::new(0),
            discarded_bytes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            dropped_records: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let period = config.period;
            thread::Builder::new()
                .name("datalog-writer".to_string())
                .spawn(move || run_writer(&shared, &recv, period))?
        };

        Ok(DataLog {
            inner: Arc::new(Handle {
                shared,
                commands: sender,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Starts an entry, or takes another reference to a live one.
    ///
    /// Starting a live name with the same type returns its id without writing
    /// anything. Starting it with a different type returns 0, which every
    /// append ignores.
    pub fn start(&self, name: &str, r#type: &str, metadata: &str, timestamp: u64) -> Result<u32> {
        let shared = self.shared();
        let timestamp = shared.resolve(timestamp);
        let size = format::payload_size(format::start_payload_len(name, r#type, metadata))?;
        let mut state = shared.lock_open()?;

        match state.registry.start(name, r#type, metadata) {
            StartOutcome::Created(id) => {
                if !state.stopped {
                    state.push_start(id, size, name, r#type, metadata, timestamp);
                }
                debug!(entry = id, name, r#type, "started entry");
                Ok(id)
            }
            StartOutcome::Existing(id) => Ok(id),
            StartOutcome::Conflict { existing_type } => {
                warn!(
                    name,
                    r#type,
                    existing_type = existing_type.as_str(),
                    "entry already started with a different type"
                );
                Ok(0)
            }
            StartOutcome::Exhausted => {
                error!(name, "no entry ids left");
                Ok(0)
            }
        }
    }

    /// Drops one reference to an entry and records a Finish for it.
    pub fn finish(&self, entry: u32, timestamp: u64) -> Result<()> {
        let shared = self.shared();
        let timestamp = shared.resolve(timestamp);
        let mut state = shared.lock_open()?;

        if entry == 0 {
            return Ok(());
        }

        match state.registry.finish(entry) {
            Some(_) if !state.stopped => {
                let size = format::FINISH_PAYLOAD_SIZE as u32;
                format::write_record_header(&mut state.buffer, 0, size, timestamp);
                format::write_finish_payload(&mut state.buffer, entry);
            }
            Some(_) => {}
            None => debug!(entry, "finish for unknown entry"),
        }

        Ok(())
    }

    /// Replaces an entry's metadata. A record is written even when it did not change.
    pub fn set_metadata(&self, entry: u32, metadata: &str, timestamp: u64) -> Result<()> {
        let shared = self.shared();
        let timestamp = shared.resolve(timestamp);
        let size = format::payload_size(format::set_metadata_payload_len(metadata))?;
        let mut state = shared.lock_open()?;

        if entry == 0 {
            return Ok(());
        }

        if !state.registry.set_metadata(entry, metadata) {
            debug!(entry, "metadata for unknown entry");
            return Ok(());
        }

        if !state.stopped {
            format::write_record_header(&mut state.buffer, 0, size, timestamp);
            format::write_set_metadata_payload(&mut state.buffer, entry, metadata);
        }

        Ok(())
    }

    /// Registers a schema under `name`, stored as the single data record of
    /// entry `/.schema/<name>`. Only the first registration of a name counts.
    pub fn add_schema(
        &self,
        name: &str,
        r#type: &str,
        schema: &[u8],
        timestamp: u64,
    ) -> Result<()> {
        let shared = self.shared();
        let timestamp = shared.resolve(timestamp);
        let entry_name = format!("{SCHEMA_PREFIX}{name}");
        let start_size = format::payload_size(format::start_payload_len(&entry_name, r#type, ""))?;
        let schema_size = format::payload_size(schema.len())?;
        let mut state = shared.lock_open()?;

        if state.registry.has_schema(name) {
            return Ok(());
        }

        let id = match state.registry.start(&entry_name, r#type, "") {
            StartOutcome::Created(id) => {
                if !state.stopped {
                    state.push_start(id, start_size, &entry_name, r#type, "", timestamp);
                }
                id
            }
            StartOutcome::Existing(id) => id,
            StartOutcome::Conflict { existing_type } => {
                warn!(
                    name,
                    r#type,
                    existing_type = existing_type.as_str(),
                    "schema entry already started with a different type"
                );
                return Ok(());
            }
            StartOutcome::Exhausted => {
                error!(name, "no entry ids left for schema");
                return Ok(());
            }
        };

        state.registry.add_schema(name, id, schema);
        if !state.stopped {
            format::write_record_header(&mut state.buffer, id, schema_size, timestamp);
            state.buffer.extend_from_slice(schema);
        }

        Ok(())
    }

    pub fn add_schema_str(
        &self,
        name: &str,
        r#type: &str,
        schema: &str,
        timestamp: u64,
    ) -> Result<()> {
        self.add_schema(name, r#type, schema.as_bytes(), timestamp)
    }

    pub fn has_schema(&self, name: &str) -> Result<bool> {
        Ok(self.shared().lock_open()?.registry.has_schema(name))
    }

    /// Stops writing data records until [`DataLog::resume`]. Entry control
    /// records are still written.
    pub fn pause(&self) -> Result<()> {
        self.shared().lock_open()?.paused = true;
        Ok(())
    }

    /// Undoes [`DataLog::pause`] and [`DataLog::stop`].
    ///
    /// After a stop this begins a new segment that opens with Start records
    /// for every live entry and the bodies of all registered schemas, so it
    /// can be read on its own.
    pub fn resume(&self) -> Result<()> {
        let shared = self.shared();
        let timestamp = shared.resolve(0);
        let mut state = shared.lock_open()?;

        state.paused = false;
        if state.stopped {
            state.stopped = false;
            state.begin_segment(&shared.extra_header, timestamp);
            debug!("resumed stopped log");
        }

        Ok(())
    }

    /// Ends the current segment: everything buffered is written and the file
    /// closed. Until [`DataLog::resume`] nothing is written.
    pub fn stop(&self) -> Result<()> {
        let shared = self.shared();
        {
            let mut state = shared.lock_open()?;
            if state.stopped {
                return Ok(());
            }

            state.stopped = true;
            let end = state.buffer.len();
            state.segment_ends.push(end);
        }

        shared.drain();
        Ok(())
    }

    /// Writes everything buffered so far on the calling thread.
    pub fn flush(&self) -> Result<()> {
        let shared = self.shared();
        drop(shared.lock_open()?);

        shared.drain();
        Ok(())
    }

    /// Changes the output file name. An open file is renamed in place and
    /// later segments use the new name. Rename failures are logged and counted.
    pub fn set_filename(&self, filename: &str) -> Result<()> {
        let shared = self.shared();
        drop(shared.lock_open()?);

        let mut sink = shared.sink.lock();
        if let Err(err) = sink.set_filename(filename) {
            shared.write_failures.fetch_add(1, Ordering::Relaxed);
            error!(filename, %err, "failed to rename log file");
        }

        Ok(())
    }

    /// Writes out everything buffered, ends the segment and stops the
    /// background thread.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared().lock_open()?;
            state.closed = true;
            if !state.stopped {
                let end = state.buffer.len();
                state.segment_ends.push(end);
            }
        }

        let _ = self.inner.commands.send(Command::Shutdown);
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.join() {
                return Err(format_err!("{err:#?}"));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared().state.lock().closed
    }

    pub fn is_paused(&self) -> Result<bool> {
        Ok(self.shared().lock_open()?.paused)
    }

    pub fn is_stopped(&self) -> Result<bool> {
        Ok(self.shared().lock_open()?.stopped)
    }

    /// Live entries ordered by id.
    pub fn live_entries(&self) -> Result<Vec<EntryInfo>> {
        Ok(self.shared().lock_open()?.registry.snapshot().entries)
    }

    #[must_use]
    pub fn stats(&self) -> DataLogStats {
        let shared = self.shared();
        DataLogStats {
            bytes_written: shared.bytes_written.load(Ordering::Relaxed),
            discarded_bytes: shared.discarded_bytes.load(Ordering::Relaxed),
            write_failures: shared.write_failures.load(Ordering::Relaxed),
            dropped_records: shared.dropped_records.load(Ordering::Relaxed),
            buffered_bytes: shared.state.lock().buffer.len(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !state.closed {
                state.closed = true;
                if !state.stopped {
                    let end = state.buffer.len();
                    state.segment_ends.push(end);
                }
            }
        }

        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
    }
}

impl Shared {
    pub(crate) fn resolve(&self, timestamp: u64) -> u64 {
        if timestamp == 0 {
            self.clock.get_time()
        } else {
            timestamp
        }
    }

    pub(crate) fn lock_open(&self) -> Result<MutexGuard<'_, State>, DataLogError> {
        let state = self.state.lock();
        if state.closed {
            return Err(DataLogError::Closed);
        }

        Ok(state)
    }

    /// Buffers one data record whose payload is produced by `fill`, which
    /// must append exactly `size` bytes or the record is taken back out.
    ///
    /// Returns whether the record was buffered: nothing is written for the
    /// sentinel entry, while paused or stopped, or when the buffer is full.
    pub(crate) fn append_with(
        &self,
        entry: u32,
        timestamp: u64,
        size: usize,
        fill: impl FnOnce(&mut Vec<u8>),
    ) -> Result<bool> {
        let size32 = format::payload_size(size)?;
        let timestamp = self.resolve(timestamp);
        let mut state = self.lock_open()?;

        if entry == 0 || state.paused || state.stopped {
            return Ok(false);
        }

        let record_len = format::record_len(entry, size32, timestamp);
        if state.buffer.len() + record_len > self.max_buffered_bytes {
            self.dropped_records.fetch_add(1, Ordering::Relaxed);
            if !state.overflowing {
                state.overflowing = true;
                warn!(
                    buffered = state.buffer.len(),
                    limit = self.max_buffered_bytes,
                    "log buffer full, dropping data records until the next flush"
                );
            }
            return Ok(false);
        }

        let header_start = state.buffer.len();
        format::write_record_header(&mut state.buffer, entry, size32, timestamp);
        let payload_start = state.buffer.len();
        fill(&mut state.buffer);

        let written = state.buffer.len() - payload_start;
        if written != size {
            state.buffer.truncate(header_start);
            self.dropped_records.fetch_add(1, Ordering::Relaxed);
            error!(entry, declared = size, written, "payload size mismatch, record dropped");
            return Err(DataLogError::SizeMismatch {
                declared: size,
                written,
            }
            .into());
        }

        if !state.drain_requested && state.buffer.len() > self.max_buffered_bytes / 2 {
            state.drain_requested = true;
            let _ = self.commands.send(Command::Drain);
        }

        Ok(true)
    }

    /// Hands buffered bytes to the sink. Chunks that fail to write go back to
    /// the front of the buffer for the next attempt; until a drain succeeds,
    /// producers stop requesting early drains and retries wait for the period.
    fn drain(&self) {
        let mut sink = self.sink.lock();

        let (chunk, ends) = {
            let mut state = self.state.lock();
            (
                mem::replace(&mut state.buffer, Vec::with_capacity(INITIAL_BUFFER_CAPACITY)),
                mem::take(&mut state.segment_ends),
            )
        };

        if chunk.is_empty() && ends.is_empty() {
            return;
        }

        let mut start = 0;
        for (index, end) in ends.iter().copied().chain([chunk.len()]).enumerate() {
            let segment_done = index < ends.len();

            if end > start {
                let counter = match sink.write_chunk(&chunk[start..end]) {
                    Ok(ChunkOutcome::Written) => &self.bytes_written,
                    Ok(ChunkOutcome::Discarded) => &self.discarded_bytes,
                    Err(err) => {
                        self.write_failures.fetch_add(1, Ordering::Relaxed);
                        error!(bytes = chunk.len() - start, %err, "failed to write log data");
                        self.requeue(&chunk[start..], &ends[index..], start);
                        return;
                    }
                };
                counter.fetch_add((end - start) as u64, Ordering::Relaxed);
            }

            if segment_done {
                if let Err(err) = sink.finish_segment() {
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    error!(%err, "failed to finish log segment");
                }
            }

            start = end;
        }

        let mut state = self.state.lock();
        state.drain_requested = false;
        state.overflowing = false;
    }

    fn requeue(&self, unwritten: &[u8], ends: &[usize], offset: usize) {
        let mut state = self.state.lock();

        let mut buffer = Vec::with_capacity(unwritten.len() + state.buffer.len());
        buffer.extend_from_slice(unwritten);
        buffer.extend_from_slice(&state.buffer);

        let mut segment_ends: Vec<usize> = ends.iter().map(|end| end - offset).collect();
        segment_ends.extend(state.segment_ends.iter().map(|end| end + unwritten.len()));

        state.buffer = buffer;
        state.segment_ends = segment_ends;
    }
}

impl State {
    fn push_record(&mut self, entry: u32, timestamp: u64, payload: &[u8]) {
        format::write_record_header(&mut self.buffer, entry, payload.len() as u32, timestamp);
        self.buffer.extend_from_slice(payload);
    }

    /// `size` comes from [`format::payload_size`] over the same strings.
    fn push_start(
        &mut self,
        id: u32,
        size: u32,
        name: &str,
        r#type: &str,
        metadata: &str,
        timestamp: u64,
    ) {
        format::write_record_header(&mut self.buffer, 0, size, timestamp);
        format::write_start_payload(&mut self.buffer, id, name, r#type, metadata);
    }

    /// Writes a header and replays the registry so the new segment stands alone.
    fn begin_segment(&mut self, extra_header: &str, timestamp: u64) {
        format::write_file_header(&mut self.buffer, extra_header);

        let snapshot = self.registry.snapshot();
        for entry in &snapshot.entries {
            let size = format::start_payload_len(&entry.name, &entry.r#type, &entry.metadata);
            let Ok(size) = format::payload_size(size) else {
                error!(entry = entry.id, size, "start record too large to replay");
                continue;
            };
            self.push_start(
                entry.id,
                size,
                &entry.name,
                &entry.r#type,
                &entry.metadata,
                timestamp,
            );
        }
        for schema in &snapshot.schemas {
            self.push_record(schema.entry, timestamp, &schema.data);
        }
    }
}

fn run_writer(shared: &Shared, commands: &Receiver<Command>, period: Duration) {
    loop {
        match commands.recv_timeout(period) {
            Ok(Command::Drain) | Err(ReceiveErrorTimeout::Timeout) => shared.drain(),
            Ok(Command::Shutdown) | Err(_) => break,
        }
    }

    shared.drain();
    debug!("log writer stopped");
}

#![warn(clippy::pedantic, clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
)]

//! Append-only binary data log in the WPILOG format.
//!
//! Producers on any thread start named entries and append time-stamped
//! values; a background thread periodically writes the buffered records out.
//! [`reader::DataLogReader`] decodes finished logs.


static HEADER_STRING: &[u8; 6] = b"WPILOG";
static HEADER_VERSION: u16 = 0x0100;

pub mod append;
pub mod config;
pub mod entrytypes;
pub mod error;
pub mod format;
pub mod reader;
pub mod registry;
pub mod sink;
pub mod writer;

pub use config::DataLogConfig;
pub use entrytypes::{
    Entry, Lazy, LogEntry, LogValue, StructArrayLogEntry, StructDescriptor, StructLogEntry,
    StructSerializable,
};
pub use error::DataLogError;
pub use reader::{DataLogReader, DataLogRecord};
pub use registry::EntryInfo;
pub use sink::{ChunkOutcome, FileSink, LogSink, StreamSink};
pub use writer::{DataLog, DataLogStats, MonotonicClock, TimeProvider};

/// An owned, decoded record. Control records carry the id of the entry they
/// describe in `id`.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: u32,
    pub timestamp: u64,
    pub info: RecordInfo,
}

#[derive(Debug, Clone)]
pub enum RecordInfo {
    Control(ControlData),
    Data(Box<[u8]>),
}

#[derive(Debug, Clone)]
pub enum ControlData {
    Start {
        name: Box<str>,
        r#type: Box<str>,
        metadata: Box<str>,
    },
    Finish,
    SetMetadata(Box<str>),
}

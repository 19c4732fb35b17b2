//! Durable destinations for drained log bytes.
//!
//! A sink sees the byte stream cut into segments: every segment starts with a
//! file header and ends with [`LogSink::finish_segment`].

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info, warn};

/// What a sink did with a chunk it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The bytes reached the destination.
    Written,
    /// The sink has nowhere to put the bytes and dropped them.
    Discarded,
}

/// Receives the bytes drained from a log. Only one thread uses a sink at a time.
pub trait LogSink: Send {
    /// Writes a chunk of the current segment. On error no part of the chunk
    /// may be left behind, so the same chunk can be retried later.
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<ChunkOutcome>;

    /// Ends the current segment. The next write belongs to a new one.
    fn finish_segment(&mut self) -> io::Result<()>;

    /// Changes the destination name used from now on.
    fn set_filename(&mut self, _filename: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Writes each segment to its own file in a directory.
///
/// The file is created on the first write of a segment. Renaming moves the
/// open file; if a file with the target name already exists when a new
/// segment starts, a `_<n>` suffix is added.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    filename: String,
    current: Option<OpenFile>,
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileSink {
    /// An empty `filename` is replaced by a generated `wpilog_<hex>.wpilog` name.
    pub fn new(dir: impl Into<PathBuf>, filename: &str) -> FileSink {
        let filename = if filename.is_empty() {
            generated_filename()
        } else {
            filename.to_string()
        };

        FileSink {
            dir: dir.into(),
            filename,
            current: None,
        }
    }

    /// Path of the file the current segment is being written to.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.current.as_ref().map(|open| open.path.as_path())
    }

    fn open(&mut self) -> io::Result<&mut OpenFile> {
        if self.current.is_none() {
            let path = unique_path(&self.dir, &self.filename);
            let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            debug!(path = %path.display(), "opened log file");

            self.current = Some(OpenFile { file, path, len: 0 });
        }

        match self.current.as_mut() {
            Some(open) => Ok(open),
            None => Err(io::Error::other("log file not open")),
        }
    }
}

impl LogSink for FileSink {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<ChunkOutcome> {
        let open = self.open()?;

        if let Err(err) = open.file.write_all(data) {
            // Drop whatever part made it out so a retry starts clean.
            let _ = open.file.set_len(open.len);
            let _ = open.file.seek(SeekFrom::Start(open.len));
            return Err(err);
        }

        open.len += data.len() as u64;
        Ok(ChunkOutcome::Written)
    }

    fn finish_segment(&mut self) -> io::Result<()> {
        match self.current.take() {
            Some(open) => {
                debug!(path = %open.path.display(), bytes = open.len, "closed log file");
                open.file.sync_all()
            }
            None => Ok(()),
        }
    }

    fn set_filename(&mut self, filename: &str) -> io::Result<()> {
        self.filename = filename.to_string();

        if let Some(open) = self.current.as_mut() {
            let target = self.dir.join(filename);
            fs::rename(&open.path, &target)?;
            info!(from = %open.path.display(), to = %target.display(), "renamed log file");
            open.path = target;
        }

        Ok(())
    }
}

/// Writes to any [`Write`] implementation. A stream holds a single segment:
/// once it is finished, later segments are discarded and reported as such.
pub struct StreamSink<W: Write + Send> {
    writer: W,
    finished: bool,
    discarding: bool,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(writer: W) -> StreamSink<W> {
        StreamSink {
            writer,
            finished: false,
            discarding: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> LogSink for StreamSink<W> {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<ChunkOutcome> {
        if self.finished {
            if self.discarding {
                debug!(bytes = data.len(), "stream already finished, discarding");
            } else {
                self.discarding = true;
                warn!(bytes = data.len(), "stream log was stopped, discarding later segments");
            }
            return Ok(ChunkOutcome::Discarded);
        }

        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(ChunkOutcome::Written)
    }

    fn finish_segment(&mut self) -> io::Result<()> {
        self.finished = true;
        self.writer.flush()
    }
}

fn generated_filename() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos() ^ (elapsed.as_secs() as u32))
        .unwrap_or_default();

    format!("wpilog_{:08x}.wpilog", nanos ^ std::process::id().rotate_left(16))
}

/// `dir/filename`, or `dir/<stem>_<n>.<ext>` for the first `n` not taken.
fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let path = dir.join(filename);
    if !path.exists() {
        return path;
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (filename, None),
    };

    (1u32..)
        .map(|n| match extension {
            Some(extension) => dir.join(format!("{stem}_{n}.{extension}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

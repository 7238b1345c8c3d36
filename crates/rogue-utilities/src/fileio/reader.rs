//! Data file replay.

use std::{
    ffi::OsString,
    fs::File,
    io::{BufReader, ErrorKind, Read},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use rogue_core::{
    Error, Result,
    stream::{AsMaster, Master},
};
use rogue_proto::record::{HEADER_SIZE, RecordHeader};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Shared {
    master: Master,
    stop: AtomicBool,
    active: AtomicBool,
    frames: AtomicU64,
}

impl Shared {
    fn replay_file(&self, path: &Path) -> Result<u64> {
        let mut reader = BufReader::new(File::open(path)?);
        info!(path = %path.display(), "data file replay started");
        let mut count = 0;
        let mut head = [0u8; HEADER_SIZE];
        while !self.stop.load(Ordering::Relaxed) {
            match reader.read_exact(&mut head) {
                Ok(()) => {},
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let header = RecordHeader::decode(&head)?;
            let len = header.stored_len();
            // Grows with the bytes actually on disk, not the size field
            let mut payload = Vec::new();
            reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
            if payload.len() < len {
                warn!(path = %path.display(), len, got = payload.len(), "truncated record ends replay");
                break;
            }

            let frame = self.master.req_frame(len, false)?;
            {
                let mut lock = frame.lock();
                lock.write(0, &payload)?;
                lock.set_channel(header.channel);
            }
            self.master.send_frame(frame);
            self.frames.fetch_add(1, Ordering::Relaxed);
            count += 1;
        }
        debug!(path = %path.display(), count, "data file replay finished");
        Ok(count)
    }

    fn replay(&self, path: &Path) -> Result<u64> {
        let files = StreamReader::files(path);
        if files.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no data file at {}", path.display()),
            )));
        }
        let mut total = 0;
        for file in files {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            total += self.replay_file(&file)?;
        }
        Ok(total)
    }
}

/// Replays a recorded data file through a stream master.
///
/// Each record becomes one frame whose channel is the record's channel tag.
/// Legacy raw-data records come back with their word padding.
#[derive(Debug, Default)]
pub struct StreamReader {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamReader {
    /// Idle reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files making up the recording at `path`: the file itself if it
    /// exists, otherwise the rolled series `<path>.1`, `<path>.2`, ...
    pub fn files(path: &Path) -> Vec<PathBuf> {
        if path.is_file() {
            return vec![path.to_path_buf()];
        }
        let mut files = Vec::new();
        for index in 1.. {
            let mut name = OsString::from(path.as_os_str());
            name.push(format!(".{index}"));
            let candidate = PathBuf::from(name);
            if !candidate.is_file() {
                break;
            }
            files.push(candidate);
        }
        files
    }

    /// Replay the recording at `path` on the calling thread. Returns the
    /// number of frames sent.
    pub fn replay(&self, path: impl AsRef<Path>) -> Result<u64> {
        self.shared.stop.store(false, Ordering::Relaxed);
        self.shared.replay(path.as_ref())
    }

    /// Replay the recording at `path` on a background thread.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        self.close();
        let path = path.as_ref().to_path_buf();
        if Self::files(&path).is_empty() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no data file at {}", path.display()),
            )));
        }
        self.shared.stop.store(false, Ordering::Relaxed);
        self.shared.active.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new().name("rogue-reader".into()).spawn(move || {
            if let Err(e) = shared.replay(&path) {
                warn!(path = %path.display(), error = %e, "data file replay failed");
            }
            shared.active.store(false, Ordering::Release);
        });
        match worker {
            Ok(worker) => {
                *self.worker.lock() = Some(worker);
                Ok(())
            },
            Err(e) => {
                self.shared.active.store(false, Ordering::Release);
                Err(Error::Io(e))
            },
        }
    }

    /// Whether a background replay is still running.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Block until the background replay finishes.
    pub fn wait(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    /// Stop a background replay and wait for its thread.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.wait();
    }

    /// Frames sent since creation.
    pub fn frame_count(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }
}

impl AsMaster for StreamReader {
    fn master(&self) -> &Master {
        &self.shared.master
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.close();
    }
}

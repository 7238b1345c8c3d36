//! Frame recorder.

use std::{
    ffi::OsString,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rogue_core::{
    Error, Result,
    stream::{FramePtr, Slave},
};
use rogue_proto::record::{HEADER_SIZE, RAW_DATA_CHANNEL, RecordHeader};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Roll to a new file before one would grow past this many bytes; zero
    /// writes a single unbounded file
    pub size_limit: u64,
    /// Bytes buffered in memory between writes to disk
    pub buffer_size: usize,
    /// Skip frames whose error field is set
    pub drop_errors: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { size_limit: 0, buffer_size: 64 * 1024, drop_errors: false }
    }
}

#[derive(Debug, Default)]
struct State {
    base: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    index: u32,
    current_size: u64,
    total_size: u64,
    frame_count: u64,
}

impl State {
    fn path_for(base: &Path, index: u32, rolled: bool) -> PathBuf {
        if !rolled {
            return base.to_path_buf();
        }
        let mut name = OsString::from(base.as_os_str());
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

/// Writes frames from any number of channels into one data file.
///
/// Frames reach the writer through [`StreamWriterChannel`]s, one per
/// channel tag. With a `size_limit` the output is a series of files
/// `<path>.1`, `<path>.2`, ...; a new file is started whenever the next
/// record would push the current one past the limit, so a file only
/// exceeds it when a single record is larger than the limit.
#[derive(Debug)]
pub struct StreamWriter {
    config: WriterConfig,
    state: Mutex<State>,
    count_cv: Condvar,
    dropped: AtomicU64,
}

impl StreamWriter {
    /// Closed writer.
    pub fn new(config: WriterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            count_cv: Condvar::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Start recording to `path`, closing any file already open. Counters
    /// restart from zero.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.state.lock();
        Self::finish(&mut state)?;
        *state = State { base: Some(path.as_ref().to_path_buf()), ..State::default() };
        self.roll(&mut state)?;
        drop(state);
        self.count_cv.notify_all();
        Ok(())
    }

    /// Flush and close the current file.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let result = Self::finish(&mut state);
        state.base = None;
        result
    }

    /// Whether a file is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Push buffered records to disk.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.file.as_mut() {
            Some(file) => Ok(file.flush()?),
            None => Ok(()),
        }
    }

    /// Frames written since [`open`](Self::open).
    pub fn frame_count(&self) -> u64 {
        self.state.lock().frame_count
    }

    /// Bytes written across every file since [`open`](Self::open).
    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size
    }

    /// Bytes written to the current file.
    pub fn current_size(&self) -> u64 {
        self.state.lock().current_size
    }

    /// Frames discarded because no file was open or their error was set.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Block until `count` frames have been written or `timeout` passes.
    pub fn wait_frame_count(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.frame_count < count {
            if self.count_cv.wait_until(&mut state, deadline).timed_out() {
                return state.frame_count >= count;
            }
        }
        true
    }

    /// Slave that records frames under `channel` (0..=15).
    pub fn channel(self: &Arc<Self>, channel: u8) -> Result<Arc<StreamWriterChannel>> {
        if channel > 0x0F {
            return Err(Error::Unsupported("record channel above 15"));
        }
        Ok(Arc::new(StreamWriterChannel {
            writer: Arc::clone(self),
            channel,
            frames: AtomicU64::new(0),
        }))
    }

    /// Append one record.
    pub fn write_frame(&self, channel: u8, frame: &FramePtr) -> Result<()> {
        let lock = frame.lock();
        if self.config.drop_errors && lock.error() != 0 {
            debug!(channel, error = lock.error(), "errored frame not recorded");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let payload = lock.payload();
        let header = RecordHeader::for_payload(channel, payload)?;
        let stored = header.stored_len();
        let record = (HEADER_SIZE + stored) as u64;

        let mut state = self.state.lock();
        if state.file.is_none() {
            drop(state);
            debug!(channel, "frame arrived with no file open");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let limit = self.config.size_limit;
        if limit > 0 && state.current_size > 0 && state.current_size + record > limit {
            self.roll(&mut state)?;
        }

        let result = Self::write_record(&mut state, &header, &lock, stored - payload);
        if let Err(e) = result {
            error!(channel, error = %e, "data file write failed");
            return Err(e);
        }
        state.current_size += record;
        state.total_size += record;
        state.frame_count += 1;
        drop(state);
        self.count_cv.notify_all();
        Ok(())
    }

    fn write_record(
        state: &mut State,
        header: &RecordHeader,
        frame: &rogue_core::stream::FrameLock<'_>,
        pad: usize,
    ) -> Result<()> {
        let Some(file) = state.file.as_mut() else {
            return Err(Error::Cancelled);
        };
        file.write_all(&header.encode())?;
        for chunk in frame.begin_read().chunks() {
            file.write_all(chunk)?;
        }
        if pad > 0 {
            file.write_all(&[0u8; 3][..pad])?;
        }
        Ok(())
    }

    fn roll(&self, state: &mut State) -> Result<()> {
        Self::finish(state)?;
        let Some(base) = state.base.clone() else {
            return Err(Error::Cancelled);
        };
        let rolled = self.config.size_limit > 0;
        state.index += 1;
        let path = State::path_for(&base, state.index, rolled);
        let file = File::create(&path).map_err(|e| {
            error!(path = %path.display(), error = %e, "data file open failed");
            e
        })?;
        state.file = Some(BufWriter::with_capacity(self.config.buffer_size.max(1), file));
        state.current_size = 0;
        info!(path = %path.display(), "data file opened");
        Ok(())
    }

    fn finish(state: &mut State) -> Result<()> {
        if let Some(mut file) = state.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if let Err(e) = Self::finish(self.state.get_mut()) {
            error!(error = %e, "data file flush on drop failed");
        }
    }
}

/// Records every frame it receives under one channel tag.
#[derive(Debug)]
pub struct StreamWriterChannel {
    writer: Arc<StreamWriter>,
    channel: u8,
    frames: AtomicU64,
}

impl StreamWriterChannel {
    /// Channel tag.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Frames received on this channel.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Slave for StreamWriterChannel {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.writer.write_frame(self.channel, &frame)
    }
}

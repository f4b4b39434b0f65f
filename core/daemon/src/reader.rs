//! Tag reader adapters.
//!
//! A reader blocks for at most the given timeout and reports either a tag or
//! `TagRead::Timeout`. Timeouts are the steady state (nobody is tapping) and are
//! never treated as faults.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use fs_err::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ReaderError;
use crate::tag::TagId;

const FEED_CHANNEL_CAPACITY: usize = 64;
const FEED_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const FEED_TAIL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagRead {
    Tag(TagId),
    Timeout,
}

pub trait TagReader: Send {
    fn read(&mut self, timeout: Duration) -> Result<TagRead, ReaderError>;

    fn kind(&self) -> &'static str;
}

impl<R: TagReader + ?Sized> TagReader for Box<R> {
    fn read(&mut self, timeout: Duration) -> Result<TagRead, ReaderError> {
        (**self).read(timeout)
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }
}

/// Reads one tag per line from a feed file or FIFO.
///
/// Keyboard-wedge readers piped into a FIFO and test harnesses appending to a
/// plain file both end up here. Content present when the reader is opened is
/// skipped so a restart does not replay old taps.
pub struct LineTagReader {
    path: PathBuf,
    rx: Receiver<String>,
}

impl LineTagReader {
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let initial = match File::open(path) {
            Ok(mut file) => {
                if is_regular_file(&file) {
                    file.seek(SeekFrom::End(0))?;
                }
                Some(file)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Reader feed not present yet; waiting for it");
                None
            }
            Err(err) => return Err(ReaderError::Io(err)),
        };

        let (tx, rx) = channel::bounded(FEED_CHANNEL_CAPACITY);
        let follow_path = path.to_path_buf();
        thread::Builder::new()
            .name("toolcrib-feed".to_string())
            .spawn(move || follow_feed(&follow_path, initial, tx))?;

        Ok(Self {
            path: path.to_path_buf(),
            rx,
        })
    }
}

impl TagReader for LineTagReader {
    fn read(&mut self, timeout: Duration) -> Result<TagRead, ReaderError> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => TagId::parse(&line)
                .map(TagRead::Tag)
                .ok_or(ReaderError::InvalidTag(line)),
            Err(RecvTimeoutError::Timeout) => Ok(TagRead::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ReaderError::Unavailable(format!(
                "feed follower for {} stopped",
                self.path.display()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        "lines"
    }
}

fn is_regular_file(file: &File) -> bool {
    file.metadata()
        .map(|meta| !meta.file_type().is_fifo())
        .unwrap_or(true)
}

fn follow_feed(path: &Path, mut current: Option<File>, tx: Sender<String>) {
    loop {
        let file = match current.take() {
            Some(file) => file,
            None => match File::open(path) {
                Ok(file) => {
                    debug!(path = %path.display(), "Opened reader feed");
                    file
                }
                Err(err) => {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(error = %err, path = %path.display(), "Failed to open reader feed");
                    }
                    thread::sleep(FEED_RETRY_INTERVAL);
                    continue;
                }
            },
        };

        let regular = is_regular_file(&file);
        match pump_lines(file, regular, &tx) {
            FeedEnd::ReceiverGone => return,
            FeedEnd::Reopen => {}
        }
    }
}

enum FeedEnd {
    ReceiverGone,
    Reopen,
}

fn pump_lines(file: File, regular: bool, tx: &Sender<String>) -> FeedEnd {
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        match reader.read_line(&mut line) {
            Ok(0) => {
                // A FIFO hits EOF when its writer goes away; reopen and wait
                // for the next writer. Plain files are tailed.
                if !regular {
                    return FeedEnd::Reopen;
                }
                if feed_truncated(&mut reader) {
                    debug!("Reader feed truncated; reading from start");
                    line.clear();
                    if reader.seek(SeekFrom::Start(0)).is_err() {
                        return FeedEnd::Reopen;
                    }
                }
                thread::sleep(FEED_TAIL_INTERVAL);
            }
            Ok(_) => {
                if !line.ends_with('\n') {
                    // Partial write; the rest of the line arrives later.
                    continue;
                }
                let value = line.trim().to_string();
                line.clear();
                if value.is_empty() {
                    continue;
                }
                if tx.send(value).is_err() {
                    return FeedEnd::ReceiverGone;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Reader feed line was not UTF-8; dropping it");
                line.clear();
            }
            Err(err) => {
                warn!(error = %err, "Failed to read reader feed");
                thread::sleep(FEED_RETRY_INTERVAL);
                return FeedEnd::Reopen;
            }
        }
    }
}

fn feed_truncated(reader: &mut BufReader<File>) -> bool {
    let position = match reader.stream_position() {
        Ok(position) => position,
        Err(_) => return false,
    };
    reader
        .get_ref()
        .metadata()
        .map(|meta| meta.len() < position)
        .unwrap_or(false)
}

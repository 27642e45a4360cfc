use crate::autotune;
use crate::codec::{self, EncodedImage, Precision};
use crate::error::{DecodeError, DecodeResult};
use crate::frame_table;
use crate::handles::{ImageHandle, ImageStore, PNG_MIME};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendError, Sender, TryRecvError};
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchConfig {
    // None means auto-tuned.
    pub max_workers: Option<usize>,
}

impl DispatchConfig {
    pub fn resolve(self, largest_input_bytes: u64) -> autotune::DispatchTune {
        autotune::decode_worker_budget(largest_input_bytes, self.max_workers)
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Count {
        path: PathBuf,
    },
    Frame {
        path: PathBuf,
        frame_index: u32,
        rows: u32,
        cols: u32,
    },
    Whole {
        path: PathBuf,
        rows: u32,
        cols: u32,
        precision: Precision,
    },
    Raster {
        path: PathBuf,
        mime: &'static str,
    },
}

#[derive(Debug)]
pub enum Reply {
    FrameCount(u32),
    Image {
        image: EncodedImage,
        md5: String,
    },
    Raster {
        bytes: Vec<u8>,
        mime: &'static str,
        md5: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub handle: ImageHandle,
    pub md5: String,
    // (rows, cols) for decoded frames; raster files keep their own size.
    pub dims: Option<(u32, u32)>,
}

impl Request {
    fn describe(&self) -> String {
        match self {
            Request::Count { path } => format!("count {}", file_label(path)),
            Request::Frame {
                path, frame_index, ..
            } => format!("frame {}#{}", file_label(path), frame_index),
            Request::Whole { path, .. } => format!("whole {}", file_label(path)),
            Request::Raster { path, .. } => format!("raster {}", file_label(path)),
        }
    }
}

pub fn md5_hex(buf: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(buf);
    format!("{:x}", hasher.finalize())
}

pub fn execute(request: &Request) -> DecodeResult<Reply> {
    match request {
        Request::Count { path } => {
            let buf = std::fs::read(path)?;
            let table = frame_table::parse_header(&buf)?;
            Ok(Reply::FrameCount(table.frame_count))
        }
        Request::Frame {
            path,
            frame_index,
            rows,
            cols,
        } => {
            let buf = std::fs::read(path)?;
            let table = frame_table::parse_header(&buf)?;
            let entry = table.entry(*frame_index as usize).ok_or_else(|| {
                DecodeError::IndexOutOfRange(format!(
                    "frame {} of {} in {}",
                    frame_index,
                    table.frame_count,
                    file_label(path)
                ))
            })?;
            let image = codec::decode_one_frame(entry, &buf, table.header_end, *rows, *cols)?;
            Ok(Reply::Image {
                image,
                md5: md5_hex(&buf),
            })
        }
        Request::Whole {
            path,
            rows,
            cols,
            precision,
        } => {
            let buf = std::fs::read(path)?;
            let image = codec::decode_whole_buffer(&buf, *rows, *cols, *precision)?;
            Ok(Reply::Image {
                image,
                md5: md5_hex(&buf),
            })
        }
        Request::Raster { path, mime } => {
            let bytes = std::fs::read(path)?;
            let md5 = md5_hex(&bytes);
            Ok(Reply::Raster {
                bytes,
                mime: *mime,
                md5,
            })
        }
    }
}

struct Job {
    name: String,
    run: Box<dyn FnOnce() + Send>,
    abort: Box<dyn FnOnce(DecodeError) + Send>,
}

// Requests queue here; a worker thread is only spawned once it holds a token,
// so at most `workers` decode threads exist besides the scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    store: ImageStore,
    workers: usize,
    jobs: Sender<Job>,
    seq: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(workers: usize, store: ImageStore) -> Self {
        let workers = workers.max(1);
        let (token_tx, token_rx) = bounded(workers);
        for _ in 0..workers {
            let _ = token_tx.send(());
        }
        let (jobs, queue) = unbounded::<Job>();
        std::thread::spawn(move || schedule(queue, token_tx, token_rx));

        Self {
            store,
            workers,
            jobs,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn get_frame_count(&self, path: &Path) -> Pending<u32> {
        self.submit(
            Request::Count {
                path: path.to_path_buf(),
            },
            |reply, _store| match reply {
                Reply::FrameCount(n) => Ok(n),
                Reply::Image { .. } | Reply::Raster { .. } => Err(mismatched("count")),
            },
        )
    }

    pub fn get_frame(&self, path: &Path, frame_index: u32, rows: u32, cols: u32) -> Pending<LoadedImage> {
        self.submit(
            Request::Frame {
                path: path.to_path_buf(),
                frame_index,
                rows,
                cols,
            },
            publish_image,
        )
    }

    pub fn get_whole_image(
        &self,
        path: &Path,
        rows: u32,
        cols: u32,
        precision: Precision,
    ) -> Pending<LoadedImage> {
        self.submit(
            Request::Whole {
                path: path.to_path_buf(),
                rows,
                cols,
                precision,
            },
            publish_image,
        )
    }

    pub fn get_raster(&self, path: &Path, mime: &'static str) -> Pending<LoadedImage> {
        self.submit(
            Request::Raster {
                path: path.to_path_buf(),
                mime,
            },
            publish_image,
        )
    }

    fn submit<T, F>(&self, request: Request, finish: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Reply, &ImageStore) -> DecodeResult<T> + Send + 'static,
    {
        let label = request.describe();
        let (reply_tx, reply_rx) = bounded::<DecodeResult<T>>(1);
        let abort_tx = reply_tx.clone();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();

        let job = Job {
            name: format!("decode-{}", seq),
            run: Box::new(move || {
                let result = execute(&request).and_then(|reply| finish(reply, &store));
                let _ = reply_tx.send(result);
            }),
            abort: Box::new(move |err| {
                let _ = abort_tx.send(Err(err));
            }),
        };
        if let Err(SendError(job)) = self.jobs.send(job) {
            (job.abort)(DecodeError::WorkerLost(format!("{}: scheduler is gone", label)));
        }

        Pending {
            rx: reply_rx,
            label,
            ready: None,
            spent: false,
        }
    }
}

fn schedule(queue: Receiver<Job>, token_tx: Sender<()>, token_rx: Receiver<()>) {
    for job in queue.iter() {
        if token_rx.recv().is_err() {
            return;
        }
        let token = TokenGuard(token_tx.clone());
        let Job { name, run, abort } = job;
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let _token = token;
            run();
        });
        // A failed spawn drops the closure, and with it the token guard.
        if let Err(e) = spawned {
            abort(DecodeError::WorkerLost(format!("{}: could not start worker: {}", name, e)));
        }
    }
}

fn publish_image(reply: Reply, store: &ImageStore) -> DecodeResult<LoadedImage> {
    match reply {
        Reply::Image { image, md5 } => Ok(LoadedImage {
            handle: store.create(image.png, PNG_MIME),
            md5,
            dims: Some((image.rows, image.cols)),
        }),
        Reply::Raster { bytes, mime, md5 } => Ok(LoadedImage {
            handle: store.create(bytes, mime),
            md5,
            dims: None,
        }),
        Reply::FrameCount(_) => Err(mismatched("image")),
    }
}

fn mismatched(expected: &str) -> DecodeError {
    DecodeError::WorkerLost(format!("worker replied with the wrong shape, expected {}", expected))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

// Hands the concurrency token back even if the job panics.
struct TokenGuard(Sender<()>);

impl Drop for TokenGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct Pending<T> {
    rx: Receiver<DecodeResult<T>>,
    label: String,
    ready: Option<DecodeResult<T>>,
    spent: bool,
}

impl<T> Pending<T> {
    pub fn try_take(&mut self) -> Option<DecodeResult<T>> {
        if self.spent {
            return None;
        }
        if self.ready.is_none() {
            self.ready = match self.rx.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Err(self.lost())),
            };
        }
        let result = self.ready.take()?;
        self.spent = true;
        Some(result)
    }

    pub fn wait_ready(&mut self, timeout: Duration) -> bool {
        if self.spent || self.ready.is_some() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                self.ready = Some(result);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                self.ready = Some(Err(self.lost()));
                true
            }
        }
    }

    pub fn wait(mut self) -> DecodeResult<T> {
        match self.ready.take() {
            Some(result) => result,
            None => self.rx.recv().unwrap_or_else(|_| Err(self.lost())),
        }
    }

    fn lost(&self) -> DecodeError {
        DecodeError::WorkerLost(format!("{}: worker exited without replying", self.label))
    }
}

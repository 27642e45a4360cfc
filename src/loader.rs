use crate::codec::Precision;
use crate::dispatch::{Dispatcher, LoadedImage, Pending};
use crate::error::{DecodeError, DecodeResult};
use crate::handles::{ImageHandle, ImageStore};
use crate::progress::Notify;
use crate::util::{self, FileKind};

use clap::ValueEnum;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[value(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum DatLayout {
    #[default]
    Tabled,
    Whole,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoaderConfig {
    pub dat_layout: DatLayout,
    pub precision: Precision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Raster { mime: &'static str },
    CaptureFrame,
    CaptureWhole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameDescriptor {
    pub display_name: String,
    pub source: PathBuf,
    pub is_sub_frame: bool,
    pub sub_frame_index: Option<u32>,
    #[serde(flatten)]
    pub kind: SourceKind,
}

impl FrameDescriptor {
    fn single(path: &Path, kind: SourceKind) -> Self {
        Self {
            display_name: util::file_name(path),
            source: path.to_path_buf(),
            is_sub_frame: false,
            sub_frame_index: None,
            kind,
        }
    }

    fn sub_frame(path: &Path, index: u32) -> Self {
        Self {
            display_name: format!("{}#{}", util::file_name(path), index),
            source: path.to_path_buf(),
            is_sub_frame: true,
            sub_frame_index: Some(index),
            kind: SourceKind::CaptureFrame,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderStatus {
    Idle,
    ExpandingSelection,
    LoadingFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRequest {
    // Outcome arrives through `poll`.
    Started,
    // Another operation is in flight; discarded, not queued.
    Dropped,
    Cleared,
}

#[derive(Debug)]
pub enum Completion {
    SelectionExpanded {
        descriptors: usize,
        failed_files: usize,
    },
    FrameLoaded {
        index: usize,
    },
    FrameFailed {
        index: usize,
        error: DecodeError,
    },
}

enum Phase {
    Idle,
    Expanding(Expansion),
    Loading(FrameLoad),
}

struct Expansion {
    slots: Vec<ExpansionSlot>,
    failed_files: usize,
}

enum ExpansionSlot {
    Ready(Vec<FrameDescriptor>),
    Counting {
        path: PathBuf,
        pending: Pending<u32>,
    },
}

struct FrameLoad {
    index: usize,
    pending: Pending<LoadedImage>,
}

pub struct FrameLoader {
    config: LoaderConfig,
    dispatcher: Dispatcher,
    notify: Arc<dyn Notify>,
    rows: u32,
    cols: u32,
    descriptors: Vec<FrameDescriptor>,
    current_index: Option<usize>,
    // Last index a load was issued for; navigation steps from here.
    cursor: Option<usize>,
    live: Option<LoadedImage>,
    phase: Phase,
    // Loads abandoned by `clear`; their handles are revoked on arrival.
    retired: Vec<Pending<LoadedImage>>,
    completed: Vec<Completion>,
}

impl FrameLoader {
    pub fn new(config: LoaderConfig, dispatcher: Dispatcher, notify: Arc<dyn Notify>) -> Self {
        Self {
            config,
            dispatcher,
            notify,
            rows: 0,
            cols: 0,
            descriptors: Vec::new(),
            current_index: None,
            cursor: None,
            live: None,
            phase: Phase::Idle,
            retired: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.descriptors.len()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    pub fn status(&self) -> LoaderStatus {
        match self.phase {
            Phase::Idle => LoaderStatus::Idle,
            Phase::Expanding(_) => LoaderStatus::ExpandingSelection,
            Phase::Loading(_) => LoaderStatus::LoadingFrame,
        }
    }

    pub fn current_image(&self) -> Option<&ImageHandle> {
        self.live.as_ref().map(|live| &live.handle)
    }

    pub fn current_md5(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.md5.as_str())
    }

    pub fn descriptors(&self) -> &[FrameDescriptor] {
        &self.descriptors
    }

    pub fn current_descriptor(&self) -> Option<&FrameDescriptor> {
        self.current_index.and_then(|i| self.descriptors.get(i))
    }

    pub fn store(&self) -> &ImageStore {
        self.dispatcher.store()
    }

    /// Replace the sequence with the expansion of `files`. Rejected without any
    /// state change while another operation runs or when the geometry is empty.
    pub fn process_selection(&mut self, files: &[PathBuf], rows: u32, cols: u32) -> DecodeResult<()> {
        if self.is_busy() {
            return Err(DecodeError::Busy(
                "a selection or frame load is still in progress".to_string(),
            ));
        }
        if rows == 0 || cols == 0 {
            return Err(DecodeError::InvalidGeometry(format!(
                "rows and cols must be > 0, got {}x{}",
                rows, cols
            )));
        }

        self.clear();
        self.rows = rows;
        self.cols = cols;

        let mut files = files.to_vec();
        files.sort_by(|a, b| {
            util::natural_cmp(&util::file_name(a), &util::file_name(b)).then_with(|| a.cmp(b))
        });

        let mut slots = Vec::with_capacity(files.len());
        for path in files {
            match (util::classify(&path), self.config.dat_layout) {
                (FileKind::Raster { mime }, _) => slots.push(ExpansionSlot::Ready(vec![
                    FrameDescriptor::single(&path, SourceKind::Raster { mime }),
                ])),
                (FileKind::Capture, DatLayout::Whole) => slots.push(ExpansionSlot::Ready(vec![
                    FrameDescriptor::single(&path, SourceKind::CaptureWhole),
                ])),
                (FileKind::Capture, DatLayout::Tabled) => {
                    let pending = self.dispatcher.get_frame_count(&path);
                    slots.push(ExpansionSlot::Counting { path, pending });
                }
                (FileKind::Unsupported, _) => {
                    let err = DecodeError::UnsupportedFileType(util::file_name(&path));
                    self.notify.warn(&format!("skipped: {}", err));
                }
            }
        }

        if slots.is_empty() {
            self.notify
                .warn("no supported image or capture files in the selection");
        }
        // Frame counts are folded in by `poll`; with none pending the selection
        // is complete now.
        let counting = slots
            .iter()
            .any(|slot| matches!(slot, ExpansionSlot::Counting { .. }));
        self.phase = Phase::Expanding(Expansion {
            slots,
            failed_files: 0,
        });
        if !counting {
            self.advance_expansion();
        }
        Ok(())
    }

    // Negative or past-the-end indices empty the view.
    pub fn load_frame(&mut self, index: isize) -> LoadRequest {
        if self.is_busy() {
            return LoadRequest::Dropped;
        }
        if index < 0 || index as usize >= self.descriptors.len() {
            self.release_live();
            self.current_index = None;
            self.cursor = None;
            return LoadRequest::Cleared;
        }

        let index = index as usize;
        self.cursor = Some(index);
        let desc = &self.descriptors[index];
        let pending = match desc.kind {
            SourceKind::CaptureFrame => {
                let sub = desc.sub_frame_index.unwrap_or(0);
                self.dispatcher.get_frame(&desc.source, sub, self.rows, self.cols)
            }
            SourceKind::CaptureWhole => self.dispatcher.get_whole_image(
                &desc.source,
                self.rows,
                self.cols,
                self.config.precision,
            ),
            SourceKind::Raster { mime } => self.dispatcher.get_raster(&desc.source, mime),
        };
        self.phase = Phase::Loading(FrameLoad { index, pending });
        LoadRequest::Started
    }

    pub fn next_frame(&mut self) -> Option<LoadRequest> {
        if self.is_busy() {
            return None;
        }
        let next = self.cursor.map_or(0, |c| c + 1);
        if next >= self.descriptors.len() {
            return None;
        }
        Some(self.load_frame(next as isize))
    }

    pub fn prev_frame(&mut self) -> Option<LoadRequest> {
        if self.is_busy() {
            return None;
        }
        match self.cursor {
            Some(c) if c > 0 => Some(self.load_frame(c as isize - 1)),
            _ => None,
        }
    }

    // An in-flight load is abandoned and its image revoked once the worker replies.
    pub fn clear(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Loading(load) => self.retired.push(load.pending),
            Phase::Expanding(_) | Phase::Idle => {}
        }
        self.release_live();
        self.descriptors.clear();
        self.current_index = None;
        self.cursor = None;
        self.completed.clear();
        self.reap_retired();
    }

    pub fn poll(&mut self) -> Vec<Completion> {
        self.reap_retired();
        match self.status() {
            LoaderStatus::Idle => {}
            LoaderStatus::ExpandingSelection => self.advance_expansion(),
            LoaderStatus::LoadingFrame => self.advance_frame_load(),
        }
        std::mem::take(&mut self.completed)
    }

    pub fn wait_idle(&mut self) -> Vec<Completion> {
        let mut completions = self.poll();
        while self.is_busy() {
            match &mut self.phase {
                Phase::Idle => {}
                Phase::Loading(load) => {
                    load.pending.wait_ready(WAIT_SLICE);
                }
                Phase::Expanding(exp) => {
                    let counting = exp.slots.iter_mut().find_map(|slot| match slot {
                        ExpansionSlot::Counting { pending, .. } => Some(pending),
                        ExpansionSlot::Ready(_) => None,
                    });
                    if let Some(pending) = counting {
                        pending.wait_ready(WAIT_SLICE);
                    }
                }
            }
            completions.extend(self.poll());
        }
        completions
    }

    fn advance_expansion(&mut self) {
        let Phase::Expanding(exp) = &mut self.phase else {
            return;
        };

        for slot in exp.slots.iter_mut() {
            let ExpansionSlot::Counting { path, pending } = slot else {
                continue;
            };
            let Some(result) = pending.try_take() else {
                continue;
            };
            let descriptors = match result {
                Ok(count) => (0..count).map(|i| FrameDescriptor::sub_frame(path, i)).collect(),
                Err(err) => {
                    exp.failed_files += 1;
                    self.notify
                        .error(&format!("{}: {}", util::file_name(path), err));
                    Vec::new()
                }
            };
            *slot = ExpansionSlot::Ready(descriptors);
        }

        let all_ready = exp
            .slots
            .iter()
            .all(|slot| matches!(slot, ExpansionSlot::Ready(_)));
        if !all_ready {
            return;
        }

        let Phase::Expanding(exp) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let file_count = exp.slots.len();
        self.descriptors = exp
            .slots
            .into_iter()
            .flat_map(|slot| match slot {
                ExpansionSlot::Ready(descriptors) => descriptors,
                ExpansionSlot::Counting { .. } => Vec::new(),
            })
            .collect();
        self.notify.info(&format!(
            "selection expanded: {} frames from {} files ({} failed)",
            self.descriptors.len(),
            file_count,
            exp.failed_files
        ));
        self.completed.push(Completion::SelectionExpanded {
            descriptors: self.descriptors.len(),
            failed_files: exp.failed_files,
        });

        if !self.descriptors.is_empty() {
            self.load_frame(0);
        }
    }

    fn advance_frame_load(&mut self) {
        let Phase::Loading(load) = &mut self.phase else {
            return;
        };
        let Some(result) = load.pending.try_take() else {
            return;
        };
        let index = load.index;
        self.phase = Phase::Idle;
        self.finish_load(index, result);
    }

    fn finish_load(&mut self, index: usize, result: DecodeResult<LoadedImage>) {
        match result {
            Ok(loaded) => {
                self.release_live();
                self.live = Some(loaded);
                self.current_index = Some(index);
                self.completed.push(Completion::FrameLoaded { index });
            }
            Err(error) => {
                let name = self
                    .descriptors
                    .get(index)
                    .map(|d| d.display_name.clone())
                    .unwrap_or_default();
                self.notify
                    .error(&format!("failed to load frame {} ({}): {}", index, name, error));
                self.completed.push(Completion::FrameFailed { index, error });
            }
        }
    }

    fn release_live(&mut self) {
        if let Some(live) = self.live.take() {
            self.dispatcher.store().revoke(&live.handle);
        }
    }

    fn reap_retired(&mut self) {
        let store = self.dispatcher.store().clone();
        self.retired.retain_mut(|pending| match pending.try_take() {
            Some(Ok(loaded)) => {
                store.revoke(&loaded.handle);
                false
            }
            Some(Err(_)) => false,
            None => true,
        });
    }
}

impl Drop for FrameLoader {
    fn drop(&mut self) {
        self.clear();
        let store = self.dispatcher.store().clone();
        for pending in self.retired.drain(..) {
            if let Ok(loaded) = pending.wait() {
                store.revoke(&loaded.handle);
            }
        }
    }
}

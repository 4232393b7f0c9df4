// SPDX-License-Identifier: MPL-2.0

//! Fakes shared by unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use image::{Rgba, RgbaImage};
use loopframe_config::{CollectionEntry, LoopStyle};

use crate::{
    decoder::{DecodeError, DecodedFrame, DecoderFactory, FrameSource},
    memory::{MemoryInfo, MemorySource},
    prefetch::{Collection, FetchError, RemoteStorage, Segment},
};

/// Index of a fake frame within its pass.
pub fn frame_index(frame: &DecodedFrame) -> u64 {
    frame.pts.unwrap_or(u64::MAX)
}

/// Synthetic 4x2 video whose frame `n` carries `pts == n`.
pub struct FakeSource {
    frames: usize,
    next: usize,
    fps: f64,
    fail_at: Option<usize>,
    closed: Rc<Cell<usize>>,
}

impl FrameSource for FakeSource {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        if self.fail_at == Some(self.next) {
            self.fail_at = None;
            return Err(DecodeError::Frame(format!("corrupt frame {}", self.next)));
        }
        if self.next >= self.frames {
            return Ok(None);
        }

        let shade = (self.next % 256) as u8;
        let image = RgbaImage::from_pixel(4, 2, Rgba([shade, 0, 0, 255]));
        let frame = DecodedFrame::new(image, Some(self.next as u64));
        self.next += 1;
        Ok(Some(frame))
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        (4, 2)
    }

    fn decoder_name(&self) -> &str {
        "fakedec"
    }

    fn close(&mut self) {
        self.closed.set(self.closed.get() + 1);
    }
}

/// Opens every path as a fake video unless it was marked broken.
pub struct FakeFactory {
    frames: usize,
    fps: f64,
    broken: RefCell<HashSet<PathBuf>>,
    fail_next_at: Cell<Option<usize>>,
    fail_next_open: Cell<bool>,
    opened: RefCell<Vec<PathBuf>>,
    closed: Rc<Cell<usize>>,
}

impl FakeFactory {
    pub fn new(frames: usize, fps: f64) -> Rc<Self> {
        Rc::new(Self {
            frames,
            fps,
            broken: RefCell::default(),
            fail_next_at: Cell::new(None),
            fail_next_open: Cell::new(false),
            opened: RefCell::default(),
            closed: Rc::default(),
        })
    }

    pub fn mark_broken(&self, path: impl Into<PathBuf>) {
        self.broken.borrow_mut().insert(path.into());
    }

    /// The next opened source fails once when it reaches frame `index`.
    pub fn fail_next_decode_at(&self, index: usize) {
        self.fail_next_at.set(Some(index));
    }

    pub fn fail_next_open(&self) {
        self.fail_next_open.set(true);
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.borrow().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.borrow().len()
    }

    pub fn close_count(&self) -> usize {
        self.closed.get()
    }
}

impl DecoderFactory for FakeFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        if self.fail_next_open.replace(false) {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: "file vanished".into(),
            });
        }
        if self.broken.borrow().contains(path) {
            return Err(DecodeError::NoVideoStream {
                path: path.to_path_buf(),
            });
        }

        self.opened.borrow_mut().push(path.to_path_buf());
        Ok(Box::new(FakeSource {
            frames: self.frames,
            next: 0,
            fps: self.fps,
            fail_at: self.fail_next_at.take(),
            closed: Rc::clone(&self.closed),
        }))
    }
}

/// Memory source with an adjustable available figure.
#[derive(Clone)]
pub struct FixedMemory {
    available_mb: Arc<Mutex<u64>>,
}

impl FixedMemory {
    pub fn new(available_mb: u64) -> Self {
        Self {
            available_mb: Arc::new(Mutex::new(available_mb)),
        }
    }

    pub fn set(&self, available_mb: u64) {
        *self.available_mb.lock().unwrap() = available_mb;
    }
}

impl MemorySource for FixedMemory {
    fn read(&self) -> eyre::Result<MemoryInfo> {
        let available_mb = *self.available_mb.lock().unwrap();
        Ok(MemoryInfo {
            total_mb: 4096,
            available_mb,
            used_mb: 4096u64.saturating_sub(available_mb),
            free_mb: available_mb,
        })
    }
}

/// Memory source that always fails.
pub struct BrokenMemory;

impl MemorySource for BrokenMemory {
    fn read(&self) -> eyre::Result<MemoryInfo> {
        Err(eyre::eyre!("meminfo unavailable"))
    }
}

/// One recorded `download_segment` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub collection: String,
    pub start: usize,
    pub count: usize,
}

impl SegmentRequest {
    pub fn new(collection: &str, start: usize, count: usize) -> Self {
        Self {
            collection: collection.to_string(),
            start,
            count,
        }
    }
}

pub enum Reply {
    /// Deliver this many items, with the end-of-collection flag.
    Items(usize, bool),
    Fail(String),
}

type Gate = (Sender<Reply>, Receiver<Reply>);

/// Remote storage whose downloads block until the test releases them.
///
/// Every collection has its own gate, so concurrent fetch and switch
/// downloads can be released independently. Delivered items are small files
/// created under `dir`.
pub struct GatedStorage {
    dir: PathBuf,
    gates: Mutex<HashMap<String, Gate>>,
    requests: Mutex<Vec<SegmentRequest>>,
    started: (Sender<SegmentRequest>, Receiver<SegmentRequest>),
}

impl GatedStorage {
    pub fn new(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            gates: Mutex::default(),
            requests: Mutex::default(),
            started: crossbeam_channel::unbounded(),
        })
    }

    fn gate(&self, collection: &str) -> Gate {
        self.gates
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_insert_with(crossbeam_channel::unbounded)
            .clone()
    }

    /// Let one pending or future download of `collection` finish.
    pub fn release(&self, collection: &str, reply: Reply) {
        self.gate(collection).0.send(reply).unwrap();
    }

    /// Wait for the next download call to begin.
    pub fn expect_request(&self) -> SegmentRequest {
        self.started
            .1
            .recv_timeout(Duration::from_secs(5))
            .expect("no download was started")
    }

    pub fn requests(&self) -> Vec<SegmentRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Path an item fetched from `collection` at `index` is delivered to.
    pub fn item_path(&self, collection: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{collection}-{index}.mp4"))
    }
}

impl RemoteStorage for GatedStorage {
    fn download_segment(
        &self,
        collection: &Collection,
        start: usize,
        count: usize,
    ) -> Result<Segment, FetchError> {
        let request = SegmentRequest::new(collection.name(), start, count);
        self.requests.lock().unwrap().push(request.clone());
        let _ = self.started.0.send(request);

        let gate = self.gate(collection.name()).1;
        match gate.recv() {
            Ok(Reply::Items(n, end_of_collection)) => {
                let mut paths = Vec::with_capacity(n);
                for index in start..start + n {
                    let path = self.item_path(collection.name(), index);
                    std::fs::write(&path, b"video").map_err(|source| FetchError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    paths.push(path);
                }
                Ok(Segment {
                    paths,
                    end_of_collection,
                })
            }
            Ok(Reply::Fail(reason)) => Err(FetchError::Unavailable(reason)),
            Err(_) => Err(FetchError::Unavailable("gate closed".into())),
        }
    }
}

/// Collections named `names`, numbered in order.
pub fn collections(names: &[&str]) -> Vec<Collection> {
    let entries: Vec<_> = names
        .iter()
        .map(|name| CollectionEntry::new(*name, "bucket").loop_style(LoopStyle::Loop))
        .collect();
    Collection::from_entries(&entries)
}

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

pub const PNG_MIME: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    id: u64,
    url: String,
}

impl ImageHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url())
    }
}

#[derive(Debug)]
pub struct ImageBlob {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct ImageStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    blobs: HashMap<u64, Arc<ImageBlob>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, bytes: Vec<u8>, mime: &'static str) -> ImageHandle {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.blobs.insert(id, Arc::new(ImageBlob { mime, bytes }));
        ImageHandle {
            id,
            url: format!("blob:datframe/{}", id),
        }
    }

    pub fn get(&self, handle: &ImageHandle) -> Option<Arc<ImageBlob>> {
        self.inner.lock().unwrap().blobs.get(&handle.id).cloned()
    }

    // Returns false if the handle was already revoked.
    pub fn revoke(&self, handle: &ImageHandle) -> bool {
        self.inner.lock().unwrap().blobs.remove(&handle.id).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().blobs.len()
    }
}

//! Pending work for one directory's loader
//!
//! Requests are coalesced by file name: asking again for a file that is
//! already queued bumps a demand counter instead of adding an entry.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::state::{FileInfo, SizeClass};

/// A queued file plus how many times each size class was asked for
#[derive(Debug)]
pub struct ThumbnailRequest {
    file: Arc<FileInfo>,
    demand: [u32; 2],
}

impl ThumbnailRequest {
    fn new(file: Arc<FileInfo>) -> Self {
        Self { file, demand: [0; 2] }
    }

    pub fn file(&self) -> &Arc<FileInfo> {
        &self.file
    }

    pub fn demand(&self, class: SizeClass) -> u32 {
        self.demand[class.index()]
    }

    /// Size classes somebody still wants
    pub fn wanted(&self) -> impl Iterator<Item = SizeClass> + '_ {
        SizeClass::ALL
            .into_iter()
            .filter(move |class| self.demand(*class) > 0)
    }

    pub fn is_wanted(&self) -> bool {
        self.demand.iter().any(|count| *count > 0)
    }

    /// The queue's reference is the only one left: nobody displays the file
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.file) == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new entry was appended
    New,
    /// An existing entry's counter was bumped
    Coalesced,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: VecDeque<ThumbnailRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, file: &Arc<FileInfo>, class: SizeClass) -> Enqueued {
        let existing = self
            .requests
            .iter()
            .position(|req| Arc::ptr_eq(&req.file, file) || req.file.name() == file.name());

        let (index, result) = match existing {
            Some(index) => (index, Enqueued::Coalesced),
            None => {
                self.requests.push_back(ThumbnailRequest::new(Arc::clone(file)));
                (self.requests.len() - 1, Enqueued::New)
            }
        };

        self.requests[index].demand[class.index()] += 1;
        result
    }

    /// Withdraw one unit of demand for `class` from every entry, dropping
    /// entries nobody wants any more. Returns true if the queue is now empty.
    pub fn cancel_class(&mut self, class: SizeClass) -> bool {
        for request in self.requests.iter_mut() {
            let count = &mut request.demand[class.index()];
            *count = count.saturating_sub(1);
        }
        self.requests.retain(ThumbnailRequest::is_wanted);
        self.requests.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<ThumbnailRequest> {
        self.requests.pop_front()
    }

    /// Demand for a queued file, `None` if it isn't queued
    pub fn demand(&self, name: &str, class: SizeClass) -> Option<u32> {
        self.requests
            .iter()
            .find(|req| req.file.name() == name)
            .map(|req| req.demand(class))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

/// Finished files waiting for the directory to be told
#[derive(Debug, Default)]
pub struct UpdateQueue {
    files: VecDeque<Arc<FileInfo>>,
}

impl UpdateQueue {
    pub fn push(&mut self, file: Arc<FileInfo>) {
        self.files.push_back(file);
    }

    pub fn pop(&mut self) -> Option<Arc<FileInfo>> {
        self.files.pop_front()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

//! Background worker draining a loader's request queue
//!
//! One thread per active loader. The worker pops requests under the shared
//! lock, does the slow part (thumbnail or folder size) without it, and hands
//! finished files to the directory with the lock released.

use parking_lot::{Mutex, MutexGuard};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::deep_size::{deep_size, is_protected};
use super::queue::{RequestQueue, ThumbnailRequest, UpdateQueue};
use super::LoaderContext;
use crate::dir::DirectoryModel;
use crate::state::FileInfo;

/// Lifecycle of one worker thread
///
/// `Draining` and `Terminated` are both "stale": the thread will not pop any
/// more requests, so new work needs a fresh worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Active = 0,
    Draining = 1,
    Terminated = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Active,
            1 => WorkerState::Draining,
            _ => WorkerState::Terminated,
        }
    }
}

/// Both queues live behind the loader's single lock
#[derive(Debug, Default)]
pub(crate) struct Queues {
    pub requests: RequestQueue,
    pub updates: UpdateQueue,
}

/// State shared between a loader and its worker threads
pub(crate) struct Shared {
    pub queues: Mutex<Queues>,
    pub dir: Weak<dyn DirectoryModel>,
    pub context: LoaderContext,
}

#[derive(Debug)]
pub(crate) struct WorkerControl {
    cancelled: AtomicBool,
    state: AtomicU8,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Active as u8),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// The loader's handle on one worker thread
pub(crate) struct WorkerHandle {
    control: Arc<WorkerControl>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Must be checked with the queue lock held; the worker only leaves
    /// `Active` while holding it. A cancelled worker never pops again, so it
    /// counts as stale even before it gets there.
    pub fn is_stale(&self) -> bool {
        self.control.state() != WorkerState::Active || self.control.is_cancelled()
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread to exit. A worker dropping the last reference to
    /// its own directory ends up here on its own thread; it is already on
    /// its way out, so it is not joined.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("Thumbnail worker panicked");
            }
        }
    }
}

pub(crate) fn spawn(shared: Arc<Shared>) -> WorkerHandle {
    let control = Arc::new(WorkerControl::new());
    let worker_control = Arc::clone(&control);

    let thread = thread::Builder::new()
        .name("thumbnail-loader".to_string())
        .spawn(move || run(&shared, &worker_control));

    match thread {
        Ok(thread) => WorkerHandle {
            control,
            thread: Some(thread),
        },
        Err(e) => {
            // Stale right away, so the next request tries again
            warn!("Could not start thumbnail worker: {}", e);
            control.set_state(WorkerState::Terminated);
            WorkerHandle {
                control,
                thread: None,
            }
        }
    }
}

fn run(shared: &Shared, control: &WorkerControl) {
    while !control.is_cancelled() {
        let request = {
            let mut queues = shared.queues.lock();
            match queues.requests.pop_front() {
                Some(request) if request.is_abandoned() => {
                    debug!("Nobody shows {} any more, skipping", request.file().name());
                    continue;
                }
                Some(request) => request,
                None => {
                    control.set_state(WorkerState::Draining);
                    break;
                }
            }
        };

        let Some(dir) = shared.dir.upgrade() else {
            break;
        };

        let processed = process(shared, control, dir.as_ref(), &request);

        if processed && !control.is_cancelled() {
            let mut queues = shared.queues.lock();
            queues.updates.push(Arc::clone(request.file()));
            deliver_updates(&mut queues, dir.as_ref());
        }
    }

    // Upgraded outside the lock: if this turns out to be the last reference,
    // dropping it tears the loader down and takes the lock itself
    let dir = shared.dir.upgrade();
    {
        let mut queues = shared.queues.lock();
        control.set_state(WorkerState::Draining);

        if let Some(dir) = dir.as_deref().filter(|_| !control.is_cancelled()) {
            deliver_updates(&mut queues, dir);
        }
    }
    drop(dir);

    control.set_state(WorkerState::Terminated);
}

/// Notify the directory about every finished file, releasing the lock
/// around each callback
fn deliver_updates(queues: &mut MutexGuard<'_, Queues>, dir: &dyn DirectoryModel) {
    while let Some(file) = queues.updates.pop() {
        MutexGuard::unlocked(queues, || dir.thumbnail_loaded(&file));
    }
}

/// Returns true if any size class was handled for the request
fn process(
    shared: &Shared,
    control: &WorkerControl,
    dir: &dyn DirectoryModel,
    request: &ThumbnailRequest,
) -> bool {
    let file = request.file();
    let path = dir.path().join(file.name());

    if file.is_dir() {
        if !request.is_wanted() {
            return false;
        }
        update_deep_size(shared, control, dir, file, &path);
        return true;
    }

    let mut processed = false;
    for class in request.wanted() {
        if !file.is_thumbnail_loaded(class) {
            let size = shared.context.config.pixel_size(class);
            let thumbnail = shared
                .context
                .store
                .load_for_file(&path, size, file.mtime(), file.mime_type());
            if let Some(thumbnail) = thumbnail {
                file.set_thumbnail(class, thumbnail);
            }
        }
        processed = true;
    }
    processed
}

fn update_deep_size(
    shared: &Shared,
    control: &WorkerControl,
    dir: &dyn DirectoryModel,
    file: &FileInfo,
    path: &Path,
) {
    let protected_roots = &shared.context.config.protected_roots;

    if is_protected(path, protected_roots) || dir.avoid_changes() || dir.avoid_changes_for(path) {
        debug!("Not sizing {}", path.display());
        return;
    }
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        _ => return,
    }
    if control.is_cancelled() {
        return;
    }

    let size = deep_size(path, &control.cancelled, |candidate| {
        is_protected(candidate, protected_roots) || dir.avoid_changes_for(candidate)
    });

    if !size.cancelled && !control.is_cancelled() {
        file.set_size(size.bytes);
    }
}

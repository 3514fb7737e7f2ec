//! Per-directory thumbnail loader
//!
//! Each directory view owns at most one `ThumbnailLoader`, created the first
//! time the view asks for something and torn down when all demand is
//! cancelled or the view goes away:
//! - `request` queues a file and makes sure a live worker will see it
//! - `cancel_all` withdraws one size class and frees an emptied loader
//! - `LoaderSlot::free` is the directory's own teardown path

pub mod deep_size;
pub mod queue;
mod worker;

pub use deep_size::{deep_size, DeepSize};
pub use queue::{Enqueued, RequestQueue, ThumbnailRequest, UpdateQueue};
pub use worker::WorkerState;

use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::config::ThumbnailConfig;
use crate::dir::DirectoryModel;
use crate::state::{FileInfo, SizeClass};
use crate::thumbnail::ThumbnailStore;
use worker::{Queues, Shared, WorkerHandle};

/// What every loader needs regardless of its directory
#[derive(Debug, Clone)]
pub struct LoaderContext {
    pub store: Arc<ThumbnailStore>,
    pub config: Arc<ThumbnailConfig>,
}

impl LoaderContext {
    pub fn new(store: ThumbnailStore, config: ThumbnailConfig) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }
}

pub struct ThumbnailLoader {
    shared: Arc<Shared>,
    worker: Option<WorkerHandle>,
    /// Stale workers that may still be delivering their last updates
    retired: Vec<WorkerHandle>,
}

impl ThumbnailLoader {
    fn new(dir: Weak<dyn DirectoryModel>, context: LoaderContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                dir,
                context,
            }),
            worker: None,
            retired: Vec::new(),
        }
    }

    fn enqueue(&mut self, file: &Arc<FileInfo>, class: SizeClass) {
        let needs_worker = {
            let mut queues = self.shared.queues.lock();
            // Decided under the lock the worker uses to go stale, so a request
            // can never land behind a worker that already stopped popping
            let needs_worker = self.worker.as_ref().map_or(true, WorkerHandle::is_stale);
            queues.requests.enqueue(file, class);
            needs_worker
        };

        if needs_worker {
            self.retired.retain_mut(|old| {
                if old.is_finished() {
                    old.join();
                    false
                } else {
                    true
                }
            });
            if let Some(old) = self.worker.take() {
                self.retired.push(old);
            }
            self.worker = Some(worker::spawn(Arc::clone(&self.shared)));
        }
    }

    /// Apply `RequestQueue::cancel_class`; true if the queue ended up empty
    fn cancel_class(&self, class: SizeClass) -> bool {
        self.shared.queues.lock().requests.cancel_class(class)
    }

    /// Number of queued requests
    pub fn pending(&self) -> usize {
        self.shared.queues.lock().requests.len()
    }

    /// True when no worker is running
    pub fn is_idle(&self) -> bool {
        let current_done = self
            .worker
            .as_ref()
            .map_or(true, |worker| worker.state() == WorkerState::Terminated);
        current_done && self.retired.iter().all(WorkerHandle::is_finished)
    }

    /// Ask every worker to stop without waiting for it
    pub fn cancel(&self) {
        for worker in self.worker.iter().chain(self.retired.iter()) {
            worker.cancel();
        }
    }

    /// Cancel and join the workers, then drop everything still queued
    pub fn destroy(self) {
        // Drop does the work
    }

    fn shutdown(&mut self) {
        self.cancel();
        for mut worker in self.worker.take().into_iter().chain(self.retired.drain(..)) {
            worker.join();
        }

        let mut queues = self.shared.queues.lock();
        let dropped = queues.requests.len();
        queues.requests.clear();
        queues.updates.clear();
        debug!("Thumbnail loader freed, {} requests dropped", dropped);
    }
}

impl Drop for ThumbnailLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThumbnailLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailLoader")
            .field("pending", &self.pending())
            .field("worker", &self.worker.as_ref().map(WorkerHandle::state))
            .field("retired", &self.retired.len())
            .finish()
    }
}

/// The directory's handle on its (lazily created) loader
#[derive(Debug)]
pub struct LoaderSlot {
    context: LoaderContext,
    loader: Mutex<Option<ThumbnailLoader>>,
}

impl LoaderSlot {
    pub fn new(context: LoaderContext) -> Self {
        Self {
            context,
            loader: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &LoaderContext {
        &self.context
    }

    /// Access the loader, if any, for inspection
    pub fn lock(&self) -> MutexGuard<'_, Option<ThumbnailLoader>> {
        self.loader.lock()
    }

    pub fn has_loader(&self) -> bool {
        self.loader.lock().is_some()
    }

    /// Request cancellation of the running worker without waiting
    pub fn cancel(&self) {
        if let Some(loader) = self.loader.lock().as_ref() {
            loader.cancel();
        }
    }

    /// Tear the loader down, waiting for its worker to exit
    pub fn free(&self) {
        // Take it out first: the worker's callbacks may touch this slot
        let loader = self.loader.lock().take();
        if let Some(loader) = loader {
            loader.destroy();
        }
    }
}

/// Queue a thumbnail (or, for a directory entry, a folder size) for `file`
pub fn request<D>(dir: &Arc<D>, file: &Arc<FileInfo>, class: SizeClass)
where
    D: DirectoryModel + 'static,
{
    let slot = dir.loader_slot();
    let mut guard = slot.loader.lock();

    let loader = guard.get_or_insert_with(|| {
        info!("Starting thumbnail loader for {}", dir.path().display());
        let weak: Weak<dyn DirectoryModel> = Arc::downgrade(dir) as Weak<dyn DirectoryModel>;
        ThumbnailLoader::new(weak, slot.context.clone())
    });

    loader.enqueue(file, class);
}

/// Withdraw one request of `class` for every queued file; frees the loader
/// when nothing is left
pub fn cancel_all<D>(dir: &D, class: SizeClass)
where
    D: DirectoryModel + ?Sized,
{
    let slot = dir.loader_slot();
    let emptied = {
        let mut guard = slot.loader.lock();
        let empty = guard
            .as_ref()
            .is_some_and(|loader| loader.cancel_class(class));
        if empty {
            guard.take()
        } else {
            None
        }
    };

    if let Some(loader) = emptied {
        loader.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileKind;
    use image::{Rgb, RgbImage};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Blocks the worker the first time it asks about `at`
    struct Gate {
        at: PathBuf,
        entered: Sender<()>,
        go: Receiver<()>,
    }

    struct TestDir {
        path: PathBuf,
        slot: LoaderSlot,
        excluded: Vec<PathBuf>,
        loaded: Mutex<Sender<String>>,
        gate: Mutex<Option<Gate>>,
    }

    impl DirectoryModel for TestDir {
        fn path(&self) -> &Path {
            &self.path
        }

        fn avoid_changes_for(&self, path: &Path) -> bool {
            let gate = {
                let mut gate = self.gate.lock();
                if gate.as_ref().is_some_and(|g| g.at == path) {
                    gate.take()
                } else {
                    None
                }
            };
            if let Some(gate) = gate {
                gate.entered.send(()).unwrap();
                let _ = gate.go.recv();
            }
            self.excluded.iter().any(|excluded| excluded == path)
        }

        fn thumbnail_loaded(&self, file: &Arc<FileInfo>) {
            let _ = self.loaded.lock().send(file.name().to_string());
        }

        fn loader_slot(&self) -> &LoaderSlot {
            &self.slot
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        dir: Arc<TestDir>,
        loaded: Receiver<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let listing = temp_dir.path().join("listing");
            fs::create_dir(&listing).unwrap();

            let config = ThumbnailConfig {
                cache_root: temp_dir.path().join("cache"),
                video_thumbnails: false,
                ..Default::default()
            };
            let store = ThumbnailStore::init(&config).unwrap();
            let (tx, rx) = mpsc::channel();

            let dir = Arc::new(TestDir {
                path: listing,
                slot: LoaderSlot::new(LoaderContext::new(store, config)),
                excluded: Vec::new(),
                loaded: Mutex::new(tx),
                gate: Mutex::new(None),
            });

            Fixture {
                _temp_dir: temp_dir,
                dir,
                loaded: rx,
            }
        }

        fn photo(&self, name: &str) -> Arc<FileInfo> {
            let path = self.dir.path.join(name);
            RgbImage::from_pixel(300, 200, Rgb([10, 200, 10]))
                .save(&path)
                .unwrap();
            Arc::new(FileInfo::from_path(&path).unwrap())
        }

        fn folder(&self, name: &str, files: &[u64]) -> Arc<FileInfo> {
            let path = self.dir.path.join(name);
            fs::create_dir(&path).unwrap();
            for (i, len) in files.iter().enumerate() {
                fs::write(path.join(format!("f{}", i)), vec![0u8; *len as usize]).unwrap();
            }
            Arc::new(FileInfo::new(name, FileKind::Directory, 1234))
        }

        /// Make the worker stop inside the size walk of `folder`, at `child`
        fn gate_at(&self, child: PathBuf) -> (Receiver<()>, Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (go_tx, go_rx) = mpsc::channel();
            *self.dir.gate.lock() = Some(Gate {
                at: child,
                entered: entered_tx,
                go: go_rx,
            });
            (entered_rx, go_tx)
        }

        fn next_loaded(&self) -> String {
            self.loaded.recv_timeout(TIMEOUT).unwrap()
        }

        fn wait_idle(&self) {
            let deadline = Instant::now() + TIMEOUT;
            while !self.dir.slot.lock().as_ref().map_or(true, ThumbnailLoader::is_idle) {
                assert!(Instant::now() < deadline);
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn stats(&self) -> (u64, u64) {
            let store = &self.dir.slot.context().store;
            (store.stats().generated(), store.stats().direct_loads())
        }
    }

    #[test]
    fn test_thumbnail_and_folder_size_are_delivered() {
        let fixture = Fixture::new();
        let photo = fixture.photo("photo.png");
        let folder = fixture.folder("docs", &[10, 20, 30]);

        request(&fixture.dir, &photo, SizeClass::Large);
        request(&fixture.dir, &folder, SizeClass::Large);

        assert_eq!(fixture.next_loaded(), "photo.png");
        assert_eq!(fixture.next_loaded(), "docs");

        let thumb = photo.thumbnail(SizeClass::Large).unwrap();
        // 300x200 is cached at 128x85 first
        assert_eq!((thumb.width(), thumb.height()), (48, 31));
        assert!(!photo.is_thumbnail_loaded(SizeClass::Small));
        assert_eq!(folder.size(), 60);

        fixture.dir.slot.free();
        assert!(!fixture.dir.slot.has_loader());
    }

    #[test]
    fn test_excluded_mount_child_is_not_counted() {
        let fixture = Fixture::new();
        let folder = fixture.folder("D", &[10, 20, 30]);
        let mount = fixture.dir.path.join("D").join("mnt");
        fs::create_dir(&mount).unwrap();
        fs::write(mount.join("disk.img"), vec![0u8; 4096]).unwrap();

        let dir = Arc::new(TestDir {
            path: fixture.dir.path.clone(),
            slot: LoaderSlot::new(fixture.dir.slot.context().clone()),
            excluded: vec![mount],
            loaded: Mutex::new(fixture.dir.loaded.lock().clone()),
            gate: Mutex::new(None),
        });

        request(&dir, &folder, SizeClass::Small);
        assert_eq!(fixture.next_loaded(), "D");
        assert_eq!(folder.size(), 60);
    }

    #[test]
    fn test_avoid_changes_view_skips_folder_size() {
        let fixture = Fixture::new();
        let folder = fixture.folder("remote", &[10]);

        // The excluded directory itself is never walked
        let dir = Arc::new(TestDir {
            path: fixture.dir.path.clone(),
            slot: LoaderSlot::new(fixture.dir.slot.context().clone()),
            excluded: vec![fixture.dir.path.join("remote")],
            loaded: Mutex::new(fixture.dir.loaded.lock().clone()),
            gate: Mutex::new(None),
        });

        request(&dir, &folder, SizeClass::Large);
        assert_eq!(fixture.next_loaded(), "remote");
        assert_eq!(folder.size(), 1234);
    }

    #[test]
    fn test_abandoned_request_is_skipped() {
        let fixture = Fixture::new();
        let blocker = fixture.folder("blocker", &[1]);
        let (entered, go) = fixture.gate_at(fixture.dir.path.join("blocker"));

        request(&fixture.dir, &blocker, SizeClass::Large);
        entered.recv_timeout(TIMEOUT).unwrap();

        // Queued behind the blocker, then forgotten by the view
        let photo = fixture.photo("gone.png");
        request(&fixture.dir, &photo, SizeClass::Large);
        drop(photo);
        let tail = fixture.folder("tail", &[]);
        request(&fixture.dir, &tail, SizeClass::Large);

        go.send(()).unwrap();
        assert_eq!(fixture.next_loaded(), "blocker");
        assert_eq!(fixture.next_loaded(), "tail");
        assert_eq!(fixture.stats(), (0, 0));
    }

    #[test]
    fn test_cancel_stops_popping_and_keeps_size() {
        let fixture = Fixture::new();
        let folder = fixture.folder("D", &[10, 20, 30]);
        fs::create_dir(fixture.dir.path.join("D").join("sub")).unwrap();
        let (entered, go) = fixture.gate_at(fixture.dir.path.join("D").join("sub"));

        request(&fixture.dir, &folder, SizeClass::Large);
        entered.recv_timeout(TIMEOUT).unwrap();

        let photos: Vec<_> = (0..5)
            .map(|i| fixture.photo(&format!("p{}.png", i)))
            .collect();
        for photo in &photos {
            request(&fixture.dir, photo, SizeClass::Large);
        }

        fixture.dir.slot.cancel();
        go.send(()).unwrap();
        fixture.dir.slot.free();

        assert_eq!(folder.size(), 1234);
        assert!(photos.iter().all(|p| !p.is_thumbnail_loaded(SizeClass::Large)));
        assert_eq!(fixture.stats(), (0, 0));
        assert!(fixture.loaded.try_recv().is_err());
    }

    #[test]
    fn test_request_after_cancel_starts_a_new_worker() {
        let fixture = Fixture::new();
        let blocker = fixture.folder("blocker", &[1]);
        let (entered, go) = fixture.gate_at(fixture.dir.path.join("blocker"));

        request(&fixture.dir, &blocker, SizeClass::Large);
        entered.recv_timeout(TIMEOUT).unwrap();

        // The parked worker is still Active but will never pop again
        fixture.dir.slot.cancel();
        let later = fixture.folder("later", &[7]);
        request(&fixture.dir, &later, SizeClass::Large);
        go.send(()).unwrap();

        assert_eq!(fixture.next_loaded(), "later");
        assert_eq!(later.size(), 7);
        assert_eq!(blocker.size(), 1234);

        fixture.wait_idle();
        assert_eq!(fixture.dir.slot.lock().as_ref().map(ThumbnailLoader::pending), Some(0));
    }

    #[test]
    fn test_cancel_all_keeps_loader_with_remaining_demand() {
        let fixture = Fixture::new();
        let blocker = fixture.folder("blocker", &[]);
        let (entered, go) = fixture.gate_at(fixture.dir.path.join("blocker"));

        request(&fixture.dir, &blocker, SizeClass::Large);
        entered.recv_timeout(TIMEOUT).unwrap();

        let both = fixture.photo("both.png");
        let small = fixture.photo("small.png");
        request(&fixture.dir, &both, SizeClass::Large);
        request(&fixture.dir, &both, SizeClass::Small);
        request(&fixture.dir, &small, SizeClass::Small);

        cancel_all(fixture.dir.as_ref(), SizeClass::Small);
        {
            let guard = fixture.dir.slot.lock();
            let loader = guard.as_ref().unwrap();
            assert_eq!(loader.pending(), 1);
        }

        go.send(()).unwrap();
        assert_eq!(fixture.next_loaded(), "blocker");
        assert_eq!(fixture.next_loaded(), "both.png");
        assert!(both.is_thumbnail_loaded(SizeClass::Large));
        assert!(!both.is_thumbnail_loaded(SizeClass::Small));
        assert!(!small.is_thumbnail_loaded(SizeClass::Small));
    }

    #[test]
    fn test_cancel_all_frees_emptied_loader() {
        let fixture = Fixture::new();
        let blocker = fixture.folder("blocker", &[]);
        let (entered, go) = fixture.gate_at(fixture.dir.path.join("blocker"));

        request(&fixture.dir, &blocker, SizeClass::Small);
        entered.recv_timeout(TIMEOUT).unwrap();
        let photo = fixture.photo("a.png");
        request(&fixture.dir, &photo, SizeClass::Small);

        // cancel_all joins the worker, which is parked until `go` goes away
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            drop(go);
        });
        cancel_all(fixture.dir.as_ref(), SizeClass::Small);
        releaser.join().unwrap();

        assert!(!fixture.dir.slot.has_loader());
    }

    #[test]
    fn test_new_worker_after_previous_one_finished() {
        let fixture = Fixture::new();
        let first = fixture.folder("first", &[5]);
        request(&fixture.dir, &first, SizeClass::Large);
        assert_eq!(fixture.next_loaded(), "first");

        // Ask again once the first worker has gone away
        fixture.wait_idle();

        let second = fixture.folder("second", &[7]);
        request(&fixture.dir, &second, SizeClass::Large);
        assert_eq!(fixture.next_loaded(), "second");
        assert_eq!(second.size(), 7);
    }

    #[test]
    fn test_dropping_directory_frees_loader() {
        let fixture = Fixture::new();
        let folder = fixture.folder("docs", &[1]);
        request(&fixture.dir, &folder, SizeClass::Large);
        assert_eq!(fixture.next_loaded(), "docs");
        fixture.wait_idle();

        let Fixture { dir, _temp_dir, .. } = fixture;
        let weak = Arc::downgrade(&dir);
        drop(dir);
        assert!(weak.upgrade().is_none());
    }
}

use clap::Parser;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use thumbnail_loader::loader::ThumbnailLoader;
use thumbnail_loader::{
    loader, DirectoryModel, FileInfo, LoaderContext, LoaderSlot, SizeClass, ThumbnailConfig,
    ThumbnailStore,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "thumbnail-loader")]
#[command(about = "Load thumbnails and folder sizes the way a file manager view does")]
#[command(version)]
struct Cli {
    /// Directory to list
    #[arg(required_unless_present = "file")]
    dir: Option<PathBuf>,

    /// Use the large size class instead of the small one
    #[arg(long)]
    large: bool,

    /// Load the preview of a single file instead of a directory
    #[arg(long, conflicts_with = "dir")]
    file: Option<PathBuf>,

    /// Edge length in pixels for --file (defaults to the size class)
    #[arg(long, requires = "file")]
    size: Option<u32>,
}

/// A plain directory listing that reports every completion on a channel
struct FsDirectory {
    path: PathBuf,
    slot: LoaderSlot,
    #[cfg(unix)]
    device: Option<u64>,
    done: Mutex<Sender<Arc<FileInfo>>>,
}

impl FsDirectory {
    fn new(path: PathBuf, context: LoaderContext, done: Sender<Arc<FileInfo>>) -> Self {
        Self {
            #[cfg(unix)]
            device: device_of(&path),
            path,
            slot: LoaderSlot::new(context),
            done: Mutex::new(done),
        }
    }
}

#[cfg(unix)]
fn device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    fs::symlink_metadata(path).ok().map(|meta| meta.dev())
}

impl DirectoryModel for FsDirectory {
    fn path(&self) -> &Path {
        &self.path
    }

    /// Don't wander onto other filesystems while summing folder sizes
    #[cfg(unix)]
    fn avoid_changes_for(&self, path: &Path) -> bool {
        match (self.device, device_of(path)) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        }
    }

    fn thumbnail_loaded(&self, file: &Arc<FileInfo>) {
        let _ = self.done.lock().send(Arc::clone(file));
    }

    fn loader_slot(&self) -> &LoaderSlot {
        &self.slot
    }
}

fn list_directory(context: LoaderContext, path: PathBuf, class: SizeClass) -> std::io::Result<()> {
    let mut files: Vec<Arc<FileInfo>> = Vec::new();
    for entry in fs::read_dir(&path)? {
        let entry = entry?;
        match FileInfo::from_path(&entry.path()) {
            Ok(info) => files.push(Arc::new(info)),
            Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }
    files.sort_by(|a, b| a.name().cmp(b.name()));

    println!("🔍 Loading {} entries in {}", files.len(), path.display());

    let (tx, rx) = mpsc::channel();
    let dir = Arc::new(FsDirectory::new(path, context.clone(), tx));

    for file in &files {
        loader::request(&dir, file, class);
    }

    let reported = collect_updates(&dir, &rx, files.len(), |file| print_entry(file, class));
    if reported < files.len() {
        warn!("Loader stopped with {} entries unreported", files.len() - reported);
    }

    dir.loader_slot().free();

    let stats = context.store.stats();
    println!(
        "✅ Done: {} cache hits, {} generated, {} decoded directly",
        stats.cache_hits(),
        stats.generated(),
        stats.direct_loads()
    );
    Ok(())
}

fn print_entry(file: &FileInfo, class: SizeClass) {
    if file.is_dir() {
        println!("📁 {}/  {}", file.name(), file.disp_size());
    } else if let Some(thumbnail) = file.thumbnail(class) {
        println!("🖼️  {}  {}x{}", file.name(), thumbnail.width(), thumbnail.height());
    } else {
        println!("   {}  (no preview)", file.name());
    }
}

/// Wait for up to `expected` completions. Gives up once the loader has no
/// running worker, e.g. when a thread could not be spawned.
fn collect_updates(
    dir: &FsDirectory,
    rx: &Receiver<Arc<FileInfo>>,
    expected: usize,
    mut on_update: impl FnMut(&FileInfo),
) -> usize {
    let mut received = 0;
    while received < expected {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(file) => {
                on_update(file.as_ref());
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                let idle = dir
                    .loader_slot()
                    .lock()
                    .as_ref()
                    .map_or(true, ThumbnailLoader::is_idle);
                if idle {
                    // Anything sent just before the worker finished
                    for file in rx.try_iter().take(expected - received) {
                        on_update(file.as_ref());
                        received += 1;
                    }
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    received
}

async fn load_one(store: Arc<ThumbnailStore>, path: PathBuf, size: u32) {
    let name = path.display().to_string();
    match store.load_for_file_async(path, size, None, None).await {
        Some(thumbnail) => println!("🖼️  {}  {}x{}", name, thumbnail.width(), thumbnail.height()),
        None => println!("   {}  (no preview)", name),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match ThumbnailConfig::load_or_default() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let store = match ThumbnailStore::init(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("Could not open the thumbnail cache: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let class = if cli.large {
        SizeClass::Large
    } else {
        SizeClass::Small
    };
    let context = LoaderContext::new(store, config);

    if let Some(file) = cli.file {
        let size = cli.size.unwrap_or_else(|| context.config.pixel_size(class));
        load_one(Arc::clone(&context.store), file, size).await;
        return ExitCode::SUCCESS;
    }

    let Some(dir) = cli.dir else {
        return ExitCode::FAILURE;
    };
    info!("Size class {:?}, {} px", class, context.config.pixel_size(class));

    let result = tokio::task::spawn_blocking(move || list_directory(context, dir, class)).await;
    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("Could not list directory: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Directory listing panicked: {}", e);
            ExitCode::FAILURE
        }
    }
}

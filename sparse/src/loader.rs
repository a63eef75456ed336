//! The background worker that services the hot set against the file.
//!
//! One loader thread per buffer, driven by a bounded command queue. All file
//! I/O happens here with the store mutex released; the mutex is taken only to
//! pick work and to commit results. Cancellation is observed between chunks.

use crate::{watched, SourceFile, SparseStore};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug)]
pub enum Command {
    /// Something changed (hot set, budget, new background work); re-scan.
    Wake,
    Shutdown,
}

/// Called after a chunk is read, before it is committed to the store, with
/// the store mutex released. The linemap resolve pass hangs off this hook.
pub type CommitHook = Box<dyn FnMut(u64, &[u8]) + Send>;

/// Called when the loader has no hot-set work. Returns true if it made
/// progress and wants to be called again (e.g. a pending layout batch).
pub type IdleHook = Box<dyn FnMut() -> bool + Send>;

pub struct LoaderOptions {
    pub store: Arc<Mutex<SparseStore>>,
    pub file: Arc<dyn SourceFile>,
    /// Upper bound on a single read, so cancellation stays responsive.
    pub read_chunk: usize,
    pub on_commit: CommitHook,
    pub on_idle: IdleHook,
}

/// Handle owned by the buffer; dropping it shuts the worker down.
pub struct LoaderHandle {
    tx: Sender<Command>,
    join: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    idle: Arc<AtomicBool>,
    error: Arc<Mutex<Option<io::Error>>>,
}

impl LoaderHandle {
    pub fn spawn(opts: LoaderOptions) -> Self {
        let (tx, rx) = bounded(4);
        let cancel = Arc::new(AtomicBool::new(false));
        let idle = Arc::new(AtomicBool::new(false));
        let error = Arc::new(Mutex::new(None));

        let worker = Loader {
            store: opts.store,
            file: opts.file,
            rx,
            cancel: cancel.clone(),
            idle: idle.clone(),
            error: error.clone(),
            on_commit: opts.on_commit,
            on_idle: opts.on_idle,
            read_chunk: opts.read_chunk.max(1),
        };
        let join = std::thread::Builder::new()
            .name("tarn-loader".into())
            .spawn(move || worker.run())
            .expect("spawning loader thread");

        Self {
            tx,
            join: Some(join),
            cancel,
            idle,
            error,
        }
    }

    /// Nudge the worker. Never blocks; a full queue already guarantees a
    /// pending wakeup.
    pub fn wake(&self) {
        match self.tx.try_send(Command::Wake) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => warn!("loader is gone"),
        }
    }

    /// True when the worker is parked with nothing to do.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// The most recent I/O error, if any. The affected region is already
    /// marked failed in the store.
    pub fn take_error(&self) -> Option<io::Error> {
        self.error.lock().take()
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Drain outstanding commands and join the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.tx.try_send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("loader thread panicked");
            }
        }
    }
}

impl Drop for LoaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Loader {
    store: Arc<Mutex<SparseStore>>,
    file: Arc<dyn SourceFile>,
    rx: Receiver<Command>,
    cancel: Arc<AtomicBool>,
    idle: Arc<AtomicBool>,
    error: Arc<Mutex<Option<io::Error>>>,
    on_commit: CommitHook,
    on_idle: IdleHook,
    read_chunk: usize,
}

impl Loader {
    fn run(mut self) {
        debug!("loader running");
        while !self.cancelled() {
            let mut shutdown = false;
            while let Ok(cmd) = self.rx.try_recv() {
                if matches!(cmd, Command::Shutdown) {
                    shutdown = true;
                }
            }
            if shutdown {
                break;
            }

            let work = {
                let mut store = watched(&self.store, "sparse-store");
                // Eviction is bounded per pass; the budget is honored
                // eventually, not instantly.
                for _ in 0..16 {
                    if !store.evict_step() {
                        break;
                    }
                }
                store.next_missing()
            };

            match work {
                Some((range, class)) => {
                    let len = (range.end - range.start).min(self.read_chunk as u64) as usize;
                    debug!(start = range.start, len, ?class, "loading chunk");
                    self.load(range.start, len);
                }
                None => {
                    if (self.on_idle)() {
                        continue;
                    }
                    self.idle.store(true, Ordering::Relaxed);
                    let cmd = self.rx.recv();
                    self.idle.store(false, Ordering::Relaxed);
                    match cmd {
                        Ok(Command::Wake) => {}
                        Ok(Command::Shutdown) | Err(_) => break,
                    }
                }
            }
        }
        debug!("loader finishing");
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn load(&mut self, offset: u64, len: usize) {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            if self.cancelled() {
                return;
            }
            match self.file.read_at(offset + filled as u64, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(offset, len, error = %e, "read failed; marking region unavailable");
                    let mut store = watched(&self.store, "sparse-store");
                    store.mark_failed(offset..offset + len as u64);
                    *self.error.lock() = Some(e);
                    return;
                }
            }
        }

        if filled < len {
            // The file ended short of its declared length; whatever is
            // missing can never load.
            warn!(offset, len, filled, "short read; marking tail unavailable");
            let mut store = watched(&self.store, "sparse-store");
            store.mark_failed(offset + filled as u64..offset + len as u64);
            *self.error.lock() = Some(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than its declared length",
            ));
        }
        if filled == 0 {
            return;
        }

        buf.truncate(filled);
        (self.on_commit)(offset, &buf);
        let mut store = watched(&self.store, "sparse-store");
        store.commit(offset, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeSignal, HotClass, HotRange, MemoryFile, ReadWindow};
    use std::time::Duration;

    fn harness(
        contents: &[u8],
        budget: usize,
        read_chunk: usize,
    ) -> (Arc<Mutex<SparseStore>>, Arc<ChangeSignal>, LoaderHandle) {
        let signal = Arc::new(ChangeSignal::new());
        let file = Arc::new(MemoryFile::new(contents.to_vec()));
        let store = Arc::new(Mutex::new(SparseStore::new(
            file.len(),
            budget,
            signal.clone(),
        )));
        let handle = LoaderHandle::spawn(LoaderOptions {
            store: store.clone(),
            file,
            read_chunk,
            on_commit: Box::new(|_, _| {}),
            on_idle: Box::new(|| false),
        });
        (store, signal, handle)
    }

    fn wait_resident(
        store: &Arc<Mutex<SparseStore>>,
        signal: &Arc<ChangeSignal>,
        range: std::ops::Range<u64>,
    ) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let seen = {
                let mut s = store.lock();
                let got = s.read_forward(range.start).bytes().len() as u64;
                if got >= range.end - range.start {
                    return;
                }
                s.epoch()
            };
            assert!(std::time::Instant::now() < deadline, "loader made no progress");
            signal.wait_past(seen, Duration::from_millis(100));
        }
    }

    #[test]
    fn hot_set_becomes_resident() {
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let (store, signal, handle) = harness(&data, 1 << 20, 512);
        store.lock().set_hot_set([HotRange {
            range: 1000..3000,
            class: HotClass::Viewport,
        }]);
        handle.wake();
        wait_resident(&store, &signal, 1000..3000);
        let mut s = store.lock();
        assert_eq!(s.read_forward(1000).bytes()[..10], data[1000..1010]);
        handle.take_error().map(|e| panic!("unexpected error: {e}"));
    }

    #[test]
    fn failing_file_leaves_sticky_region() {
        struct Broken;
        impl SourceFile for Broken {
            fn len(&self) -> u64 {
                1024
            }
            fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "bad disk"))
            }
        }

        let signal = Arc::new(ChangeSignal::new());
        let store = Arc::new(Mutex::new(SparseStore::new(1024, 1 << 20, signal.clone())));
        let handle = LoaderHandle::spawn(LoaderOptions {
            store: store.clone(),
            file: Arc::new(Broken),
            read_chunk: 256,
            on_commit: Box::new(|_, _| {}),
            on_idle: Box::new(|| false),
        });
        let seen = signal.current();
        store.lock().set_hot_set([HotRange {
            range: 0..512,
            class: HotClass::Viewport,
        }]);
        handle.wake();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = seen;
        loop {
            {
                let mut s = store.lock();
                if matches!(s.read_forward(0), ReadWindow::Failed) {
                    break;
                }
                seen = s.epoch();
            }
            assert!(std::time::Instant::now() < deadline, "failure never surfaced");
            signal.wait_past(seen, Duration::from_millis(100));
        }
        assert!(handle.take_error().is_some());
    }

    #[test]
    fn commit_hook_sees_bytes_before_the_store() {
        let data = vec![7u8; 2048];
        let signal = Arc::new(ChangeSignal::new());
        let file = Arc::new(MemoryFile::new(data));
        let store = Arc::new(Mutex::new(SparseStore::new(2048, 1 << 20, signal.clone())));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let hook_store = store.clone();
        let handle = LoaderHandle::spawn(LoaderOptions {
            store: store.clone(),
            file,
            read_chunk: 1024,
            on_commit: Box::new(move |offset, bytes| {
                // The chunk must not be resident yet when the hook runs.
                let resident = hook_store.lock().read_forward(offset).bytes().len();
                hook_seen.lock().push((offset, bytes.len(), resident));
            }),
            on_idle: Box::new(|| false),
        });
        store.lock().set_hot_set([HotRange {
            range: 0..2048,
            class: HotClass::Viewport,
        }]);
        handle.wake();
        wait_resident(&store, &signal, 0..2048);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|&(_, len, resident)| len == 1024 && resident == 0));
    }

    #[test]
    fn shutdown_joins_quickly() {
        let data = vec![0u8; 1 << 20];
        let (store, _signal, handle) = harness(&data, 1 << 20, 4096);
        store.lock().set_hot_set([HotRange {
            range: 0..(1 << 20),
            class: HotClass::Viewport,
        }]);
        handle.wake();
        let start = std::time::Instant::now();
        handle.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

//! Background save jobs.
//!
//! Saving streams the buffer's runs to a destination file on a worker
//! thread: literal runs from memory, file-backed runs (resident or not) from
//! the backing file. The interactive thread only ever polls job state.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tarn_linemap::Linemap;
use tarn_sparse::SourceFile;
use tracing::{info, warn};

const COPY_CHUNK: usize = 256 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    Running,
    Done,
    Failed(String),
}

#[derive(Default)]
pub(crate) struct SaveJobs {
    states: Arc<Mutex<HashMap<JobId, SaveState>>>,
}

impl SaveJobs {
    pub fn status(&self, id: JobId) -> Option<SaveState> {
        self.states.lock().get(&id).cloned()
    }

    pub fn spawn(
        &self,
        id: JobId,
        snapshot: Linemap,
        file: Arc<dyn SourceFile>,
        dest: PathBuf,
        cancel: Arc<AtomicBool>,
    ) {
        self.states.lock().insert(id, SaveState::Running);
        let states = self.states.clone();
        std::thread::Builder::new()
            .name("tarn-save".into())
            .spawn(move || {
                let outcome = write_snapshot(&snapshot, file.as_ref(), &dest, &cancel);
                let state = match outcome {
                    Ok(()) => {
                        info!(dest = %dest.display(), "save finished");
                        SaveState::Done
                    }
                    Err(e) => {
                        warn!(dest = %dest.display(), error = %e, "save failed");
                        SaveState::Failed(e.to_string())
                    }
                };
                states.lock().insert(id, state);
            })
            .expect("spawning save thread");
    }
}

fn write_snapshot(
    snapshot: &Linemap,
    file: &dyn SourceFile,
    dest: &PathBuf,
    cancel: &AtomicBool,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(dest)?);
    let mut buf = vec![0u8; COPY_CHUNK];
    for run in snapshot.runs() {
        if let Some(bytes) = run.literal_bytes(0..run.len) {
            out.write_all(bytes)?;
            continue;
        }
        let range = run.file_range(0..run.len).expect("non-literal run");
        let mut pos = range.start;
        while pos < range.end {
            if cancel.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "buffer closed"));
            }
            let want = ((range.end - pos) as usize).min(COPY_CHUNK);
            let got = file.read_at(pos, &mut buf[..want])?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backing file ended early",
                ));
            }
            out.write_all(&buf[..got])?;
            pos += got as u64;
        }
    }
    out.flush()
}

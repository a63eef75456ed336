//! The buffer façade: one sparse store plus one linemap behind a pair of
//! short-lived mutexes, mediating every query the interactive thread makes.
//!
//! The façade's job is to keep the interactive thread honest: queries use a
//! `try_lock` on the store and return partial answers instead of waiting,
//! viewport changes are translated into hot-set membership for the loader,
//! and all heavy work (file reads, layout of large regions, saving) happens
//! on background threads that signal completion through a change epoch.

mod config;
mod edit;
mod error;
mod persist;
mod position;
mod save;

pub use config::Config;
pub use edit::{EditRecord, EditSource};
pub use error::{Error, Result};
pub use persist::CompactState;
pub use position::{BufferPosition, BufferRect, Position};
pub use save::{JobId, SaveState};
pub use tarn_linemap::{
    DeltaOutcome, Direction, Glyph, Located, Rounding, SpatialDelta, WidthTable,
};
pub use tarn_sparse::{ChangeSignal, HotClass, HotRange, SourceFile};

use parking_lot::Mutex;
use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};
use tarn_linemap::{
    build_runs, is_utf8_cont, utf8_seq_len, Backing, ByteSource, Linemap, SourceStatus,
};
use tarn_sparse::{
    watched, DiskFile, LoaderHandle, LoaderOptions, ReadWindow, SparseStore,
};
use tracing::{error, warn};

pub(crate) struct Shared {
    pub store: Arc<Mutex<SparseStore>>,
    pub tree: Mutex<Linemap>,
    pub signal: Arc<ChangeSignal>,
}

/// An open file, possibly with unsaved edits. Owns its loader thread; the
/// thread is cancelled and joined when the buffer drops.
pub struct Buffer {
    shared: Arc<Shared>,
    loader: LoaderHandle,
    file: Arc<dyn SourceFile>,
    widths: Arc<WidthTable>,
    cfg: Config,
    backing_path: Option<PathBuf>,
    backing_len: u64,
    edit_log: Vec<EditRecord>,
    jobs: save::SaveJobs,
    next_job: u64,
    quarantined: Option<String>,
}

/// A run of viewport content handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct RectRun {
    /// Virtual offsets the run covers.
    pub range: Range<u64>,
    /// Spatial position of the run's first glyph, relative to the rect's
    /// anchor position.
    pub origin: SpatialDelta,
    pub kind: RunKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunKind {
    Text(String),
    /// Content not yet known; re-query after the epoch advances.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RectContent {
    pub runs: Vec<RectRun>,
    /// Epoch observed while producing the runs; every commit at or before it
    /// is reflected.
    pub epoch: u64,
}

impl Buffer {
    pub fn open_path(path: &Path, cfg: Config, widths: Arc<WidthTable>) -> Result<Self> {
        let file: Arc<dyn SourceFile> = Arc::new(DiskFile::open(path)?);
        Ok(Self::open(file, Some(path.to_path_buf()), cfg, widths))
    }

    pub fn open(
        file: Arc<dyn SourceFile>,
        backing_path: Option<PathBuf>,
        cfg: Config,
        widths: Arc<WidthTable>,
    ) -> Self {
        Self::build(file, backing_path, cfg, widths, None)
    }

    /// Reopen from persisted state. A backing file whose length changed
    /// since the state was captured invalidates the edit log; the buffer
    /// reloads fully unmapped instead.
    pub fn restore(
        state: CompactState,
        file: Arc<dyn SourceFile>,
        cfg: Config,
        widths: Arc<WidthTable>,
    ) -> Self {
        if file.len() != state.backing_len {
            warn!(
                expected = state.backing_len,
                actual = file.len(),
                "backing file length changed; reloading without edits"
            );
            return Self::build(file, state.backing_path, cfg, widths, None);
        }
        Self::build(file, state.backing_path, cfg, widths, Some(state.edits))
    }

    fn build(
        file: Arc<dyn SourceFile>,
        backing_path: Option<PathBuf>,
        cfg: Config,
        widths: Arc<WidthTable>,
        replay: Option<Vec<EditRecord>>,
    ) -> Self {
        let len = file.len();
        let signal = Arc::new(ChangeSignal::new());
        let shared = Arc::new(Shared {
            store: Arc::new(Mutex::new(SparseStore::new(
                len,
                cfg.memory_budget,
                signal.clone(),
            ))),
            tree: Mutex::new(Linemap::open(len)),
            signal,
        });
        let loader = spawn_loader(&shared, &file, &cfg, &widths);
        let mut buffer = Self {
            shared,
            loader,
            file,
            widths,
            cfg,
            backing_path,
            backing_len: len,
            edit_log: Vec::new(),
            jobs: save::SaveJobs::default(),
            next_job: 0,
            quarantined: None,
        };
        if let Some(edits) = replay {
            buffer.replay(edits);
        }
        buffer
    }

    fn replay(&mut self, edits: Vec<EditRecord>) {
        for record in edits {
            let applied = match record {
                EditRecord::Insert { offset, source } => self.insert(offset, source),
                EditRecord::Delete { start, end } => self.delete(start..end),
            };
            if let Err(e) = applied {
                warn!(error = %e, "replay stopped at a stale edit");
                break;
            }
        }
    }

    // ---- observation ----

    pub fn len(&self) -> u64 {
        watched(&self.shared.tree, "linemap").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic change counter covering both loaded data and edits.
    pub fn epoch(&self) -> u64 {
        self.shared.signal.current()
    }

    /// Signal the renderer can wait on; the interactive thread only polls.
    pub fn signal(&self) -> Arc<ChangeSignal> {
        self.shared.signal.clone()
    }

    /// True when the loader has nothing left to do.
    pub fn is_idle(&self) -> bool {
        self.loader.is_idle()
    }

    /// The most recent loader I/O error; the affected file region is already
    /// sticky-unavailable in the store.
    pub fn take_io_error(&self) -> Option<std::io::Error> {
        self.loader.take_error()
    }

    pub fn budget_exceeded(&self) -> bool {
        self.shared
            .store
            .try_lock()
            .map(|s| s.budget_exceeded())
            .unwrap_or(false)
    }

    // ---- queries (non-blocking, O(log N)) ----

    pub fn spatial_delta(&self, a: u64, b: u64) -> Result<DeltaOutcome> {
        self.guard()?;
        let tree = watched(&self.shared.tree, "linemap");
        let source = StoreSource {
            store: &self.shared.store,
        };
        Ok(tree.spatial_delta(a, b, &source, &self.widths))
    }

    pub fn offset_at(&self, base: u64, target: SpatialDelta, rounding: Rounding) -> Result<Located> {
        self.guard()?;
        let tree = watched(&self.shared.tree, "linemap");
        let source = StoreSource {
            store: &self.shared.store,
        };
        Ok(tree.offset_at(base, target, rounding, &source, &self.widths))
    }

    pub fn mapped_neighborhood(&self, offset: u64) -> Result<Range<u64>> {
        self.guard()?;
        Ok(watched(&self.shared.tree, "linemap").mapped_neighborhood(offset))
    }

    pub fn max_line_width_lower_bound(&self, range: Range<u64>) -> Result<f64> {
        self.guard()?;
        Ok(watched(&self.shared.tree, "linemap").max_line_width_lower_bound(range))
    }

    /// Explicit conversion from any position value to an offset.
    pub fn resolve(&self, position: Position, rounding: Rounding) -> Result<Located> {
        match position {
            Position::Offset(offset) => {
                self.guard()?;
                Ok(Located {
                    offset: offset.min(self.len()),
                    achieved: SpatialDelta::ZERO,
                    missing: None,
                })
            }
            Position::At(pos) => self.offset_at(pos.base, pos.delta, rounding),
            Position::Rect(rect) => self.offset_at(rect.corner.base, rect.corner.delta, rounding),
        }
    }

    /// Up to `max` glyphs starting at `offset`, walking in `direction`.
    /// Unknown regions appear as single sentinel items.
    pub fn read_chars(
        &self,
        offset: u64,
        direction: Direction,
        max: usize,
    ) -> Result<Vec<tarn_linemap::CharItem>> {
        self.guard()?;
        let tree = watched(&self.shared.tree, "linemap");
        let source = StoreSource {
            store: &self.shared.store,
        };
        Ok(tree.iter_chars(offset, direction, &source).take(max).collect())
    }

    /// Everything the renderer needs for one viewport: resident text runs,
    /// unknown runs, and the epoch they were observed at.
    pub fn query_rect(&self, rect: BufferRect) -> Result<RectContent> {
        self.guard()?;
        let tree = watched(&self.shared.tree, "linemap");
        let source = StoreSource {
            store: &self.shared.store,
        };
        let mut runs = Vec::new();
        let rows = rect.size.lines.max(0) + 1;
        let x_end = rect.corner.delta.x + rect.size.x;

        for row in 0..rows {
            let y = rect.corner.delta.lines + row;
            let start = tree.offset_at(
                rect.corner.base,
                SpatialDelta::new(y, rect.corner.delta.x),
                Rounding::Floor,
                &source,
                &self.widths,
            );
            if start.missing.is_some() {
                runs.push(RectRun {
                    range: start.offset..start.offset,
                    origin: start.achieved,
                    kind: RunKind::Unknown,
                });
                continue;
            }

            let mut x = start.achieved.x;
            let origin = start.achieved;
            let run_start = start.offset;
            let mut pos = run_start;
            let mut text = String::new();
            for item in tree.iter_chars(start.offset, tarn_linemap::Direction::Forward, &source) {
                match item.glyph {
                    Glyph::Char('\n') => break,
                    Glyph::Char(c) => {
                        if x >= x_end {
                            break;
                        }
                        text.push(c);
                        x += self.widths.advance_for(c);
                        pos = item.offset + c.len_utf8() as u64;
                    }
                    Glyph::Unknown { len } => {
                        if !text.is_empty() {
                            runs.push(RectRun {
                                range: run_start..pos,
                                origin,
                                kind: RunKind::Text(std::mem::take(&mut text)),
                            });
                        }
                        runs.push(RectRun {
                            range: item.offset..item.offset + len,
                            origin: SpatialDelta::new(y, x),
                            kind: RunKind::Unknown,
                        });
                        pos = item.offset + len;
                        break;
                    }
                }
            }
            if !text.is_empty() || pos > run_start {
                runs.push(RectRun {
                    range: run_start..pos,
                    origin,
                    kind: RunKind::Text(text),
                });
            }
        }

        Ok(RectContent {
            runs,
            epoch: self.shared.signal.current(),
        })
    }

    // ---- residency control ----

    /// Declare the viewport: its byte range (plus a prefetch margin) becomes
    /// the hot set the loader keeps resident. Unknown layout falls back to a
    /// byte radius around the anchor, refined as data arrives.
    pub fn set_viewport(&self, rect: BufferRect) -> Result<()> {
        self.guard()?;
        let mut hot: Vec<HotRange> = Vec::new();
        {
            let tree = watched(&self.shared.tree, "linemap");
            let source = StoreSource {
                store: &self.shared.store,
            };
            let top = tree.offset_at(
                rect.corner.base,
                rect.corner.delta,
                Rounding::Floor,
                &source,
                &self.widths,
            );
            let bottom = tree.offset_at(
                rect.corner.base,
                SpatialDelta::new(
                    rect.corner.delta.lines + rect.size.lines + 1,
                    rect.corner.delta.x + rect.size.x,
                ),
                Rounding::Ceil,
                &source,
                &self.widths,
            );
            for missing in [&top.missing, &bottom.missing].into_iter().flatten() {
                hot.push(HotRange {
                    range: missing.clone(),
                    class: HotClass::Viewport,
                });
            }

            let mut vstart = top.offset.min(bottom.offset);
            let mut vend = top.offset.max(bottom.offset);
            if vstart == vend {
                vstart = rect.corner.base.saturating_sub(self.cfg.load_radius);
                vend = rect.corner.base.saturating_add(self.cfg.load_radius);
            }
            for range in tree.file_ranges_in(vstart..vend, 8) {
                hot.push(HotRange {
                    range,
                    class: HotClass::Viewport,
                });
            }
            let margin_lo = vstart.saturating_sub(self.cfg.load_radius);
            let margin_hi = vend.saturating_add(self.cfg.load_radius);
            for range in tree.file_ranges_in(margin_lo..vstart, 4) {
                hot.push(HotRange {
                    range,
                    class: HotClass::Prefetch,
                });
            }
            for range in tree.file_ranges_in(vend..margin_hi, 4) {
                hot.push(HotRange {
                    range,
                    class: HotClass::Prefetch,
                });
            }
        }
        watched(&self.shared.store, "sparse-store").set_hot_set(hot);
        self.loader.wake();
        Ok(())
    }

    /// Replace the hot set directly (search results, bookmarks, tooling).
    pub fn set_hot_set(&self, ranges: Vec<HotRange>) -> Result<()> {
        self.guard()?;
        watched(&self.shared.store, "sparse-store").set_hot_set(ranges);
        self.loader.wake();
        Ok(())
    }

    /// Add speculative ranges to the current hot set.
    pub fn request_resident(&self, ranges: impl IntoIterator<Item = Range<u64>>) -> Result<()> {
        self.guard()?;
        {
            let mut store = watched(&self.shared.store, "sparse-store");
            let mut hot = store.hot_set().to_vec();
            hot.extend(ranges.into_iter().map(|range| HotRange {
                range,
                class: HotClass::Speculative,
            }));
            store.set_hot_set(hot);
        }
        self.loader.wake();
        Ok(())
    }

    pub fn set_memory_budget(&self, bytes: usize) -> Result<()> {
        self.guard()?;
        watched(&self.shared.store, "sparse-store").set_memory_budget(bytes);
        self.loader.wake();
        Ok(())
    }

    // ---- edits ----

    pub fn insert(&mut self, offset: u64, source: EditSource) -> Result<()> {
        self.guard()?;
        if source.is_empty() {
            return Ok(());
        }
        self.check_boundary(offset)?;
        {
            let mut tree = watched(&self.shared.tree, "linemap");
            let byte_source = StoreSource {
                store: &self.shared.store,
            };
            match &source {
                EditSource::Bytes(bytes) if bytes.len() <= self.cfg.inline_layout_threshold => {
                    tree.insert_literal(
                        offset,
                        Arc::from(bytes.as_slice()),
                        &byte_source,
                        &self.widths,
                    )?;
                }
                EditSource::Bytes(bytes) => {
                    tree.insert_deferred(
                        offset,
                        Backing::literal(bytes.clone()),
                        bytes.len() as u64,
                        &byte_source,
                        &self.widths,
                    )?;
                }
                EditSource::FileRegion {
                    offset: file_offset,
                    len,
                } => {
                    tree.insert_deferred(
                        offset,
                        Backing::File(*file_offset),
                        *len,
                        &byte_source,
                        &self.widths,
                    )?;
                }
            }
        }
        self.after_edit(EditRecord::Insert { offset, source })
    }

    pub fn delete(&mut self, range: Range<u64>) -> Result<()> {
        self.guard()?;
        if range.start > range.end {
            return Err(Error::OutOfBounds {
                offset: range.start,
                len: self.len(),
            });
        }
        if range.is_empty() {
            return Ok(());
        }
        self.check_boundary(range.start)?;
        self.check_boundary(range.end)?;
        {
            let mut tree = watched(&self.shared.tree, "linemap");
            let byte_source = StoreSource {
                store: &self.shared.store,
            };
            tree.delete(range.clone(), &byte_source, &self.widths)?;
        }
        self.after_edit(EditRecord::Delete {
            start: range.start,
            end: range.end,
        })
    }

    /// Rejects edits that provably split a code point. Unknown regions are
    /// validated lazily; the layout pass decodes whatever results.
    fn check_boundary(&self, offset: u64) -> Result<()> {
        let tree = watched(&self.shared.tree, "linemap");
        let source = StoreSource {
            store: &self.shared.store,
        };
        if tree.is_char_boundary(offset, &source) == Some(false) {
            return Err(Error::InvalidEdit { offset });
        }
        Ok(())
    }

    fn after_edit(&mut self, record: EditRecord) -> Result<()> {
        self.edit_log.push(record);
        #[cfg(debug_assertions)]
        {
            let verdict = watched(&self.shared.tree, "linemap").verify();
            if let Err(why) = verdict {
                return self.quarantine(why);
            }
        }
        self.shared.signal.bump();
        self.loader.wake();
        Ok(())
    }

    fn guard(&self) -> Result<()> {
        match &self.quarantined {
            Some(why) => Err(Error::Corruption(why.clone())),
            None => Ok(()),
        }
    }

    fn quarantine(&mut self, why: String) -> Result<()> {
        error!(%why, "invariant violation; quarantining buffer");
        self.quarantined = Some(why.clone());
        Err(Error::Corruption(why))
    }

    /// Check internal invariants now; quarantines the buffer on violation.
    pub fn verify(&mut self) -> Result<()> {
        self.guard()?;
        let verdict = watched(&self.shared.tree, "linemap").verify();
        match verdict {
            Ok(()) => Ok(()),
            Err(why) => self.quarantine(why),
        }
    }

    // ---- jobs & persistence ----

    /// Stream the buffer's content to `dest` on a background thread.
    pub fn save(&mut self, dest: impl Into<PathBuf>) -> Result<JobId> {
        self.guard()?;
        let id = JobId(self.next_job);
        self.next_job += 1;
        let snapshot = watched(&self.shared.tree, "linemap").clone();
        self.jobs.spawn(
            id,
            snapshot,
            self.file.clone(),
            dest.into(),
            self.loader.cancel_token(),
        );
        Ok(id)
    }

    pub fn save_status(&self, id: JobId) -> Option<SaveState> {
        self.jobs.status(id)
    }

    pub fn persist(&self) -> CompactState {
        CompactState {
            backing_path: self.backing_path.clone(),
            backing_len: self.backing_len,
            edits: self.edit_log.clone(),
        }
    }
}

// ---- loader wiring ----

fn spawn_loader(
    shared: &Arc<Shared>,
    file: &Arc<dyn SourceFile>,
    cfg: &Config,
    widths: &Arc<WidthTable>,
) -> LoaderHandle {
    let commit_shared = shared.clone();
    let commit_widths = widths.clone();
    let idle_shared = shared.clone();
    let idle_widths = widths.clone();
    let scan_batch = cfg.scan_batch;
    LoaderHandle::spawn(LoaderOptions {
        store: shared.store.clone(),
        file: file.clone(),
        read_chunk: cfg.read_chunk,
        on_commit: Box::new(move |offset, bytes| {
            resolve_file_window(&commit_shared, &commit_widths, offset, bytes);
        }),
        on_idle: Box::new(move || literal_scan_step(&idle_shared, &idle_widths, scan_batch)),
    })
}

/// Convert unmapped runs covered by a freshly loaded window into resident
/// runs. Layout happens with no lock held; each splice takes the tree lock
/// only long enough to swap one fragment.
fn resolve_file_window(shared: &Shared, widths: &WidthTable, offset: u64, bytes: &[u8]) {
    let window = offset..offset + bytes.len() as u64;
    let mut from = 0u64;
    for _ in 0..64 {
        let ticket = {
            let tree = watched(&shared.tree, "linemap");
            tree.next_unmapped_in_window(window.clone(), from)
        };
        let Some(ticket) = ticket else { break };
        let Backing::File(backing) = ticket.backing else {
            break;
        };
        let lo = backing + ticket.replace.start;
        let hi = backing + ticket.replace.end;
        let slice = &bytes[(lo - window.start) as usize..(hi - window.start) as usize];
        let (replace, slice) = align_to_chars(ticket.replace.clone(), ticket.len, slice);
        if slice.is_empty() {
            // A sub-code-point sliver at the window's edge; it resolves when
            // the neighbouring window loads.
            from = ticket.start + ticket.len;
            continue;
        }
        let runs = build_runs(slice, &Backing::File(backing + replace.start), widths);
        let committed = {
            let mut tree = watched(&shared.tree, "linemap");
            tree.commit_scan(&ticket, replace, runs)
        };
        if committed {
            shared.signal.bump();
        } else {
            from = ticket.start + ticket.len;
        }
    }
}

/// One bounded batch of layout for a deferred literal insert. Returns true
/// while more such work remains.
fn literal_scan_step(shared: &Shared, widths: &WidthTable, batch: u64) -> bool {
    let ticket = {
        let tree = watched(&shared.tree, "linemap");
        tree.next_deferred_literal(0)
    };
    let Some(ticket) = ticket else { return false };
    let Backing::Literal { bytes, start } = ticket.backing.clone() else {
        return false;
    };
    let end = batch.max(1).min(ticket.len);
    let slice = &bytes[start..start + end as usize];
    let (replace, slice) = align_to_chars(0..end, ticket.len, slice);
    if slice.is_empty() {
        return false;
    }
    let runs = build_runs(slice, &ticket.backing.offset(replace.start), widths);
    let committed = {
        let mut tree = watched(&shared.tree, "linemap");
        tree.commit_scan(&ticket, replace, runs)
    };
    if committed {
        shared.signal.bump();
    }
    committed
}

/// Shrink a scan slice so its interior edges land between code points. Edges
/// that coincide with the fragment's own boundaries stay put.
fn align_to_chars(mut replace: Range<u64>, frag_len: u64, mut slice: &[u8]) -> (Range<u64>, &[u8]) {
    if replace.start > 0 {
        let mut trim = 0;
        while trim < 3 && trim < slice.len() && is_utf8_cont(slice[trim]) {
            trim += 1;
        }
        replace.start += trim as u64;
        slice = &slice[trim..];
    }
    if replace.end < frag_len {
        for back in 0..3.min(slice.len()) {
            let lead = slice[slice.len() - back - 1];
            if utf8_seq_len(lead) > back + 1 {
                slice = &slice[..slice.len() - back - 1];
                replace.end -= back as u64 + 1;
                break;
            }
            if !is_utf8_cont(lead) {
                break;
            }
        }
    }
    (replace, slice)
}

/// The tree's view of the sparse store: a strictly non-blocking byte source.
/// Contention reads as non-residency; the query returns partial and the
/// caller retries after the epoch moves.
struct StoreSource<'a> {
    store: &'a Mutex<SparseStore>,
}

impl ByteSource for StoreSource<'_> {
    fn read(&self, file_range: Range<u64>, out: &mut Vec<u8>) -> SourceStatus {
        let Some(mut store) = self.store.try_lock() else {
            return SourceStatus::Unavailable;
        };
        out.clear();
        let mut pos = file_range.start;
        while pos < file_range.end {
            match store.read_forward(pos) {
                ReadWindow::Resident(bytes) => {
                    let take = bytes.len().min((file_range.end - pos) as usize);
                    out.extend_from_slice(&bytes[..take]);
                    pos += take as u64;
                }
                ReadWindow::Missing => return SourceStatus::Unavailable,
                ReadWindow::Failed => return SourceStatus::Failed,
            }
        }
        SourceStatus::Complete
    }
}

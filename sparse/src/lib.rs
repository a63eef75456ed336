//! Demand-paged, explicitly non-blocking cache of file-backed byte ranges.
//!
//! A [`SparseStore`] holds an ordered set of resident byte ranges loaded from
//! a file that may be far larger than RAM. The interactive thread reads
//! whatever happens to be resident and declares which ranges it needs kept
//! resident (the hot set); a single background [`loader`] thread per buffer
//! services the hot set against the file and evicts cold data against an
//! advisory memory budget.
//!
//! Unavailable data is not an error here: reads yield [`ReadWindow::Missing`]
//! and callers retry once the store's epoch advances. I/O failures become
//! sticky [`ReadWindow::Failed`] regions.

pub mod io;
pub mod loader;
mod segment;
mod signal;
pub mod store;
mod watch;

pub use io::{DiskFile, MemoryFile, SourceFile};
pub use loader::{Command, LoaderHandle, LoaderOptions};
pub use signal::ChangeSignal;
pub use store::{HotClass, HotRange, ReadWindow, SparseStore};
pub use watch::{watched, WatchedGuard};

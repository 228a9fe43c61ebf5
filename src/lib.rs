//! Remora - remote synchronization for git repositories
//!
//! Remora shells out to the git executable for fetch, push and pull,
//! decodes the progress stream while the command runs, and classifies
//! every updated ref into a typed record. Remote management (URLs,
//! configuration, stale-ref detection) is handled through git2 and thin
//! subprocess calls.
//!
//! ```no_run
//! use remora::{Remote, SyncOptions};
//!
//! # async fn example() -> remora::Result<()> {
//! let origin = Remote::new("/path/to/repo", "origin");
//! for record in origin.fetch(&SyncOptions::default(), None).await? {
//!     println!("{} -> {:?}", record.name(), record.flags);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod models;
pub mod progress;
pub mod remote;
pub mod safety;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use error::{RemoraError, Result};
pub use models::{
    FetchFlags, FetchRecord, FetchResults, GitRef, PushFlags, PushRecord, PushResults, RefKind,
    RemoteInfo,
};
pub use progress::{NoProgress, Progress, ProgressOp};
pub use remote::{Remote, SyncOptions};

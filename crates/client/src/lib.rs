//! hubsync client library
//!
//! The sync engine lives here; the binary in `main.rs` is a thin CLI
//! over it, and integration tests drive the engine against an
//! in-process hub.

pub mod error;
pub mod state;
pub mod sync;

pub use error::{DatasetReport, SyncError, SyncOutcome};
pub use state::SyncState;
pub use sync::{PlanEntry, SyncClient};

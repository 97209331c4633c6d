//! hubsync-hub: scheduler, packager and HTTP surface of the hub
//!
//! The binary in `main.rs` wires these together; the library exists so
//! integration tests can run a real hub in-process.

pub mod http;
pub mod packager;
pub mod readers;
pub mod scheduler;

pub use http::ApiContext;
pub use packager::Packager;
pub use readers::ReaderRegistry;
pub use scheduler::{DatasetOutcome, Scheduler};

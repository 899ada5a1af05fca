//! `jobforge-core`: foundation types shared by the queue, its API and workers.
//!
//! This crate contains **no storage or runtime concerns**: identifiers, the
//! error taxonomy and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};

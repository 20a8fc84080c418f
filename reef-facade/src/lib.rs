//! Connection-scoped machinery shared by the blocking and reactor schedulers.
//!
//! Both deployments drive the same [`session::Session`] state machine; they differ only in how
//! bytes arrive (blocking reads vs readiness events) and how responses leave (synchronous
//! writes vs a partial-write queue). Keeping the protocol phases here prevents the two
//! implementations from drifting apart.

pub mod session;
pub mod window;

pub use session::{ResponseQueue, Session};
pub use window::ReadWindow;

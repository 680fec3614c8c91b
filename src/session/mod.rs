//! # Session Module
//!
//! Per-connection session lifecycle (`machine`) and the process-wide session map (`registry`).
//!
//! ## Locking rule:
//! Never call into the registry while holding a session's mutex. The registry
//! locks sessions while it holds its own map lock (summary, snapshot, remove).

pub mod machine;
pub mod registry;

pub use machine::{Effect, Session, SessionCommand, SessionSettings, SessionState};
pub use registry::{RegistrySummary, SessionRegistry, SessionSnapshot, SharedSession};

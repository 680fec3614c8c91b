//! # Transcription Module
//!
//! Everything between "this audio is ready" and "here is the text".
//! The acoustic model itself is external; this module only drives it.
//!
//! ## Key Components:
//! - **engine**: the `RecognitionEngine` seam and the command-line engine adapter
//! - **dispatcher**: bounded worker pool that runs recognitions off the receive path
//! - **outbox**: per-connection queue restoring submission order of results
//! - **postprocess**: `<|tag|>` tokenizer that turns engine output into clean text
//!
//! ## Ordering:
//! Within one connection, results reach the client in the order their audio was
//! submitted, and `session_ended` comes after every recognition queued before it.
//! Across connections there is no ordering.

pub mod dispatcher; // Worker pool and result shaping
pub mod engine; // External recognizer seam
pub mod outbox; // Ordered delivery back to the connection
pub mod postprocess; // Annotation tag extraction

pub use dispatcher::{DispatcherStats, RecognitionDispatcher, RecognitionResult, RecognitionTask};
pub use engine::{CommandEngine, RecognitionEngine};
pub use outbox::{Delivery, SessionOutbox};

//! Recorder registry and lifecycle orchestration.
//!
//! [`Manager`] guarantees that each room has at most one running
//! [`Recorder`]; recorders themselves are built through an injected
//! [`RecorderFactory`].

pub mod error;
pub mod manager;
pub mod process;
pub mod recorder;

pub use error::RecorderError;
pub use manager::Manager;
pub use process::{ProcessRecorder, ProcessRecorderFactory, ProcessRecorderSettings};
pub use recorder::{Recorder, RecorderFactory, RecorderState};

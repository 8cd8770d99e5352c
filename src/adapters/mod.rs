// Adapters layer: concrete implementations for external systems (subprocesses, local storage).

pub mod process;
pub mod storage;

pub use process::{RecordingRunner, TokioCommandRunner};
pub use storage::LocalStorage;

pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::{LocalStorage, RecordingRunner, TokioCommandRunner};
pub use config::{ConnectivityConfig, ConnectometryConfig};
pub use core::{ConnectivityExtractor, ConnectometryRunner, PreprocessingPipeline};
pub use domain::ports::CommandRunner;
pub use utils::error::{DsiError, Result};

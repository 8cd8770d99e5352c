#[cfg(feature = "cli")]
pub mod cli;
pub mod connectivity;
pub mod connectometry;
pub mod merge;

pub use connectivity::{ConnectivityConfig, ExtractOverrides};
pub use connectometry::{BatchConfiguration, ConnectometryConfig};

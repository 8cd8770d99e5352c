pub mod batch;
pub mod connectometry;
pub mod convert;
pub mod discovery;
pub mod extract;
pub mod findings;
pub mod pipeline;
pub mod probe;

pub use batch::{run_extraction_batch, BatchOptions};
pub use connectometry::{ConnectometryRunner, RunnerOptions};
pub use extract::ConnectivityExtractor;
pub use pipeline::{PipelineOptions, PreprocessingPipeline};

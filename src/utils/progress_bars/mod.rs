pub mod logging;
pub mod progress_config;

pub use logging::BatchLogger;
pub use progress_config::ProgressConfig;

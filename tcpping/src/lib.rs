pub mod args;
pub mod catcher;
pub mod config;
pub mod error;
pub mod logger;
pub mod pitcher;
pub mod stats;
pub mod wire;

pub use catcher::Catcher;
pub use config::{CatcherConfig, Config, PitcherConfig};
pub use error::PingError;
pub use pitcher::Pitcher;
pub use stats::{RoundTripRecord, RunSummary};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}

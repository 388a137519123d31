pub mod audit;
pub mod capability;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod object;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transaction;
pub mod version;

pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelConfig};

/// Install the default tracing subscriber. Safe to call more than once.
pub fn setup_log() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

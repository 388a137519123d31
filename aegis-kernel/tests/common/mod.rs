#![allow(dead_code)]

use aegis_kernel::{Kernel, KernelConfig};
use std::path::Path;
use tempfile::TempDir;

pub const TEST_SALT: &str = "test-salt";

/// Open a kernel over a fresh temporary store.
pub fn open_kernel() -> (Kernel, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let kernel = open_kernel_at(dir.path().join("db"));
    (kernel, dir)
}

/// Open (or reopen) a kernel over a specific store path.
pub fn open_kernel_at(path: impl AsRef<Path>) -> Kernel {
    let mut config = KernelConfig::new(path.as_ref());
    config.workspace_salt = Some(TEST_SALT.to_string());
    Kernel::open(config).expect("kernel open")
}

/// Open a kernel with a short workflow timeout, for timeout tests.
pub fn open_kernel_with_timeout(timeout_secs: f64) -> (Kernel, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let mut config = KernelConfig::new(dir.path().join("db"));
    config.workspace_salt = Some(TEST_SALT.to_string());
    config.timeout_secs = timeout_secs;
    let kernel = Kernel::open(config).expect("kernel open");
    (kernel, dir)
}

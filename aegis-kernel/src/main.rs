use aegis_kernel::ipc::IpcServer;
use aegis_kernel::{setup_log, Kernel, KernelConfig};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_log();
    let opts: Options = Options::from_args();

    let mut config = KernelConfig::new(opts.db);
    config.workspace_salt = opts.workspace_salt;
    config.timeout_secs = opts.timeout_secs;

    let kernel = Arc::new(Kernel::open(config)?);
    IpcServer::bind(kernel, opts.bind).await?.serve().await?;
    Ok(())
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "aegis-kernel",
    about = "Capability-secure kernel for untrusted workflow code"
)]
pub struct Options {
    /// Local address to serve the kernel protocol on
    #[structopt(short, long, default_value = "127.0.0.1:7611")]
    bind: SocketAddr,

    /// Path of the record store
    #[structopt(short, long, default_value = "./aegis.db")]
    db: PathBuf,

    /// Wall-clock budget per workflow execution, in seconds
    #[structopt(long, default_value = "30")]
    timeout_secs: f64,

    /// Salt for PII field-name hashing (random when omitted)
    #[structopt(long)]
    workspace_salt: Option<String>,
}

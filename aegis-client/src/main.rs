use aegis_client::KernelClient;
use aegis_types::structs::CapabilityRisk;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use structopt::StructOpt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let opts: Options = Options::from_args();
    let client = KernelClient::new(opts.connect);

    match opts.command {
        Command::Run { file, principal } => {
            let code = tokio::fs::read_to_string(&file).await?;
            let outcome = client.execute(&code, &principal).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Validate { file } => {
            let code = tokio::fs::read_to_string(&file).await?;
            let (valid, errors) = client.validate(&code).await?;
            if valid {
                println!("ok");
            } else {
                for error in errors {
                    eprintln!("{}", error);
                }
                std::process::exit(1);
            }
        }
        Command::Grant {
            principal,
            operation,
            resource,
            risk,
            ttl,
        } => {
            let risk = match risk.as_deref() {
                None | Some("read") => CapabilityRisk::Read,
                Some("stateful") => CapabilityRisk::Stateful,
                Some("irreversible") => CapabilityRisk::Irreversible,
                Some(other) => return Err(format!("unknown risk level: {}", other).into()),
            };
            let capability = client
                .grant(&principal, &operation, &resource, risk, ttl, None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&capability)?);
        }
        Command::Revoke { token } => {
            let revoked = client.revoke(&token).await?;
            println!("{}", if revoked { "revoked" } else { "not found" });
        }
        Command::Audit {
            principal,
            op,
            limit,
        } => {
            let entries = client.query_audit(principal, op, limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}

#[derive(Debug, StructOpt)]
#[structopt(name = "aegis-client", about = "Submit workflows to a running kernel")]
pub struct Options {
    /// Kernel socket address
    #[structopt(short, long, default_value = "127.0.0.1:7611")]
    connect: SocketAddr,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Execute a workflow file
    Run {
        file: PathBuf,
        #[structopt(short, long, default_value = "agent:default")]
        principal: String,
    },
    /// Validate a workflow file without executing it
    Validate { file: PathBuf },
    /// Grant a capability
    Grant {
        principal: String,
        operation: String,
        resource: String,
        /// read | stateful | irreversible
        #[structopt(short, long)]
        risk: Option<String>,
        /// Time-to-live in seconds
        #[structopt(short, long)]
        ttl: Option<f64>,
    },
    /// Revoke a capability token
    Revoke { token: String },
    /// Show audit entries
    Audit {
        #[structopt(short, long)]
        principal: Option<String>,
        #[structopt(short, long)]
        op: Option<String>,
        #[structopt(short, long)]
        limit: Option<usize>,
    },
}

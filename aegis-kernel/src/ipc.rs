//! Local IPC server.
//!
//! Serves the kernel protocol over a local TCP socket: one length-prefixed
//! JSON request per frame, one response frame back. Workflow execution can
//! block for its full wall-clock budget, so each request is processed on the
//! blocking pool rather than a reactor thread.

use crate::kernel::Kernel;
use aegis_types::wire::{read_frame, write_frame};
use aegis_types::{KernelRequest, KernelResponse};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct IpcServer {
    kernel: Arc<Kernel>,
    listener: TcpListener,
}

impl IpcServer {
    /// Bind the kernel socket. `serve` then runs until the process exits.
    pub async fn bind(kernel: Arc<Kernel>, bind: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        info!(target: "aegis", "kernel listening on {}", listener.local_addr()?);
        Ok(Self { kernel, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let kernel = Arc::clone(&self.kernel);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(kernel, stream).await {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        warn!(target: "aegis", "connection {} failed: {}", peer, e);
                    }
                }
            });
        }
    }
}

async fn handle_connection(kernel: Arc<Kernel>, mut stream: TcpStream) -> io::Result<()> {
    loop {
        let request: KernelRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                // Malformed frame: report it and keep the socket usable.
                write_frame(&mut stream, &KernelResponse::Error(e.to_string())).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!(target: "aegis", "request: {:?}", request);

        let kernel_for_request = Arc::clone(&kernel);
        let response = tokio::task::spawn_blocking(move || {
            kernel_for_request.process_request(request)
        })
        .await
        .unwrap_or_else(|e| KernelResponse::Error(format!("request handler failed: {}", e)));

        write_frame(&mut stream, &response).await?;
    }
}

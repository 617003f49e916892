//! TCP front end for the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use cfs_fs::CfsRegistry;
use cfs_protocol::serve_connection;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Accepts connections and serves each one against a shared registry.
#[derive(Clone, Debug)]
pub struct CfsServer {
    registry: Arc<CfsRegistry>,
}

impl CfsServer {
    pub fn new(registry: Arc<CfsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CfsRegistry> {
        &self.registry
    }

    /// Binds `addr` and spawns the accept loop, returning the bound
    /// address so callers binding port 0 can learn the real port.
    pub async fn listen(
        &self,
        addr: impl ToSocketAddrs,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "listening");
        let server = self.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = server.serve(listener).await {
                warn!(%err, "accept loop failed");
            }
        });
        Ok((local_addr, task))
    }

    /// Runs the accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            debug!(%peer, "connection accepted");
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(socket, registry).await {
                    debug!(%err, "connection ended with error");
                }
            });
        }
    }
}

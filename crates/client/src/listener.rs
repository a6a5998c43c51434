//! Local TCP listener
//!
//! Accepts local connections and relays each one through its own tunnel.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::driver::TunnelDriver;

/// Local listener spawning one [`TunnelDriver`] session per connection
pub struct TunnelListener {
    listen_addr: SocketAddr,
    driver: TunnelDriver,
    /// Handle for the accept task
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TunnelListener {
    pub fn new(listen_addr: SocketAddr, driver: TunnelDriver) -> Self {
        Self {
            listen_addr,
            driver,
            handle: None,
        }
    }

    /// Start accepting local connections.
    ///
    /// Returns once the listener is bound; accepting runs in a background task.
    pub async fn start(&mut self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let actual_addr = listener.local_addr()?;
        info!(
            "Tunnel client listening on {} for target {}",
            actual_addr,
            self.driver.config().target()
        );
        self.listen_addr = actual_addr;

        let driver = self.driver.clone();

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("Local connection from {}", peer_addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }
                        let driver = driver.clone();
                        tokio::spawn(async move {
                            if let Err(e) = driver.run(stream).await {
                                warn!("Tunnel for {} could not be opened: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Local accept error: {}", e);
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop accepting local connections
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Tunnel client stopped");
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.stop();
    }
}

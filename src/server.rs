//! TCP Server
//!
//! Accepts clients, enforces the client limit and spawns one
//! [`ConnectionHandler`](crate::connection::ConnectionHandler) task per
//! client. The loop ends when the shutdown future resolves; connections
//! already running are left to finish on their own.

use crate::connection::{handle_connection, ConnectionStats};
use crate::db::Db;
use crate::protocol::Reply;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub struct Server {
    listener: TcpListener,
    db: Arc<Db>,
    stats: Arc<ConnectionStats>,
    /// One permit per client slot; `None` when unlimited.
    clients: Option<Arc<Semaphore>>,
}

impl Server {
    /// Binds the listener.
    pub async fn bind(addr: &str, db: Arc<Db>, max_clients: Option<usize>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            db,
            stats: Arc::new(ConnectionStats::new()),
            clients: max_clients.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Accepts clients until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = self.accept_loop() => {}
            _ = shutdown => {
                info!("Shutdown signal received, no longer accepting clients");
            }
        }
    }

    async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let permit = match &self.clients {
            None => None,
            Some(clients) => match Arc::clone(clients).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(client = %addr, "Max number of clients reached");
                    self.stats.connection_rejected();
                    tokio::spawn(reject(stream));
                    return;
                }
            },
        };

        let db = Arc::clone(&self.db);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            handle_connection(stream, addr, db, stats).await;
            drop(permit);
        });
    }
}

async fn reject(mut stream: TcpStream) {
    let reply = Reply::error("ERR max number of clients reached").to_bytes();
    let _ = stream.write_all(&reply).await;
    let _ = stream.shutdown().await;
}

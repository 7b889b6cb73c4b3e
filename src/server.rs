use crate::broker::Broker;
use crate::config::Config;
use crate::pki::{self, CertError, CertificateBundle};
use crate::registry::Registry;
use crate::session::{Session, SessionOptions};
use crate::transport::{self, Listener, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, ServerError>;

/// Pause before accepting again once the process runs out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Certificate provisioning failed: {0}")]
    Certificates(#[from] CertError),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TransportError),
    #[error("Failed to bind to {address}: {source}")]
    ListenerBind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server is already running")]
    AlreadyRunning,
    #[error("Server is not running")]
    NotRunning,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static function to start a server with the given configuration
pub async fn start(config: Config) -> Result<Server> {
    let server = Server::new(config);
    server.start().await?;
    Ok(server)
}

struct Running {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

/// The hub: one registry and broker shared by every connection.
pub struct Server {
    config: Config,
    broker: Arc<Broker>,
    running: AtomicBool,
    server_handle: Mutex<Option<Running>>,
    address: RwLock<Option<String>>,
    certificates: RwLock<Option<Arc<CertificateBundle>>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            broker: Broker::new(registry, config.inbox_capacity),
            config,
            running: AtomicBool::new(false),
            server_handle: Mutex::new(None),
            address: RwLock::new(None),
            certificates: RwLock::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut server_handle = self.server_handle.lock().await;
        if self.running.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyRunning);
        }

        info!("Starting Server");

        let acceptor = if self.config.secure {
            let bundle = Arc::new(pki::provision(&self.config.tls)?);
            let acceptor = transport::build_tls_acceptor(&bundle)?;
            *self.certificates.write().await = Some(bundle);
            Some(acceptor)
        } else {
            warn!("Mutual TLS disabled, accepting plain TCP connections");
            None
        };

        let bind_address = self.config.bind_address();
        let listener = Listener::bind(&bind_address, acceptor, self.config.handshake_timeout())
            .await
            .map_err(|source| ServerError::ListenerBind {
                address: bind_address.clone(),
                source,
            })?;

        // Get the actual bound address (useful for port 0)
        let bound_addr = listener.local_addr()?;
        *self.address.write().await = Some(bound_addr.to_string());

        info!(secure = listener.is_secure(), "Server listening on {}", bound_addr);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Self::run_server(
            Arc::clone(&self.broker),
            listener,
            SessionOptions::from(&self.config),
            shutdown.clone(),
        ));
        *server_handle = Some(Running { handle, shutdown });

        self.running.store(true, Ordering::Release);
        info!("Server started successfully");
        Ok(())
    }

    /// Cancel every session and wait for them and the accept loop to finish.
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .server_handle
            .lock()
            .await
            .take()
            .ok_or(ServerError::NotRunning)?;

        info!("Stopping server");

        running.shutdown.cancel();
        running.handle.await.unwrap_or_else(|e| {
            error!("Error in waiting for server task {e}");
        });

        self.running.store(false, Ordering::Release);
        *self.address.write().await = None;

        info!("Server stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn address(&self) -> Option<String> {
        self.address.read().await.clone()
    }

    /// The bundle in use, when running with mutual TLS.
    pub async fn certificates(&self) -> Option<Arc<CertificateBundle>> {
        self.certificates.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.broker.registry()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    async fn run_server(
        broker: Arc<Broker>,
        listener: Listener,
        options: SessionOptions,
        shutdown_token: CancellationToken,
    ) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(incoming) => {
                            debug!(peer = %incoming.peer_addr(), "New connection");
                            sessions.spawn(Self::handle_connection(
                                Arc::clone(&broker),
                                incoming,
                                options.clone(),
                                shutdown_token.clone(),
                            ));
                        }
                        Err(e) if transport::is_transient(&e) => {
                            warn!(error = %e, "Failed to accept connection");
                            if transport::is_descriptor_exhaustion(&e) {
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Listener failed, no longer accepting connections");
                            break;
                        }
                    }
                }

                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined {
                        error!("Error in join task: {e}");
                    }
                }

                // Handle shutdown signal
                _ = shutdown_token.cancelled() => {
                    info!("Server received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Error in join task: {e}");
            }
        }

        info!("Server loop completed");
    }

    async fn handle_connection(
        broker: Arc<Broker>,
        incoming: transport::Incoming,
        options: SessionOptions,
        shutdown: CancellationToken,
    ) {
        let peer = incoming.peer_addr();
        let stream = tokio::select! {
            established = incoming.establish() => match established {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Connection rejected");
                    return;
                }
            },
            _ = shutdown.cancelled() => return,
        };

        Session::new(broker, stream, options).run(shutdown).await;
    }
}

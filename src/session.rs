use bytes::BytesMut;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery, Inbox};
use crate::config::Config;
use crate::protocol::codec::{self, CodecError, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::protocol::{Envelope, MsgType};
use crate::registry::ClientId;
use crate::transport::AsyncStream;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Upper bound on the closing handshake once a session is over.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),
    #[error("Delivery write stalled for {0:?}")]
    WriteTimeout(Duration),
    #[error("Shutdown during delivery write")]
    Cancelled,
}

/// Per-connection knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub anonymous_publish: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            write_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            anonymous_publish: true,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
            max_frame_size: config.max_frame_size,
            anonymous_publish: config.anonymous_publish,
        }
    }
}

/// One connection's handler.
///
/// Reads envelopes in arrival order, applies them to the broker and writes
/// deliveries for the client ids it subscribed back on the same stream. Any
/// read or decode failure ends the session; an unknown `msg_type` does not.
pub struct Session {
    id: String,
    peer: Option<SocketAddr>,
    stream: Box<dyn AsyncStream>,
    broker: Arc<Broker>,
    inbox: Inbox,
    clients: HashSet<ClientId>,
    frames: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    options: SessionOptions,
}

impl Session {
    pub fn new(broker: Arc<Broker>, stream: Box<dyn AsyncStream>, options: SessionOptions) -> Self {
        let id = format!("session_{}", Uuid::new_v4());
        let inbox = broker.open_inbox(id.clone());
        Self {
            peer: stream.peer_addr().ok(),
            id,
            stream,
            broker,
            inbox,
            clients: HashSet::new(),
            frames: FrameCodec::new(options.max_frame_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the connection until the peer leaves, an error occurs or
    /// `shutdown` fires, then release every client id this session owns.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let fingerprint = self.stream.peer_fingerprint();
        info!(
            session = %self.id,
            peer = ?self.peer,
            fingerprint = fingerprint.as_deref().unwrap_or("-"),
            "Session started"
        );

        match self.serve(&shutdown).await {
            Ok(()) | Err(SessionError::Cancelled) => info!(session = %self.id, "Session closed"),
            Err(e) => warn!(session = %self.id, error = %e, "Session terminated"),
        }

        self.detach_all();
        // A TLS close_notify can block behind a peer that stopped reading.
        match timeout(CLOSE_TIMEOUT, self.stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session = %self.id, error = %e, "Error closing stream"),
            Err(_) => debug!(session = %self.id, "Timed out closing stream"),
        }
    }

    async fn serve(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut last_activity = Instant::now();

        loop {
            while let Some(frame) = self.frames.decode(&mut self.read_buf)? {
                self.handle_frame(&frame, shutdown).await?;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(session = %self.id, "Session received shutdown signal");
                    return Ok(());
                }

                _ = deadline(self.options.idle_timeout, last_activity) => {
                    // deadline only resolves when a timeout is set
                    return Err(SessionError::IdleTimeout(
                        self.options.idle_timeout.unwrap_or_default(),
                    ));
                }

                read = self.stream.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    last_activity = Instant::now();
                }

                Some(delivery) = self.broker.fan_out(&mut self.inbox) => {
                    self.write_delivery(delivery, shutdown).await?;
                    last_activity = Instant::now();
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8], shutdown: &CancellationToken) -> Result<()> {
        if frame.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) if e.is_recoverable() => {
                warn!(session = %self.id, error = %e, "Ignoring envelope");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.dispatch(&envelope);
        self.flush_deliveries(shutdown).await
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        let client_id = envelope.client_id.as_str();
        let topic = envelope.topic.as_str();
        let known = self.broker.registry().contains(client_id);

        match envelope.msg_type {
            MsgType::Subscribe => {
                self.broker.subscribe(client_id, topic, &self.inbox);
                self.clients.insert(client_id.to_owned());
                debug!(session = %self.id, client_id, topic, "Subscribed");
            }
            MsgType::Unsubscribe if known => {
                let removed = self.broker.unsubscribe(client_id, topic);
                debug!(session = %self.id, client_id, topic, removed, "Unsubscribed");
            }
            MsgType::Publish if known || self.options.anonymous_publish => {
                let delivered = self.broker.publish(envelope);
                debug!(session = %self.id, client_id, topic, delivered, "Publish dispatched");
            }
            msg_type => {
                debug!(
                    session = %self.id,
                    client_id,
                    %msg_type,
                    "Ignoring envelope from unknown client"
                );
            }
        }
    }

    /// Write whatever is already queued for this connection.
    async fn flush_deliveries(&mut self, shutdown: &CancellationToken) -> Result<()> {
        while let Some(delivery) = self.broker.try_fan_out(&mut self.inbox) {
            self.write_delivery(delivery, shutdown).await?;
        }
        Ok(())
    }

    /// Write one delivery, giving up on shutdown or once `write_timeout`
    /// has passed.
    async fn write_delivery(&mut self, delivery: Delivery, shutdown: &CancellationToken) -> Result<()> {
        self.write_buf.clear();
        codec::encode_into(&delivery.envelope, &mut self.write_buf)?;

        let limit = self.options.write_timeout;
        let stream = &mut self.stream;
        let buf = &self.write_buf[..];
        tokio::select! {
            _ = shutdown.cancelled() => return Err(SessionError::Cancelled),
            _ = deadline(limit, Instant::now()) => {
                return Err(SessionError::WriteTimeout(limit.unwrap_or_default()));
            }
            written = async move {
                stream.write_all(buf).await?;
                stream.flush().await
            } => written?,
        }
        debug!(
            session = %self.id,
            client_id = %delivery.client_id,
            topic = %delivery.envelope.topic,
            "Delivered"
        );
        Ok(())
    }

    fn detach_all(&mut self) {
        for client_id in self.clients.drain() {
            if self.broker.detach(&client_id, &self.id) {
                debug!(session = %self.id, client_id = %client_id, "Client removed");
            }
        }
    }
}

async fn deadline(limit: Option<Duration>, since: Instant) {
    match limit {
        Some(limit) => sleep_until(since + limit).await,
        None => std::future::pending().await,
    }
}

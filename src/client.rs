//! Minimal client for the hub's envelope protocol.

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::pki::ClientIdentity;
use crate::protocol::codec::{self, CodecError, FrameCodec};
use crate::protocol::Envelope;
use crate::transport::{self, TransportError};

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TransportError),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Speaks newline-delimited envelopes over any byte stream, on behalf of one
/// client id.
pub struct HubClient<S> {
    client_id: String,
    stream: S,
    frames: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl HubClient<TlsStream<TcpStream>> {
    /// Connect with mutual TLS, presenting `identity` and trusting only its
    /// root.
    pub async fn connect_tls(
        addr: &str,
        server_name: &str,
        identity: &ClientIdentity,
        client_id: impl Into<String>,
    ) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ClientError::InvalidServerName(server_name.to_string()))?;
        let connector = TlsConnector::from(transport::client_tls_config(identity)?);

        let socket = TcpStream::connect(addr).await?;
        let stream = connector.connect(name, socket).await?;
        Ok(Self::new(stream, client_id))
    }
}

impl HubClient<TcpStream> {
    /// Connect to a hub running with `secure = false`.
    pub async fn connect_plain(addr: &str, client_id: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, client_id))
    }
}

impl<S> HubClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            stream,
            frames: FrameCodec::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let envelope = Envelope::subscribe(self.client_id.as_str(), topic);
        self.send(&envelope).await
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let envelope = Envelope::unsubscribe(self.client_id.as_str(), topic);
        self.send(&envelope).await
    }

    /// Publish `data` on `topic` and return the envelope's `msg_id`.
    pub async fn publish(&mut self, topic: &str, data: impl Into<Value>) -> Result<String> {
        let envelope = Envelope::publish(self.client_id.as_str(), topic, data);
        self.send(&envelope).await?;
        Ok(envelope.msg_id)
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.write_buf.clear();
        codec::encode_into(envelope, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next envelope from the hub, or `None` once the hub closes the
    /// connection. Envelopes of an unknown `msg_type` are skipped.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(frame) = self.frames.decode(&mut self.read_buf)? {
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match codec::decode(&frame) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(e) if e.is_recoverable() => {
                        debug!(client_id = %self.client_id, error = %e, "Skipping envelope");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

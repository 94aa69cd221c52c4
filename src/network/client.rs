//! Primary Client
//!
//! Session-oriented client for the primary's replication endpoint. The
//! replicator drives it through the [`PrimaryConnector`] / [`PrimaryClient`]
//! traits so tests and alternative transports can substitute their own
//! implementations.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_frame, write_frame};
use crate::config::ReplicaConfig;
use crate::error::{Error, Result};
use crate::protocol::{ExportTxRequest, Request, Response, Trailer};

/// Chunk stream produced by one export request
///
/// `next_chunk` returns `None` at end of stream; the trailer is readable
/// only after that point.
#[async_trait]
pub trait TxStream: Send {
    /// Read the next payload chunk, or `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;

    /// Trailer metadata, available once the stream is exhausted
    fn trailer(&self) -> Option<&Trailer>;
}

/// Authenticated session against the primary's replication endpoint
///
/// The session token obtained from `login` and refreshed by `use_database`
/// forms the authenticated context for subsequent calls.
#[async_trait]
pub trait PrimaryClient: Send {
    /// Authenticate the session
    async fn login(&mut self, username: &str, password: &str) -> Result<()>;

    /// Select the database to replicate, refreshing the session token
    async fn use_database(&mut self, database: &str) -> Result<()>;

    /// Export one transaction as a chunk stream
    async fn export_tx<'a>(
        &'a mut self,
        request: ExportTxRequest,
    ) -> Result<Box<dyn TxStream + 'a>>;

    /// Terminate the session; idempotent
    async fn logout(&mut self) -> Result<()>;

    /// Drop the connection; idempotent
    async fn disconnect(&mut self);
}

/// Factory producing fresh sessions, so the replicator can re-establish a
/// wedged connection
#[async_trait]
pub trait PrimaryConnector: Send + Sync {
    /// Client type produced by this connector
    type Client: PrimaryClient + Send + 'static;

    /// Open a connection to the primary
    async fn connect(&self, address: &str, port: u16) -> Result<Self::Client>;
}

/// Reassemble one exported transaction from a chunk stream.
///
/// End of stream is the normal termination; the payload may be empty when
/// the primary only shares its commit state.
pub async fn read_fully<S: TxStream + ?Sized>(stream: &mut S) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

/// TCP connector for the framed replication protocol
pub struct TcpConnector {
    /// Connection timeout
    connect_timeout: Duration,
    /// Bytes per chunk frame requested from the primary
    chunk_size: usize,
}

impl TcpConnector {
    /// Create a new connector
    pub fn new(connect_timeout: Duration, chunk_size: usize) -> Self {
        Self {
            connect_timeout,
            chunk_size,
        }
    }

    /// Create a connector from the replica configuration
    pub fn from_config(config: &ReplicaConfig) -> Self {
        Self::new(config.connect_timeout(), config.replication.stream_chunk_size)
    }
}

#[async_trait]
impl PrimaryConnector for TcpConnector {
    type Client = TcpPrimaryClient;

    async fn connect(&self, address: &str, port: u16) -> Result<TcpPrimaryClient> {
        let target = format!("{}:{}", address, port);

        let result = timeout(self.connect_timeout, TcpStream::connect(&target)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(TcpPrimaryClient {
                    stream: Some(stream),
                    address: target,
                    token: None,
                    chunk_size: self.chunk_size,
                })
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: target,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(target)),
        }
    }
}

/// TCP session speaking the framed replication protocol
pub struct TcpPrimaryClient {
    /// Connection, dropped on disconnect
    stream: Option<TcpStream>,
    /// Remote address, for error reporting
    address: String,
    /// Current session token
    token: Option<String>,
    /// Bytes per chunk frame requested from the primary
    chunk_size: usize,
}

impl TcpPrimaryClient {
    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        let address = self.address.clone();
        self.stream.as_mut().ok_or(Error::ConnectionFailed {
            address,
            reason: "not connected".into(),
        })
    }

    fn token(&self) -> Result<String> {
        self.token
            .clone()
            .ok_or_else(|| Error::Auth("session is not authenticated".into()))
    }
}

#[async_trait]
impl PrimaryClient for TcpPrimaryClient {
    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let stream = self.stream_mut()?;

        write_frame(
            stream,
            &Request::Login {
                username: username.to_string(),
                password: password.to_string(),
            },
        )
        .await?;

        match read_frame::<_, Response>(stream).await? {
            Response::LoggedIn { token } => {
                self.token = Some(token);
                Ok(())
            }
            Response::Error { code, message } => Err(code.into_error(message)),
            _ => Err(Error::Protocol("Unexpected response to login".into())),
        }
    }

    async fn use_database(&mut self, database: &str) -> Result<()> {
        let token = self.token()?;
        let stream = self.stream_mut()?;

        write_frame(
            stream,
            &Request::UseDatabase {
                token,
                database: database.to_string(),
            },
        )
        .await?;

        match read_frame::<_, Response>(stream).await? {
            Response::DatabaseSelected { token } => {
                self.token = Some(token);
                Ok(())
            }
            Response::Error { code, message } => Err(code.into_error(message)),
            _ => Err(Error::Protocol("Unexpected response to use_database".into())),
        }
    }

    async fn export_tx<'a>(
        &'a mut self,
        request: ExportTxRequest,
    ) -> Result<Box<dyn TxStream + 'a>> {
        let token = self.token()?;
        let chunk_size = self.chunk_size;
        let stream = self.stream_mut()?;

        write_frame(
            stream,
            &Request::ExportTx {
                token,
                request,
                chunk_size,
            },
        )
        .await?;

        // Read the first frame eagerly so export errors (e.g. divergence)
        // surface from the call itself rather than from the stream
        let first = read_frame::<_, Response>(stream).await?;
        if let Response::Error { code, message } = first {
            return Err(code.into_error(message));
        }

        Ok(Box::new(TcpTxStream {
            stream,
            pending: Some(first),
            trailer: None,
        }))
    }

    async fn logout(&mut self) -> Result<()> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };
        let stream = self.stream_mut()?;

        write_frame(stream, &Request::Logout { token }).await?;

        match read_frame::<_, Response>(stream).await? {
            Response::LoggedOut => Ok(()),
            Response::Error { code, message } => Err(code.into_error(message)),
            _ => Err(Error::Protocol("Unexpected response to logout".into())),
        }
    }

    async fn disconnect(&mut self) {
        self.token = None;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Chunk stream over a live TCP session
struct TcpTxStream<'a> {
    stream: &'a mut TcpStream,
    /// First frame, read eagerly by `export_tx`
    pending: Option<Response>,
    trailer: Option<Trailer>,
}

#[async_trait]
impl TxStream for TcpTxStream<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.trailer.is_some() {
            return Ok(None);
        }

        let response = match self.pending.take() {
            Some(response) => response,
            None => read_frame::<_, Response>(&mut *self.stream).await?,
        };

        match response {
            Response::TxChunk { data } => Ok(Some(data)),
            Response::TxTrailer { trailer } => {
                self.trailer = Some(trailer);
                Ok(None)
            }
            Response::Error { code, message } => Err(code.into_error(message)),
            _ => Err(Error::Protocol("Unexpected frame in export stream".into())),
        }
    }

    fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }
}

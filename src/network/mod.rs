//! Network Module
//!
//! Framed TCP transport to the primary's replication endpoint.

mod client;

pub use client::{
    read_fully, PrimaryClient, PrimaryConnector, TcpConnector, TcpPrimaryClient, TxStream,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::FrameHeader;

/// Read a framed message from a reader
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Protocol("Frame checksum mismatch".into()));
    }

    // Deserialize
    let message = bincode::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

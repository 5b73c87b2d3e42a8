use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;

/// Upper bound on an encoded header; anything larger is a framing error.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Byte the receiver writes back once a chunk is durable and recorded.
pub const CHUNK_ACK: u8 = 0x06;

/// First frame on every chunk connection. The payload that follows carries no
/// length of its own: both ends derive it from the registered metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub content_hash: String,
    pub idx: u64,
}

impl ChunkHeader {
    pub fn new(content_hash: impl Into<String>, idx: u64) -> Self {
        Self {
            content_hash: content_hash.into(),
            idx,
        }
    }

    pub async fn write_to_stream<T>(&self, writer: &mut T) -> Result<(), TransferError>
    where
        T: AsyncWrite + Unpin,
    {
        let json = serde_json::to_vec(self)?;
        let length = json.len() as u32;

        writer.write_all(&length.to_be_bytes()).await?;
        writer.write_all(&json).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Returns `None` if the peer closed the connection before sending anything.
    pub async fn read_from_stream<T>(reader: &mut T) -> Result<Option<Self>, TransferError>
    where
        T: AsyncRead + Unpin,
    {
        let mut length_bytes = [0u8; 4];
        match reader.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(TransferError::Io(e)),
        }

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length == 0 || length > MAX_HEADER_LEN {
            tracing::warn!("Received invalid header length: {}", length);
            return Err(TransferError::ProtocolError(format!(
                "chunk header length {} outside 1..={}",
                length, MAX_HEADER_LEN
            )));
        }

        let mut json_bytes = vec![0u8; length];
        reader.read_exact(&mut json_bytes).await?;

        let header = serde_json::from_slice(&json_bytes)?;
        Ok(Some(header))
    }
}

pub async fn write_ack<T>(writer: &mut T) -> Result<(), TransferError>
where
    T: AsyncWrite + Unpin,
{
    writer.write_all(&[CHUNK_ACK]).await?;
    writer.flush().await?;
    Ok(())
}

/// Waits for the receiver's answer to a chunk. A close without the ack byte
/// means the chunk was rejected and is still missing.
pub async fn read_ack<T>(reader: &mut T) -> Result<bool, TransferError>
where
    T: AsyncRead + Unpin,
{
    let mut ack = [0u8; 1];
    let n = reader.read(&mut ack).await?;
    Ok(n == 1 && ack[0] == CHUNK_ACK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_header_round_trip_leaves_payload() {
        let (mut client, mut server) = duplex(1024);
        let header = ChunkHeader::new("deadbeef", 7);

        header.write_to_stream(&mut client).await.unwrap();
        client.write_all(b"payload").await.unwrap();
        drop(client);

        let received = ChunkHeader::read_from_stream(&mut server).await.unwrap().unwrap();
        assert_eq!(received, header);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn test_header_uses_wire_field_names() {
        let json = serde_json::to_string(&ChunkHeader::new("ab", 2)).unwrap();
        assert_eq!(json, r#"{"contentHash":"ab","idx":2}"#);
    }

    #[tokio::test]
    async fn test_closed_stream_yields_none() {
        let (client, mut server) = duplex(64);
        drop(client);

        assert!(ChunkHeader::read_from_stream(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&((MAX_HEADER_LEN as u32) + 1).to_be_bytes()).await.unwrap();

        let result = ChunkHeader::read_from_stream(&mut server).await;
        assert!(matches!(result, Err(TransferError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_malformed_header_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(b"nope").await.unwrap();

        let result = ChunkHeader::read_from_stream(&mut server).await;
        assert!(matches!(result, Err(TransferError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_truncated_header_is_io_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&32u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"contentHash\"").await.unwrap();
        drop(client);

        let result = ChunkHeader::read_from_stream(&mut server).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn test_ack_distinguishes_close() {
        let (mut client, mut server) = duplex(64);
        write_ack(&mut server).await.unwrap();
        drop(server);

        assert!(read_ack(&mut client).await.unwrap());
        assert!(!read_ack(&mut client).await.unwrap());
    }
}

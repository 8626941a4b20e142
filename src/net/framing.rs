//! 4-byte big-endian length prefix + UTF-8 JSON object body. Framing has
//! no knowledge of message semantics — it only knows about byte lengths
//! and "is this a JSON object".

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_BYTES;
use crate::error::ProtocolError;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let len = body.len();
    if len == 0 || len as u64 > MAX_FRAME_BYTES as u64 {
        return Err(ProtocolError::FrameTooLarge(len as u32, MAX_FRAME_BYTES));
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::UnexpectedEof)
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    Ok(body)
}

/// Serialize `value` with no whitespace and send it as one frame.
pub async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    write_frame(writer, &body).await
}

/// Read one frame, requiring the payload to decode as a JSON object before
/// deserializing it into `T`.
pub async fn read_json<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<T, ProtocolError> {
    let body = read_frame(reader).await?;
    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidFrame(
            "frame payload is not a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[tokio::test]
    async fn round_trips_through_encode_decode() {
        let mut buf = Vec::new();
        let msg = Sample {
            a: 7,
            b: "hi".to_string(),
        };
        write_json(&mut buf, &msg).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Sample = read_json(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        let huge = (MAX_FRAME_BYTES + 1).to_be_bytes();
        buf.extend_from_slice(&huge);
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Sample, _> = read_json(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(_, _))));
    }

    #[tokio::test]
    async fn rejects_non_object_payload() {
        let mut buf = Vec::new();
        let payload = b"[1,2,3]";
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Sample, _> = read_json(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn unexpected_eof_on_short_read() {
        let buf = vec![0u8, 0, 0, 5, b'{', b'"'];
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Sample, _> = read_json(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedEof)));
    }
}

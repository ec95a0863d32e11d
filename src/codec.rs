//! Framed envelope codec.
//!
//! One frame on the wire is the ASCII decimal length of the serialized
//! [`Message`] envelope, CRLF, the envelope bytes, CRLF:
//!
//! ```text
//! <ascii-decimal-length> \r \n <length bytes of envelope> \r \n
//! ```
//!
//! Encoding is infallible once a message exists; decoding distinguishes
//! transport failures (EOF anywhere inside a frame surfaces as
//! [`Error::Disconnected`]) from protocol failures (a non-decimal header, an
//! unknown or mismatched envelope tag, a malformed payload), which leave the
//! connection itself intact. The two bytes trailing the payload are consumed
//! but never verified; the length header is authoritative.

use prost::Message as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{ErrorResponse, Message, MessageType, WireMessage};

/// Serializes `msg` into one complete frame.
pub fn encode_frame<M: WireMessage>(msg: &M) -> Vec<u8> {
    let envelope = msg.to_envelope().encode_to_vec();
    let mut frame = Vec::with_capacity(envelope.len() + 16);
    frame.extend_from_slice(format!("{}\r\n", envelope.len()).as_bytes());
    frame.extend_from_slice(&envelope);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Writes one framed message to `writer` and flushes it.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: WireMessage,
{
    writer.write_all(&encode_frame(msg)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from `reader` and returns the raw envelope bytes.
///
/// # Errors
///
/// [`Error::Disconnected`] on EOF before or inside the frame,
/// [`Error::InvalidHeader`] when the length line does not parse, and
/// [`Error::Io`] for any other transport failure.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = Vec::new();
    let n = reader.read_until(b'\n', &mut header).await?;
    if n == 0 || header.last() != Some(&b'\n') {
        return Err(Error::Disconnected);
    }

    header.pop();
    if header.last() == Some(&b'\r') {
        header.pop();
    }

    let line = String::from_utf8_lossy(&header).into_owned();
    let len: usize = line.parse().map_err(|_| Error::InvalidHeader(line))?;

    let mut payload = vec![0u8; len];
    read_exact_or_disconnect(reader, &mut payload).await?;

    // Trailing delimiter; the byte count is honored but the contents are not
    // checked against CRLF, matching observed server behavior.
    let mut trailer = [0u8; 2];
    read_exact_or_disconnect(reader, &mut trailer).await?;

    Ok(payload)
}

/// Decodes an envelope into the expected response type.
///
/// An [`MessageType::Error`] envelope is surfaced as [`Error::Warden`]
/// regardless of what was expected; any other tag must match `M::TYPE`.
pub fn decode_response<M: WireMessage>(envelope_bytes: &[u8]) -> Result<M> {
    let envelope = Message::decode(envelope_bytes)?;
    let got = MessageType::try_from(envelope.r#type)
        .map_err(|_| Error::UnknownMessageType(envelope.r#type))?;

    if got == MessageType::Error {
        let fault = ErrorResponse::decode(&envelope.payload[..])?;
        return Err(Error::Warden(crate::error::WardenError {
            message: fault.message.unwrap_or_default(),
            data: fault.data.unwrap_or_default(),
            backtrace: fault.backtrace,
        }));
    }

    if got != M::TYPE {
        return Err(Error::UnexpectedMessageType {
            expected: M::TYPE,
            got,
        });
    }

    Ok(M::decode(&envelope.payload[..])?)
}

/// Reads one framed message of the expected type.
pub async fn read_message<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncBufRead + Unpin,
    M: WireMessage,
{
    let envelope = read_frame(reader).await?;
    decode_response(&envelope)
}

async fn read_exact_or_disconnect<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Disconnected),
        Err(err) => Err(Error::Io(err)),
    }
}

/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Wire helpers shared by the upstream transports
//!
//! Converts between Hickory `Message` and wire bytes. Stream transports
//! (TCP, DoT, DoQ) frame each message with a 2-byte big-endian length prefix;
//! UDP and DoH carry the bare message. The transaction ID on the wire is always
//! chosen by the caller, independent of the ID stored in the message.

use bytes::{BufMut, BytesMut};
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{DnsError, Result};

pub mod quic_stream;

/// Fixed size of a DNS message header
pub const DNS_HEADER_LEN: usize = 12;

/// Serialize `msg` with its transaction ID replaced by `id`
pub fn pack_message(msg: &Message, id: u16) -> Result<Vec<u8>> {
    let mut bytes = msg.to_vec()?;
    if bytes.len() < DNS_HEADER_LEN {
        return Err(DnsError::ShortRead(bytes.len()));
    }
    bytes[..2].copy_from_slice(&id.to_be_bytes());
    Ok(bytes)
}

/// Build one length-prefixed stream frame carrying `msg` under `id`
pub fn frame_message(msg: &Message, id: u16) -> Result<BytesMut> {
    let body = pack_message(msg, id)?;
    let len = u16::try_from(body.len()).map_err(|_| {
        DnsError::protocol(format!(
            "DNS message too large: {} bytes (max 65535)",
            body.len()
        ))
    })?;

    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u16(len);
    frame.put_slice(&body);
    Ok(frame)
}

/// Decode a length prefix, rejecting frames too short to hold a header
#[inline]
pub fn frame_len(prefix: [u8; 2]) -> Result<usize> {
    let len = u16::from_be_bytes(prefix) as usize;
    if len < DNS_HEADER_LEN {
        return Err(DnsError::ShortRead(len));
    }
    Ok(len)
}

/// Write one framed message to a stream
pub async fn write_message<W>(writer: &mut W, id: u16, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_message(msg, id)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from a stream
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix).await?;
    let len = frame_len(prefix)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Message::from_vec(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::io::duplex;

    fn query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        msg
    }

    #[test]
    fn test_pack_message_rewrites_id_only_on_wire() {
        let msg = query(0x1234);
        let bytes = pack_message(&msg, 0).unwrap();
        assert_eq!(&bytes[..2], &[0, 0]);
        assert_eq!(msg.id(), 0x1234);

        let decoded = Message::from_vec(&bytes).unwrap();
        assert_eq!(decoded.id(), 0);
        assert_eq!(decoded.queries(), msg.queries());
    }

    #[tokio::test]
    async fn test_framed_message_over_stream() {
        let (mut client, mut server) = duplex(4096);
        write_message(&mut client, 0xbeef, &query(7)).await.unwrap();

        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received.id(), 0xbeef);
        assert_eq!(received.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_read_rejects_short_frame() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0, 5, 1, 2, 3, 4, 5]).await.unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, DnsError::ShortRead(5)));
    }

    #[tokio::test]
    async fn test_read_reports_eof() {
        let (client, mut server) = duplex(64);
        drop(client);
        assert!(matches!(
            read_message(&mut server).await,
            Err(DnsError::Io(_))
        ));
    }
}

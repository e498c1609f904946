/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Framed DNS messages over a QUIC bidirectional stream
//!
//! Uses quinn's native stream calls so write/read failures keep their typed
//! errors; the retry policy in the DoQ transport inspects them.

use crate::core::error::Result;
use crate::network::transport::{frame_len, frame_message};
use hickory_proto::op::Message;
use quinn::{Connection, RecvStream, SendStream};

/// One request/response exchange on a fresh stream
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl QuicStream {
    /// Open a bidirectional stream on an established connection
    pub async fn open(conn: &Connection) -> Result<Self> {
        let (send, recv) = conn.open_bi().await?;
        Ok(Self { send, recv })
    }

    /// Write one framed message under `id`, then half-close the send side
    pub async fn write_message(&mut self, msg: &Message, id: u16) -> Result<()> {
        let frame = frame_message(msg, id)?;
        let mut chunks = [frame.freeze()];
        self.send.write_all_chunks(&mut chunks).await?;
        // A stream that is already finished has nothing left to flush.
        let _ = self.send.finish();
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 2];
        self.recv.read_exact(&mut prefix).await?;
        let len = frame_len(prefix)?;

        let mut buf = vec![0u8; len];
        self.recv.read_exact(&mut buf).await?;
        let msg = Message::from_vec(&buf)?;

        // Nothing else is expected on this stream.
        let _ = self.recv.stop(0u32.into());
        Ok(msg)
    }
}

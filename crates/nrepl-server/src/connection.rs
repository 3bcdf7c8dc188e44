// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

/// Per-connection read loop and reply writer
use crate::codec::{decode, encode};
use crate::error::{NReplError, Result};
use crate::framer::Framer;
use crate::message::{Request, Response};
use crate::ops::Dispatcher;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// Writes encoded replies in the connection's framing format
///
/// Length-prefixed replies always carry a 4-byte big-endian header, even
/// when the client framed its requests with an ASCII `<len>:` header.
#[derive(Debug)]
pub struct ResponseWriter<W> {
    inner: W,
    length_prefixed: bool,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(inner: W, length_prefixed: bool) -> Self {
        Self {
            inner,
            length_prefixed,
        }
    }

    pub fn is_length_prefixed(&self) -> bool {
        self.length_prefixed
    }

    pub fn set_length_prefixed(&mut self, length_prefixed: bool) {
        self.length_prefixed = length_prefixed;
    }

    /// Encode and flush a single reply
    pub async fn send(&mut self, response: Response) -> Result<()> {
        let body = encode(&response.into_value());

        if self.length_prefixed {
            let len = u32::try_from(body.len()).map_err(|_| {
                NReplError::format("Reply too large for a 4-byte length header", body.len())
            })?;
            self.inner.write_all(&len.to_be_bytes()).await?;
        }
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;

        debug!(
            bytes = body.len(),
            length_prefixed = self.length_prefixed,
            "sent reply"
        );
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Serve one client until it disconnects
///
/// A fresh session is created up front and becomes the connection's current
/// session. Requests are handled strictly in arrival order; replies to one
/// request are all written before the next request is looked at.
pub async fn handle_connection<S>(stream: S, dispatcher: Arc<Dispatcher>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let mut writer = ResponseWriter::new(writer, false);
    let mut current_session = dispatcher.sessions().create_session();
    debug!(session = %current_session, "created connection session");

    let mut framer = Framer::new();
    let mut accumulated = Vec::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            debug!(session = %current_session, "client closed the connection");
            return Ok(());
        }
        accumulated.extend_from_slice(&buffer[..n]);

        while let Some(frame) = framer.next_frame(&mut accumulated) {
            writer.set_length_prefixed(framer.is_length_prefixed());

            let request = match decode(&frame) {
                Ok(fields) => Request::new(fields),
                Err(err) => {
                    warn!("dropping undecodable message: {}", err);
                    continue;
                }
            };

            match dispatcher
                .dispatch(&request, &current_session, &mut writer)
                .await
            {
                Ok(next) => current_session = next,
                Err(err) if err.is_recoverable() => warn!("request failed: {}", err),
                Err(err) => return Err(err),
            }
        }
    }
}

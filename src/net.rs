// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::mpsc,
};
use tracing::debug;

/// Await bytes on the read half, appending into `buf`. Pends forever while
/// there is no connection, so this can sit in a `select!` arm unconditionally.
/// `Ok(0)` means the peer closed the connection.
pub(crate) async fn read_some(
    reader: &mut Option<OwnedReadHalf>,
    buf: &mut BytesMut,
) -> std::io::Result<usize> {
    match reader.as_mut() {
        Some(half) => half.read_buf(buf).await,
        None => std::future::pending().await,
    }
}

/// Drain `frames` onto the socket one at a time. Serializing all writes
/// through this task keeps concurrent senders from interleaving frame bytes
/// on the wire. The task ends on the first write error (after telling
/// `on_error`) or when every sender is gone.
pub(crate) fn spawn_frame_writer(
    mut half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    on_error: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(err) = half.write_all(&frame).await {
                debug!("socket write failed: {err}");
                on_error();
                return;
            }
        }
    });
}

//! TCP editor transport: newline-delimited JSON frames.
//!
//! Each connection gets one reader task and one writer task. The reader
//! turns lines into [`BrokerInput::EditorMessage`]; the writer drains the
//! client's outbound channel. Connect and disconnect are reported to the
//! broker, which owns the broadcast set.

use crate::broker::{BrokerInput, ClientId};
use crate::error::TransportError;
use anyhow::{Context, Result};
use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub struct EditorListener {
    listener: TcpListener,
    inbound: UnboundedSender<BrokerInput>,
    next_id: Arc<AtomicU64>,
}

impl EditorListener {
    pub async fn bind(addr: &str, inbound: UnboundedSender<BrokerInput>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind editor listener on {}", addr))?;
        Ok(Self {
            listener,
            inbound,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the broker goes away.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Editor transport listening on {}", addr);
        }
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            if self.inbound.is_closed() {
                break;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            debug!("Editor client {} connected from {}", id, peer);
            tokio::spawn(serve_client(id, stream, self.inbound.clone()));
        }
    }
}

async fn serve_client(id: ClientId, stream: TcpStream, inbound: UnboundedSender<BrokerInput>) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    if inbound
        .send(BrokerInput::ClientConnected { client: id, sender: tx })
        .is_err()
    {
        return;
    }

    let writer_task = tokio::spawn(async move {
        if let Err(e) = write_frames(writer, rx).await {
            debug!("Writer for client {} stopped: {}", id, e);
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let msg = BrokerInput::EditorMessage {
                    client: id,
                    text: text.to_string(),
                };
                if inbound.send(msg).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Client {}: {}", id, TransportError::Io(e));
                break;
            }
        }
    }

    let _ = inbound.send(BrokerInput::ClientDisconnected(id));
    writer_task.abort();
    debug!("Editor client {} disconnected", id);
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: UnboundedReceiver<Bytes>,
) -> Result<(), TransportError> {
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

//! TCP front end: one task per connection, one line per request.
//!
//! Each connection gets its own cancellation context, derived from the
//! server's. The context is cancelled when the peer hangs up or the server
//! shuts down, which ends any `pull` subscription or quorum round that the
//! connection started. Lines on a connection are handled one at a time, so
//! a `pull` occupies its connection until it is cancelled.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    context::{CancelHandle, Context},
    error::{Error, Result},
    handler::{Handler, InboundMessage, Log, Paxos, ResponseSink},
    wire::{read_line, render_error, write_line},
};

/// Lines read ahead of the one being processed.
const LINE_BACKLOG: usize = 32;

type ConnectionId = u64;

pub struct Server<L: ?Sized, P: ?Sized> {
    listener: TcpListener,
    handler: Handler<L, P>,
    next_id: Arc<AtomicU64>,
}

impl<L, P> Server<L, P>
where
    L: Log + ?Sized + 'static,
    P: Paxos + ?Sized + 'static,
{
    pub fn new(listener: TcpListener, handler: Handler<L, P>) -> Self {
        Self {
            listener,
            handler,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then cancels every
    /// open connection.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            handler,
            next_id,
        } = self;
        let (root, cancel_all) = Context::with_cancel();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    cancel_all.cancel();
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        spawn_connection(stream, peer, id, handler.clone(), &root);
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// A line as seen by the handler, tagged with where it came from.
struct InboundLine {
    text: String,
    address: String,
    name: String,
}

impl InboundMessage for InboundLine {
    fn message(&self) -> &str {
        &self.text
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Writes each payload as one line on the connection. Remembers whether a
/// write failed, since after that nothing more can be sent.
struct LineSink {
    writer: OwnedWriteHalf,
    broken: bool,
}

#[async_trait]
impl ResponseSink for LineSink {
    async fn push(&mut self, payload: String) -> std::io::Result<()> {
        let written = write_line(&mut self.writer, &payload).await;
        self.broken |= written.is_err();
        written
    }
}

fn spawn_connection<L, P>(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    handler: Handler<L, P>,
    root: &Context,
) where
    L: Log + ?Sized + 'static,
    P: Paxos + ?Sized + 'static,
{
    let (ctx, cancel) = root.child();
    tokio::spawn(async move {
        debug!(peer = %peer, id, "connection opened");
        if let Err(err) = handle_connection(stream, peer, id, handler, ctx, cancel).await {
            warn!(peer = %peer, id, error = %err, "connection closed with error");
        } else {
            debug!(peer = %peer, id, "connection closed");
        }
    });
}

async fn handle_connection<L, P>(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    handler: Handler<L, P>,
    ctx: Context,
    cancel: CancelHandle,
) -> Result<()>
where
    L: Log + ?Sized + 'static,
    P: Paxos + ?Sized + 'static,
{
    let (reader, writer) = stream.into_split();
    let (line_tx, mut line_rx) = mpsc::channel(LINE_BACKLOG);
    let reader_task = tokio::spawn(read_lines(BufReader::new(reader), line_tx, cancel));
    let mut sink = LineSink {
        writer,
        broken: false,
    };
    let address = peer.to_string();
    let name = format!("conn-{id}");

    let outcome = loop {
        let next = select! {
            biased;
            _ = ctx.cancelled() => None,
            next = line_rx.recv() => next,
        };
        let Some(text) = next else {
            break Ok(());
        };

        let message = InboundLine {
            text,
            address: address.clone(),
            name: name.clone(),
        };
        match handler.process(ctx.clone(), &message, &mut sink).await {
            Ok(()) => {}
            Err(err) if sink.broken => break Err(err),
            Err(err) => {
                debug!(peer = %peer, line = %message.text, error = %err, "request failed");
                if let Err(err) = sink.push(render_error(&err)).await {
                    break Err(Error::Io(err));
                }
            }
        }
    };

    reader_task.abort();
    outcome
}

/// Forwards lines from the peer until it hangs up. Dropping `cancel` on the
/// way out cancels the connection context.
async fn read_lines(
    mut reader: BufReader<OwnedReadHalf>,
    lines: mpsc::Sender<String>,
    cancel: CancelHandle,
) {
    loop {
        match read_line(&mut reader).await {
            Ok(Some(line)) => {
                if lines.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "read failed");
                break;
            }
        }
    }
    cancel.cancel();
}

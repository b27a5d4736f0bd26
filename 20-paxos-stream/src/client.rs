//! Line protocol client, used by peers for the consensus phases and by the
//! `client` subcommand.

use std::{io, net::SocketAddr};

use anyhow::Context as _;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info};

use crate::{
    cli::ClientArgs,
    error::{Error, Result},
    wire::{parse_response, read_line, write_line},
};

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        debug!(peer = %addr, "connected");
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            peer: addr,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.writer, line).await?;
        Ok(())
    }

    /// Next response line. `Ok(None)` once the server closed the connection;
    /// `error: ...` lines come back as [`Error::Remote`].
    pub async fn recv(&mut self) -> Result<Option<String>> {
        match read_line(&mut self.reader).await? {
            Some(line) => parse_response(line).map(Some),
            None => Ok(None),
        }
    }

    /// Sends `line` and waits for its single response line.
    pub async fn request(&mut self, line: &str) -> Result<String> {
        self.send(line).await?;
        self.recv().await?.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a response",
            ))
        })
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Sends one command line and prints the responses.
///
/// `pull` keeps printing streamed values until the server closes the
/// connection or ctrl-c is pressed; every other command prints one line.
pub async fn run(args: ClientArgs) -> anyhow::Result<()> {
    let line = args.line.join(" ");
    let mut client = Client::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", client.peer());

    client.send(&line).await?;
    let streaming = line.split_whitespace().next() == Some("pull");

    loop {
        select! {
            response = client.recv() => match response? {
                Some(payload) => {
                    write_stdout(&payload).await?;
                    if !streaming {
                        break;
                    }
                }
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                ctrl_c.context("failed to listen for ctrl-c")?;
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    write_line(&mut stdout, line).await
}

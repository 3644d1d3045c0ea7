//! The pub/sub bus the Consumer subscribes to. Transport configuration is
//! an external collaborator — this module only needs to produce a stream
//! of `BusMessage`s and reconnect with backoff when the stream ends.
//!
//! The wire shape on this channel is newline-delimited JSON over a plain
//! TCP connection, optionally preceded by a password line, which is about
//! as little transport as a "single typed channel" can have while still
//! being a real socket to reconnect.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::protocol::BusMessage;

pub struct PubSubClient {
    host: String,
    port: u16,
    password: Option<String>,
}

impl PubSubClient {
    pub fn new(config: &Config) -> Self {
        PubSubClient {
            host: config.pubsub_host.clone(),
            port: config.pubsub_port,
            password: config.pubsub_password.clone(),
        }
    }

    async fn connect(&self) -> std::io::Result<BufReader<TcpStream>> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        if let Some(password) = &self.password {
            stream.write_all(password.as_bytes()).await?;
            stream.write_all(b"\n").await?;
        }
        Ok(BufReader::new(stream))
    }

    /// Connects (retrying with exponential backoff) and hands back a
    /// connected reader; the caller drives the read loop and calls this
    /// again when the stream ends.
    pub async fn connect_with_retry(&self) -> BufReader<TcpStream> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        loop {
            match self.connect().await {
                Ok(reader) => {
                    info!("{:15.15}[>] {:20} connected to pub/sub bus at {}:{}", "pubsub", "connect", self.host, self.port);
                    backoff.reset();
                    return reader;
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!("{:15.15}[x] {:20} pub/sub connect failed: {}, retrying in {:?}", "pubsub", "connect-fail", e, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Reads one line and parses it as a `BusMessage`. `Ok(None)` means the
    /// peer closed the stream cleanly; malformed lines are logged and
    /// skipped rather than treated as a disconnect.
    pub async fn read_message(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<BusMessage>> {
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<BusMessage>(trimmed) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    debug!("{:15.15}[x] {:20} malformed bus message dropped: {}", "pubsub", "malformed", e);
                    continue;
                }
            }
        }
    }
}

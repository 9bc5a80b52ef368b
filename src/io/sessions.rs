//! Push sessions - newline-delimited TCP protocol
//!
//! Client lines:
//!   HELLO <subscriberId>   bind to a subscriber and join its zones
//!   SUB <zoneId>           join a zone topic
//!   UNSUB <zoneId>         leave a zone topic
//!   PING
//!
//! Server lines: `OK ...`, `ERR <reason>`, `PONG`, and one JSON object per
//! delivered notification. Each connection owns one registry channel, which
//! is closed when the connection ends. A line longer than 256 bytes gets
//! `ERR line too long` and the connection is closed.

use crate::domain::error::AlertError;
use crate::domain::types::{SubscriberId, ZoneId};
use crate::services::fanout::ChannelId;
use crate::services::pipeline::AlertPipeline;
use anyhow::Context;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_LINE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Hello(SubscriberId),
    Sub(ZoneId),
    Unsub(ZoneId),
    Ping,
}

impl SessionCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.len() > MAX_LINE_LEN {
            return Err("line too long".to_string());
        }
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        let zone_arg = |arg: &str| {
            arg.parse::<ZoneId>().map_err(|_| format!("invalid zone id '{}'", arg))
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELLO" if !arg.is_empty() => Ok(SessionCommand::Hello(SubscriberId(arg.to_string()))),
            "HELLO" => Err("HELLO requires a subscriber id".to_string()),
            "SUB" => zone_arg(arg).map(SessionCommand::Sub),
            "UNSUB" => zone_arg(arg).map(SessionCommand::Unsub),
            "PING" => Ok(SessionCommand::Ping),
            _ => Err(format!("unknown command '{}'", verb)),
        }
    }
}

/// One framed read from a session
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    TooLong,
    Eof,
}

/// Read one newline-terminated line of at most `MAX_LINE_LEN` bytes
///
/// Never buffers more than `MAX_LINE_LEN + 1` bytes. Partial reads stay in
/// `buf`, so the call can be dropped inside `select!` and resumed.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let budget = (MAX_LINE_LEN + 1).saturating_sub(buf.len()) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', buf).await?;

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            return Ok(Frame::Line(line));
        }
        if buf.len() > MAX_LINE_LEN {
            buf.clear();
            return Ok(Frame::TooLong);
        }
        if n == 0 {
            return Ok(Frame::Eof);
        }
    }
}

fn join_ids(ids: &[ZoneId]) -> String {
    ids.iter().map(ZoneId::to_string).collect::<Vec<_>>().join(",")
}

/// Execute one command and produce the reply line
fn execute(pipeline: &AlertPipeline, channel: ChannelId, command: SessionCommand) -> String {
    let result: Result<String, AlertError> = match command {
        SessionCommand::Ping => return "PONG".to_string(),
        SessionCommand::Hello(subscriber) => pipeline
            .attach_channel(channel, &subscriber)
            .map(|zones| format!("OK HELLO {} zones={}", subscriber, join_ids(&zones))),
        SessionCommand::Sub(zone) => match pipeline.zones().get(zone) {
            Some(z) if z.is_live(Utc::now()) => {
                pipeline.registry().subscribe(channel, zone).map(|_| format!("OK SUB {}", zone))
            }
            _ => Err(AlertError::NotFound(format!("zone {}", zone))),
        },
        SessionCommand::Unsub(zone) => {
            pipeline.registry().unsubscribe(channel, zone).map(|_| format!("OK UNSUB {}", zone))
        }
    };
    result.unwrap_or_else(|e| format!("ERR {}", e))
}

/// Serve one session until the peer disconnects or shutdown is signalled
pub async fn serve_session<S>(
    stream: S,
    peer: String,
    pipeline: Arc<AlertPipeline>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (channel, mut outbound) = pipeline.registry().open();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut pending = Vec::with_capacity(MAX_LINE_LEN + 1);

    info!(peer = %peer, channel = %channel, "session_opened");

    if writer.write_all(format!("OK READY {}\n", channel).as_bytes()).await.is_ok() {
        loop {
            let reply = tokio::select! {
                frame = read_frame(&mut reader, &mut pending) => match frame {
                    Ok(Frame::Line(line)) if line.trim().is_empty() => continue,
                    Ok(Frame::Line(line)) => match SessionCommand::parse(&line) {
                        Ok(command) => execute(&pipeline, channel, command),
                        Err(reason) => format!("ERR {}", reason),
                    },
                    Ok(Frame::TooLong) => {
                        warn!(peer = %peer, limit = %MAX_LINE_LEN, "session_line_too_long");
                        let _ = writer.write_all(b"ERR line too long\n").await;
                        break;
                    }
                    Ok(Frame::Eof) => break,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "session_read_failed");
                        break;
                    }
                },
                msg = outbound.recv() => match msg {
                    Some(msg) => msg.to_json_line(),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let mut out = reply.into_bytes();
            out.push(b'\n');
            if let Err(e) = writer.write_all(&out).await {
                debug!(peer = %peer, error = %e, "session_write_failed");
                break;
            }
        }
    }

    pipeline.registry().on_channel_closed(channel);
    info!(peer = %peer, channel = %channel, "session_closed");
}

/// Start the push session listener
pub async fn start_session_listener(
    addr: SocketAddr,
    pipeline: Arc<AlertPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind session listener on {}", addr))?;

    info!(addr = %addr, "session_listener_started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("session_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        let pipeline = pipeline.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            serve_session(socket, peer.to_string(), pipeline, shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "session_accept_failed");
                    }
                }
            }
        }
    }
}

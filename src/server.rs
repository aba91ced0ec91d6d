//! WebSocket front end.
//!
//! Each connection upgraded on `/ws` is split into a reader task and a writer
//! task bridged to [`handle_connection`] over unbounded channels. A plain
//! `GET /api/health` is answered before the upgrade is attempted.

use crate::config::Config;
use crate::orchestrator::{handle_connection, CallContext};
use crate::protocol::{ClientMessage, InboundFrame, OutboundFrame};
use crate::vad::{build_detector, VadEngine, VadError, VadParams, VoiceActivityDetector};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Path accepted for the call socket.
pub const CALL_PATH: &str = "/ws";
/// Health check answered without an upgrade.
pub const HEALTH_PATH: &str = "/api/health";

/// Error type for the listener
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("VAD setup failed: {0}")]
    Vad(#[from] VadError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Everything needed to build a fresh detector for each call.
#[derive(Debug, Clone, Copy)]
pub struct VadSettings {
    pub engine: VadEngine,
    pub params: VadParams,
    pub energy_threshold: f32,
    pub sample_rate: u32,
}

impl VadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: config.vad_engine,
            params: config.vad,
            energy_threshold: config.vad_energy_threshold,
            sample_rate: config.sample_rate,
        }
    }

    pub fn build(&self) -> std::result::Result<Box<dyn VoiceActivityDetector>, VadError> {
        build_detector(self.engine, self.params, self.energy_threshold, self.sample_rate)
    }
}

/// Accept connections until the listener fails.
///
/// The VAD settings are checked once up front so a bad engine/rate pairing
/// fails at startup instead of on the first call.
pub async fn serve(listener: TcpListener, ctx: CallContext, vad: VadSettings) -> Result<()> {
    vad.build()?;
    info!("Listening on {}{}", listener.local_addr()?, CALL_PATH);

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_socket(stream, peer, ctx, vad).await;
        });
    }
}

fn check_path(req: &Request, resp: Response) -> std::result::Result<Response, ErrorResponse> {
    if req.uri().path() == CALL_PATH {
        return Ok(resp);
    }
    debug!("Rejecting upgrade on {}", req.uri().path());
    let mut reject = ErrorResponse::new(Some("Not found".to_string()));
    *reject.status_mut() = StatusCode::NOT_FOUND;
    Err(reject)
}

async fn is_health_check(stream: &TcpStream) -> bool {
    let request_line = format!("GET {} ", HEALTH_PATH);
    let mut head = [0u8; 32];
    match stream.peek(&mut head).await {
        Ok(n) => head[..n].starts_with(request_line.as_bytes()),
        Err(_) => false,
    }
}

async fn answer_health(mut stream: TcpStream, ctx: &CallContext) -> std::io::Result<()> {
    // The request has no body; its head fits one read.
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await?;

    let body = serde_json::json!({
        "status": "ok",
        "service": "rholine",
        "activeCall": ctx.manager.active_call().map(|call| call.call_id),
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, ctx: CallContext, vad: VadSettings) {
    if is_health_check(&stream).await {
        if let Err(e) = answer_health(stream, &ctx).await {
            debug!("Health check from {} failed: {}", peer, e);
        }
        return;
    }

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    info!("Client connected: {}", peer);

    let detector = match vad.build() {
        Ok(detector) => detector,
        Err(e) => {
            error!("Cannot create VAD for {}: {}", peer, e);
            return;
        }
    };

    let (mut sink, mut stream) = ws_stream.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let frame = match message {
                Ok(message) => match inbound_frame(message) {
                    Some(frame) => frame,
                    None => continue,
                },
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    InboundFrame::Closed
                }
            };
            let closed = frame == InboundFrame::Closed;
            if inbound_tx.send(frame).is_err() || closed {
                return;
            }
        }
        let _ = inbound_tx.send(InboundFrame::Closed);
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Some(message) = outbound_message(frame) else {
                continue;
            };
            if let Err(e) = sink.send(message).await {
                debug!("WebSocket write failed: {}", e);
                return;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    });

    let record = handle_connection(ctx, detector, inbound_rx, outbound_tx).await;
    reader.abort();
    if let Err(e) = writer.await {
        warn!("Writer task for {} failed: {}", peer, e);
    }

    match record {
        Some(record) => info!(
            "Client {} disconnected after call {} ({:?})",
            peer, record.call_id, record.end_reason
        ),
        None => info!("Client {} disconnected without a call", peer),
    }
}

/// Map a socket message to an inbound frame. Pings, pongs and malformed
/// control messages yield `None`.
fn inbound_frame(message: Message) -> Option<InboundFrame> {
    match message {
        Message::Binary(bytes) => Some(InboundFrame::audio(bytes.to_vec())),
        Message::Text(text) => ClientMessage::parse(text.as_str()).map(InboundFrame::Control),
        Message::Close(frame) => {
            debug!("Close frame: {:?}", frame);
            Some(InboundFrame::Closed)
        }
        _ => None,
    }
}

fn outbound_message(frame: OutboundFrame) -> Option<Message> {
    match frame {
        OutboundFrame::Audio(pcm) => Some(Message::Binary(pcm.into())),
        OutboundFrame::Control(msg) => match msg.to_json() {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                error!("Failed to serialize {:?}: {}", msg, e);
                None
            }
        },
    }
}

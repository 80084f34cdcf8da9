//! WebSocket client for the control server, used by watchers and by a second
//! server instance to reach the first.

use crate::events::ServerEvent;
use crate::protocol::{ClientRequest, ServerMessage, ServerReply, PING, PONG};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid message from server: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed by server")]
    Closed,

    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

/// URL of a control server listening on `host:port`.
pub fn server_url(host: &str, port: u16) -> String {
    format!("ws://{}:{}/", host, port)
}

pub struct ControlClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Events that arrived while waiting for a reply.
    pending: VecDeque<ServerEvent>,
}

impl ControlClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _response) = connect_async(url).await?;
        Ok(Self {
            stream,
            pending: VecDeque::new(),
        })
    }

    pub async fn send(&mut self, request: &ClientRequest) -> Result<(), ClientError> {
        let text = serde_json::to_string(request)?;
        self.send_text(&text).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Send a request and wait for its reply; events received meanwhile are kept.
    pub async fn request(&mut self, request: &ClientRequest) -> Result<ServerReply, ClientError> {
        self.send(request).await?;
        loop {
            match self.read_message().await? {
                ServerMessage::Reply(reply) => return Ok(reply),
                ServerMessage::Event(event) => self.pending.push_back(event),
            }
        }
    }

    /// Next reply or event, oldest buffered event first.
    pub async fn next_message(&mut self) -> Result<ServerMessage, ClientError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(ServerMessage::Event(event));
        }
        self.read_message().await
    }

    /// Next broadcast event, skipping stray replies.
    pub async fn next_event(&mut self) -> Result<ServerEvent, ClientError> {
        loop {
            if let ServerMessage::Event(event) = self.next_message().await? {
                return Ok(event);
            }
        }
    }

    /// Round trip of the plain-text liveness query.
    pub async fn ping(&mut self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.send_text(PING).await?;
        loop {
            match self.read_frame().await? {
                text if text == PONG => return Ok(started.elapsed()),
                text => match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Event(event) => self.pending.push_back(event),
                    ServerMessage::Reply(reply) => {
                        return Err(ClientError::Unexpected(format!("{:?}", reply)))
                    }
                },
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.close(None).await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<ServerMessage, ClientError> {
        loop {
            let text = self.read_frame().await?;
            if text == PONG {
                continue;
            }
            return Ok(serde_json::from_str(&text)?);
        }
    }

    async fn read_frame(&mut self) -> Result<String, ClientError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

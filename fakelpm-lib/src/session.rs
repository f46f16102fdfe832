//! Server side of a download session.
//!
//! A session owns its stream exclusively and runs strictly in order:
//!
//! ```text
//! AwaitingRequest ─► SendingHeader ─► AwaitHeaderAck ─► StreamingMeasurements ─► SendingFinal ─► Closed
//!   ▲         │
//!   └── NAK ──┘  (framed but undecodable request, or unknown command)
//! ```
//!
//! The server never has more than one block in flight: each header or
//! record must be acknowledged before the next one is written.

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::constants::*;
use crate::error::LpmError;
use crate::frame::{Command, ControlFrame, Final, Frame, Header, Measurement, Request};
use crate::source::MeasurementSource;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Step of the handshake, used to give errors context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Phase {
    #[strum(to_string = "connect")]
    Connect,
    #[strum(to_string = "greeting ACK")]
    Greeting,
    #[strum(to_string = "request")]
    Request,
    #[strum(to_string = "request ACK")]
    RequestAck,
    #[strum(to_string = "header")]
    Header,
    #[strum(to_string = "header ACK")]
    HeaderAck,
    #[strum(to_string = "measurement")]
    Measurement,
    #[strum(to_string = "measurement ACK")]
    MeasurementAck,
    #[strum(to_string = "final")]
    Final,
}

/// States of the server-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ServerState {
    AwaitingRequest,
    SendingHeader,
    AwaitHeaderAck,
    StreamingMeasurements,
    SendingFinal,
    Closed,
}

/// Outcome of a completed server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub command: Command,
    pub records_sent: usize,
    /// NAKs sent for bad requests before the accepted one
    pub naks_sent: usize,
}

pub struct ServerSession<S> {
    stream: S,
    config: SessionConfig,
    source: Arc<dyn MeasurementSource>,
    clock: Arc<dyn Clock>,
    state: ServerState,
    buffer: BytesMut,
    naks_sent: usize,
}

impl<S> ServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: SessionConfig, source: Arc<dyn MeasurementSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            stream,
            config,
            source,
            clock,
            state: ServerState::AwaitingRequest,
            buffer: BytesMut::with_capacity(config.max_request_buffer),
            naks_sent: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn enter(&mut self, state: ServerState) {
        debug!("Session state {} -> {}", self.state, state);
        self.state = state;
    }

    /// Drive one download to completion, then close the stream.
    pub async fn run(mut self) -> Result<SessionSummary, LpmError> {
        let (request, command) = self.await_request().await?;
        info!("Received {} request - measures download", command);

        self.enter(ServerState::SendingHeader);
        self.write(ControlFrame::Ack.as_bytes(), Phase::RequestAck).await?;
        let header = Header::for_request(&request, self.clock.now());
        self.write(&header.encode(), Phase::Header).await?;
        info!("Sent header block for {} request", command);

        self.enter(ServerState::AwaitHeaderAck);
        self.await_ack(Phase::HeaderAck).await?;

        self.enter(ServerState::StreamingMeasurements);
        let total = self.source.batch_len();
        for index in 0..total {
            let measurement = Measurement::new(self.source.next_payload());
            self.write(&measurement.encode(), Phase::Measurement).await?;
            debug!("Sent measurement {}/{}", index + 1, total);
            self.await_ack(Phase::MeasurementAck).await?;
        }

        self.enter(ServerState::SendingFinal);
        self.write(&Final::new().encode(), Phase::Final).await?;
        info!("Sent final package after {} measurements", total);

        self.enter(ServerState::Closed);
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown after final package failed: {}", e);
        }

        Ok(SessionSummary {
            command,
            records_sent: total,
            naks_sent: self.naks_sent,
        })
    }

    /// Accumulate input until it holds a request with a known command.
    ///
    /// Framed input that does not decode, and requests with an unknown
    /// command, are answered with a NAK. Input without a complete
    /// STX..ETX span gets no reply. A partial request is given
    /// `frame_gap` to complete before it is judged.
    async fn await_request(&mut self) -> Result<(Request, Command), LpmError> {
        let mut settled = false;
        loop {
            match self.scan_request(settled) {
                RequestScan::Found(request) => {
                    settled = false;
                    match request.command() {
                        Ok(command) => return Ok((request, command)),
                        Err(e) => {
                            warn!("Rejecting request: {}", e);
                            self.send_nak().await?;
                        }
                    }
                    continue;
                }
                RequestScan::Invalid(e) => {
                    settled = false;
                    warn!("Invalid request: {}", e);
                    self.send_nak().await?;
                    continue;
                }
                RequestScan::Partial => {
                    settled = !self.fill(Some(self.config.frame_gap)).await?;
                    if settled {
                        debug!("Partial request stalled: {}", hex::encode(&self.buffer));
                    }
                }
                RequestScan::Idle => {
                    self.fill(None).await?;
                    settled = false;
                }
            }
        }
    }

    /// Look for a request at every STX in the buffer.
    ///
    /// A later STX is tried when an earlier one does not decode, so a stray
    /// start byte cannot hide the request behind it. Unless `settled`, a
    /// short tail that still matches the request prefix waits for more input.
    fn scan_request(&mut self, settled: bool) -> RequestScan {
        let mut rejected = None;
        let mut partial = None;
        let mut offset = 0;

        while let Some(pos) = self.buffer[offset..].iter().position(|&b| b == STX) {
            let start = offset + pos;
            let candidate = &self.buffer[start..];
            match Request::decode(candidate) {
                Ok(request) => {
                    if start > 0 {
                        debug!("Skipped {} bytes before request", start);
                    }
                    self.buffer.advance(start + REQUEST_LEN);
                    return RequestScan::Found(request);
                }
                Err(e) => {
                    if partial.is_none() && !settled && could_be_request(candidate) {
                        partial = Some(start);
                    }
                    rejected.get_or_insert(e);
                }
            }
            offset = start + 1;
        }

        if let Some(start) = partial {
            self.buffer.advance(start);
            return RequestScan::Partial;
        }
        if has_frame_span(&self.buffer) {
            self.buffer.clear();
            return RequestScan::Invalid(rejected.unwrap_or_else(|| LpmError::Framing("no request in frame".into())));
        }
        self.discard_noise();
        RequestScan::Idle
    }

    /// Append the next read to the buffer.
    ///
    /// With a `limit`, returns false when nothing arrived in time.
    async fn fill(&mut self, limit: Option<Duration>) -> Result<bool, LpmError> {
        let mut chunk = [0u8; 512];
        let read = match limit {
            Some(limit) => match timeout(limit, self.stream.read(&mut chunk)).await {
                Ok(read) => read,
                Err(_) => return Ok(false),
            },
            None => self.stream.read(&mut chunk).await,
        };
        let n = read.map_err(|e| LpmError::from(e).in_phase(Phase::Request))?;
        if n == 0 {
            return Err(LpmError::Io(std::io::ErrorKind::UnexpectedEof.into()).in_phase(Phase::Request));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        debug!("Request buffer: {}", hex::encode(&self.buffer));
        Ok(true)
    }

    /// Drop bytes that cannot start a request.
    fn discard_noise(&mut self) {
        match self.buffer.iter().position(|&b| b == STX) {
            Some(start) => {
                self.buffer.advance(start);
            }
            None => self.buffer.clear(),
        }
        if self.buffer.len() > self.config.max_request_buffer {
            warn!("Dropping {} unframed bytes", self.buffer.len());
            self.buffer.clear();
        }
    }

    async fn send_nak(&mut self) -> Result<(), LpmError> {
        self.write(ControlFrame::Nak.as_bytes(), Phase::Request).await?;
        self.naks_sent += 1;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8], phase: Phase) -> Result<(), LpmError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| LpmError::from(e).in_phase(phase))?;
        self.stream.flush().await.map_err(|e| LpmError::from(e).in_phase(phase))
    }

    /// Wait for any reply from the client. Its content is only logged.
    async fn await_ack(&mut self, phase: Phase) -> Result<(), LpmError> {
        let mut reply = [0u8; CONTROL_LEN];
        let n = timeout(self.config.ack_timeout, self.stream.read(&mut reply))
            .await
            .map_err(LpmError::from)
            .and_then(|read| read.map_err(LpmError::from))
            .map_err(|e| e.in_phase(phase))?;
        if n == 0 {
            return Err(LpmError::Io(std::io::ErrorKind::UnexpectedEof.into()).in_phase(phase));
        }

        let reply = &reply[..n];
        match ControlFrame::classify(reply) {
            Some(kind) => debug!("Received {} for {}", kind, phase),
            None => debug!("Received {:?} for {}", String::from_utf8_lossy(reply), phase),
        }
        Ok(())
    }
}

enum RequestScan {
    Found(Request),
    /// Framed input with no request in it
    Invalid(LpmError),
    /// The tail may still become a request
    Partial,
    Idle,
}

/// True when `bytes` is shorter than a request and agrees with its prefix.
fn could_be_request(bytes: &[u8]) -> bool {
    bytes.len() < REQUEST_LEN
        && bytes.first() == Some(&STX)
        && bytes[1..].iter().zip(PROTOCOL_TAG.iter()).all(|(a, b)| a == b)
}

/// True when `bytes` holds an STX with an ETX somewhere after it.
fn has_frame_span(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|&b| b == STX)
        .is_some_and(|start| bytes[start + 1..].contains(&ETX))
}

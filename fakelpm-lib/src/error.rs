use crate::session::Phase;
use std::io;
use thiserror::Error;

/// The primary error type for the `fakelpm` library.
#[derive(Error, Debug)]
pub enum LpmError {
    /// Start or end marker missing, or a frame prefix that fits no known block.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Invalid checksum: computed {computed:#06x}, received {received:#06x}")]
    Checksum { computed: u16, received: u16 },

    #[error("Timed out waiting for the peer: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Unknown command {:?}", String::from_utf8_lossy(.0))]
    UnknownCommand([u8; 2]),

    #[error("Request rejected by the server with NAK")]
    Rejected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid archive data: {0}")]
    Archive(String),

    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Hex decode failed: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Any of the above, tagged with the handshake phase it interrupted.
    #[error("{phase} failed: {source}")]
    Session {
        phase: Phase,
        #[source]
        source: Box<LpmError>,
    },
}

impl LpmError {
    /// Wrap this error with the phase in which it happened.
    ///
    /// An error that already carries a phase keeps the innermost one.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            already @ LpmError::Session { .. } => already,
            other => LpmError::Session {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The error with any phase wrapper removed.
    pub fn root(&self) -> &LpmError {
        match self {
            LpmError::Session { source, .. } => source.root(),
            other => other,
        }
    }

    /// Phase in which the error occurred, if known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            LpmError::Session { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self.root() {
            LpmError::Timeout(_) => true,
            LpmError::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            _ => false,
        }
    }

    /// True when the peer sent bytes that break the protocol, as opposed to
    /// a transport failure or a timeout.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self.root(),
            LpmError::Framing(_) | LpmError::Length { .. } | LpmError::Checksum { .. } | LpmError::UnknownCommand(_)
        )
    }
}

use crate::clock::ZoneSpec;
use crate::constants::*;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Per-connection settings of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Longest wait for the client to acknowledge the header or a record
    pub ack_timeout: Duration,
    /// Unframed bytes kept while waiting for a request before they are dropped
    pub max_request_buffer: usize,
    /// How long a partly received request may wait for its remaining bytes
    pub frame_gap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_request_buffer: MAX_REQUEST_BUFFER,
            frame_gap: DEFAULT_FRAME_GAP,
        }
    }
}

impl SessionConfig {
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_frame_gap(mut self, frame_gap: Duration) -> Self {
        self.frame_gap = frame_gap;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub session: SessionConfig,
    /// Zone used to stamp headers
    pub zone: ZoneSpec,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            session: SessionConfig::default(),
            zone: ZoneSpec::Local,
        }
    }
}

impl ServerConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_zone(mut self, zone: ZoneSpec) -> Self {
        self.zone = zone;
        self
    }
}

/// Client identity and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline applied to every read and write
    pub request_timeout: Duration,
    pub user_code: [u8; 4],
    pub plant_code: [u8; 4],
    pub block_select: u8,
    /// Record limit, all zero for "everything"
    pub max_records: [u8; 4],
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_code: *b"0000",
            plant_code: *b"0000",
            block_select: BLOCK_SELECT_MEASURES,
            max_records: [0; 4],
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_codes(mut self, user_code: [u8; 4], plant_code: [u8; 4]) -> Self {
        self.user_code = user_code;
        self.plant_code = plant_code;
        self
    }
}

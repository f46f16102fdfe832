use crate::constants::*;
use crate::error::LpmError;
use crate::frame::{ControlFrame, Final, Frame, Header, Measurement, Request};
use bytes::Bytes;
use strum_macros::Display;

/// Kinds of block that can appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    Request,
    Header,
    Measurement,
    Final,
    Ack,
    Nak,
}

impl MessageKind {
    /// Fixed size of this kind of block
    pub fn frame_len(&self) -> usize {
        match self {
            MessageKind::Request => REQUEST_LEN,
            MessageKind::Header => HEADER_LEN,
            MessageKind::Measurement => MEASUREMENT_LEN,
            MessageKind::Final => FINAL_LEN,
            MessageKind::Ack | MessageKind::Nak => CONTROL_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Download request from the client
    Request(Request),
    /// Session header from the device
    Header(Header),
    /// One measurement record
    Measurement(Measurement),
    /// End of download
    Final(Final),
    Ack,
    Nak,
}

impl Message {
    /// Identify the block starting at the first STX in `bytes` from its
    /// fixed prefix.
    ///
    /// Returns `None` when no STX is present, when the prefix matches no
    /// known block, or when more bytes are needed to tell a measurement
    /// from a final frame.
    pub fn sniff(bytes: &[u8]) -> Option<MessageKind> {
        let start = bytes.iter().position(|&b| b == STX)?;
        let body = &bytes[start + 1..];

        if body.starts_with(&PROTOCOL_TAG) {
            return Some(MessageKind::Request);
        }
        if body.starts_with(&RECORD_PREFIX) {
            let marker = body.get(4..7)?;
            return if marker == END_OF_DOWNLOAD {
                Some(MessageKind::Final)
            } else {
                Some(MessageKind::Measurement)
            };
        }
        if body.starts_with(&COMPUTER_TAG) && body.get(2..4) == Some(&HEADER_BLOCK[..]) {
            return Some(MessageKind::Header);
        }
        if body.get(..4) == Some(&b"PCR0"[..]) {
            return match body.get(4..7)? {
                b"ACK" => Some(MessageKind::Ack),
                b"NAK" => Some(MessageKind::Nak),
                _ => None,
            };
        }
        None
    }

    /// Decode whichever block `bytes` holds.
    pub fn decode(bytes: &[u8]) -> Result<Self, LpmError> {
        let kind = Self::sniff(bytes).ok_or_else(|| {
            LpmError::Framing(format!("unrecognised block prefix: {}", hex::encode(&bytes[..bytes.len().min(8)])))
        })?;

        match kind {
            MessageKind::Request => Request::decode(bytes).map(Message::Request),
            MessageKind::Header => Header::decode(bytes).map(Message::Header),
            MessageKind::Measurement => Measurement::decode(bytes).map(Message::Measurement),
            MessageKind::Final => Final::decode(bytes).map(Message::Final),
            MessageKind::Ack => Ok(Message::Ack),
            MessageKind::Nak => Ok(Message::Nak),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Header(_) => MessageKind::Header,
            Message::Measurement(_) => MessageKind::Measurement,
            Message::Final(_) => MessageKind::Final,
            Message::Ack => MessageKind::Ack,
            Message::Nak => MessageKind::Nak,
        }
    }

    /// Wire bytes, with checksums computed for structured blocks
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Request(request) => request.encode(),
            Message::Header(header) => header.encode(),
            Message::Measurement(measurement) => measurement.encode(),
            Message::Final(final_frame) => final_frame.encode(),
            Message::Ack => Bytes::from_static(ControlFrame::Ack.as_bytes()),
            Message::Nak => Bytes::from_static(ControlFrame::Nak.as_bytes()),
        }
    }
}

impl From<ControlFrame> for Message {
    fn from(control: ControlFrame) -> Self {
        match control {
            ControlFrame::Ack => Message::Ack,
            ControlFrame::Nak => Message::Nak,
        }
    }
}

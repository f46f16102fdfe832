//! Fixed-layout wire frames of the LPM download protocol.
//!
//! Every structured frame is `STX`, a body, a big-endian 16-bit additive
//! checksum over the body, and a closing marker:
//!
//! ```text
//! ┌─────┬──────────────────────────────┬──────────────┬─────────┐
//! │ STX │ body (checksum-covered)      │ sum (BE u16) │ ETX/ETB │
//! └─────┴──────────────────────────────┴──────────────┴─────────┘
//! ```
//!
//! | Frame         | Size | End | Covered bytes |
//! |---------------|------|-----|---------------|
//! | `Request`     | 22   | ETX | 1..=18        |
//! | `Header`      | 35   | ETB | 1..=31        |
//! | `Measurement` | 56   | ETB | 1..=52        |
//! | `Final`       | 11   | ETX | 1..=7         |
//!
//! The structs below are the wire layout itself; `zerocopy` maps them onto
//! byte slices without any per-field parsing.

use crate::constants::*;
use crate::error::LpmError;
use crate::payload::MeasurementData;
use bytes::Bytes;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use strum_macros::Display;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Unsigned 16-bit sum of `bytes`, wrapping on overflow.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

/// Encode a value in 0..=99 as one packed BCD byte.
///
/// Values above 99 are not representable; the tens digit spills into the
/// high nibble and the result is meaningless.
pub fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Decode one packed BCD byte.
pub fn from_bcd(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

/// Behaviour shared by the four checksummed frames.
pub trait Frame: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned + Copy {
    /// Total frame size including markers.
    const LEN: usize;
    /// Closing marker, `ETX` or `ETB`.
    const END: u8;

    /// Checksum as stored in the frame.
    fn checksum(&self) -> u16;

    fn set_checksum(&mut self, sum: u16);

    /// Checksum computed over the covered range (everything between STX and
    /// the checksum field).
    fn computed_checksum(&self) -> u16 {
        checksum(&self.as_bytes()[1..Self::LEN - 3])
    }

    /// Copy of the frame with its checksum field filled in.
    fn sealed(mut self) -> Self {
        let sum = self.computed_checksum();
        self.set_checksum(sum);
        self
    }

    /// Serialize to exactly `LEN` bytes with a freshly computed checksum.
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.sealed().as_bytes())
    }

    /// Find the frame in `bytes`, check its size and checksum, and copy every
    /// field verbatim.
    fn decode(bytes: &[u8]) -> Result<Self, LpmError> {
        let framed = locate_frame(bytes, Self::LEN, Self::END)?;
        let frame = Self::read_from_bytes(framed).map_err(|_| LpmError::Length {
            expected: Self::LEN,
            actual: framed.len(),
        })?;

        let computed = frame.computed_checksum();
        let received = frame.checksum();
        if computed != received {
            return Err(LpmError::Checksum { computed, received });
        }
        Ok(frame)
    }
}

fn marker_name(marker: u8) -> &'static str {
    match marker {
        STX => "STX",
        ETX => "ETX",
        ETB => "ETB",
        _ => "marker",
    }
}

/// Slice out the `len`-byte span starting at the first STX.
///
/// The end marker is expected at the fixed position implied by `len`;
/// payload bytes that happen to equal a marker value are not mistaken for
/// one. When it is not there, the first end marker after STX determines
/// the reported length.
fn locate_frame(bytes: &[u8], len: usize, end: u8) -> Result<&[u8], LpmError> {
    let start = bytes
        .iter()
        .position(|&b| b == STX)
        .ok_or_else(|| LpmError::Framing("STX not found".to_string()))?;
    let rest = &bytes[start..];

    if rest.len() >= len && rest[len - 1] == end {
        return Ok(&rest[..len]);
    }

    let end_pos = rest
        .iter()
        .skip(1)
        .position(|&b| b == end)
        .ok_or_else(|| LpmError::Framing(format!("{} not found", marker_name(end))))?;

    Err(LpmError::Length {
        expected: len,
        actual: end_pos + 2,
    })
}

/// Download commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Command {
    /// Total download
    #[strum(to_string = "DT")]
    Total,
    /// Partial download
    #[strum(to_string = "DP")]
    Partial,
}

impl Command {
    pub fn code(&self) -> [u8; 2] {
        match self {
            Command::Total => *b"DT",
            Command::Partial => *b"DP",
        }
    }
}

impl TryFrom<[u8; 2]> for Command {
    type Error = LpmError;

    fn try_from(code: [u8; 2]) -> Result<Self, Self::Error> {
        match &code {
            b"DT" => Ok(Command::Total),
            b"DP" => Ok(Command::Partial),
            _ => Err(LpmError::UnknownCommand(code)),
        }
    }
}

/// Download request sent by the client (22 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Request {
    pub stx: u8,
    pub protocol: [u8; 2],
    pub user_code: [u8; 4],
    pub plant_code: [u8; 4],
    pub command: [u8; 2],
    pub block_select: u8,
    pub reserved: u8,
    /// Zero means "all records"
    pub max_records: [u8; 4],
    pub checksum: U16,
    pub etx: u8,
}

impl Request {
    /// A measures-only request for every record, with zeroed user and plant
    /// codes. The checksum is filled in on `encode`.
    pub fn new(command: Command) -> Self {
        Self {
            stx: STX,
            protocol: PROTOCOL_TAG,
            user_code: *b"0000",
            plant_code: *b"0000",
            command: command.code(),
            block_select: BLOCK_SELECT_MEASURES,
            reserved: 0,
            max_records: [0; 4],
            checksum: U16::new(0),
            etx: ETX,
        }
    }

    pub fn with_codes(mut self, user_code: [u8; 4], plant_code: [u8; 4]) -> Self {
        self.user_code = user_code;
        self.plant_code = plant_code;
        self
    }

    pub fn with_block_select(mut self, block_select: u8) -> Self {
        self.block_select = block_select;
        self
    }

    pub fn with_max_records(mut self, max_records: [u8; 4]) -> Self {
        self.max_records = max_records;
        self
    }

    /// The requested download type, if the command code is known.
    pub fn command(&self) -> Result<Command, LpmError> {
        Command::try_from(self.command)
    }
}

impl Frame for Request {
    const LEN: usize = REQUEST_LEN;
    const END: u8 = ETX;

    fn checksum(&self) -> u16 {
        self.checksum.get()
    }

    fn set_checksum(&mut self, sum: u16) {
        self.checksum.set(sum);
    }
}

/// Session header ("intestation") sent by the device (35 bytes).
///
/// Date and time fields are wider on the wire than their content: only the
/// first byte of each carries a BCD value, the rest stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Header {
    pub stx: u8,
    pub computer: [u8; 2],
    pub block: [u8; 2],
    pub model: [u8; 2],
    pub user_code: [u8; 4],
    pub plant_code: [u8; 4],
    pub day: [u8; 2],
    pub month: [u8; 2],
    pub year: [u8; 4],
    pub hour: [u8; 2],
    pub minute: [u8; 2],
    pub ram: u8,
    pub sw_version: [u8; 4],
    pub checksum: U16,
    pub etb: u8,
}

impl Header {
    /// Header echoing the request's codes, stamped with `now`.
    pub fn new(user_code: [u8; 4], plant_code: [u8; 4], now: NaiveDateTime) -> Self {
        Self {
            stx: STX,
            computer: COMPUTER_TAG,
            block: HEADER_BLOCK,
            model: MODEL_TAG,
            user_code,
            plant_code,
            day: [to_bcd(now.day() as u8), 0],
            month: [to_bcd(now.month() as u8), 0],
            year: [to_bcd(now.year().rem_euclid(100) as u8), 0, 0, 0],
            hour: [to_bcd(now.hour() as u8), 0],
            minute: [to_bcd(now.minute() as u8), 0],
            ram: RAM_FLAG,
            sw_version: SW_VERSION,
            checksum: U16::new(0),
            etb: ETB,
        }
    }

    /// Header addressed to whoever sent `request`.
    pub fn for_request(request: &Request, now: NaiveDateTime) -> Self {
        Self::new(request.user_code, request.plant_code, now)
    }

    /// The device clock as announced, assuming the 21st century.
    pub fn date_time(&self) -> Option<NaiveDateTime> {
        let year = 2000 + from_bcd(self.year[0]) as i32;
        NaiveDate::from_ymd_opt(year, from_bcd(self.month[0]) as u32, from_bcd(self.day[0]) as u32)?
            .and_hms_opt(from_bcd(self.hour[0]) as u32, from_bcd(self.minute[0]) as u32, 0)
    }
}

impl Frame for Header {
    const LEN: usize = HEADER_LEN;
    const END: u8 = ETB;

    fn checksum(&self) -> u16 {
        self.checksum.get()
    }

    fn set_checksum(&mut self, sum: u16) {
        self.checksum.set(sum);
    }
}

/// One lamp-pole record (56 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Measurement {
    pub stx: u8,
    pub computer: [u8; 2],
    pub block: [u8; 2],
    pub data: MeasurementData,
    pub checksum: U16,
    pub etb: u8,
}

impl Measurement {
    pub fn new(data: MeasurementData) -> Self {
        Self {
            stx: STX,
            computer: COMPUTER_TAG,
            block: MEASUREMENT_BLOCK,
            data,
            checksum: U16::new(0),
            etb: ETB,
        }
    }
}

impl Frame for Measurement {
    const LEN: usize = MEASUREMENT_LEN;
    const END: u8 = ETB;

    fn checksum(&self) -> u16 {
        self.checksum.get()
    }

    fn set_checksum(&mut self, sum: u16) {
        self.checksum.set(sum);
    }
}

/// End-of-download sentinel (11 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Final {
    pub stx: u8,
    pub computer: [u8; 2],
    pub block: [u8; 2],
    pub end_download: [u8; 3],
    pub checksum: U16,
    pub etx: u8,
}

impl Final {
    pub fn new() -> Self {
        Self {
            stx: STX,
            computer: COMPUTER_TAG,
            block: MEASUREMENT_BLOCK,
            end_download: END_OF_DOWNLOAD,
            checksum: U16::new(0),
            etx: ETX,
        }
    }
}

impl Default for Final {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame for Final {
    const LEN: usize = FINAL_LEN;
    const END: u8 = ETX;

    fn checksum(&self) -> u16 {
        self.checksum.get()
    }

    fn set_checksum(&mut self, sum: u16) {
        self.checksum.set(sum);
    }
}

/// The two literal control frames.
///
/// The server treats any reply as an acknowledgement. The client only
/// checks whether its request drew a NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ControlFrame {
    #[strum(to_string = "ACK")]
    Ack,
    #[strum(to_string = "NAK")]
    Nak,
}

impl ControlFrame {
    pub fn as_bytes(&self) -> &'static [u8; CONTROL_LEN] {
        match self {
            ControlFrame::Ack => &ACK_FRAME,
            ControlFrame::Nak => &NAK_FRAME,
        }
    }

    /// Best-effort label for logging an 11-byte control block.
    pub fn classify(bytes: &[u8]) -> Option<Self> {
        if bytes == ACK_FRAME {
            Some(ControlFrame::Ack)
        } else if bytes == NAK_FRAME {
            Some(ControlFrame::Nak)
        } else {
            None
        }
    }
}

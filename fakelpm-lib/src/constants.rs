// Protocol constants for the LPM download protocol

use std::time::Duration;

/// Start of text, first byte of every frame
pub const STX: u8 = 0x02;

/// End of text, closes requests, final frames and control frames
pub const ETX: u8 = 0x03;

/// End of transmission block, closes header and measurement frames
pub const ETB: u8 = 0x17;

/// Protocol tag carried by every request
pub const PROTOCOL_TAG: [u8; 2] = *b"C0";

/// Sender tag for frames produced by the device side
pub const COMPUTER_TAG: [u8; 2] = *b"PC";

/// Block type of the header ("intestation") frame
pub const HEADER_BLOCK: [u8; 2] = *b"D0";

/// Device model announced in the header
pub const MODEL_TAG: [u8; 2] = *b"L0";

/// Block type shared by measurement and final frames
pub const MEASUREMENT_BLOCK: [u8; 2] = *b"D4";

/// Marker that distinguishes a final frame from a measurement
pub const END_OF_DOWNLOAD: [u8; 3] = *b"EOD";

/// Prefix following STX on both measurement and final frames
pub const RECORD_PREFIX: [u8; 4] = *b"PCD4";

/// Firmware version reported in the header
pub const SW_VERSION: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

/// RAM flag reported in the header
pub const RAM_FLAG: u8 = 0x01;

/// Request block selector for "measures only"
pub const BLOCK_SELECT_MEASURES: u8 = 0x08;

/// Size of a request frame (22 bytes)
pub const REQUEST_LEN: usize = 22;

/// Size of a header frame (35 bytes)
pub const HEADER_LEN: usize = 35;

/// Size of a measurement frame (56 bytes)
pub const MEASUREMENT_LEN: usize = 56;

/// Size of a final frame (11 bytes)
pub const FINAL_LEN: usize = 11;

/// Size of the ACK/NAK control frames (11 bytes)
pub const CONTROL_LEN: usize = 11;

/// Size of the measurement payload (48 bytes)
pub const PAYLOAD_LEN: usize = 48;

/// Size of one AE/M1/M2 sub-reading inside the payload
pub const SUB_READING_LEN: usize = 11;

/// Literal ACK frame
pub const ACK_FRAME: [u8; CONTROL_LEN] = [STX, b'P', b'C', b'R', b'0', b'A', b'C', b'K', b'1', b'A', ETX];

/// Literal NAK frame
pub const NAK_FRAME: [u8; CONTROL_LEN] = [STX, b'P', b'C', b'R', b'0', b'N', b'A', b'K', b'0', b'F', ETX];

/// Harvest time value meaning "no sample taken"
pub const HARVEST_NONE: u16 = 0xFFFF;

/// Raw voltage units per volt. The payload carries centivolts.
///
/// The canned archive samples look like whole volts; this value is the one
/// convention applied everywhere until the device owner confirms it.
pub const VOLTAGE_SCALE: f64 = 100.0;

/// Amps per raw current unit
pub const CURRENT_SCALE: f64 = 3.57 / 1000.0;

/// Raw cosfi units per unit power factor
pub const COSFI_SCALE: f64 = 100.0;

/// Fewest measurement records streamed per download
pub const MIN_RECORDS: usize = 3;

/// Most measurement records streamed per download
pub const MAX_RECORDS: usize = 10;

/// How long the server waits for the client to acknowledge a block
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client read/write deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest amount of unframed input buffered while awaiting a request
pub const MAX_REQUEST_BUFFER: usize = 2048;

/// Quiet time after which a partial request is judged on what has arrived
pub const DEFAULT_FRAME_GAP: Duration = Duration::from_millis(250);

/// Port used by both binaries when none is given
pub const DEFAULT_PORT: u16 = 5001;

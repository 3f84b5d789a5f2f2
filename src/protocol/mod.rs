//! Wire protocol module
//!
//! NDJSON control messages and tagged binary piece frames.

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{write_message, LineReader, MAX_LINE_LENGTH};
pub use frame::{read_frame, write_frame, Frame, MAX_UDP_PAYLOAD, MAX_UDP_PIECE_DATA};
pub use message::{ControlMessage, MessageBody, NackReason, STATUS_ACKNOWLEDGED, STATUS_OK};

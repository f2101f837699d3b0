//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the NATS text protocol:
//! - Control line verbs and size fields
//! - Frame buffer for accumulating partial reads
//! - Typed frames and their serialization
//! - Header blocks and the INFO/CONNECT JSON bodies

mod frame;
mod frame_buffer;
mod headers;
mod info;
mod wire_format;

pub use frame::{Frame, HMsg, HPub, Msg, Pub, Sub, Unsub};
pub use frame_buffer::FrameBuffer;
pub use headers::{Headers, NO_RESPONDERS_STATUS};
pub use info::{ConnectInfo, ServerInfo};
pub use wire_format::{
    Verb, CRLF, DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_VERSION,
};

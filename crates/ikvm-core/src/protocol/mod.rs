//! Protocol module containing message types and the binary frame codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_reply, decode_reply_payload, decode_request, decode_request_payload, encode_reply,
    encode_request, find_frame, FrameScan, ProtocolError,
};
pub use messages::*;

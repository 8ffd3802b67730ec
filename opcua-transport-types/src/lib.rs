//! Wire primitives, status codes and the opaque message contract shared by the transport
//! crates in this workspace.

mod error;
mod message;
mod status_code;
mod string;
mod wire;

pub use error::{EncodingResult, Error};
pub use message::{Message, MessageType, TestStackRequest, TestStackResponse};
pub use status_code::StatusCode;
pub use string::{ByteString, UAString};
pub use wire::{
    read_byte_string, read_i32, read_string, read_u32, read_u8, write_byte_string, write_bytes,
    write_i32, write_string, write_u32, write_u8, DecodingOptions,
};

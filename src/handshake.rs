//! The handshake packet every client sends first.

use bytes::BytesMut;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::frame::Frame;

pub const HANDSHAKE_PACKET_ID: i32 = 0;

/// Protocol state the client asks to switch to after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status = 1,
    Login = 2,
}

impl TryFrom<i32> for NextState {
    type Error = HandshakeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Status),
            2 => Ok(Self::Login),
            other => Err(HandshakeError::InvalidNextState(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub protocol_version: i32,
    /// Hostname the client used to reach the proxy, without any mod loader
    /// marker.
    pub virtual_host: String,
    pub requested_port: u16,
    pub next_state: NextState,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("expected handshake packet id 0, got {0}")]
    UnexpectedPacketId(i32),
    #[error("invalid next state {0}")]
    InvalidNextState(i32),
    #[error("malformed handshake field `{field}`: {source}")]
    Malformed {
        field: &'static str,
        #[source]
        source: CodecError,
    },
}

fn field<T>(name: &'static str, result: Result<T, CodecError>) -> Result<T, HandshakeError> {
    result.map_err(|source| HandshakeError::Malformed {
        field: name,
        source,
    })
}

/// Decodes a handshake from a complete frame.
///
/// The frame is only inspected, so its bytes can still be forwarded verbatim.
pub fn decode(frame: &Frame) -> Result<HandshakeMessage, HandshakeError> {
    let mut body = frame.body();

    let packet_id = field("packet_id", codec::read_var_int(&mut body))?;
    if packet_id != HANDSHAKE_PACKET_ID {
        return Err(HandshakeError::UnexpectedPacketId(packet_id));
    }

    let protocol_version = field("protocol_version", codec::read_var_int(&mut body))?;
    let server_address = field("server_address", codec::read_string(&mut body))?;
    let requested_port = field("port", codec::read_unsigned_short(&mut body))?;
    let next_state = NextState::try_from(field("next_state", codec::read_var_int(&mut body))?)?;

    Ok(HandshakeMessage {
        protocol_version,
        virtual_host: strip_loader_marker(server_address),
        requested_port,
        next_state,
    })
}

/// Forge appends `\0FML\0` (or `\0FML2\0`, ...) to the address it sends.
fn strip_loader_marker(mut address: String) -> String {
    if let Some(nul) = address.find('\0') {
        address.truncate(nul);
    }
    address
}

impl HandshakeMessage {
    /// Encodes this handshake as a complete frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut body = BytesMut::new();
        codec::write_var_int(&mut body, HANDSHAKE_PACKET_ID);
        codec::write_var_int(&mut body, self.protocol_version);
        codec::write_string(&mut body, &self.virtual_host);
        codec::write_unsigned_short(&mut body, self.requested_port);
        codec::write_var_int(&mut body, self.next_state as i32);
        Frame::from_body(&body)
    }
}

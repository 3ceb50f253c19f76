//! Response frames sent by the server.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use num_enum::TryFromPrimitive;

pub use error::Error;
pub use supported::Supported;

use super::frame_errors::ResponseParseError;
use super::protocol_features::ProtocolFeatures;
use super::ProtocolVersion;

/// Opcode identifying the response type in the frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

/// Human-readable response kind, used in error messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CqlResponseKind {
    Error,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl std::fmt::Display for CqlResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlResponseKind::Error => "ERROR",
            CqlResponseKind::Ready => "READY",
            CqlResponseKind::Authenticate => "AUTHENTICATE",
            CqlResponseKind::Supported => "SUPPORTED",
            CqlResponseKind::Result => "RESULT",
            CqlResponseKind::Event => "EVENT",
            CqlResponseKind::AuthChallenge => "AUTH_CHALLENGE",
            CqlResponseKind::AuthSuccess => "AUTH_SUCCESS",
        };
        f.write_str(kind_str)
    }
}

/// A fully deserialized response body.
#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    pub fn deserialize(
        features: &ProtocolFeatures,
        version: ProtocolVersion,
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> std::result::Result<Response, ResponseParseError> {
        let result_options = result::ResultParseOptions {
            with_pk_indexes: version >= ProtocolVersion::V4,
            with_result_metadata_id: version >= ProtocolVersion::V5,
        };
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(features, buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(authenticate::Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => {
                Response::Result(result::deserialize_with_options(buf, result_options)?)
            }
            ResponseOpcode::Event => Response::Event(event::Event::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(authenticate::AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => {
                Response::AuthSuccess(authenticate::AuthSuccess::deserialize(buf)?)
            }
        };

        Ok(response)
    }

    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            Response::Error(_) => CqlResponseKind::Error,
            Response::Ready => CqlResponseKind::Ready,
            Response::Authenticate(_) => CqlResponseKind::Authenticate,
            Response::Supported(_) => CqlResponseKind::Supported,
            Response::Result(_) => CqlResponseKind::Result,
            Response::Event(_) => CqlResponseKind::Event,
            Response::AuthChallenge(_) => CqlResponseKind::AuthChallenge,
            Response::AuthSuccess(_) => CqlResponseKind::AuthSuccess,
        }
    }
}

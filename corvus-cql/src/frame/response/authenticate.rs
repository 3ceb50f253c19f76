use crate::frame::frame_errors::ResponseParseError;
use crate::frame::response::CqlResponseKind;
use crate::frame::types;

/// AUTHENTICATE: the server demands a SASL exchange using the named mechanism.
#[derive(Debug)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let authenticator_name = types::read_string(buf)
            .map_err(ResponseParseError::malformed(CqlResponseKind::Authenticate))?
            .to_string();
        Ok(Authenticate { authenticator_name })
    }
}

/// AUTH_SUCCESS: the exchange concluded; may carry a final token.
#[derive(Debug)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let success_message = types::read_bytes_opt(buf)
            .map_err(ResponseParseError::malformed(CqlResponseKind::AuthSuccess))?
            .map(ToOwned::to_owned);
        Ok(AuthSuccess { success_message })
    }
}

/// AUTH_CHALLENGE: one more round of the exchange is required.
#[derive(Debug)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let authenticate_message = types::read_bytes_opt(buf)
            .map_err(ResponseParseError::malformed(CqlResponseKind::AuthChallenge))?
            .map(ToOwned::to_owned);
        Ok(AuthChallenge {
            authenticate_message,
        })
    }
}

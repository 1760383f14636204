//! Transport encoding for session descriptions.
//!
//! Offers and answers travel as base64 of their JSON form so the signaling
//! relay only ever sees an opaque string, whatever shape the SDP object has.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::types::call::{SdpType, SessionDescription};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} description, got {actual}")]
    UnexpectedType { expected: SdpType, actual: SdpType },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown signaling event: {0}")]
    UnknownEvent(String),
}

pub fn encode_description(desc: &SessionDescription) -> Result<String, CodecError> {
    let json = serde_json::to_vec(desc)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_description(encoded: &str) -> Result<SessionDescription, CodecError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decode and check that the description plays the expected role.
pub fn decode_description_as(
    encoded: &str,
    expected: SdpType,
) -> Result<SessionDescription, CodecError> {
    let desc = decode_description(encoded)?;
    if desc.sdp_type != expected {
        return Err(CodecError::UnexpectedType {
            expected,
            actual: desc.sdp_type,
        });
    }
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

    #[test]
    fn test_encoded_description_is_opaque_base64() {
        let encoded = encode_description(&SessionDescription::offer(OFFER_SDP)).unwrap();
        assert!(!encoded.contains('{'));
        assert!(!encoded.contains("\r\n"));
        let decoded = decode_description(&encoded).unwrap();
        assert_eq!(decoded.sdp, OFFER_SDP);
        assert_eq!(decoded.sdp_type, SdpType::Offer);
    }

    #[test]
    fn test_decode_rejects_wrong_role() {
        let encoded = encode_description(&SessionDescription::answer("v=0")).unwrap();
        let err = decode_description_as(&encoded, SdpType::Offer).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedType {
                expected: SdpType::Offer,
                actual: SdpType::Answer
            }
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_description("not base64!!"),
            Err(CodecError::Base64(_))
        ));
        let not_json = STANDARD.encode(b"plain text");
        assert!(matches!(
            decode_description(&not_json),
            Err(CodecError::Json(_))
        ));
    }
}

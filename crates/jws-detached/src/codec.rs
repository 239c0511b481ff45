//! Compact detached token codec
//!
//! A detached token is `seg0..seg2`: the base64url header, an always-empty
//! payload segment, and the base64url signature. A non-empty middle segment is
//! rejected; an attached payload must never be mistaken for the body.

use base64::{
    alphabet,
    engine::{
        general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD},
        DecodePaddingMode,
    },
    Engine as _,
};
use serde_json::Value;

use crate::{errors::JwsDetachedError, types::Header, Result};

/// Accepts padded and unpadded input and non-zero trailing bits, never emits
/// padding
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// base64url without padding (RFC 4648 §5)
pub fn base64url_encode(input: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// base64url decode, padding optional
pub fn base64url_decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    Ok(URL_SAFE_LENIENT.decode(input)?)
}

/// A parsed detached token
///
/// Borrows the header segment from the wire string: verification must hash
/// the segment exactly as received, never a re-encoding of the parsed header.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedToken<'a> {
    header_segment: &'a str,
    header: Header,
    signature: Vec<u8>,
    canonical_signature: bool,
}

impl<'a> DetachedToken<'a> {
    /// Parse `seg0..seg2`
    pub fn parse(token: &'a str) -> Result<Self> {
        let mut segments = token.split('.');
        let (Some(header_segment), Some(payload_segment), Some(signature_segment), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(JwsDetachedError::malformed("expected three segments"));
        };

        if !payload_segment.is_empty() {
            return Err(JwsDetachedError::malformed(
                "payload segment of a detached token must be empty",
            ));
        }

        let header_json = base64url_decode(header_segment)?;
        let header = match serde_json::from_slice::<Value>(&header_json)? {
            Value::Object(claims) => Header::from_map(claims),
            _ => return Err(JwsDetachedError::malformed("header is not a JSON object")),
        };

        let signature = base64url_decode(signature_segment)?;
        // trailing bits the decoder ignored still count as part of the signature
        let canonical_signature =
            base64url_encode(&signature) == signature_segment.trim_end_matches('=');

        Ok(Self {
            header_segment,
            header,
            signature,
            canonical_signature,
        })
    }

    /// Build a token string from a header and raw signature bytes
    pub fn encode(header: &Header, signature: &[u8]) -> Result<String> {
        Ok(Self::encode_with_segment(&header.to_segment()?, signature))
    }

    /// Build a token string from an already encoded header segment
    pub fn encode_with_segment(header_segment: &str, signature: &[u8]) -> String {
        format!("{header_segment}..{}", base64url_encode(signature))
    }

    /// Segment 0 exactly as received
    pub fn header_segment(&self) -> &'a str {
        self.header_segment
    }

    /// Decoded protected header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Decoded signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Whether segment 2 is exactly the unpadded encoding of [`signature`]
    ///
    /// [`signature`]: Self::signature
    pub fn has_canonical_signature(&self) -> bool {
        self.canonical_signature
    }

    /// Split into the decoded header and signature
    pub fn into_parts(self) -> (Header, Vec<u8>) {
        (self.header, self.signature)
    }
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::{HeaderMap, HeaderName, HeaderValue};

use super::NegotiateError;

pub const SCHEME: &str = "Negotiate";

/// `Negotiate <base64>`, or a bare `Negotiate` for an empty token.
pub fn encode(token: &[u8]) -> Result<HeaderValue, NegotiateError> {
    if token.is_empty() {
        return Ok(HeaderValue::from_static(SCHEME));
    }
    Ok(HeaderValue::try_from(format!("{SCHEME} {}", BASE64.encode(token)))?)
}

/// The token carried by the `name` header.
///
/// The scheme matches case-insensitively and is separated from the payload by any ASCII
/// whitespace. Once the scheme matches, every defect in the payload is an encoding error.
pub fn decode(headers: &HeaderMap, name: HeaderName) -> Result<Vec<u8>, NegotiateError> {
    let Some(value) = headers.get(&name) else {
        return Err(NegotiateError::MissingHeader(name));
    };
    let value = value.as_bytes().trim_ascii();
    let (scheme, payload) = match value.iter().position(u8::is_ascii_whitespace) {
        Some(split) => value.split_at(split),
        None => (value, &[][..]),
    };
    if !scheme.eq_ignore_ascii_case(SCHEME.as_bytes()) {
        return Err(NegotiateError::WrongScheme);
    }
    let payload = payload.trim_ascii();
    if payload.is_empty() {
        return Err(NegotiateError::EmptyPayload);
    }
    let token = BASE64.decode(payload)?;
    if token.is_empty() {
        return Err(NegotiateError::EmptyPayload);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};

    use super::*;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn encodes_standard_base64_with_padding() {
        assert_eq!(encode(b"\xfb\xff").unwrap(), "Negotiate +/8=");
        assert_eq!(encode(b"").unwrap(), "Negotiate");
    }

    #[test]
    fn decodes_the_token() {
        assert_eq!(decode(&headers("Negotiate +/8="), AUTHORIZATION).unwrap(), b"\xfb\xff");
        assert_eq!(decode(&headers("negotiate   YWJj "), AUTHORIZATION).unwrap(), b"abc");
        assert_eq!(decode(&headers("Negotiate\tYWJj"), AUTHORIZATION).unwrap(), b"abc");
    }

    #[test]
    fn classifies_bad_headers() {
        assert!(matches!(
            decode(&HeaderMap::new(), WWW_AUTHENTICATE),
            Err(NegotiateError::MissingHeader(name)) if name == WWW_AUTHENTICATE
        ));
        assert!(matches!(decode(&headers("Basic YWJj"), AUTHORIZATION), Err(NegotiateError::WrongScheme)));
        assert!(matches!(decode(&headers("NegotiateYWJj"), AUTHORIZATION), Err(NegotiateError::WrongScheme)));
        assert!(matches!(decode(&headers("Negotiate"), AUTHORIZATION), Err(NegotiateError::EmptyPayload)));
        assert!(matches!(
            decode(&headers("Negotiate not*base64"), AUTHORIZATION),
            Err(NegotiateError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn non_ascii_payload_is_an_encoding_error() {
        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_bytes(b"Negotiate \xffYWJj").unwrap());
        assert!(matches!(decode(&map, AUTHORIZATION), Err(NegotiateError::InvalidEncoding(_))));
        map.insert(AUTHORIZATION, HeaderValue::from_bytes(b"Basic \xff").unwrap());
        assert!(matches!(decode(&map, AUTHORIZATION), Err(NegotiateError::WrongScheme)));
    }
}

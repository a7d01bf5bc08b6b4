use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{Error, RequestErrorKind};

pub const MAX_ID_LENGTH: usize = 256;

/// Characters left untouched by query escaping, besides ASCII alphanumerics.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Checks that a room or participant id is short enough and already in canonical query-escaped form.
pub fn validate_id(id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::new_request(
            "id must not be empty".to_owned(),
            RequestErrorKind::InvalidParamsError,
        ));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(Error::new_request(
            format!("id {} too long, the maximum is {}", id, MAX_ID_LENGTH),
            RequestErrorKind::InvalidParamsError,
        ));
    }
    let unescaped = query_unescape(id)?;
    let escaped = query_escape(&unescaped);
    if escaped != id {
        return Err(Error::new_request(
            format!("unmatch {} {}", id, escaped),
            RequestErrorKind::InvalidParamsError,
        ));
    }
    Ok(())
}

pub fn query_escape(input: &str) -> String {
    input
        .split(' ')
        .map(|part| utf8_percent_encode(part, QUERY).to_string())
        .collect::<Vec<_>>()
        .join("+")
}

pub fn query_unescape(input: &str) -> Result<String, Error> {
    let plus_decoded = input.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| {
            Error::new_request(
                format!("invalid id {}: {}", input, e),
                RequestErrorKind::InvalidParamsError,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_ids() {
        assert!(validate_id("room-1").is_ok());
        assert!(validate_id("8f0e1c7a-2b3d-4e5f-9a8b-7c6d5e4f3a2b").is_ok());
        assert!(validate_id("a+b").is_ok());
        assert!(validate_id("caf%C3%A9").is_ok());
        assert!(validate_id("tilde~dot.under_score").is_ok());
    }

    #[test]
    fn rejects_non_canonical_ids() {
        assert!(validate_id("a b").is_err());
        assert!(validate_id("a%20b").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("caf%c3%a9").is_err());
        assert!(validate_id("%zz").is_err());
        assert!(validate_id("%FF").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn rejects_long_ids() {
        let id = "a".repeat(MAX_ID_LENGTH);
        assert!(validate_id(&id).is_ok());
        let id = "a".repeat(MAX_ID_LENGTH + 1);
        let err = validate_id(&id).unwrap_err();
        assert_eq!(err.code(), crate::error::CODE_INVALID_PARAMS);
    }

    #[test]
    fn escape_round_trip() {
        assert_eq!(query_escape("a b/c"), "a+b%2Fc");
        assert_eq!(query_unescape("a+b%2Fc").unwrap(), "a b/c");
    }
}

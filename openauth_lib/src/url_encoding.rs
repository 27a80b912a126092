use percent_encoding::{percent_decode, percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Encode set for application/x-www-form-urlencoded allowing unreserved characters
const FORM_URLENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Encodes a string for URL safety and returns an owned `String`
///
/// # Example
/// ```
/// use openauth_lib::url_encoding::encode_url_owned;
/// let encoded = encode_url_owned("Hello World!");
/// assert_eq!(encoded, "Hello%20World%21");
/// ```
pub fn encode_url_owned(input: &str) -> String {
    percent_encode(input.as_bytes(), FORM_URLENCODE_SET).to_string()
}

/// Decodes a URL-encoded string, failing when the decoded bytes are not UTF-8.
///
/// `+` is treated as a literal plus; use [`decode_form_component`] for form bodies.
pub fn decode_url_owned(input: &str) -> Result<String, String> {
    percent_decode(input.as_bytes())
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| format!("Invalid UTF-8 in URL-encoded input: {}", e))
}

/// Decodes one component of an application/x-www-form-urlencoded body.
pub fn decode_form_component(input: &str) -> Result<String, String> {
    decode_url_owned(&input.replace('+', " "))
}

/// Encodes ordered pairs as `k1=v1&k2=v2`.
///
/// # Example
/// ```
/// use openauth_lib::url_encoding::encode_form;
/// let body = encode_form([("a", "1 2"), ("b", "x&y")]);
/// assert_eq!(body, "a=1%202&b=x%26y");
/// ```
pub fn encode_form<K, V, I>(pairs: I) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&encode_url_owned(key.as_ref()));
        out.push('=');
        out.push_str(&encode_url_owned(value.as_ref()));
    }
    out
}

/// Parses a form body into ordered pairs. Empty segments are skipped and a
/// segment without `=` yields an empty value.
pub fn parse_form(input: &str) -> Result<Vec<(String, String)>, String> {
    input
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
            Ok((decode_form_component(key)?, decode_form_component(value)?))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn form_round_trip_keeps_order() {
        let pairs = vec![
            ("z".to_string(), "last?".to_string()),
            ("a".to_string(), "ü & =".to_string()),
        ];
        let encoded = encode_form(pairs.iter().map(|(k, v)| (k, v)));
        assert_eq!(parse_form(&encoded).unwrap(), pairs);
    }

    #[test]
    fn plus_is_space_only_in_forms() {
        assert_eq!(decode_form_component("a+b").unwrap(), "a b");
        assert_eq!(decode_url_owned("a+b").unwrap(), "a+b");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(decode_url_owned("%FF%FE").is_err());
    }
}

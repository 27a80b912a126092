//! Conversion between typed part values and their wire strings.
//!
//! Every type that can appear in a message part implements [`WireValue`],
//! which names its default [`ValueEncoder`]. A part can override the encoder
//! at declaration time; [`ParseEncoder`] is the explicit opt-in for types that
//! only offer `FromStr` and `Display`.

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::marker::PhantomData;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use url::Url;

use super::error::EncodingError;

pub trait ValueEncoder<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<String, EncodingError>;

    fn decode(&self, value: &str) -> Result<T, EncodingError>;

    /// The value as it was originally received, before normalization.
    /// Signatures are computed over this form.
    fn encode_original(&self, value: &T) -> Result<String, EncodingError> {
        self.encode(value)
    }

    /// Sentinel written for an absent optional value instead of omitting it.
    fn null_encoding(&self) -> Option<&'static str> {
        None
    }
}

/// A type with a default wire encoder.
pub trait WireValue: Sized + Send + Sync + 'static {
    type Encoder: ValueEncoder<Self> + Default;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StringEncoder;

impl ValueEncoder<String> for StringEncoder {
    fn encode(&self, value: &String) -> Result<String, EncodingError> {
        Ok(value.clone())
    }

    fn decode(&self, value: &str) -> Result<String, EncodingError> {
        Ok(value.to_string())
    }
}

/// Lowercase `true`/`false`; decoding ignores case.
#[derive(Debug, Default, Clone, Copy)]
pub struct BooleanEncoder;

impl ValueEncoder<bool> for BooleanEncoder {
    fn encode(&self, value: &bool) -> Result<String, EncodingError> {
        Ok(if *value { "true" } else { "false" }.to_string())
    }

    fn decode(&self, value: &str) -> Result<bool, EncodingError> {
        if value.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if value.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(EncodingError::invalid(value, "expected true or false"))
        }
    }
}

/// Decimal integers without sign prefixes or padding whitespace.
pub struct IntegerEncoder<T>(PhantomData<fn() -> T>);

impl<T> Default for IntegerEncoder<T> {
    fn default() -> Self {
        IntegerEncoder(PhantomData)
    }
}

impl<T> ValueEncoder<T> for IntegerEncoder<T>
where
    T: FromStr + Display + 'static,
{
    fn encode(&self, value: &T) -> Result<String, EncodingError> {
        Ok(value.to_string())
    }

    fn decode(&self, value: &str) -> Result<T, EncodingError> {
        if value.starts_with('+') || value.trim() != value {
            return Err(EncodingError::invalid(value, "not a canonical integer"));
        }
        value.parse().map_err(|_| EncodingError::invalid(value, "not an integer"))
    }
}

/// An absolute URI that remembers the exact string it was parsed from.
#[derive(Debug, Clone)]
pub struct MessageUri {
    url: Url,
    original: String,
}

impl MessageUri {
    pub fn parse(input: &str) -> Result<Self, url::ParseError> {
        Ok(Self { url: Url::parse(input)?, original: input.to_string() })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn into_url(self) -> Url {
        self.url
    }
}

impl From<Url> for MessageUri {
    fn from(url: Url) -> Self {
        let original = url.as_str().to_string();
        Self { url, original }
    }
}

impl PartialEq for MessageUri {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for MessageUri {}

impl Display for MessageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UriEncoder;

impl ValueEncoder<MessageUri> for UriEncoder {
    fn encode(&self, value: &MessageUri) -> Result<String, EncodingError> {
        Ok(value.url.as_str().to_string())
    }

    fn decode(&self, value: &str) -> Result<MessageUri, EncodingError> {
        MessageUri::parse(value).map_err(|e| EncodingError::invalid(value, e.to_string()))
    }

    fn encode_original(&self, value: &MessageUri) -> Result<String, EncodingError> {
        Ok(value.original.clone())
    }
}

/// ISO 8601 UTC timestamps, e.g. `2024-05-01T12:00:00Z`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DateTimeEncoder;

impl ValueEncoder<DateTime<Utc>> for DateTimeEncoder {
    fn encode(&self, value: &DateTime<Utc>) -> Result<String, EncodingError> {
        Ok(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    fn decode(&self, value: &str) -> Result<DateTime<Utc>, EncodingError> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| EncodingError::invalid(value, e.to_string()))
    }
}

/// Whole seconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixTimestampEncoder;

impl ValueEncoder<DateTime<Utc>> for UnixTimestampEncoder {
    fn encode(&self, value: &DateTime<Utc>) -> Result<String, EncodingError> {
        Ok(value.timestamp().to_string())
    }

    fn decode(&self, value: &str) -> Result<DateTime<Utc>, EncodingError> {
        let seconds: i64 = IntegerEncoder::default().decode(value)?;
        DateTime::from_timestamp(seconds, 0).ok_or_else(|| EncodingError::invalid(value, "timestamp out of range"))
    }
}

/// Durations as a whole number of seconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeSpanEncoder;

impl ValueEncoder<TimeDelta> for TimeSpanEncoder {
    fn encode(&self, value: &TimeDelta) -> Result<String, EncodingError> {
        Ok(value.num_seconds().to_string())
    }

    fn decode(&self, value: &str) -> Result<TimeDelta, EncodingError> {
        let seconds: i64 = IntegerEncoder::default().decode(value)?;
        TimeDelta::try_seconds(seconds).ok_or_else(|| EncodingError::invalid(value, "duration out of range"))
    }
}

/// Standard padded base64.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Encoder;

impl ValueEncoder<Vec<u8>> for Base64Encoder {
    fn encode(&self, value: &Vec<u8>) -> Result<String, EncodingError> {
        Ok(BASE64.encode(value))
    }

    fn decode(&self, value: &str) -> Result<Vec<u8>, EncodingError> {
        BASE64.decode(value).map_err(|e| EncodingError::invalid(value, e.to_string()))
    }
}

/// A BCP 47 style language tag such as `en-US`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: &str) -> Result<Self, EncodingError> {
        let valid = !tag.is_empty()
            && tag.split('-').enumerate().all(|(i, subtag)| {
                (1..=8).contains(&subtag.len())
                    && if i == 0 {
                        subtag.bytes().all(|b| b.is_ascii_alphabetic())
                    } else {
                        subtag.bytes().all(|b| b.is_ascii_alphanumeric())
                    }
            });
        if valid {
            Ok(Locale(tag.to_string()))
        } else {
            Err(EncodingError::invalid(tag, "not a language tag"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocaleEncoder;

impl ValueEncoder<Locale> for LocaleEncoder {
    fn encode(&self, value: &Locale) -> Result<String, EncodingError> {
        Ok(value.0.clone())
    }

    fn decode(&self, value: &str) -> Result<Locale, EncodingError> {
        Locale::new(value)
    }
}

/// Comma-joined language tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocaleListEncoder;

impl ValueEncoder<Vec<Locale>> for LocaleListEncoder {
    fn encode(&self, value: &Vec<Locale>) -> Result<String, EncodingError> {
        Ok(value.iter().map(Locale::as_str).collect::<Vec<_>>().join(","))
    }

    fn decode(&self, value: &str) -> Result<Vec<Locale>, EncodingError> {
        if value.is_empty() {
            return Ok(Vec::new());
        }
        value.split(',').map(|tag| Locale::new(tag.trim())).collect()
    }
}

/// A `::`-separated path naming a Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: &str) -> Result<Self, EncodingError> {
        let valid = name.split("::").all(|segment| {
            let mut bytes = segment.bytes();
            matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
                && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
        });
        if valid {
            Ok(TypeName(name.to_string()))
        } else {
            Err(EncodingError::invalid(name, "not a type path"))
        }
    }

    pub fn of<T: ?Sized>() -> Self {
        TypeName(std::any::type_name::<T>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TypeNameEncoder;

impl ValueEncoder<TypeName> for TypeNameEncoder {
    fn encode(&self, value: &TypeName) -> Result<String, EncodingError> {
        Ok(value.0.clone())
    }

    fn decode(&self, value: &str) -> Result<TypeName, EncodingError> {
        TypeName::new(value)
    }
}

/// Space-delimited scope tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeEncoder;

impl ValueEncoder<BTreeSet<String>> for ScopeEncoder {
    fn encode(&self, value: &BTreeSet<String>) -> Result<String, EncodingError> {
        if let Some(bad) = value.iter().find(|s| s.is_empty() || s.contains(char::is_whitespace)) {
            return Err(EncodingError::Unencodable(format!("scope token {:?} contains whitespace", bad)));
        }
        Ok(value.iter().map(String::as_str).collect::<Vec<_>>().join(" "))
    }

    fn decode(&self, value: &str) -> Result<BTreeSet<String>, EncodingError> {
        Ok(value.split_whitespace().map(str::to_string).collect())
    }
}

/// Generic `FromStr`/`Display` conversion. Never chosen implicitly; a part
/// must name it.
pub struct ParseEncoder<T>(PhantomData<fn() -> T>);

impl<T> Default for ParseEncoder<T> {
    fn default() -> Self {
        ParseEncoder(PhantomData)
    }
}

impl<T> ValueEncoder<T> for ParseEncoder<T>
where
    T: FromStr + Display + 'static,
    T::Err: Display,
{
    fn encode(&self, value: &T) -> Result<String, EncodingError> {
        Ok(value.to_string())
    }

    fn decode(&self, value: &str) -> Result<T, EncodingError> {
        value.parse().map_err(|e: T::Err| EncodingError::invalid(value, e.to_string()))
    }
}

impl WireValue for String {
    type Encoder = StringEncoder;
}

impl WireValue for bool {
    type Encoder = BooleanEncoder;
}

macro_rules! integer_wire_values {
    ($($ty:ty),+) => {
        $(impl WireValue for $ty {
            type Encoder = IntegerEncoder<$ty>;
        })+
    };
}

integer_wire_values!(u16, u32, u64, i32, i64);

impl WireValue for MessageUri {
    type Encoder = UriEncoder;
}

impl WireValue for DateTime<Utc> {
    type Encoder = DateTimeEncoder;
}

impl WireValue for TimeDelta {
    type Encoder = TimeSpanEncoder;
}

impl WireValue for Vec<u8> {
    type Encoder = Base64Encoder;
}

impl WireValue for Locale {
    type Encoder = LocaleEncoder;
}

impl WireValue for Vec<Locale> {
    type Encoder = LocaleListEncoder;
}

impl WireValue for TypeName {
    type Encoder = TypeNameEncoder;
}

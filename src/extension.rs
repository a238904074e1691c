//! `Sec-WebSocket-Extensions` header grammar (RFC 6455 §9.1)
//!
//! ```text
//! extension-list = 1#extension
//! extension      = token *( ";" extension-param )
//! extension-param = token [ "=" ( token | quoted-string ) ]
//! ```
//!
//! The parser is a single pass state machine over the header bytes. Errors
//! report the byte offset of the first offending character.

use std::fmt;

use indexmap::IndexMap;

use crate::error::SyntaxError;

/// A single parameter value: a bare flag (`foo`) or an explicit value (`foo=bar`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Flag,
    Value(String),
}

impl ParamValue {
    pub fn is_flag(&self) -> bool {
        matches!(self, ParamValue::Flag)
    }

    /// The explicit value, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Flag => None,
            ParamValue::Value(v) => Some(v),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Flag => write!(f, "true"),
            ParamValue::Value(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Value(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Value(v)
    }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self {
        ParamValue::Value(v.to_string())
    }
}

/// Parameters of one extension offer, in header order
pub type Params = IndexMap<String, Vec<ParamValue>>;

/// Extension name to its offers, in header order
pub type Extensions = IndexMap<String, Vec<Params>>;

const fn build_token_table() -> [bool; 128] {
    let mut table = [false; 128];
    let mut c = 0;
    while c < 128 {
        let b = c as u8;
        table[c] = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                    | b'`' | b'|' | b'~'
            );
        c += 1;
    }
    table
}

static TOKEN_CHARS: [bool; 128] = build_token_table();

/// RFC 7230 `tchar`
#[inline]
pub(crate) fn is_token_char(b: u8) -> bool {
    (b as usize) < 128 && TOKEN_CHARS[b as usize]
}

#[inline]
fn is_ows(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn push<V>(map: &mut IndexMap<String, Vec<V>>, name: &str, value: V) {
    map.entry(name.to_owned()).or_default().push(value);
}

fn unescape(value: &str) -> String {
    value.replace('\\', "")
}

/// Parse a `Sec-WebSocket-Extensions` header value.
///
/// The empty string parses to an empty map.
pub fn parse(header: &str) -> Result<Extensions, SyntaxError> {
    let mut offers = Extensions::new();
    if header.is_empty() {
        return Ok(offers);
    }

    let bytes = header.as_bytes();
    let mut params = Params::new();
    let mut extension_name: Option<&str> = None;
    let mut param_name: Option<&str> = None;
    let mut must_unescape = false;
    let mut is_escaping = false;
    let mut in_quotes = false;
    let mut start: Option<usize> = None;
    let mut end: Option<usize> = None;
    let unexpected = SyntaxError::UnexpectedCharacter;

    for (i, &code) in bytes.iter().enumerate() {
        match (extension_name, param_name) {
            (None, _) => {
                if end.is_none() && is_token_char(code) {
                    start.get_or_insert(i);
                } else if i != 0 && is_ows(code) {
                    if end.is_none() && start.is_some() {
                        end = Some(i);
                    }
                } else if code == b';' || code == b',' {
                    let Some(s) = start else {
                        return Err(unexpected(i));
                    };
                    let name = &header[s..end.unwrap_or(i)];
                    if code == b',' {
                        push(&mut offers, name, std::mem::take(&mut params));
                    } else {
                        extension_name = Some(name);
                    }
                    start = None;
                    end = None;
                } else {
                    return Err(unexpected(i));
                }
            }
            (Some(ext), None) => {
                if end.is_none() && is_token_char(code) {
                    start.get_or_insert(i);
                } else if is_ows(code) {
                    if end.is_none() && start.is_some() {
                        end = Some(i);
                    }
                } else if code == b';' || code == b',' {
                    let Some(s) = start else {
                        return Err(unexpected(i));
                    };
                    push(&mut params, &header[s..end.unwrap_or(i)], ParamValue::Flag);
                    if code == b',' {
                        push(&mut offers, ext, std::mem::take(&mut params));
                        extension_name = None;
                    }
                    start = None;
                    end = None;
                } else if code == b'=' && start.is_some() && end.is_none() {
                    param_name = start.map(|s| &header[s..i]);
                    start = None;
                } else {
                    return Err(unexpected(i));
                }
            }
            (Some(ext), Some(param)) => {
                // A quoted value must still be a token once unescaped.
                if is_escaping {
                    if !is_token_char(code) {
                        return Err(unexpected(i));
                    }
                    if start.is_none() {
                        start = Some(i);
                    } else {
                        must_unescape = true;
                    }
                    is_escaping = false;
                } else if in_quotes {
                    if is_token_char(code) {
                        start.get_or_insert(i);
                    } else if code == b'"' && start.is_some() {
                        in_quotes = false;
                        end = Some(i);
                    } else if code == b'\\' {
                        is_escaping = true;
                    } else {
                        return Err(unexpected(i));
                    }
                } else if code == b'"' && bytes[i - 1] == b'=' {
                    in_quotes = true;
                } else if end.is_none() && is_token_char(code) {
                    start.get_or_insert(i);
                } else if start.is_some() && is_ows(code) {
                    if end.is_none() {
                        end = Some(i);
                    }
                } else if code == b';' || code == b',' {
                    let Some(s) = start else {
                        return Err(unexpected(i));
                    };
                    let raw = &header[s..end.unwrap_or(i)];
                    let value = if must_unescape {
                        must_unescape = false;
                        unescape(raw)
                    } else {
                        raw.to_owned()
                    };
                    push(&mut params, param, ParamValue::Value(value));
                    if code == b',' {
                        push(&mut offers, ext, std::mem::take(&mut params));
                        extension_name = None;
                    }
                    param_name = None;
                    start = None;
                    end = None;
                } else {
                    return Err(unexpected(i));
                }
            }
        }
    }

    let Some(s) = start else {
        return Err(SyntaxError::UnexpectedEnd);
    };
    if in_quotes {
        return Err(SyntaxError::UnexpectedEnd);
    }

    let token = &header[s..end.unwrap_or(bytes.len())];
    match (extension_name, param_name) {
        (None, _) => push(&mut offers, token, params),
        (Some(ext), None) => {
            push(&mut params, token, ParamValue::Flag);
            push(&mut offers, ext, params);
        }
        (Some(ext), Some(param)) => {
            let value = if must_unescape {
                unescape(token)
            } else {
                token.to_owned()
            };
            push(&mut params, param, ParamValue::Value(value));
            push(&mut offers, ext, params);
        }
    }

    Ok(offers)
}

fn format_params(name: &str, params: &Params) -> String {
    let mut parts = vec![name.to_owned()];
    for (key, values) in params {
        for value in values {
            match value {
                ParamValue::Flag => parts.push(key.clone()),
                ParamValue::Value(v) => parts.push(format!("{key}={v}")),
            }
        }
    }
    parts.join("; ")
}

/// Build a `Sec-WebSocket-Extensions` header value
pub fn format(extensions: &Extensions) -> String {
    extensions
        .iter()
        .flat_map(|(name, offers)| {
            let offers: Vec<String> = if offers.is_empty() {
                vec![name.clone()]
            } else {
                offers.iter().map(|p| format_params(name, p)).collect()
            };
            offers
        })
        .collect::<Vec<_>>()
        .join(", ")
}

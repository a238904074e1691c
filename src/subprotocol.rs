//! `Sec-WebSocket-Protocol` header grammar (RFC 6455 §4.3)
//!
//! A comma separated list of tokens with optional whitespace around the
//! separators. Order is preserved; duplicates are an error.

use indexmap::IndexSet;

use crate::error::SyntaxError;
use crate::extension::is_token_char;

/// Ordered set of subprotocol names
pub type ProtocolSet = IndexSet<String>;

fn insert(protocols: &mut ProtocolSet, protocol: &str) -> Result<(), SyntaxError> {
    if !protocols.insert(protocol.to_owned()) {
        return Err(SyntaxError::DuplicateSubprotocol(protocol.to_owned()));
    }
    Ok(())
}

/// Parse a `Sec-WebSocket-Protocol` header value
pub fn parse(header: &str) -> Result<ProtocolSet, SyntaxError> {
    let mut protocols = ProtocolSet::new();
    let mut start: Option<usize> = None;
    let mut end: Option<usize> = None;

    for (i, &code) in header.as_bytes().iter().enumerate() {
        if end.is_none() && is_token_char(code) {
            start.get_or_insert(i);
        } else if i != 0 && (code == b' ' || code == b'\t') {
            if end.is_none() && start.is_some() {
                end = Some(i);
            }
        } else if code == b',' {
            let Some(s) = start else {
                return Err(SyntaxError::UnexpectedCharacter(i));
            };
            insert(&mut protocols, &header[s..end.unwrap_or(i)])?;
            start = None;
            end = None;
        } else {
            return Err(SyntaxError::UnexpectedCharacter(i));
        }
    }

    match (start, end) {
        (Some(s), None) => insert(&mut protocols, &header[s..])?,
        _ => return Err(SyntaxError::UnexpectedEnd),
    }

    Ok(protocols)
}

//! Negotiation frame writer.
//!
//! The first frame on the wire tells the server which hub protocol the
//! session speaks. It is written by this dedicated writer, never by the
//! codec, and goes out before any invocation.

use crate::codec::{self, SerializationError};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct NegotiationFrame<'a> {
    protocol: &'a str,
}

pub(crate) fn write_negotiation(protocol: &str) -> Result<Vec<u8>, SerializationError> {
    let json = serde_json::to_string(&NegotiationFrame { protocol })?;
    Ok(codec::to_frame(json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_frame_names_the_protocol() {
        let frame = write_negotiation("json").unwrap();
        assert_eq!(frame, "{\"protocol\":\"json\"}\u{001E}".as_bytes());
    }
}

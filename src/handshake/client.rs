// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Client side of the opening handshake: compose the opening request,
//! parse and judge the server's reply.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

use crate::base64;
use crate::matcher::{find, Cursor, Span};
use crate::Parsing;
use super::{accept_key, Output, ACCEPT_KEY_LEN, CRLF, TERMSEQ};

/// Length of the base64-encoded 16-byte websocket key.
pub(crate) const ENCODED_KEY_LEN: usize = 24;

/// Compose the opening request into `buf` with a fresh random key
/// (RFC 6455 section 4.1).
///
/// Returns the request length and the accept key the server must echo.
pub fn encode_request(
    resource: &str,
    host: &str,
    sp_token: &str,
    buf: &mut [u8]
) -> (usize, [u8; ACCEPT_KEY_LEN]) {
    let nonce: [u8; 16] = rand::random();
    let mut key = [0; ENCODED_KEY_LEN];
    let n = base64::encode(&nonce, &mut key);
    debug_assert_eq!(n, Ok(ENCODED_KEY_LEN));
    encode_request_with_key(resource, host, sp_token, &key, buf)
}

// Deterministic part of request composition, split out so the exact bytes
// can be tested against a fixed key.
pub(crate) fn encode_request_with_key(
    resource: &str,
    host: &str,
    sp_token: &str,
    key: &[u8; ENCODED_KEY_LEN],
    buf: &mut [u8]
) -> (usize, [u8; ACCEPT_KEY_LEN]) {
    let expected = accept_key(key);
    let mut out = Output::new(buf);
    out.put(b"GET ");
    out.put(resource.as_bytes());
    out.put(b" HTTP/1.1\r\n");
    out.put(b"Host: ");
    out.put(host.as_bytes());
    out.put(CRLF);
    out.put(b"Upgrade: websocket\r\n");
    out.put(b"Connection: Upgrade\r\n");
    out.put(b"Sec-WebSocket-Key: ");
    out.put(key);
    out.put(CRLF);
    out.put(b"Sec-WebSocket-Version: 13\r\n");
    out.put(b"Sec-WebSocket-Protocol: ");
    out.put(sp_token.as_bytes());
    out.put(TERMSEQ);
    (out.len(), expected)
}

/// Recognized parts of a server reply, as spans into the receive buffer
/// it was parsed from.
///
/// `Sec-WebSocket-Version-Server` and `Sec-WebSocket-Protocol-Server` are
/// not RFC 6455 header names; they are a nanomsg extension and parsed for
/// interoperability with peers that send them.
#[derive(Debug, Default, Clone, Copy)]
pub struct Response {
    pub status_code: Span,
    pub reason_phrase: Span,
    pub server: Option<Span>,
    pub accept_key: Option<Span>,
    pub upgrade: Option<Span>,
    pub conn: Option<Span>,
    pub version: Option<Span>,
    pub protocol: Option<Span>,
    pub extensions: Option<Span>
}

/// Parse the reply bytes received so far into a [`Response`]. As with
/// request parsing, anything incomplete or not yet matching yields
/// [`Parsing::NeedMore`].
pub fn parse(buf: &[u8]) -> Parsing<Response> {
    if find(buf, TERMSEQ).is_none() {
        return Parsing::NeedMore
    }

    let mut cur = Cursor::new(buf);
    let mut response = Response::default();

    // Status line (RFC 7230 section 3.1.2).
    if !cur.token(b"HTTP/1.1 ") {
        return Parsing::NeedMore
    }
    response.status_code = match cur.value(b" ") {
        Some(code) => code,
        None => return Parsing::NeedMore
    };
    response.reason_phrase = match cur.value(CRLF) {
        Some(phrase) => phrase,
        None => return Parsing::NeedMore
    };

    while !cur.is_at_end() {
        let value =
            if cur.token_ci(b"Server:") {
                &mut response.server
            } else if cur.token_ci(b"Sec-WebSocket-Accept:") {
                &mut response.accept_key
            } else if cur.token_ci(b"Upgrade:") {
                &mut response.upgrade
            } else if cur.token_ci(b"Connection:") {
                &mut response.conn
            } else if cur.token_ci(b"Sec-WebSocket-Version-Server:") {
                &mut response.version
            } else if cur.token_ci(b"Sec-WebSocket-Protocol-Server:") {
                &mut response.protocol
            } else if cur.token_ci(b"Sec-WebSocket-Extensions:") {
                &mut response.extensions
            } else if cur.token(CRLF) {
                debug_assert!(cur.is_at_end());
                return Parsing::Done(response)
            } else {
                match cur.value_trimmed(CRLF) {
                    Some(_) => continue,
                    None => return Parsing::NeedMore
                }
            };
        match cur.value_trimmed(CRLF) {
            Some(span) => *value = Some(span),
            None => return Parsing::NeedMore
        }
    }

    Parsing::Done(response)
}

/// Judge a fully parsed [`Response`] against the accept key computed at
/// request time (RFC 6455 section 4.2.2). Order matters: presence of the
/// required parts, then the status code, then upgrade and connection
/// tokens, then the accept key itself.
pub fn validate(response: &Response, buf: &[u8], expected_accept_key: &[u8]) -> bool {
    let (upgrade, conn, accept) = match (response.upgrade, response.conn, response.accept_key) {
        (Some(u), Some(c), Some(a)) => (u, c, a),
        _ => return false
    };

    if response.status_code.slice(buf) != b"101" {
        // Anything but a connection upgrade fails the handshake; there is
        // no redirect handling.
        return false
    }
    if !upgrade.slice(buf).eq_ignore_ascii_case(b"websocket") {
        return false
    }
    if !conn.slice(buf).eq_ignore_ascii_case(b"upgrade") {
        return false
    }
    accept.slice(buf).eq_ignore_ascii_case(expected_accept_key)
}

// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Server side of the opening handshake: parse and judge the client's
//! request, compose the reply.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

use crate::matcher::{find, Cursor, Span};
use crate::sp::{SpId, SpMap};
use crate::Parsing;
use super::{accept_key, Error, Output, CRLF, TERMSEQ};

/// Recognized parts of a client opening request, as spans into the
/// receive buffer it was parsed from.
#[derive(Debug, Default, Clone, Copy)]
pub struct Request {
    pub uri: Span,
    pub host: Option<Span>,
    pub origin: Option<Span>,
    pub key: Option<Span>,
    pub upgrade: Option<Span>,
    pub conn: Option<Span>,
    pub version: Option<Span>,
    pub protocol: Option<Span>,
    pub extensions: Option<Span>
}

/// Parse the bytes received so far into a [`Request`].
///
/// Anything short of a complete, well-formed header block yields
/// [`Parsing::NeedMore`]: until the terminating blank line has arrived,
/// a failing match may simply mean the rest of the request is still in
/// flight.
pub fn parse(buf: &[u8]) -> Parsing<Request> {
    if find(buf, TERMSEQ).is_none() {
        return Parsing::NeedMore
    }

    let mut cur = Cursor::new(buf);
    let mut request = Request::default();

    // Request line (RFC 7230 section 3.1.1). Method and version are
    // case-sensitive, with exactly one space in between.
    if !cur.token(b"GET ") {
        return Parsing::NeedMore
    }
    request.uri = match cur.value(b" ") {
        Some(uri) if !uri.is_empty() => uri,
        _ => return Parsing::NeedMore
    };
    if !cur.token(b"HTTP/1.1") || !cur.token(CRLF) {
        return Parsing::NeedMore
    }

    // Header fields, matched one by one until the bare CRLF that closes
    // the block. Unrecognized headers are skipped.
    while !cur.is_at_end() {
        let value =
            if cur.token_ci(b"Host:") {
                &mut request.host
            } else if cur.token_ci(b"Origin:") {
                &mut request.origin
            } else if cur.token_ci(b"Sec-WebSocket-Key:") {
                &mut request.key
            } else if cur.token_ci(b"Upgrade:") {
                &mut request.upgrade
            } else if cur.token_ci(b"Connection:") {
                &mut request.conn
            } else if cur.token_ci(b"Sec-WebSocket-Version:") {
                &mut request.version
            } else if cur.token_ci(b"Sec-WebSocket-Protocol:") {
                &mut request.protocol
            } else if cur.token_ci(b"Sec-WebSocket-Extensions:") {
                &mut request.extensions
            } else if cur.token(CRLF) {
                // End of the header block. The receive logic stops at the
                // terminating blank line, so nothing may follow it.
                debug_assert!(cur.is_at_end());
                return Parsing::Done(request)
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

    Parsing::Done(request)
}

/// Why a request is answered with a diagnostic 400 instead of a 101.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The request did not fit the receive buffer.
    TooLong,
    /// A header required by RFC 6455 is missing, or the upgrade or
    /// connection token is wrong.
    BadHandshake,
    /// `Sec-WebSocket-Version` is not 13.
    BadVersion,
    /// The SP-required headers are absent.
    MissingSpHeaders,
    /// Known scalability protocol, but not a legal peer of the local one.
    NotPeer,
    /// The advertised sub-protocol token is not in the map.
    UnknownProtocol
}

impl RejectReason {
    pub(crate) fn status_line(self) -> &'static str {
        match self {
            RejectReason::TooLong => "400 Opening Handshake Too Long",
            RejectReason::BadHandshake => "400 Cannot Have Body",
            RejectReason::BadVersion => "400 Unsupported WebSocket Version",
            RejectReason::MissingSpHeaders => "400 Missing nanomsg Required Headers",
            RejectReason::NotPeer => "400 Incompatible Socket Type",
            RejectReason::UnknownProtocol => "400 Unrecognized Socket Type"
        }
    }

    pub(crate) fn as_error(self) -> Error {
        match self {
            RejectReason::TooLong => Error::TooLong,
            RejectReason::BadHandshake
            | RejectReason::BadVersion
            | RejectReason::MissingSpHeaders => Error::Incompatible,
            RejectReason::NotPeer | RejectReason::UnknownProtocol => Error::Peer
        }
    }
}

/// Judge a fully parsed [`Request`]. On success the negotiated [`SpId`]
/// is returned; the first failing check wins.
pub fn validate<F>(
    request: &Request,
    buf: &[u8],
    map: &SpMap,
    is_peer: &mut F
) -> Result<SpId, RejectReason>
where
    F: FnMut(SpId) -> bool + ?Sized
{
    // Required by RFC 6455 section 4.1.
    let (upgrade, conn, version) =
        match (request.host, request.upgrade, request.conn, request.key, request.version) {
            (Some(_), Some(u), Some(c), Some(_), Some(v)) => (u, c, v),
            _ => return Err(RejectReason::BadHandshake)
        };

    if !version.slice(buf).eq_ignore_ascii_case(b"13") {
        return Err(RejectReason::BadVersion)
    }
    if !upgrade.slice(buf).eq_ignore_ascii_case(b"websocket") {
        return Err(RejectReason::BadHandshake)
    }
    if !conn.slice(buf).eq_ignore_ascii_case(b"upgrade") {
        return Err(RejectReason::BadHandshake)
    }

    match request.protocol {
        Some(protocol) => match map.by_token(protocol.slice(buf)) {
            Some(sp) => {
                if is_peer(sp) {
                    Ok(sp)
                } else {
                    Err(RejectReason::NotPeer)
                }
            }
            None => Err(RejectReason::UnknownProtocol)
        },
        // No sub-protocol advertised: assume the map's fallback. This
        // keeps non-SP websocket clients connectable when the local
        // socket is of the fallback type.
        None => {
            let sp = map.fallback();
            if is_peer(sp) {
                Ok(sp)
            } else {
                Err(RejectReason::NotPeer)
            }
        }
    }
}

/// Reply the server sends back to the client.
#[derive(Debug)]
pub enum Response<'a> {
    /// Upgrade the connection (RFC 6455 section 4.2.2). `key` is the
    /// client's `Sec-WebSocket-Key`; `protocol` is echoed verbatim.
    Accept { key: &'a [u8], protocol: &'a [u8] },
    /// Fail the connection with a diagnostic status (RFC 6455 section
    /// 4.4), echoing the client's `Sec-WebSocket-Version` value.
    Reject { reason: RejectReason, version: &'a [u8] }
}

/// Compose the reply into `buf`, returning the number of bytes written.
///
/// The reject form carries no terminating blank line; peers treat the
/// non-101 status line as final.
pub fn encode_response(response: &Response, buf: &mut [u8]) -> usize {
    let mut out = Output::new(buf);
    match response {
        Response::Accept { key, protocol } => {
            out.put(b"HTTP/1.1 101 Switching Protocols\r\n");
            out.put(b"Upgrade: websocket\r\n");
            out.put(b"Connection: Upgrade\r\n");
            out.put(b"Sec-WebSocket-Accept: ");
            out.put(&accept_key(key));
            out.put(CRLF);
            out.put(b"Sec-WebSocket-Protocol: ");
            out.put(protocol);
            out.put(TERMSEQ)
        }
        Response::Reject { reason, version } => {
            out.put(b"HTTP/1.1 ");
            out.put(reason.status_line().as_bytes());
            out.put(CRLF);
            out.put(b"Sec-WebSocket-Version: ");
            out.put(version);
            out.put(CRLF)
        }
    }
    out.len()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use crate::sp::{self, SpId};
    use crate::Parsing;
    use super::*;

    const SAMPLE: &[u8] =
        b"GET /chat HTTP/1.1\r\n\
          Host: a\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          Sec-WebSocket-Protocol: x-nanomsg-pair\r\n\r\n";

    fn parsed(buf: &[u8]) -> Request {
        match parse(buf) {
            Parsing::Done(r) => r,
            Parsing::NeedMore => panic!("expected a complete request")
        }
    }

    fn judge(buf: &[u8], local_peers: &[SpId]) -> Result<SpId, RejectReason> {
        let request = parsed(buf);
        validate(&request, buf, &sp::NANOMSG, &mut |p| local_peers.contains(&p))
    }

    #[test]
    fn sample_request_is_parsed_and_accepted() {
        let request = parsed(SAMPLE);
        assert_eq!(request.uri.slice(SAMPLE), b"/chat");
        assert_eq!(request.host.unwrap().slice(SAMPLE), b"a");
        assert_eq!(request.key.unwrap().slice(SAMPLE), b"dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(request.version.unwrap().slice(SAMPLE), b"13");
        assert_eq!(request.protocol.unwrap().slice(SAMPLE), b"x-nanomsg-pair");
        assert!(request.origin.is_none());
        assert_eq!(judge(SAMPLE, &[sp::PAIR]), Ok(sp::PAIR));
    }

    #[test]
    fn every_incomplete_prefix_needs_more() {
        // No prefix short of the full terminating blank line parses.
        for n in 0 .. SAMPLE.len() {
            assert_matches!(parse(&SAMPLE[.. n]), Parsing::NeedMore)
        }
        assert_matches!(parse(SAMPLE), Parsing::Done(_));
    }

    #[test]
    fn malformed_request_line_still_needs_more() {
        assert_matches!(parse(b"PUT /chat HTTP/1.1\r\n\r\n"), Parsing::NeedMore);
        assert_matches!(parse(b"GET  HTTP/1.1\r\n\r\n"), Parsing::NeedMore); // empty uri
        assert_matches!(parse(b"GET / HTTP/1.0\r\n\r\n"), Parsing::NeedMore);
    }

    #[test]
    fn unknown_headers_are_skipped() {
        let buf: &[u8] =
            b"GET / HTTP/1.1\r\n\
              X-Custom: anything at all\r\n\
              Host: a\r\n\r\n";
        let request = parsed(buf);
        assert_eq!(request.host.unwrap().slice(buf), b"a");
    }

    #[test]
    fn header_values_are_trimmed_on_both_sides() {
        let buf: &[u8] = b"GET / HTTP/1.1\r\nHost:   spaced out   \r\n\r\n";
        let request = parsed(buf);
        assert_eq!(request.host.unwrap().slice(buf), b"spaced out");
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let buf: &[u8] = b"GET / HTTP/1.1\r\nhost: a\r\nUPGRADE: WebSocket\r\n\r\n";
        let request = parsed(buf);
        assert_eq!(request.host.unwrap().slice(buf), b"a");
        assert_eq!(request.upgrade.unwrap().slice(buf), b"WebSocket");
    }

    #[test]
    fn missing_required_headers_reject() {
        let buf: &[u8] =
            b"GET / HTTP/1.1\r\n\
              Host: a\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n"; // no key
        assert_eq!(judge(buf, &[sp::PAIR]), Err(RejectReason::BadHandshake));
    }

    #[test]
    fn wrong_version_rejects() {
        let buf = SAMPLE.to_vec();
        let buf = String::from_utf8(buf).unwrap().replace("Version: 13", "Version: 8");
        assert_eq!(judge(buf.as_bytes(), &[sp::PAIR]), Err(RejectReason::BadVersion));
    }

    #[test]
    fn wrong_upgrade_or_connection_rejects() {
        let s = String::from_utf8(SAMPLE.to_vec()).unwrap();
        let wrong_upgrade = s.replace("Upgrade: websocket", "Upgrade: h2c");
        assert_eq!(judge(wrong_upgrade.as_bytes(), &[sp::PAIR]), Err(RejectReason::BadHandshake));
        let wrong_conn = s.replace("Connection: Upgrade", "Connection: close");
        assert_eq!(judge(wrong_conn.as_bytes(), &[sp::PAIR]), Err(RejectReason::BadHandshake));
    }

    #[test]
    fn incompatible_peer_rejects() {
        let s = String::from_utf8(SAMPLE.to_vec()).unwrap();
        let pub_request = s.replace("x-nanomsg-pair", "x-nanomsg-pub");
        // Local REQ socket: only REP is a legal peer.
        let request = pub_request.as_bytes();
        let parsed_req = parsed(request);
        let verdict = validate(&parsed_req, request, &sp::NANOMSG, &mut |p| p == sp::REP);
        assert_eq!(verdict, Err(RejectReason::NotPeer));
    }

    #[test]
    fn unknown_protocol_token_rejects() {
        let s = String::from_utf8(SAMPLE.to_vec()).unwrap();
        let other = s.replace("x-nanomsg-pair", "x-other");
        assert_eq!(judge(other.as_bytes(), &[sp::PAIR]), Err(RejectReason::UnknownProtocol));
    }

    #[test]
    fn absent_protocol_assumes_fallback() {
        let s = String::from_utf8(SAMPLE.to_vec()).unwrap();
        let bare = s.replace("Sec-WebSocket-Protocol: x-nanomsg-pair\r\n", "");
        assert_eq!(judge(bare.as_bytes(), &[sp::PAIR]), Ok(sp::PAIR));
        assert_eq!(judge(bare.as_bytes(), &[sp::REP]), Err(RejectReason::NotPeer));
    }

    #[test]
    fn accept_response_bytes() {
        let mut buf = [0; 512];
        let response = Response::Accept {
            key: b"dGhlIHNhbXBsZSBub25jZQ==",
            protocol: b"x-nanomsg-pair"
        };
        let n = encode_response(&response, &mut buf);
        let expected: &[u8] =
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
              Sec-WebSocket-Protocol: x-nanomsg-pair\r\n\r\n";
        assert_eq!(&buf[.. n], expected);
    }

    #[test]
    fn reject_response_bytes() {
        let mut buf = [0; 512];
        let response = Response::Reject { reason: RejectReason::BadVersion, version: b"8" };
        let n = encode_response(&response, &mut buf);
        // No terminating blank line on the reject form.
        assert_eq!(&buf[.. n], b"HTTP/1.1 400 Unsupported WebSocket Version\r\nSec-WebSocket-Version: 8\r\n".as_ref());
    }

    #[test]
    fn status_lines_cover_all_reasons() {
        assert_eq!(RejectReason::TooLong.status_line(), "400 Opening Handshake Too Long");
        assert_eq!(RejectReason::BadHandshake.status_line(), "400 Cannot Have Body");
        assert_eq!(RejectReason::MissingSpHeaders.status_line(), "400 Missing nanomsg Required Headers");
        assert_eq!(RejectReason::NotPeer.status_line(), "400 Incompatible Socket Type");
        assert_eq!(RejectReason::UnknownProtocol.status_line(), "400 Unrecognized Socket Type");
    }

    #[test]
    fn reject_reasons_map_to_error_kinds() {
        use crate::handshake::Error;
        assert_eq!(RejectReason::TooLong.as_error(), Error::TooLong);
        assert_eq!(RejectReason::BadVersion.as_error(), Error::Incompatible);
        assert_eq!(RejectReason::MissingSpHeaders.as_error(), Error::Incompatible);
        assert_eq!(RejectReason::NotPeer.as_error(), Error::Peer);
        assert_eq!(RejectReason::UnknownProtocol.as_error(), Error::Peer);
    }
}

// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Scalability-protocol identifiers and their websocket sub-protocol tokens.
//!
//! The handshake itself never names a socket type; it is handed an
//! [`SpMap`] at construction and negotiates purely in terms of [`SpId`]s
//! and tokens. The canonical nanomsg table is provided as [`NANOMSG`].

/// Numeric scalability-protocol identifier, as carried on the wire by the
/// SP layer.
pub type SpId = u16;

pub const PAIR: SpId = 16;
pub const PUB: SpId = 2 * 16;
pub const SUB: SpId = 2 * 16 + 1;
pub const REQ: SpId = 3 * 16;
pub const REP: SpId = 3 * 16 + 1;
pub const PUSH: SpId = 5 * 16;
pub const PULL: SpId = 5 * 16 + 1;
pub const SURVEYOR: SpId = 6 * 16 + 2;
pub const RESPONDENT: SpId = 6 * 16 + 3;
pub const BUS: SpId = 7 * 16;

/// Bidirectional id ↔ sub-protocol token table.
///
/// `fallback` is the id assumed when a client omits
/// `Sec-WebSocket-Protocol` entirely; the canonical table designates PAIR,
/// which keeps plain (non-SP) websocket clients connectable to a local
/// PAIR socket.
#[derive(Debug)]
pub struct SpMap {
    entries: &'static [(SpId, &'static str)],
    fallback: SpId
}

impl SpMap {
    pub const fn new(entries: &'static [(SpId, &'static str)], fallback: SpId) -> Self {
        SpMap { entries, fallback }
    }

    /// The token advertised for the given id, if the id is mapped.
    pub fn token(&self, sp: SpId) -> Option<&'static str> {
        self.entries.iter().find(|e| e.0 == sp).map(|e| e.1)
    }

    /// The id a peer advertised with the given token (ASCII case-insensitive).
    pub fn by_token(&self, token: &[u8]) -> Option<SpId> {
        self.entries.iter()
            .find(|e| e.1.as_bytes().eq_ignore_ascii_case(token))
            .map(|e| e.0)
    }

    /// The id assumed when no sub-protocol is advertised at all.
    pub fn fallback(&self) -> SpId {
        self.fallback
    }
}

/// The ten nanomsg scalability protocols.
pub const NANOMSG: SpMap = SpMap::new(
    &[
        (PAIR, "x-nanomsg-pair"),
        (REQ, "x-nanomsg-req"),
        (REP, "x-nanomsg-rep"),
        (PUB, "x-nanomsg-pub"),
        (SUB, "x-nanomsg-sub"),
        (SURVEYOR, "x-nanomsg-surveyor"),
        (RESPONDENT, "x-nanomsg-respondent"),
        (PUSH, "x-nanomsg-push"),
        (PULL, "x-nanomsg-pull"),
        (BUS, "x-nanomsg-bus")
    ],
    PAIR
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_table_is_bidirectional() {
        for &(sp, token) in NANOMSG.entries {
            assert_eq!(NANOMSG.token(sp), Some(token));
            assert_eq!(NANOMSG.by_token(token.as_bytes()), Some(sp));
        }
        assert_eq!(NANOMSG.entries.len(), 10);
    }

    #[test]
    fn token_lookup_is_case_insensitive() {
        assert_eq!(NANOMSG.by_token(b"X-Nanomsg-PAIR"), Some(PAIR));
        assert_eq!(NANOMSG.by_token(b"x-nanomsg-surveyor"), Some(SURVEYOR));
    }

    #[test]
    fn unknown_lookups_fail() {
        assert_eq!(NANOMSG.by_token(b"x-other"), None);
        assert_eq!(NANOMSG.token(1234), None);
        assert_eq!(NANOMSG.by_token(b""), None);
    }

    #[test]
    fn fallback_is_pair() {
        assert_eq!(NANOMSG.fallback(), PAIR);
    }
}

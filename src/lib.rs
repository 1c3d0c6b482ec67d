// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! An implementation of the [RFC 6455][rfc6455] websocket *opening
//! handshake* for scalability-protocol (SP) transports.
//!
//! The entry point is the [`Handshake`] state machine: one instance per
//! connection, driving the exchange from the first byte on the wire until
//! the connection is ready for a framed data channel or abandoned. The
//! machine performs no I/O and never blocks; the host event loop lends it
//! a [`ByteStream`] and a [`Timer`], feeds their completion [`Event`]s
//! back in, and receives the stream together with the verdict in the
//! terminal [`Exit`].
//!
//! Sub-protocol negotiation is table-driven: the machine is constructed
//! with an [`sp::SpMap`] and a peer-compatibility check, and names no
//! socket type itself. [`sp::NANOMSG`] is the canonical ten-entry table.
//!
//! # Server example
//!
//! ```no_run
//! use saluto::{sp, ByteStream, Event, Exit, Handshake, Timer, TimerEvent};
//!
//! // The collaborators only *post* requests; completions come back as
//! // events from the host loop.
//! struct Stream;
//!
//! impl ByteStream for Stream {
//!     fn send(&mut self, data: &[u8]) { /* queue a write */ }
//!     fn recv(&mut self, n: usize) { /* queue a read of exactly n bytes */ }
//! }
//!
//! struct Alarm;
//!
//! impl Timer for Alarm {
//!     fn start(&mut self, ms: u64) { /* arm a one-shot */ }
//!     fn stop(&mut self) { /* cancel; must answer with Stopped */ }
//!     fn is_idle(&self) -> bool { true }
//! }
//!
//! let mut handshake = Handshake::server(Alarm, &sp::NANOMSG, |peer| peer == sp::PAIR);
//! handshake.start(Stream);
//!
//! // The event loop then routes completions until the machine is done:
//! let event = Event::Timer(TimerEvent::Stopped);
//! match handshake.handle(event) {
//!     Some(Exit::Done { stream, result }) => { let _ = (stream, result); /* promote or close */ }
//!     Some(Exit::Stopped { .. }) => { /* parent aborted the handshake */ }
//!     None => { /* still in progress */ }
//! }
//! ```
//!
//! A client is constructed with [`Handshake::client`], its local socket
//! type and the host and resource to request; everything else works the
//! same way.
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

pub mod base64;
pub mod handshake;
pub mod machine;
pub mod matcher;
pub mod sha1;
pub mod sp;

pub use handshake::{accept_key, Error, ACCEPT_KEY_LEN};
pub use machine::{
    ByteStream,
    Event,
    Exit,
    Handshake,
    Mode,
    StreamEvent,
    Timer,
    TimerEvent
};

/// A parsing result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsing<T> {
    /// Parsing completed.
    Done(T),
    /// Parsing is incomplete and needs more data.
    NeedMore
}

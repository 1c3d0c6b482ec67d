// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The event-driven opening-handshake state machine.
//!
//! A [`Handshake`] drives one connection from the first byte on the wire
//! until it is ready for a framed data channel or abandoned. It never
//! blocks and performs no I/O itself: it posts requests to its
//! [`ByteStream`] and [`Timer`] collaborators and reacts to the
//! completion events the host loop feeds back through
//! [`Handshake::handle`]. The stream is owned by the machine between
//! [`Handshake::start`] and the terminal [`Exit`], which carries it back
//! to the parent together with the verdict.

use crate::handshake::{client, server, Error, ACCEPT_KEY_LEN, TERMSEQ};
use crate::matcher::Span;
use crate::sp::{SpId, SpMap};
use crate::Parsing;
use log::{debug, trace};
use static_assertions::const_assert;

/// Fixed capacity of the receive and send buffers, one per direction.
pub const BUFFER_LEN: usize = 4096;

/// Time allowed to complete the whole exchange, in milliseconds.
pub const TIMEOUT_MS: u64 = 5000;

// The shortest length a valid opening request can possibly have. Polling
// for the remainder happens in termination-sequence-sized chunks, so the
// first receive grabs this much in one go.
const SERVER_MIN_RECV: usize =
    b"GET x HTTP/1.1\r\n\
      Upgrade: websocket\r\n\
      Connection: Upgrade\r\n\
      Host: x\r\n\
      Origin: x\r\n\
      Sec-WebSocket-Key: xxxxxxxxxxxxxxxxxxxxxxxx\r\n\
      Sec-WebSocket-Version: xx\r\n\r\n".len();

// The shortest conceivable server reply is a terse status.
const CLIENT_MIN_RECV: usize = b"HTTP/1.1 xxx\r\n\r\n".len();

const_assert!(first_recv_backtracks; SERVER_MIN_RECV >= TERMSEQ.len() && CLIENT_MIN_RECV >= TERMSEQ.len());
const_assert!(first_recv_fits_buffer; SERVER_MIN_RECV <= BUFFER_LEN && CLIENT_MIN_RECV <= BUFFER_LEN);

/// Is the [`Handshake`] initiating or answering?
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Initiating side: sends the opening request.
    Client,
    /// Answering side: receives the opening request.
    Server
}

impl Mode {
    pub fn is_client(self) -> bool {
        if let Mode::Client = self {
            true
        } else {
            false
        }
    }

    pub fn is_server(self) -> bool {
        !self.is_client()
    }
}

/// A byte stream the machine posts non-blocking requests to.
///
/// Both methods only *post*; the outcome arrives later as a
/// [`StreamEvent`]. A `recv(n)` completes as `Received` once exactly `n`
/// bytes are present.
pub trait ByteStream {
    /// Post a send of one contiguous byte range.
    fn send(&mut self, data: &[u8]);
    /// Post a receive of exactly `n` bytes.
    fn recv(&mut self, n: usize);
}

/// A one-shot timer collaborator.
///
/// `stop` requests cancellation and must be answered by exactly one
/// [`TimerEvent::Stopped`]; `is_idle` reports whether that answer has
/// been delivered.
pub trait Timer {
    fn start(&mut self, ms: u64);
    fn stop(&mut self);
    fn is_idle(&self) -> bool;
}

/// Completion events from the byte stream.
#[derive(Debug, Clone, Copy)]
pub enum StreamEvent<'a> {
    /// A posted send has been written out in full.
    Sent,
    /// A posted receive completed; the payload is exactly as long as
    /// requested.
    Received(&'a [u8]),
    /// Advisory: the peer shut its side down. Ignored; an `Error` will
    /// follow eventually.
    Shutdown,
    /// The stream failed.
    Error
}

/// Completion events from the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Timeout,
    Stopped
}

/// Any event the machine reacts to.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Stream(StreamEvent<'a>),
    Timer(TimerEvent)
}

/// A terminal notification handed back to the parent.
#[derive(Debug)]
pub enum Exit<S> {
    /// The handshake ran to completion; ownership of the stream returns
    /// to the parent together with the verdict. Published exactly once
    /// per started handshake.
    Done {
        stream: S,
        result: Result<(), Error>
    },
    /// Acknowledgement of [`Handshake::stop`]. The stream is returned if
    /// the machine still owned one; no verdict is published.
    Stopped {
        stream: Option<S>
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ServerRecv,
    ServerReply,
    ClientSend,
    ClientRecv,
    StoppingTimerError,
    StoppingTimerDone,
    Done,
    Stopping
}

/// A single-connection opening handshake.
///
/// The instance is inert until [`Handshake::start`] hands it the stream.
/// From then on the host loop routes every stream and timer completion
/// into [`Handshake::handle`] until it yields an [`Exit`].
pub struct Handshake<'a, S, T> {
    mode: Mode,
    state: State,
    stream: Option<S>,
    timer: T,
    map: &'a SpMap,
    is_peer: Box<dyn FnMut(SpId) -> bool + 'a>,
    /// Token advertised for the local socket type (client mode).
    sp_token: &'static str,
    resource: &'a str,
    remote_host: &'a str,
    timeout_ms: u64,
    /// Client: the request being sent. Server: the receive buffer.
    opening_hs: [u8; BUFFER_LEN],
    /// Server: the reply being sent. Client: the receive buffer.
    response: [u8; BUFFER_LEN],
    recv_pos: usize,
    recv_len: usize,
    retries: u32,
    /// The peer's `Sec-WebSocket-Version` value, echoed in diagnostic
    /// replies.
    version: Span,
    /// Verdict behind the reply currently being sent; `None` is the 101.
    reject: Option<server::RejectReason>,
    expected_accept_key: [u8; ACCEPT_KEY_LEN],
    failure: Option<Error>
}

impl<'a, S, T> Handshake<'a, S, T>
where
    S: ByteStream,
    T: Timer
{
    /// Create the initiating side of a handshake.
    ///
    /// The local socket type must be present in `map` and `resource` must
    /// be non-empty; both are programmer errors otherwise.
    pub fn client(
        timer: T,
        map: &'a SpMap,
        local_sp: SpId,
        is_peer: impl FnMut(SpId) -> bool + 'a,
        remote_host: &'a str,
        resource: &'a str
    ) -> Self {
        assert!(!resource.is_empty(), "request resource must be non-empty");
        let sp_token = match map.token(local_sp) {
            Some(token) => token,
            None => panic!("local socket type {} is not in the sub-protocol map", local_sp)
        };
        Handshake::new(Mode::Client, timer, map, Box::new(is_peer), sp_token, remote_host, resource)
    }

    /// Create the answering side of a handshake.
    pub fn server(timer: T, map: &'a SpMap, is_peer: impl FnMut(SpId) -> bool + 'a) -> Self {
        Handshake::new(Mode::Server, timer, map, Box::new(is_peer), "", "", "")
    }

    fn new(
        mode: Mode,
        timer: T,
        map: &'a SpMap,
        is_peer: Box<dyn FnMut(SpId) -> bool + 'a>,
        sp_token: &'static str,
        remote_host: &'a str,
        resource: &'a str
    ) -> Self {
        Handshake {
            mode,
            state: State::Idle,
            stream: None,
            timer,
            map,
            is_peer,
            sp_token,
            resource,
            remote_host,
            timeout_ms: TIMEOUT_MS,
            opening_hs: [0; BUFFER_LEN],
            response: [0; BUFFER_LEN],
            recv_pos: 0,
            recv_len: 0,
            retries: 0,
            version: Span::default(),
            reject: None,
            expected_accept_key: [0; ACCEPT_KEY_LEN],
            failure: None
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Has the machine neither been started nor completed a run?
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Number of incremental receive rounds beyond the first (diagnostic).
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Take ownership of the stream, arm the timer and enter the first
    /// working state. Must only be called while idle.
    pub fn start(&mut self, stream: S) {
        assert_eq!(self.state, State::Idle, "handshake already running");
        debug_assert!(self.stream.is_none());
        self.stream = Some(stream);
        self.opening_hs = [0; BUFFER_LEN];
        self.response = [0; BUFFER_LEN];
        self.recv_pos = 0;
        self.retries = 0;
        self.version = Span::default();
        self.reject = None;
        self.failure = None;

        self.timer.start(self.timeout_ms);

        match self.mode {
            Mode::Client => {
                self.recv_len = CLIENT_MIN_RECV;
                let (len, expected) = client::encode_request(
                    self.resource,
                    self.remote_host,
                    self.sp_token,
                    &mut self.opening_hs[..]
                );
                self.expected_accept_key = expected;
                self.state = State::ClientSend;
                debug!("client: sending opening handshake ({} bytes)", len);
                if let Some(stream) = self.stream.as_mut() {
                    stream.send(&self.opening_hs[.. len])
                }
            }
            Mode::Server => {
                self.recv_len = SERVER_MIN_RECV;
                self.state = State::ServerRecv;
                trace!("server: awaiting opening handshake, first {} bytes", self.recv_len);
                if let Some(stream) = self.stream.as_mut() {
                    stream.recv(self.recv_len)
                }
            }
        }
    }

    /// Abort the handshake. The timer is told to stop; once its
    /// [`TimerEvent::Stopped`] arrives, [`Handshake::handle`] yields
    /// [`Exit::Stopped`] and the machine returns to idle.
    pub fn stop(&mut self) {
        debug!("{:?}: handshake stopped by parent", self.mode);
        self.timer.stop();
        self.state = State::Stopping
    }

    /// React to a completion event. Returns `Some` exactly when the
    /// machine publishes a terminal notification.
    pub fn handle(&mut self, event: Event) -> Option<Exit<S>> {
        match self.state {
            // Nothing is in flight; a straggler event has no one to harm.
            State::Idle | State::Done => {
                debug!("{:?}: ignoring {:?} outside a run", self.mode, event);
                None
            }

            State::ServerRecv => match event {
                Event::Stream(StreamEvent::Received(bytes)) => self.on_server_received(bytes),
                Event::Stream(StreamEvent::Shutdown) => None,
                Event::Stream(StreamEvent::Error) => self.fail(Error::Stream),
                Event::Timer(TimerEvent::Timeout) => self.fail(Error::Timeout),
                other => self.unexpected(other)
            },

            State::ServerReply => match event {
                Event::Stream(StreamEvent::Sent) => {
                    // The reply is out; as per RFC 6455 section 4.2.2 a 101
                    // means the connection is ready for frames right away,
                    // while a diagnostic reply was a courtesy on a failed
                    // handshake.
                    self.timer.stop();
                    match self.reject {
                        None => self.state = State::StoppingTimerDone,
                        Some(reason) => {
                            self.failure = Some(reason.as_error());
                            self.state = State::StoppingTimerError
                        }
                    }
                    None
                }
                Event::Stream(StreamEvent::Shutdown) => None,
                Event::Stream(StreamEvent::Error) => self.fail(Error::Stream),
                Event::Timer(TimerEvent::Timeout) => self.fail(Error::Timeout),
                other => self.unexpected(other)
            },

            State::ClientSend => match event {
                Event::Stream(StreamEvent::Sent) => {
                    self.state = State::ClientRecv;
                    trace!("client: awaiting reply, first {} bytes", self.recv_len);
                    if let Some(stream) = self.stream.as_mut() {
                        stream.recv(self.recv_len)
                    }
                    None
                }
                Event::Stream(StreamEvent::Shutdown) => None,
                Event::Stream(StreamEvent::Error) => self.fail(Error::Stream),
                Event::Timer(TimerEvent::Timeout) => self.fail(Error::Timeout),
                other => self.unexpected(other)
            },

            State::ClientRecv => match event {
                Event::Stream(StreamEvent::Received(bytes)) => self.on_client_received(bytes),
                Event::Stream(StreamEvent::Shutdown) => None,
                Event::Stream(StreamEvent::Error) => self.fail(Error::Stream),
                Event::Timer(TimerEvent::Timeout) => self.fail(Error::Timeout),
                other => self.unexpected(other)
            },

            // Stream events may trickle in while the timer is stopping,
            // e.g. the peer announcing it is closing; only the timer's
            // acknowledgement moves things forward.
            State::StoppingTimerError => match event {
                Event::Timer(TimerEvent::Stopped) => {
                    let error = self.failure.take().unwrap_or(Error::Protocol);
                    self.leave(Err(error))
                }
                _ => None
            },

            State::StoppingTimerDone => match event {
                Event::Timer(TimerEvent::Stopped) => self.leave(Ok(())),
                _ => None
            },

            State::Stopping => match event {
                Event::Timer(TimerEvent::Stopped) if self.timer.is_idle() => {
                    self.state = State::Idle;
                    Some(Exit::Stopped { stream: self.stream.take() })
                }
                _ => None
            }
        }
    }

    fn on_server_received(&mut self, bytes: &[u8]) -> Option<Exit<S>> {
        if bytes.len() != self.recv_len {
            debug!("server: completion of {} bytes, {} were requested", bytes.len(), self.recv_len);
            return self.fail(Error::Protocol)
        }
        self.opening_hs[self.recv_pos .. self.recv_pos + bytes.len()].copy_from_slice(bytes);
        let filled = self.recv_pos + self.recv_len;

        match server::parse(&self.opening_hs[.. filled]) {
            Parsing::Done(request) => {
                self.version = request.version.unwrap_or_default();
                let verdict = server::validate(
                    &request,
                    &self.opening_hs[.. filled],
                    self.map,
                    &mut *self.is_peer
                );
                match verdict {
                    Ok(sp) => {
                        debug!("server: upgrading connection, peer sp {}", sp);
                        self.reject = None;
                        self.send_reply(
                            request.key.unwrap_or_default(),
                            request.protocol.unwrap_or_default()
                        )
                    }
                    Err(reason) => {
                        debug!("server: failing connection: {}", reason.status_line());
                        self.reject = Some(reason);
                        self.send_reply(Span::default(), Span::default())
                    }
                }
            }
            Parsing::NeedMore => self.request_more()
        }
    }

    fn on_client_received(&mut self, bytes: &[u8]) -> Option<Exit<S>> {
        if bytes.len() != self.recv_len {
            debug!("client: completion of {} bytes, {} were requested", bytes.len(), self.recv_len);
            return self.fail(Error::Protocol)
        }
        self.response[self.recv_pos .. self.recv_pos + bytes.len()].copy_from_slice(bytes);
        let filled = self.recv_pos + self.recv_len;

        match client::parse(&self.response[.. filled]) {
            Parsing::Done(response) => {
                if client::validate(&response, &self.response[.. filled], &self.expected_accept_key) {
                    // RFC 6455 section 4.2.2: the connection is now ready
                    // for frames.
                    debug!("client: connection upgraded");
                    self.timer.stop();
                    self.state = State::StoppingTimerDone;
                    None
                } else {
                    self.fail(Error::Incompatible)
                }
            }
            Parsing::NeedMore => self.request_more()
        }
    }

    // Compose the pending reply (101 or diagnostic, per `self.reject`)
    // into the send buffer and post it.
    fn send_reply(&mut self, key: Span, protocol: Span) -> Option<Exit<S>> {
        let len = {
            let opening = &self.opening_hs[..];
            let response = match self.reject {
                None => server::Response::Accept {
                    key: key.slice(opening),
                    protocol: protocol.slice(opening)
                },
                Some(reason) => server::Response::Reject {
                    reason,
                    version: self.version.slice(opening)
                }
            };
            server::encode_response(&response, &mut self.response[..])
        };
        self.state = State::ServerReply;
        if let Some(stream) = self.stream.as_mut() {
            stream.send(&self.response[.. len])
        }
        None
    }

    // A parse round came up short: schedule the next receive, sized so it
    // cannot read past the terminating blank line, or give up when the
    // buffer is exhausted.
    fn request_more(&mut self) -> Option<Exit<S>> {
        self.recv_pos += self.recv_len;
        let filled = match self.mode {
            Mode::Server => &self.opening_hs[.. self.recv_pos],
            Mode::Client => &self.response[.. self.recv_pos]
        };
        self.recv_len = next_chunk_len(filled);

        if self.recv_pos + self.recv_len > BUFFER_LEN {
            debug!("{:?}: opening handshake exceeds {} bytes", self.mode, BUFFER_LEN);
            match self.mode {
                Mode::Server => {
                    self.reject = Some(server::RejectReason::TooLong);
                    self.send_reply(Span::default(), Span::default())
                }
                Mode::Client => self.fail(Error::TooLong)
            }
        } else {
            self.retries += 1;
            trace!("{:?}: receiving {} more byte(s), round {}", self.mode, self.recv_len, self.retries);
            if let Some(stream) = self.stream.as_mut() {
                stream.recv(self.recv_len)
            }
            None
        }
    }

    fn fail(&mut self, error: Error) -> Option<Exit<S>> {
        debug!("{:?}: handshake failed: {}", self.mode, error);
        self.failure = Some(error);
        self.timer.stop();
        self.state = State::StoppingTimerError;
        None
    }

    fn unexpected(&mut self, event: Event) -> Option<Exit<S>> {
        debug!("{:?}: unexpected {:?} in state {:?}", self.mode, event, self.state);
        self.fail(Error::Protocol)
    }

    // Publish the verdict and hand the stream back.
    fn leave(&mut self, result: Result<(), Error>) -> Option<Exit<S>> {
        self.state = State::Done;
        match &result {
            Ok(()) => debug!("{:?}: handshake done, {} extra receive round(s)", self.mode, self.retries),
            Err(e) => debug!("{:?}: handshake failed, {} extra receive round(s): {}", self.mode, self.retries, e)
        }
        self.stream.take().map(|stream| Exit::Done { stream, result })
    }
}

// How many bytes the next receive may safely ask for: the termination
// sequence length minus the longest proper suffix of the received bytes
// that is a prefix of the termination sequence. Always 1 ..= 4.
fn next_chunk_len(filled: &[u8]) -> usize {
    let n = filled.len();
    for overlap in (1 .. TERMSEQ.len()).rev() {
        if n >= overlap && filled[n - overlap ..] == TERMSEQ[.. overlap] {
            return TERMSEQ.len() - overlap
        }
    }
    TERMSEQ.len()
}

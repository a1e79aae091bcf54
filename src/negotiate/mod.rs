// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Negotiation sessions.
//!
//! A [NegotiationSession] drives one security-context exchange with a
//! peer, for exactly one connection attempt.  The client always
//! speaks first: [initial_bytes](NegotiationSession::initial_bytes)
//! is called once, producing the first token to send.  Every token
//! subsequently received from the peer is handed to
//! [next_bytes](NegotiationSession::next_bytes), in the order it
//! arrived, until the session reports completion or fails.
//!
//! # States
//!
//! Sessions move through the [SessionState]s as follows:
//!
//! ```text
//! Fresh --initial_bytes--> Negotiating --next_bytes--> Done
//!   |                        |    ^
//!   |                        +----+ (continue needed)
//!   +------------------------+--------------------> Failed
//! ```
//!
//! `Done` and `Failed` are terminal.  Any further call to
//! `initial_bytes` or `next_bytes` is rejected with
//! [NegotiateError::BadState], and the session stays where it was.
//!
//! # Release
//!
//! [release](NegotiationSession::release) tears down the underlying
//! [SecurityContext].  It is idempotent and safe in any state, and is
//! also performed when the session is dropped, so every exit path of
//! a connection attempt releases the context exactly once.
use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use log::debug;
use log::trace;
use log::warn;

pub mod auth;
pub mod factory;
#[cfg(feature = "gssapi")]
pub mod gssapi;

/// GSSAPI major status indicating a complete context.
pub const STATUS_COMPLETE: u32 = 0;
/// GSSAPI major status indicating that another round trip is needed.
pub const STATUS_CONTINUE_NEEDED: u32 = 1;

/// Status reported by a [SecurityContext] when verifying a token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Status {
    /// Status code.
    code: u32,
    /// Diagnostic detail from the security engine.
    detail: String
}

/// Outcome of verifying a peer token against a [SecurityContext].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verification {
    /// The peer is authenticated; negotiation is done.
    Complete,
    /// Another round trip is required.
    ContinueNeeded {
        /// Follow-up token to send to the peer, if the engine
        /// produced one.
        reply: Option<Vec<u8>>
    },
    /// Verification failed, or reported a status other than
    /// completion or continuation.
    Failed {
        /// The status reported by the engine.
        status: Status
    }
}

/// A single security context, owned by one [NegotiationSession].
///
/// This is the capability consumed from the security engine.  The
/// session never looks inside tokens; it only moves them between
/// these operations and the host connection driver.
pub trait SecurityContext {
    /// Unmarshaled peer token.
    type Token;
    /// Errors from context initialization and token decoding.
    type Error: Display;

    /// Initialize the context and produce the marshaled first token.
    fn init_token(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Unmarshal a token received from the peer.
    fn unmarshal(
        &mut self,
        bytes: &[u8]
    ) -> Result<Self::Token, Self::Error>;

    /// Verify a peer token, advancing the context.
    fn verify(
        &mut self,
        token: Self::Token
    ) -> Verification;

    /// Release any resources held by the context.
    ///
    /// This is called at most once.
    fn release(&mut self);
}

/// Source of fresh [SecurityContext]s, bound to service identities.
///
/// This holds the pre-established credential from which contexts are
/// spawned.  A [Negotiator](crate::negotiate::factory::Negotiator)
/// used from several threads at once requires `new_context` to be
/// safe for concurrent invocation.
pub trait SecurityEngine {
    /// Type of contexts produced by this engine.
    type Context: SecurityContext;

    /// Create a context for authenticating to `service`.
    ///
    /// Construction is infallible; failures surface from
    /// [init_token](SecurityContext::init_token).
    fn new_context(
        &self,
        service: &str
    ) -> Self::Context;
}

/// States of a [NegotiationSession].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SessionState {
    /// No token has been produced yet.
    Fresh,
    /// The first token was produced; awaiting peer tokens.
    Negotiating,
    /// The peer is authenticated.
    Done,
    /// Negotiation failed.
    Failed
}

/// Errors that can occur during negotiation.
#[derive(Debug)]
pub enum NegotiateError<E> {
    /// The context could not produce the first token.
    Init {
        /// Error from the security engine.
        error: E
    },
    /// A peer token could not be decoded.
    Decode {
        /// Error from the security engine.
        error: E
    },
    /// A peer token failed verification.
    Verify {
        /// Status reported by the security engine.
        status: Status
    },
    /// The operation is not permitted in the session's current state.
    BadState {
        /// The state of the session.
        state: SessionState
    },
    /// The session was already released.
    Released
}

/// State machine for a single security-context negotiation.
///
/// Sessions are created by a
/// [Negotiator](crate::negotiate::factory::Negotiator), and are never
/// reused across connection attempts.
pub struct NegotiationSession<Ctx: SecurityContext> {
    /// The security context.
    ctx: Ctx,
    /// Service identity the context is bound to.
    service: String,
    state: SessionState,
    /// Number of peer tokens consumed.
    rounds: usize,
    released: bool
}

impl Status {
    /// Create a `Status` from its components.
    #[inline]
    pub fn new(
        code: u32,
        detail: String
    ) -> Self {
        Status {
            code: code,
            detail: detail
        }
    }

    /// Get the status code.
    #[inline]
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Get the diagnostic detail.
    #[inline]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl Verification {
    /// Classify a raw status.
    ///
    /// [STATUS_COMPLETE] and [STATUS_CONTINUE_NEEDED] map to their
    /// respective outcomes (with no follow-up token); every other
    /// code is a failure.
    pub fn from_status(status: Status) -> Self {
        match status.code {
            STATUS_COMPLETE => Verification::Complete,
            STATUS_CONTINUE_NEEDED => {
                Verification::ContinueNeeded { reply: None }
            }
            _ => Verification::Failed { status: status }
        }
    }
}

impl SessionState {
    /// Check whether this is a terminal state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

impl<Ctx: SecurityContext> NegotiationSession<Ctx> {
    /// Create a fresh session around `ctx`.
    #[inline]
    pub(crate) fn new(
        ctx: Ctx,
        service: String
    ) -> Self {
        NegotiationSession {
            ctx: ctx,
            service: service,
            state: SessionState::Fresh,
            rounds: 0,
            released: false
        }
    }

    /// Get the service identity this session authenticates to.
    ///
    /// This is the identity after canonicalization.
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the number of peer tokens consumed so far.
    #[inline]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Check whether the session has been released.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }

    #[inline]
    fn check(
        &self,
        expected: SessionState
    ) -> Result<(), NegotiateError<Ctx::Error>> {
        if self.released {
            Err(NegotiateError::Released)
        } else if self.state != expected {
            if self.state.is_terminal() {
                warn!(target: "negotiate-session",
                      "{} session to {} cannot be reused",
                      self.state, self.service);
            } else {
                warn!(target: "negotiate-session",
                      "operation out of order for {} session to {}",
                      self.state, self.service);
            }

            Err(NegotiateError::BadState { state: self.state })
        } else {
            Ok(())
        }
    }

    /// Produce the first token to send to the peer.
    ///
    /// This may only be called once, on a fresh session.  Any failure
    /// from the security engine is fatal to the session, and is
    /// returned as-is inside [NegotiateError::Init]; no retry is
    /// attempted.
    pub fn initial_bytes(
        &mut self
    ) -> Result<Vec<u8>, NegotiateError<Ctx::Error>> {
        self.check(SessionState::Fresh)?;

        debug!(target: "negotiate-session",
               "beginning negotiation with {}",
               self.service);

        match self.ctx.init_token() {
            Ok(token) => {
                trace!(target: "negotiate-session",
                       "produced initial token ({} bytes)",
                       token.len());

                self.state = SessionState::Negotiating;

                Ok(token)
            }
            Err(err) => {
                warn!(target: "negotiate-session",
                      "failed to initialize context for {} ({})",
                      self.service, err);

                self.state = SessionState::Failed;

                Err(NegotiateError::Init { error: err })
            }
        }
    }

    /// Consume a token received from the peer.
    ///
    /// This returns `Ok(None)` both when negotiation completes (the
    /// state becomes [Done](SessionState::Done)) and when the peer
    /// must send another token.  `Ok(Some(..))` carries a follow-up
    /// token to relay to the peer, which only happens if the engine
    /// produces one while continuing.
    pub fn next_bytes(
        &mut self,
        bytes: &[u8]
    ) -> Result<Option<Vec<u8>>, NegotiateError<Ctx::Error>> {
        self.check(SessionState::Negotiating)?;

        self.rounds += 1;

        trace!(target: "negotiate-session",
               "consuming peer token {} ({} bytes)",
               self.rounds, bytes.len());

        let token = match self.ctx.unmarshal(bytes) {
            Ok(token) => token,
            Err(err) => {
                warn!(target: "negotiate-session",
                      "malformed token from {} ({})",
                      self.service, err);

                self.state = SessionState::Failed;

                return Err(NegotiateError::Decode { error: err });
            }
        };

        match self.ctx.verify(token) {
            Verification::Complete => {
                debug!(target: "negotiate-session",
                       "negotiation with {} complete after {} rounds",
                       self.service, self.rounds);

                self.state = SessionState::Done;

                Ok(None)
            }
            Verification::ContinueNeeded { reply } => {
                trace!(target: "negotiate-session",
                       "continuing negotiation with {}",
                       self.service);

                Ok(reply)
            }
            Verification::Failed { status } => {
                warn!(target: "negotiate-session",
                      "negotiation with {} failed ({})",
                      self.service, status);

                self.state = SessionState::Failed;

                Err(NegotiateError::Verify { status: status })
            }
        }
    }

    /// Release the underlying security context.
    ///
    /// This is idempotent, and may be called in any state.
    pub fn release(&mut self) {
        if !self.released {
            debug!(target: "negotiate-session",
                   "releasing {} session to {}",
                   self.state, self.service);

            self.ctx.release();
            self.released = true;
        }
    }
}

impl<Ctx: SecurityContext> Drop for NegotiationSession<Ctx> {
    #[inline]
    fn drop(&mut self) {
        self.release()
    }
}

impl Display for Status {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "bad status {}: {}", self.code, self.detail)
    }
}

impl Display for SessionState {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SessionState::Fresh => write!(f, "fresh"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Done => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed")
        }
    }
}

impl<E> Display for NegotiateError<E>
where
    E: Display
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NegotiateError::Init { error } => {
                write!(f, "failed to produce initial token: {}", error)
            }
            NegotiateError::Decode { error } => {
                write!(f, "malformed peer token: {}", error)
            }
            NegotiateError::Verify { status } => {
                write!(f, "peer token rejected: {}", status)
            }
            NegotiateError::BadState { state } => {
                write!(f, "operation not permitted on {} session", state)
            }
            NegotiateError::Released => write!(f, "session was released")
        }
    }
}

impl<E> Error for NegotiateError<E>
where
    E: Debug + Display
{
}

#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::rc::Rc;

#[cfg(test)]
use crate::init;

/// Security context that replays scripted outcomes.
#[cfg(test)]
pub(crate) struct ScriptedContext {
    init: Option<Result<Vec<u8>, String>>,
    verdicts: VecDeque<Verification>,
    releases: Rc<Cell<usize>>
}

#[cfg(test)]
impl ScriptedContext {
    pub(crate) fn new(
        init: Result<Vec<u8>, String>,
        verdicts: Vec<Verification>,
        releases: Rc<Cell<usize>>
    ) -> Self {
        ScriptedContext {
            init: Some(init),
            verdicts: verdicts.into(),
            releases: releases
        }
    }
}

#[cfg(test)]
impl SecurityContext for ScriptedContext {
    type Error = String;
    type Token = Vec<u8>;

    fn init_token(&mut self) -> Result<Vec<u8>, String> {
        self.init
            .take()
            .unwrap_or_else(|| Err(String::from("initialized twice")))
    }

    fn unmarshal(
        &mut self,
        bytes: &[u8]
    ) -> Result<Vec<u8>, String> {
        if bytes.is_empty() {
            Err(String::from("empty token"))
        } else {
            Ok(bytes.to_vec())
        }
    }

    fn verify(
        &mut self,
        _token: Vec<u8>
    ) -> Verification {
        self.verdicts.pop_front().unwrap_or_else(|| Verification::Failed {
            status: Status::new(0xffff, String::from("script exhausted"))
        })
    }

    fn release(&mut self) {
        self.releases.set(self.releases.get() + 1)
    }
}

#[cfg(test)]
fn scripted(
    init: Result<Vec<u8>, String>,
    verdicts: Vec<Verification>
) -> (NegotiationSession<ScriptedContext>, Rc<Cell<usize>>) {
    let releases = Rc::new(Cell::new(0));
    let ctx = ScriptedContext::new(init, verdicts, releases.clone());
    let session = NegotiationSession::new(
        ctx,
        String::from("MSSQLSvc/db01.example.com:1433")
    );

    (session, releases)
}

#[test]
fn test_complete() {
    init();

    let (mut session, _) =
        scripted(Ok(vec![0x60, 0x01, 0x00]), vec![Verification::Complete]);

    assert_eq!(SessionState::Fresh, session.state());
    assert_eq!(vec![0x60, 0x01, 0x00], session.initial_bytes().unwrap());
    assert_eq!(SessionState::Negotiating, session.state());
    assert_eq!(None, session.next_bytes(&[0xa1, 0x00]).unwrap());
    assert_eq!(SessionState::Done, session.state());
    assert_eq!(1, session.rounds());
}

#[test]
fn test_continue_needed() {
    init();

    let (mut session, _) = scripted(
        Ok(vec![0x01]),
        vec![
            Verification::ContinueNeeded { reply: None },
            Verification::Complete,
        ]
    );

    session.initial_bytes().unwrap();

    assert_eq!(None, session.next_bytes(&[0x02]).unwrap());
    assert_eq!(SessionState::Negotiating, session.state());
    assert_eq!(None, session.next_bytes(&[0x03]).unwrap());
    assert_eq!(SessionState::Done, session.state());
    assert_eq!(2, session.rounds());
}

#[test]
fn test_continue_needed_with_reply() {
    init();

    let (mut session, _) = scripted(
        Ok(vec![0x01]),
        vec![Verification::ContinueNeeded {
            reply: Some(vec![0x04, 0x05])
        }]
    );

    session.initial_bytes().unwrap();

    assert_eq!(Some(vec![0x04, 0x05]), session.next_bytes(&[0x02]).unwrap());
    assert_eq!(SessionState::Negotiating, session.state());
}

#[test]
fn test_verify_failed() {
    init();

    let status = Status::new(0x000d_0000, String::from("no credentials"));
    let (mut session, _) = scripted(
        Ok(vec![0x01]),
        vec![Verification::Failed {
            status: status.clone()
        }]
    );

    session.initial_bytes().unwrap();

    match session.next_bytes(&[0x02]) {
        Err(NegotiateError::Verify { status: actual }) => {
            assert_eq!(status, actual)
        }
        other => panic!("unexpected result {:?}", other)
    }

    assert_eq!(SessionState::Failed, session.state());

    // Further calls are rejected, and the session stays failed.
    match session.next_bytes(&[0x03]) {
        Err(NegotiateError::BadState { state }) => {
            assert_eq!(SessionState::Failed, state)
        }
        other => panic!("unexpected result {:?}", other)
    }

    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_unrecognized_status_fails() {
    init();

    let status = Status::new(0x0009_0000, String::from("defective token"));
    let (mut session, _) =
        scripted(Ok(vec![0x01]), vec![Verification::from_status(status)]);

    session.initial_bytes().unwrap();

    let err = session.next_bytes(&[0x02]).unwrap_err();

    assert_eq!(
        "peer token rejected: bad status 589824: defective token",
        err.to_string()
    );
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_init_failed() {
    init();

    let (mut session, releases) = scripted(
        Err(String::from("no ticket available")),
        vec![Verification::Complete]
    );

    match session.initial_bytes() {
        Err(NegotiateError::Init { error }) => {
            assert_eq!("no ticket available", error)
        }
        other => panic!("unexpected result {:?}", other)
    }

    assert_eq!(SessionState::Failed, session.state());
    assert!(matches!(
        session.next_bytes(&[0x02]),
        Err(NegotiateError::BadState { .. })
    ));

    session.release();

    assert_eq!(1, releases.get());
}

#[test]
fn test_decode_failed() {
    init();

    let (mut session, _) =
        scripted(Ok(vec![0x01]), vec![Verification::Complete]);

    session.initial_bytes().unwrap();

    assert!(matches!(
        session.next_bytes(&[]),
        Err(NegotiateError::Decode { .. })
    ));
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_next_before_initial() {
    init();

    let (mut session, _) =
        scripted(Ok(vec![0x01]), vec![Verification::Complete]);

    assert!(matches!(
        session.next_bytes(&[0x02]),
        Err(NegotiateError::BadState {
            state: SessionState::Fresh
        })
    ));
    assert_eq!(SessionState::Fresh, session.state());
}

#[test]
fn test_initial_twice() {
    init();

    let (mut session, _) =
        scripted(Ok(vec![0x01]), vec![Verification::Complete]);

    session.initial_bytes().unwrap();

    assert!(matches!(
        session.initial_bytes(),
        Err(NegotiateError::BadState {
            state: SessionState::Negotiating
        })
    ));
    assert_eq!(SessionState::Negotiating, session.state());
}

#[test]
fn test_after_done_rejected() {
    init();

    let (mut session, _) =
        scripted(Ok(vec![0x01]), vec![Verification::Complete]);

    session.initial_bytes().unwrap();
    session.next_bytes(&[0x02]).unwrap();

    assert!(matches!(
        session.next_bytes(&[0x03]),
        Err(NegotiateError::BadState {
            state: SessionState::Done
        })
    ));
}

#[test]
fn test_release_idempotent() {
    init();

    let (mut session, releases) =
        scripted(Ok(vec![0x01]), vec![Verification::Complete]);

    session.initial_bytes().unwrap();
    session.release();
    session.release();

    assert!(session.is_released());
    assert_eq!(1, releases.get());
    assert!(matches!(
        session.next_bytes(&[0x02]),
        Err(NegotiateError::Released)
    ));

    drop(session);

    assert_eq!(1, releases.get());
}

#[test]
fn test_release_on_drop() {
    init();

    let (session, releases) =
        scripted(Ok(vec![0x01]), vec![Verification::Complete]);

    drop(session);

    assert_eq!(1, releases.get());
}

#[test]
fn test_from_status() {
    assert_eq!(
        Verification::Complete,
        Verification::from_status(Status::new(STATUS_COMPLETE, String::new()))
    );
    assert_eq!(
        Verification::ContinueNeeded { reply: None },
        Verification::from_status(Status::new(
            STATUS_CONTINUE_NEEDED,
            String::new()
        ))
    );
    assert!(matches!(
        Verification::from_status(Status::new(7, String::new())),
        Verification::Failed { .. }
    ));
}

#[test]
fn test_terminal_states() {
    assert!(!SessionState::Fresh.is_terminal());
    assert!(!SessionState::Negotiating.is_terminal());
    assert!(SessionState::Done.is_terminal());
    assert!(SessionState::Failed.is_terminal());
}

#[test]
fn test_negotiate_error_boxed() {
    init();

    let (mut session, _) = scripted(
        Err(String::from("credential expired")),
        vec![Verification::Complete]
    );
    let err: Box<dyn Error> = Box::new(session.initial_bytes().unwrap_err());

    assert_eq!(
        "failed to produce initial token: credential expired",
        err.to_string()
    );
    assert!(session.state().is_terminal());
}

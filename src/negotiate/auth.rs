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


//! Host-facing authentication interfaces.
//!
//! A host connection driver typically supports several authentication
//! mechanisms.  [AuthProvider] and [Authenticator] give all of them
//! one shape: a provider is asked whether it applies to a connection
//! attempt, and if so hands back an authenticator that produces and
//! consumes handshake bytes, and is released when the attempt is
//! over, whatever its outcome.
use std::fmt::Display;

use crate::negotiate::factory::Negotiator;
use crate::negotiate::NegotiateError;
use crate::negotiate::NegotiationSession;
use crate::negotiate::SecurityContext;
use crate::negotiate::SecurityEngine;
use crate::resolve::CanonicalNameResolver;

/// Per-connection-attempt handshake participant.
pub trait Authenticator {
    /// Errors that can occur during the handshake.
    type Error: Display;

    /// Produce the first bytes to send.
    fn initial_bytes(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Consume bytes from the peer, possibly producing bytes to send.
    ///
    /// `Ok(None)` indicates that there is nothing to send.
    fn next_bytes(
        &mut self,
        bytes: &[u8]
    ) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Release any resources held for the handshake.
    fn release(&mut self);
}

/// Source of [Authenticator]s.
pub trait AuthProvider {
    /// Type of authenticators produced.
    type Authenticator: Authenticator;

    /// Get an authenticator for a connection attempt, if this
    /// provider applies to it.
    fn authenticator(
        &self,
        user: &str,
        password: &str,
        service: &str
    ) -> Option<Self::Authenticator>;
}

impl<Ctx> Authenticator for NegotiationSession<Ctx>
where
    Ctx: SecurityContext
{
    type Error = NegotiateError<Ctx::Error>;

    #[inline]
    fn initial_bytes(
        &mut self
    ) -> Result<Vec<u8>, NegotiateError<Ctx::Error>> {
        NegotiationSession::initial_bytes(self)
    }

    #[inline]
    fn next_bytes(
        &mut self,
        bytes: &[u8]
    ) -> Result<Option<Vec<u8>>, NegotiateError<Ctx::Error>> {
        NegotiationSession::next_bytes(self, bytes)
    }

    #[inline]
    fn release(&mut self) {
        NegotiationSession::release(self)
    }
}

impl<E, R> AuthProvider for Negotiator<E, R>
where
    E: SecurityEngine,
    R: CanonicalNameResolver
{
    type Authenticator = NegotiationSession<E::Context>;

    /// The password is not used; only the presence of a user name
    /// decides applicability.
    #[inline]
    fn authenticator(
        &self,
        user: &str,
        _password: &str,
        service: &str
    ) -> Option<NegotiationSession<E::Context>> {
        self.select(user, service)
    }
}

#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::rc::Rc;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::negotiate::ScriptedContext;
#[cfg(test)]
use crate::negotiate::SessionState;
#[cfg(test)]
use crate::negotiate::Verification;

/// Drive an authenticator against a scripted peer, the way a host
/// connection driver would.
#[cfg(test)]
fn drive<A>(
    auth: &mut A,
    peer: &[&[u8]]
) -> Result<Vec<Vec<u8>>, A::Error>
where
    A: Authenticator {
    let mut sent = vec![auth.initial_bytes()?];

    for token in peer {
        if let Some(reply) = auth.next_bytes(token)? {
            sent.push(reply)
        }
    }

    Ok(sent)
}

#[test]
fn test_drive_authenticator() {
    init();

    let releases = Rc::new(Cell::new(0));
    let ctx = ScriptedContext::new(
        Ok(vec![0x60, 0x00]),
        vec![
            Verification::ContinueNeeded {
                reply: Some(vec![0xa1, 0x00])
            },
            Verification::Complete,
        ],
        releases.clone()
    );
    let mut session =
        NegotiationSession::new(ctx, String::from("HTTP/www.example.com:443"));
    let peer: [&[u8]; 2] = [&[0xa1, 0x01], &[0xa1, 0x02]];
    let sent = drive(&mut session, &peer).unwrap();

    assert_eq!(vec![vec![0x60, 0x00], vec![0xa1, 0x00]], sent);
    assert_eq!(SessionState::Done, session.state());

    Authenticator::release(&mut session);
    Authenticator::release(&mut session);

    assert_eq!(1, releases.get());
}

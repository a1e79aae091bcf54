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


//! Negotiator factory.
//!
//! [Negotiator] decides, per connection attempt, whether
//! negotiation-based authentication applies, and if so creates a
//! [NegotiationSession] bound to the canonical service identity.
use log::debug;
use log::trace;

use crate::negotiate::NegotiationSession;
use crate::negotiate::SecurityEngine;
use crate::resolve::canon::canonicalize;
use crate::resolve::CanonicalNameResolver;
use crate::resolve::SystemResolver;

/// Factory for [NegotiationSession]s.
///
/// A `Negotiator` holds the long-lived [SecurityEngine] from which
/// every session's context is spawned, and the resolver used to
/// canonicalize service identities.  It does not synchronize access
/// to either; sharing a `Negotiator` between threads is only sound if
/// both are safe for concurrent use.
pub struct Negotiator<E: SecurityEngine, R = SystemResolver> {
    engine: E,
    resolver: R,
    /// Whether to canonicalize service identities.
    canonicalize: bool
}

impl<E, R> Negotiator<E, R>
where
    E: SecurityEngine,
    R: CanonicalNameResolver
{
    /// Create a `Negotiator` from its components.
    #[inline]
    pub fn new(
        engine: E,
        resolver: R,
        canonicalize: bool
    ) -> Self {
        Negotiator {
            engine: engine,
            resolver: resolver,
            canonicalize: canonicalize
        }
    }

    /// Get the security engine.
    #[inline]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Whether service identities are canonicalized.
    #[inline]
    pub fn canonicalize_enabled(&self) -> bool {
        self.canonicalize
    }

    /// Select this mechanism for a connection attempt.
    ///
    /// If `user` is non-empty, username/password authentication is
    /// assumed to be intended, and this returns `None` without doing
    /// anything else.  Otherwise, `service` is canonicalized, and a
    /// fresh session is created for it.
    ///
    /// This never fails; errors from constructing the security
    /// context surface from
    /// [initial_bytes](NegotiationSession::initial_bytes).
    pub fn select(
        &self,
        user: &str,
        service: &str
    ) -> Option<NegotiationSession<E::Context>> {
        if !user.is_empty() {
            trace!(target: "negotiate-factory",
                   "user {} given, not negotiating",
                   user);

            return None;
        }

        let service = if self.canonicalize {
            canonicalize(&self.resolver, service)
        } else {
            service.to_string()
        };

        debug!(target: "negotiate-factory",
               "creating negotiation session for {}",
               service);

        let ctx = self.engine.new_context(&service);

        Some(NegotiationSession::new(ctx, service))
    }
}

#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::io::Error;
#[cfg(test)]
use std::io::ErrorKind;
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
#[cfg(test)]
use crate::resolve::ResolveError;

/// Resolver that knows one alias and counts lookups.
#[cfg(test)]
struct CountingResolver {
    alias: &'static str,
    cname: &'static str,
    lookups: Cell<usize>
}

#[cfg(test)]
impl CanonicalNameResolver for CountingResolver {
    fn lookup_canonical_name(
        &self,
        host: &str
    ) -> Result<String, ResolveError> {
        self.lookups.set(self.lookups.get() + 1);

        if host == self.alias {
            Ok(self.cname.to_string())
        } else {
            Err(ResolveError::IO {
                error: Error::new(ErrorKind::NotFound, "no such host")
            })
        }
    }
}

/// Engine handing out scripted contexts, recording bound services.
#[cfg(test)]
struct ScriptedEngine {
    scripts: RefCell<VecDeque<(Result<Vec<u8>, String>, Vec<Verification>)>>,
    services: RefCell<Vec<String>>,
    releases: Rc<Cell<usize>>
}

#[cfg(test)]
impl ScriptedEngine {
    fn new(
        scripts: Vec<(Result<Vec<u8>, String>, Vec<Verification>)>
    ) -> Self {
        ScriptedEngine {
            scripts: RefCell::new(scripts.into()),
            services: RefCell::new(Vec::new()),
            releases: Rc::new(Cell::new(0))
        }
    }
}

#[cfg(test)]
impl SecurityEngine for ScriptedEngine {
    type Context = ScriptedContext;

    fn new_context(
        &self,
        service: &str
    ) -> ScriptedContext {
        let (init, verdicts) =
            self.scripts.borrow_mut().pop_front().unwrap_or_else(|| {
                (Err(String::from("no script")), Vec::new())
            });

        self.services.borrow_mut().push(service.to_string());

        ScriptedContext::new(init, verdicts, self.releases.clone())
    }
}

#[cfg(test)]
fn resolver() -> CountingResolver {
    CountingResolver {
        alias: "db-alias",
        cname: "db01.example.com.",
        lookups: Cell::new(0)
    }
}

#[test]
fn test_select_with_user() {
    init();

    let negotiator =
        Negotiator::new(ScriptedEngine::new(vec![]), resolver(), true);

    for user in &["sa", "CORP\\reports", " "] {
        assert!(negotiator.select(user, "MSSQLSvc/db-alias:1433").is_none());
    }

    assert_eq!(0, negotiator.resolver.lookups.get());
    assert!(negotiator.engine().services.borrow().is_empty());
}

#[test]
fn test_select_canonicalizes() {
    init();

    let negotiator = Negotiator::new(
        ScriptedEngine::new(vec![(Ok(vec![0x60]), vec![])]),
        resolver(),
        true
    );
    let session = negotiator.select("", "MSSQLSvc/db-alias:1433").unwrap();

    assert_eq!("MSSQLSvc/db01.example.com:1433", session.service());
    assert_eq!(SessionState::Fresh, session.state());
    assert_eq!(1, negotiator.resolver.lookups.get());
    assert_eq!(
        vec![String::from("MSSQLSvc/db01.example.com:1433")],
        *negotiator.engine().services.borrow()
    );
}

#[test]
fn test_select_lookup_failure_uses_alias() {
    init();

    let negotiator = Negotiator::new(
        ScriptedEngine::new(vec![(Ok(vec![0x60]), vec![])]),
        resolver(),
        true
    );
    let session = negotiator.select("", "MSSQLSvc/sql.internal:1433").unwrap();

    assert_eq!("MSSQLSvc/sql.internal:1433", session.service());
}

#[test]
fn test_select_canonicalize_disabled() {
    init();

    let negotiator = Negotiator::new(
        ScriptedEngine::new(vec![(Ok(vec![0x60]), vec![])]),
        resolver(),
        false
    );
    let session = negotiator.select("", "MSSQLSvc/db-alias:1433").unwrap();

    assert!(!negotiator.canonicalize_enabled());
    assert_eq!("MSSQLSvc/db-alias:1433", session.service());
    assert_eq!(0, negotiator.resolver.lookups.get());
}

#[test]
fn test_select_deferred_init_failure() {
    init();

    let negotiator = Negotiator::new(
        ScriptedEngine::new(vec![(
            Err(String::from("credential expired")),
            vec![]
        )]),
        resolver(),
        true
    );
    let mut session = negotiator.select("", "MSSQLSvc/db-alias:1433").unwrap();

    assert!(session.initial_bytes().is_err());
    assert_eq!(SessionState::Failed, session.state());

    session.release();
    session.release();

    assert_eq!(1, negotiator.engine().releases.get());
}

#[test]
fn test_sessions_independent() {
    init();

    let negotiator = Negotiator::new(
        ScriptedEngine::new(vec![
            (Ok(vec![0x01]), vec![Verification::Complete]),
            (Ok(vec![0x02]), vec![Verification::Complete]),
        ]),
        resolver(),
        true
    );
    let mut first = negotiator.select("", "MSSQLSvc/db-alias:1433").unwrap();
    let mut second = negotiator.select("", "MSSQLSvc/db-alias:1433").unwrap();

    assert_eq!(vec![0x01], first.initial_bytes().unwrap());
    assert_eq!(None, first.next_bytes(&[0xa1]).unwrap());
    assert_eq!(SessionState::Done, first.state());
    assert_eq!(SessionState::Fresh, second.state());
    assert_eq!(vec![0x02], second.initial_bytes().unwrap());
}

#[test]
fn test_end_to_end() {
    init();

    const B1: [u8; 4] = [0x60, 0x02, 0x06, 0x00];
    const B2: [u8; 3] = [0xa1, 0x01, 0x00];
    const B3: [u8; 3] = [0xa1, 0x01, 0x01];
    let negotiator = Negotiator::new(
        ScriptedEngine::new(vec![(
            Ok(B1.to_vec()),
            vec![
                Verification::ContinueNeeded { reply: None },
                Verification::Complete,
            ]
        )]),
        resolver(),
        true
    );
    let mut session = negotiator
        .select("", "MSSQLSvc/sql.internal:1433")
        .expect("expected session");

    assert_eq!(B1.to_vec(), session.initial_bytes().unwrap());
    assert_eq!(None, session.next_bytes(&B2).unwrap());
    assert_eq!(SessionState::Negotiating, session.state());
    assert_eq!(None, session.next_bytes(&B3).unwrap());
    assert_eq!(SessionState::Done, session.state());

    session.release();

    assert!(session.is_released());
    assert_eq!(1, negotiator.engine().releases.get());
}

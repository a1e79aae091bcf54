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


//! Canonical name resolution.
//!
//! This module provides [CanonicalNameResolver], the capability used
//! to map a host alias onto its canonical DNS name, along with
//! [SystemResolver], which uses the platform resolver.  The
//! [canon] module uses these to rewrite service identities.
use std::error::Error as StdError;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;

use dns_lookup::getaddrinfo;
use dns_lookup::AddrInfoHints;
use log::trace;

pub mod canon;

/// Capability for looking up the canonical DNS name of a host.
///
/// Implementations are blocking.  A [Negotiator](crate::negotiate::factory::Negotiator)
/// that is shared between threads requires its resolver to be safe
/// for concurrent use.
pub trait CanonicalNameResolver {
    /// Look up the canonical name of `host`.
    ///
    /// The result may carry a trailing root-zone delimiter (`.`).
    fn lookup_canonical_name(
        &self,
        host: &str
    ) -> Result<String, ResolveError>;
}

/// Errors that can occur while looking up a canonical name.
#[derive(Debug)]
pub enum ResolveError {
    /// Low-level resolver error.
    IO {
        /// Error from the resolver.
        error: Error
    },
    /// Lookup succeeded, but no canonical name was reported.
    NoCanonicalName {
        /// Host that was looked up.
        host: String
    }
}

/// [CanonicalNameResolver] backed by the platform's `getaddrinfo`.
///
/// This requests `AI_CANONNAME`, and reports the first canonical name
/// among the results.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl CanonicalNameResolver for SystemResolver {
    fn lookup_canonical_name(
        &self,
        host: &str
    ) -> Result<String, ResolveError> {
        let hints = AddrInfoHints {
            flags: libc::AI_CANONNAME,
            ..AddrInfoHints::default()
        };
        let infos = getaddrinfo(Some(host), None, Some(hints))
            .map_err(|err| ResolveError::IO { error: err.into() })?;

        for info in infos {
            let info = info.map_err(|err| ResolveError::IO { error: err })?;

            if let Some(name) = info.canonname {
                trace!(target: "canonicalize",
                       "{} has canonical name {}",
                       host, name);

                return Ok(name);
            }
        }

        Err(ResolveError::NoCanonicalName {
            host: host.to_string()
        })
    }
}

impl<R> CanonicalNameResolver for &'_ R
where
    R: CanonicalNameResolver + ?Sized
{
    #[inline]
    fn lookup_canonical_name(
        &self,
        host: &str
    ) -> Result<String, ResolveError> {
        (**self).lookup_canonical_name(host)
    }
}

impl Display for ResolveError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ResolveError::IO { error } => error.fmt(f),
            ResolveError::NoCanonicalName { host } => {
                write!(f, "no canonical name reported for {}", host)
            }
        }
    }
}

impl StdError for ResolveError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ResolveError::IO { error } => Some(error),
            ResolveError::NoCanonicalName { .. } => None
        }
    }
}

#[cfg(test)]
use crate::init;

#[test]
fn test_no_canonical_name_display() {
    let err = ResolveError::NoCanonicalName {
        host: String::from("db-alias")
    };

    assert_eq!("no canonical name reported for db-alias", err.to_string());
}

#[test]
fn test_system_resolver_localhost() {
    init();

    // Not every build host has a resolver that reports canonical
    // names, so only check that any answer is non-empty.
    if let Ok(name) = SystemResolver.lookup_canonical_name("localhost") {
        assert!(!name.is_empty());
    }
}

#[test]
fn test_resolve_error_source() {
    let err = ResolveError::IO {
        error: Error::new(std::io::ErrorKind::NotFound, "no such host")
    };
    let boxed: Box<dyn StdError> = Box::new(err);

    assert!(boxed.source().is_some());
    assert_eq!("no such host", boxed.to_string());
}

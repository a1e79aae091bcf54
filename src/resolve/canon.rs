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


//! Service identity canonicalization.
//!
//! Service identities have the form `<protocol>/<host>:<port>`, for
//! example `MSSQLSvc/db01.example.com:1433`.  Kerberos service
//! tickets are frequently bound only to the canonical name of a
//! host, so a client that addresses a service by an alias must
//! rewrite the identity before requesting a ticket.
//! [canonicalize] performs this rewrite.
//!
//! Canonicalization never fails.  Any anomaly (an identity without a
//! protocol prefix, a missing port, or a failed lookup) causes the
//! original identity to be used as-is.
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;

use log::debug;
use log::trace;
use log::warn;

use crate::resolve::CanonicalNameResolver;

/// Errors that can occur when splitting a `host:port` string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostPortError {
    /// No port delimiter was present.
    MissingPort,
    /// An unbracketed host contained more than one colon.
    TooManyColons,
    /// An opening bracket was not closed.
    MissingBracket,
    /// A bracket appeared where none is allowed.
    UnexpectedBracket
}

/// Split a `host:port` string into its host and port.
///
/// IPv6 literals must be enclosed in brackets (`[::1]:1433`); the
/// brackets are not part of the returned host.  The port is not
/// validated, and may be empty.
pub fn split_host_port(hostport: &str) -> Result<(&str, &str), HostPortError> {
    let (host, port) = match hostport.strip_prefix('[') {
        Some(rest) => {
            let end = rest.find(']').ok_or(HostPortError::MissingBracket)?;
            let port = rest[end + 1..]
                .strip_prefix(':')
                .ok_or(HostPortError::MissingPort)?;

            if port.contains(':') {
                return Err(HostPortError::TooManyColons);
            }

            (&rest[..end], port)
        }
        None => {
            let idx = hostport.rfind(':').ok_or(HostPortError::MissingPort)?;
            let host = &hostport[..idx];

            if host.contains(':') {
                return Err(HostPortError::TooManyColons);
            }

            (host, &hostport[idx + 1..])
        }
    };

    if host.contains('[') ||
        host.contains(']') ||
        port.contains('[') ||
        port.contains(']')
    {
        Err(HostPortError::UnexpectedBracket)
    } else {
        Ok((host, port))
    }
}

/// Combine a host and port into a `host:port` string.
///
/// Hosts containing a colon (IPv6 literals) are enclosed in brackets.
pub fn join_host_port(
    host: &str,
    port: &str
) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Rewrite the host portion of `service` to its canonical DNS name.
///
/// The protocol prefix (including the `/` delimiter) and the port are
/// preserved exactly.  The host is lower-cased for the lookup only,
/// and a trailing root-zone `.` on the resolved name is removed.  If
/// the identity cannot be split, or the lookup fails, `service` is
/// returned unchanged.
pub fn canonicalize<R>(
    resolver: &R,
    service: &str
) -> String
where
    R: CanonicalNameResolver + ?Sized {
    let (prefix, hostport) = match service.find('/') {
        Some(idx) => service.split_at(idx + 1),
        None => {
            trace!(target: "canonicalize",
                   "no protocol prefix in {}, leaving as-is",
                   service);

            return service.to_string();
        }
    };
    let (host, port) = match split_host_port(hostport) {
        Ok(split) => split,
        Err(err) => {
            debug!(target: "canonicalize",
                   "cannot split {} ({}), leaving as-is",
                   hostport, err);

            return service.to_string();
        }
    };
    let key = host.to_lowercase();
    let cname = match resolver.lookup_canonical_name(&key) {
        Ok(cname) => cname,
        Err(err) => {
            warn!(target: "canonicalize",
                  "failed to look up canonical name for {} ({})",
                  key, err);

            return service.to_string();
        }
    };
    let cname = cname.strip_suffix('.').unwrap_or(&cname);

    if cname.is_empty() {
        warn!(target: "canonicalize",
              "empty canonical name for {}, leaving as-is",
              key);

        return service.to_string();
    }

    let out = format!("{}{}", prefix, join_host_port(cname, port));

    debug!(target: "canonicalize",
           "canonicalized {} to {}",
           service, out);

    out
}

impl Display for HostPortError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            HostPortError::MissingPort => write!(f, "missing port"),
            HostPortError::TooManyColons => write!(f, "too many colons"),
            HostPortError::MissingBracket => write!(f, "missing ']'"),
            HostPortError::UnexpectedBracket => write!(f, "unexpected bracket")
        }
    }
}

impl Error for HostPortError {}

#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::io::ErrorKind;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::resolve::ResolveError;

/// Table-driven resolver that records every lookup.
#[cfg(test)]
struct TableResolver {
    names: HashMap<&'static str, &'static str>,
    lookups: RefCell<Vec<String>>
}

#[cfg(test)]
impl TableResolver {
    fn new(names: &[(&'static str, &'static str)]) -> Self {
        TableResolver {
            names: names.iter().copied().collect(),
            lookups: RefCell::new(Vec::new())
        }
    }
}

#[cfg(test)]
impl CanonicalNameResolver for TableResolver {
    fn lookup_canonical_name(
        &self,
        host: &str
    ) -> Result<String, ResolveError> {
        self.lookups.borrow_mut().push(host.to_string());

        match self.names.get(host) {
            Some(name) => Ok(name.to_string()),
            None => Err(ResolveError::IO {
                error: std::io::Error::new(ErrorKind::NotFound, "no such host")
            })
        }
    }
}

#[test]
fn test_split_host_port() {
    assert_eq!(Ok(("db01", "1433")), split_host_port("db01:1433"));
    assert_eq!(Ok(("::1", "1433")), split_host_port("[::1]:1433"));
    assert_eq!(Ok(("db01", "")), split_host_port("db01:"));
    assert_eq!(Err(HostPortError::MissingPort), split_host_port("db01"));
    assert_eq!(Err(HostPortError::MissingPort), split_host_port("[::1]"));
    assert_eq!(Err(HostPortError::TooManyColons), split_host_port("::1:1433"));
    assert_eq!(
        Err(HostPortError::TooManyColons),
        split_host_port("[::1]:1433:5")
    );
    assert_eq!(Err(HostPortError::MissingBracket), split_host_port("[::1:1433"));
    assert_eq!(
        Err(HostPortError::UnexpectedBracket),
        split_host_port("db]01:1433")
    );
}

#[test]
fn test_join_host_port() {
    assert_eq!("db01:1433", join_host_port("db01", "1433"));
    assert_eq!("[fe80::1]:1433", join_host_port("fe80::1", "1433"));
}

#[test]
fn test_canonicalize_alias() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com.")]);

    assert_eq!(
        "MSSQLSvc/db01.example.com:1433",
        canonicalize(&resolver, "MSSQLSvc/db-alias:1433")
    );
}

#[test]
fn test_canonicalize_no_trailing_dot() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com")]);

    assert_eq!(
        "MSSQLSvc/db01.example.com:1433",
        canonicalize(&resolver, "MSSQLSvc/db-alias:1433")
    );
}

#[test]
fn test_canonicalize_lowercases_lookup_only() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com.")]);

    assert_eq!(
        "MSSQLSvc/db01.example.com:1433",
        canonicalize(&resolver, "MSSQLSvc/DB-Alias:1433")
    );
    assert_eq!(vec![String::from("db-alias")], *resolver.lookups.borrow());
}

#[test]
fn test_canonicalize_preserves_port() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com.")]);

    assert_eq!(
        "MSSQLSvc/db01.example.com:instance1",
        canonicalize(&resolver, "MSSQLSvc/db-alias:instance1")
    );
}

#[test]
fn test_canonicalize_keeps_prefix_after_first_slash() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com.")]);

    // Everything up to the first slash is the prefix; the rest cannot
    // be split as host:port.
    assert_eq!(
        "a/b/db-alias:1433",
        canonicalize(&resolver, "a/b/db-alias:1433")
    );
    assert_eq!(vec![String::from("b/db-alias")], *resolver.lookups.borrow());
}

#[test]
fn test_canonicalize_no_slash() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com.")]);

    assert_eq!("db-alias:1433", canonicalize(&resolver, "db-alias:1433"));
    assert!(resolver.lookups.borrow().is_empty());
}

#[test]
fn test_canonicalize_no_port() {
    init();

    let resolver = TableResolver::new(&[("db-alias", "db01.example.com.")]);

    assert_eq!(
        "MSSQLSvc/db-alias",
        canonicalize(&resolver, "MSSQLSvc/db-alias")
    );
    assert!(resolver.lookups.borrow().is_empty());
}

#[test]
fn test_canonicalize_lookup_failure() {
    init();

    let resolver = TableResolver::new(&[]);

    assert_eq!(
        "MSSQLSvc/sql.internal:1433",
        canonicalize(&resolver, "MSSQLSvc/sql.internal:1433")
    );
    assert_eq!(
        vec![String::from("sql.internal")],
        *resolver.lookups.borrow()
    );
}

#[test]
fn test_canonicalize_root_only() {
    init();

    let resolver = TableResolver::new(&[("db-alias", ".")]);

    assert_eq!(
        "MSSQLSvc/db-alias:1433",
        canonicalize(&resolver, "MSSQLSvc/db-alias:1433")
    );
}

#[test]
fn test_canonicalize_ipv6_literal() {
    init();

    let resolver = TableResolver::new(&[("fe80::1", "fe80::1")]);

    assert_eq!(
        "MSSQLSvc/[fe80::1]:1433",
        canonicalize(&resolver, "MSSQLSvc/[FE80::1]:1433")
    );
}

#[test]
fn test_canonicalize_bracketed_extra_colon() {
    init();

    let resolver = TableResolver::new(&[("::1", "loopback.example.com.")]);

    assert_eq!(
        "MSSQLSvc/[::1]:1433:5",
        canonicalize(&resolver, "MSSQLSvc/[::1]:1433:5")
    );
    assert!(resolver.lookups.borrow().is_empty());
}

#[test]
fn test_host_port_error_boxed() {
    let err: Box<dyn Error> =
        Box::new(split_host_port("db01").unwrap_err());

    assert_eq!("missing port", err.to_string());
}

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


#![allow(clippy::redundant_field_names)]
#![allow(clippy::upper_case_acronyms)]

//! SPNEGO/GSSAPI negotiation-based authentication for Constellation.
//!
//! This package provides a pluggable authentication mechanism for
//! clients of services that authenticate connections by exchanging
//! opaque GSSAPI security tokens (for example, database wire
//! protocols that carry SPNEGO blobs in their login handshake).
//!
//! The package does not carry bytes over the wire itself.  A host
//! connection driver asks a [Negotiator](crate::negotiate::factory::Negotiator)
//! whether the mechanism applies to a connection attempt, and if so
//! receives a [NegotiationSession](crate::negotiate::NegotiationSession)
//! which produces the first outbound token and then consumes the
//! peer's replies until the security context is established.
//!
//! # Capabilities
//!
//! The cryptographic engine and DNS resolution are consumed through
//! narrow traits, so the negotiation logic can be driven by any
//! implementation:
//!
//!  - **Security contexts**: [SecurityEngine](crate::negotiate::SecurityEngine)
//!    creates one [SecurityContext](crate::negotiate::SecurityContext)
//!    per connection attempt.  With the `gssapi` feature, an
//!    implementation backed by the system GSSAPI library is provided
//!    in [negotiate::gssapi].
//!
//!  - **Name resolution**: [CanonicalNameResolver](crate::resolve::CanonicalNameResolver)
//!    maps host aliases to their canonical DNS names, so that service
//!    tickets bind to the correct principal.
//!    [SystemResolver](crate::resolve::SystemResolver) uses the
//!    platform resolver.
//!
//! Configuration for the mechanism can be parsed from YAML using
//! `serde_yaml`; see [config].
pub mod config;
pub mod negotiate;
pub mod resolve;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}

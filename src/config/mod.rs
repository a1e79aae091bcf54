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


//! Configuration structures.
//!
//! This module contains definitions of types that supply
//! configuration information.  Each of these types has a YAML format,
//! which can be parsed using `serde_yaml`, thus allowing
//! configurations to be easily loaded from text files.
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Security mechanisms that can be negotiated.
///
/// # YAML Format
///
/// The YAML format is a single string, one of `spnego` or `krb5`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Serialize,
)]
pub enum Mechanism {
    /// SPNEGO (RFC 4178), negotiating an underlying mechanism with
    /// the peer.
    #[serde(rename = "spnego")]
    SPNEGO,
    /// Kerberos 5 directly.
    #[serde(rename = "krb5")]
    Krb5
}

/// Configuration for a [Negotiator](crate::negotiate::factory::Negotiator).
///
/// # YAML Format
///
/// The YAML format has five fields, all of which are optional:
///
///  - `name`: Client principal name.  If absent, the default credential is
///    used.
///
///  - `time-req`: Requested credential lifetime, in seconds.
///
///  - `mechanism`: The [Mechanism] to use.  The default is `spnego`.
///
///  - `mutual`: Whether to request mutual authentication.  The default is
///    `true`.
///
///  - `canonicalize`: Whether to rewrite service identities to use canonical
///    host names.  The default is `true`.
///
/// ## Examples
///
/// The following is an example of the YAML format:
///
/// ```yaml
/// name: sqlclient@EXAMPLE.COM
/// time-req: 3600
/// mechanism: krb5
/// canonicalize: false
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename = "negotiator")]
#[serde(rename_all = "kebab-case")]
pub struct NegotiatorConfig {
    /// Client principal name.
    #[serde(default)]
    name: Option<String>,
    /// Requested credential lifetime, in seconds.
    #[serde(default)]
    time_req: Option<u64>,
    #[serde(default)]
    mechanism: Mechanism,
    #[serde(default = "NegotiatorConfig::default_mutual")]
    mutual: bool,
    #[serde(default = "NegotiatorConfig::default_canonicalize")]
    canonicalize: bool
}

impl Default for Mechanism {
    #[inline]
    fn default() -> Self {
        Mechanism::SPNEGO
    }
}

impl Default for NegotiatorConfig {
    #[inline]
    fn default() -> Self {
        NegotiatorConfig {
            name: None,
            time_req: None,
            mechanism: Mechanism::default(),
            mutual: NegotiatorConfig::default_mutual(),
            canonicalize: NegotiatorConfig::default_canonicalize()
        }
    }
}

impl NegotiatorConfig {
    #[inline]
    fn default_mutual() -> bool {
        true
    }

    #[inline]
    fn default_canonicalize() -> bool {
        true
    }

    /// Create a new `NegotiatorConfig` from its components.
    ///
    /// The arguments of this function correspond to similarly-named
    /// fields in the YAML format.  See documentation for details.
    ///
    /// # Examples
    ///
    /// The following example shows the equivalence between this
    /// function and parsing a YAML configuration:
    ///
    /// ```
    /// # use constellation_negotiate::config::Mechanism;
    /// # use constellation_negotiate::config::NegotiatorConfig;
    /// #
    /// let yaml = concat!("name: sqlclient@EXAMPLE.COM\n",
    ///                    "time-req: 3600\n",
    ///                    "mechanism: krb5\n",
    ///                    "canonicalize: false\n");
    ///
    /// assert_eq!(
    ///     NegotiatorConfig::new(Some(String::from("sqlclient@EXAMPLE.COM")),
    ///                           Some(3600), Mechanism::Krb5, true, false),
    ///     serde_yaml::from_str(yaml).unwrap()
    /// );
    /// ```
    #[inline]
    pub fn new(
        name: Option<String>,
        time_req: Option<u64>,
        mechanism: Mechanism,
        mutual: bool,
        canonicalize: bool
    ) -> Self {
        NegotiatorConfig {
            name: name,
            time_req: time_req,
            mechanism: mechanism,
            mutual: mutual,
            canonicalize: canonicalize
        }
    }

    /// Get the client principal name.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Get the requested credential lifetime.
    #[inline]
    pub fn time_req(&self) -> Option<Duration> {
        self.time_req.map(Duration::from_secs)
    }

    /// Get the mechanism to negotiate.
    #[inline]
    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Whether to request mutual authentication.
    #[inline]
    pub fn mutual(&self) -> bool {
        self.mutual
    }

    /// Whether to canonicalize service identities.
    #[inline]
    pub fn canonicalize(&self) -> bool {
        self.canonicalize
    }

    /// Decompose this into its components.
    #[inline]
    pub fn take(
        self
    ) -> (Option<String>, Option<Duration>, Mechanism, bool, bool) {
        (
            self.name,
            self.time_req.map(Duration::from_secs),
            self.mechanism,
            self.mutual,
            self.canonicalize
        )
    }
}

#[test]
fn test_deserialize_empty_cfg() {
    let yaml = concat!("{}");
    let expected = NegotiatorConfig::default();
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_spnego_cfg() {
    let yaml = concat!("name: svc-reports@CORP.EXAMPLE.COM\n",
                       "mechanism: spnego\n",
                       "mutual: false");
    let expected = NegotiatorConfig {
        name: Some(String::from("svc-reports@CORP.EXAMPLE.COM")),
        time_req: None,
        mechanism: Mechanism::SPNEGO,
        mutual: false,
        canonicalize: true
    };
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_time_req_cfg() {
    let yaml = concat!("time-req: 600\n", "mechanism: krb5");
    let actual: NegotiatorConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(Some(Duration::from_secs(600)), actual.time_req());
    assert_eq!(Mechanism::Krb5, actual.mechanism());
    assert!(actual.canonicalize());
    assert!(actual.mutual());
}

#[test]
fn test_deserialize_bad_mechanism_cfg() {
    let yaml = concat!("mechanism: ntlm");
    let actual: Result<NegotiatorConfig, _> = serde_yaml::from_str(yaml);

    assert!(actual.is_err())
}

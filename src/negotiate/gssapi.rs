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


//! GSSAPI-backed security contexts.
//!
//! This module provides [GSSAPIEngine], a [SecurityEngine] that uses
//! the system GSSAPI library (via `libgssapi`) to establish client
//! contexts with SPNEGO or Kerberos 5.  Credentials are taken from
//! the ambient credential cache (for example, one populated by
//! `kinit`); this module never acquires tickets with a password.
//!
//! Following the behavior of `libgssapi`, credential acquisition
//! happens when a context is created, but any failure is held back
//! and reported from [init_token](SecurityContext::init_token), so
//! that selecting the mechanism never fails.
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::mem::replace;
use std::time::Duration;

use libgssapi::context::ClientCtx;
use libgssapi::context::CtxFlags;
use libgssapi::context::SecurityContext as GSSAPISecurityContext;
use libgssapi::credential::Cred;
use libgssapi::credential::CredUsage;
#[cfg(test)]
use libgssapi::error::MajorFlags;
use libgssapi::name::Name;
use libgssapi::oid::Oid;
use libgssapi::oid::OidSet;
use libgssapi::oid::GSS_MECH_KRB5;
use libgssapi::oid::GSS_NT_KRB5_PRINCIPAL;
use log::debug;
use log::trace;
use log::warn;

use crate::config::Mechanism;
use crate::config::NegotiatorConfig;
use crate::negotiate::factory::Negotiator;
use crate::negotiate::SecurityContext;
use crate::negotiate::SecurityEngine;
use crate::negotiate::Status;
use crate::negotiate::Verification;
use crate::resolve::SystemResolver;

/// SPNEGO mechanism (1.3.6.1.5.5.2).
static GSS_MECH_SPNEGO: Oid =
    Oid::from_slice(&[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02]);

/// Tag of the generic GSSAPI token framing (`[APPLICATION 0]`).
const GSS_TOKEN_TAG: u8 = 0x60;
/// Tag of an SPNEGO `NegTokenResp`.
const SPNEGO_RESPONSE_TAG: u8 = 0xa1;

/// GSSAPI major status for a missing or invalid context.
const STATUS_NO_CONTEXT: u32 = 0x0008_0000;

/// Errors from GSSAPI contexts.
#[derive(Debug)]
pub enum GSSAPIContextError {
    /// GSSAPI error.
    GSSAPI {
        /// GSSAPI error.
        error: libgssapi::error::Error
    },
    /// Context initialization produced no token.
    NoToken,
    /// A peer token was malformed.
    Malformed {
        /// What was wrong with the token.
        reason: &'static str
    },
    /// The context failed previously.
    Failed,
    /// The context was released.
    Released
}

/// [SecurityEngine] that creates GSSAPI client contexts.
#[derive(Clone, Debug)]
pub struct GSSAPIEngine {
    /// Client credential name.
    name: Option<String>,
    time_req: Option<Duration>,
    mechanism: Mechanism,
    flags: CtxFlags,
    /// Optional GSSAPI bindings.
    bindings: Option<Vec<u8>>
}

enum GSSAPIContextState {
    Ready { ctx: ClientCtx },
    /// Context creation failed; the error is reported on first use.
    Deferred { error: libgssapi::error::Error },
    Failed,
    Released
}

/// GSSAPI client context created by a [GSSAPIEngine].
pub struct GSSAPIContext {
    state: GSSAPIContextState,
    /// Optional GSSAPI bindings.
    bindings: Option<Vec<u8>>
}

/// Peer token that passed framing checks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GSSAPIToken {
    buf: Vec<u8>
}

impl Mechanism {
    #[inline]
    fn oid(&self) -> &'static Oid {
        match self {
            Mechanism::SPNEGO => &GSS_MECH_SPNEGO,
            Mechanism::Krb5 => &GSS_MECH_KRB5
        }
    }
}

impl GSSAPIEngine {
    /// Create a `GSSAPIEngine` from its components.
    ///
    /// If `name` is `None`, the default credential is used.
    #[inline]
    pub fn new(
        name: Option<String>,
        time_req: Option<Duration>,
        mechanism: Mechanism,
        mutual: bool,
        bindings: Option<Vec<u8>>
    ) -> Self {
        let flags = if mutual {
            CtxFlags::GSS_C_MUTUAL_FLAG | CtxFlags::GSS_C_REPLAY_FLAG
        } else {
            CtxFlags::GSS_C_REPLAY_FLAG
        };

        GSSAPIEngine {
            name: name,
            time_req: time_req,
            mechanism: mechanism,
            flags: flags,
            bindings: bindings
        }
    }

    /// Create a `GSSAPIEngine` from a [NegotiatorConfig].
    #[inline]
    pub fn from_config(
        config: NegotiatorConfig,
        bindings: Option<Vec<u8>>
    ) -> Self {
        let (name, time_req, mechanism, mutual, _) = config.take();

        GSSAPIEngine::new(name, time_req, mechanism, mutual, bindings)
    }

    /// Get the mechanism being negotiated.
    #[inline]
    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Get the context flags requested.
    #[inline]
    pub fn flags(&self) -> CtxFlags {
        self.flags
    }

    /// Prepare a GSSAPI context.
    fn prepare_gssapi(
        &self,
        service: &str
    ) -> Result<ClientCtx, libgssapi::error::Error> {
        // Prepare the mechanisms.
        let mech = self.mechanism.oid();
        let mut mechs = OidSet::new()?;

        mechs.add(mech)?;

        if self.mechanism == Mechanism::SPNEGO {
            mechs.add(&GSS_MECH_KRB5)?;
        }

        // Prepare the principal name.
        let cred = match &self.name {
            // A principal name was provided.
            Some(name) => {
                let name =
                    Name::new(name.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))?;

                Cred::acquire(
                    Some(&name),
                    self.time_req,
                    CredUsage::Initiate,
                    Some(&mechs)
                )?
            }
            // No principal name was provided.
            None => Cred::acquire(
                None,
                self.time_req,
                CredUsage::Initiate,
                Some(&mechs)
            )?
        };

        // Prepare the service name.
        let service =
            Name::new(service.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))?;
        let service = service.canonicalize(Some(&GSS_MECH_KRB5))?;

        Ok(ClientCtx::new(Some(cred), service, self.flags, Some(mech)))
    }
}

impl SecurityEngine for GSSAPIEngine {
    type Context = GSSAPIContext;

    fn new_context(
        &self,
        service: &str
    ) -> GSSAPIContext {
        let state = match self.prepare_gssapi(service) {
            Ok(ctx) => {
                trace!(target: "negotiate-gssapi",
                       "prepared GSSAPI context for {}",
                       service);

                GSSAPIContextState::Ready { ctx: ctx }
            }
            Err(err) => {
                warn!(target: "negotiate-gssapi",
                      "failed to prepare GSSAPI context for {} ({})",
                      service, err);

                GSSAPIContextState::Deferred { error: err }
            }
        };

        GSSAPIContext {
            state: state,
            bindings: self.bindings.clone()
        }
    }
}

impl Negotiator<GSSAPIEngine, SystemResolver> {
    /// Create a `Negotiator` using GSSAPI and the system resolver.
    #[inline]
    pub fn from_config(
        config: NegotiatorConfig,
        bindings: Option<Vec<u8>>
    ) -> Self {
        let canonicalize = config.canonicalize();
        let engine = GSSAPIEngine::from_config(config, bindings);

        Negotiator::new(engine, SystemResolver, canonicalize)
    }
}

/// Check the outer DER framing of a peer token.
///
/// Peer tokens are either wrapped in the generic GSSAPI framing or
/// are SPNEGO `NegTokenResp`s.  In both cases the outer length must
/// cover exactly the rest of the token.
fn check_frame(bytes: &[u8]) -> Result<(), GSSAPIContextError> {
    let (tag, rest) = bytes.split_first().ok_or(GSSAPIContextError::Malformed {
        reason: "empty token"
    })?;

    if *tag != GSS_TOKEN_TAG && *tag != SPNEGO_RESPONSE_TAG {
        return Err(GSSAPIContextError::Malformed {
            reason: "unexpected token tag"
        });
    }

    let (len, rest) = rest.split_first().ok_or(GSSAPIContextError::Malformed {
        reason: "truncated length"
    })?;
    let (len, body) = if *len < 0x80 {
        (*len as usize, rest)
    } else {
        let nbytes = (*len & 0x7f) as usize;

        if nbytes == 0 || nbytes > 4 || rest.len() < nbytes {
            return Err(GSSAPIContextError::Malformed {
                reason: "bad length encoding"
            });
        }

        let len = rest[..nbytes]
            .iter()
            .fold(0, |acc, b| (acc << 8) | (*b as usize));

        (len, &rest[nbytes..])
    };

    if body.len() == len {
        Ok(())
    } else {
        Err(GSSAPIContextError::Malformed {
            reason: "length does not match token size"
        })
    }
}

impl SecurityContext for GSSAPIContext {
    type Error = GSSAPIContextError;
    type Token = GSSAPIToken;

    fn init_token(&mut self) -> Result<Vec<u8>, GSSAPIContextError> {
        if let GSSAPIContextState::Deferred { .. } = self.state {
            if let GSSAPIContextState::Deferred { error } =
                replace(&mut self.state, GSSAPIContextState::Failed)
            {
                return Err(GSSAPIContextError::GSSAPI { error: error });
            }
        }

        let bindings = self.bindings.as_deref();

        match &mut self.state {
            GSSAPIContextState::Ready { ctx } => {
                debug!(target: "negotiate-gssapi",
                       "beginning GSSAPI authentication");

                let token = ctx
                    .step(None, bindings)
                    .map_err(|err| GSSAPIContextError::GSSAPI { error: err })?
                    .ok_or(GSSAPIContextError::NoToken)?;

                Ok(token.to_vec())
            }
            GSSAPIContextState::Deferred { .. } |
            GSSAPIContextState::Failed => Err(GSSAPIContextError::Failed),
            GSSAPIContextState::Released => Err(GSSAPIContextError::Released)
        }
    }

    fn unmarshal(
        &mut self,
        bytes: &[u8]
    ) -> Result<GSSAPIToken, GSSAPIContextError> {
        if let GSSAPIContextState::Released = self.state {
            return Err(GSSAPIContextError::Released);
        }

        check_frame(bytes)?;

        Ok(GSSAPIToken {
            buf: bytes.to_vec()
        })
    }

    fn verify(
        &mut self,
        token: GSSAPIToken
    ) -> Verification {
        let bindings = self.bindings.as_deref();

        match &mut self.state {
            GSSAPIContextState::Ready { ctx } => {
                match ctx.step(Some(&token.buf), bindings) {
                    Ok(reply) if ctx.is_complete() => {
                        if let Some(reply) = reply {
                            warn!(target: "negotiate-gssapi",
                                  concat!("context complete, discarding ",
                                          "final token ({} bytes)"),
                                  reply.len());
                        }

                        Verification::Complete
                    }
                    Ok(reply) => {
                        trace!(target: "negotiate-gssapi",
                               "continuing GSSAPI authentication");

                        Verification::ContinueNeeded {
                            reply: reply.map(|reply| reply.to_vec())
                        }
                    }
                    Err(err) => Verification::Failed {
                        status: Status::new(err.major.bits(), err.to_string())
                    }
                }
            }
            _ => Verification::Failed {
                status: Status::new(
                    STATUS_NO_CONTEXT,
                    String::from("no security context")
                )
            }
        }
    }

    #[inline]
    fn release(&mut self) {
        trace!(target: "negotiate-gssapi",
               "releasing GSSAPI context");

        self.state = GSSAPIContextState::Released
    }
}

impl Display for GSSAPIContextError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            GSSAPIContextError::GSSAPI { error } => error.fmt(f),
            GSSAPIContextError::NoToken => {
                write!(f, "context initialization produced no token")
            }
            GSSAPIContextError::Malformed { reason } => {
                write!(f, "malformed token: {}", reason)
            }
            GSSAPIContextError::Failed => write!(f, "context failed"),
            GSSAPIContextError::Released => write!(f, "context released")
        }
    }
}

impl Error for GSSAPIContextError {}

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::negotiate::NegotiateError;
#[cfg(test)]
use crate::negotiate::NegotiationSession;
#[cfg(test)]
use crate::negotiate::SessionState;

#[cfg(test)]
fn released() -> GSSAPIContext {
    GSSAPIContext {
        state: GSSAPIContextState::Released,
        bindings: None
    }
}

#[test]
fn test_check_frame() {
    assert!(check_frame(&[0x60, 0x02, 0x06, 0x00]).is_ok());
    assert!(check_frame(&[0xa1, 0x00]).is_ok());

    let mut long = vec![0xa1, 0x81, 0x80];

    long.extend(vec![0; 0x80]);

    assert!(check_frame(&long).is_ok());
}

#[test]
fn test_check_frame_malformed() {
    let cases: [(&[u8], &str); 6] = [
        (&[], "empty token"),
        (&[0x30, 0x00], "unexpected token tag"),
        (&[0x60], "truncated length"),
        (&[0x60, 0x80], "bad length encoding"),
        (&[0x60, 0x82, 0x01], "bad length encoding"),
        (&[0x60, 0x03, 0x00], "length does not match token size")
    ];

    for (bytes, expected) in cases.iter() {
        match check_frame(bytes) {
            Err(GSSAPIContextError::Malformed { reason }) => {
                assert_eq!(*expected, reason)
            }
            other => panic!("unexpected result {:?}", other)
        }
    }
}

#[test]
fn test_engine_flags() {
    let mutual = GSSAPIEngine::new(None, None, Mechanism::SPNEGO, true, None);
    let plain = GSSAPIEngine::new(None, None, Mechanism::Krb5, false, None);

    assert!(mutual.flags().contains(CtxFlags::GSS_C_MUTUAL_FLAG));
    assert!(!plain.flags().contains(CtxFlags::GSS_C_MUTUAL_FLAG));
    assert_eq!(Mechanism::Krb5, plain.mechanism());
}

#[test]
fn test_engine_from_config() {
    let config: NegotiatorConfig =
        serde_yaml::from_str(concat!("mechanism: krb5\n", "mutual: false"))
            .unwrap();
    let engine = GSSAPIEngine::from_config(config, None);

    assert_eq!(Mechanism::Krb5, engine.mechanism());
    assert!(!engine.flags().contains(CtxFlags::GSS_C_MUTUAL_FLAG));
}

#[test]
fn test_negotiator_from_config() {
    let config: NegotiatorConfig =
        serde_yaml::from_str(concat!("canonicalize: false")).unwrap();
    let negotiator = Negotiator::from_config(config, None);

    assert!(!negotiator.canonicalize_enabled());
    assert!(negotiator.select("sa", "MSSQLSvc/db01:1433").is_none());
}

#[test]
fn test_released_context() {
    init();

    let mut ctx = released();

    assert!(matches!(ctx.init_token(), Err(GSSAPIContextError::Released)));
    assert!(matches!(
        ctx.unmarshal(&[0xa1, 0x00]),
        Err(GSSAPIContextError::Released)
    ));
    assert!(matches!(
        ctx.verify(GSSAPIToken { buf: vec![0xa1, 0x00] }),
        Verification::Failed { .. }
    ));

    ctx.release();
}

#[test]
fn test_deferred_context() {
    init();

    let mut ctx = GSSAPIContext {
        state: GSSAPIContextState::Deferred {
            error: libgssapi::error::Error {
                major: MajorFlags::GSS_S_NO_CRED,
                minor: 0
            }
        },
        bindings: None
    };

    match ctx.init_token() {
        Err(GSSAPIContextError::GSSAPI { error }) => {
            assert!(error.major.contains(MajorFlags::GSS_S_NO_CRED))
        }
        other => panic!("unexpected result {:?}", other)
    }

    assert!(matches!(ctx.init_token(), Err(GSSAPIContextError::Failed)));
    assert!(matches!(
        ctx.verify(GSSAPIToken { buf: vec![0xa1, 0x00] }),
        Verification::Failed { .. }
    ));

    let err: Box<dyn Error> = Box::new(GSSAPIContextError::Failed);

    assert_eq!("context failed", err.to_string());
}

#[test]
fn test_deferred_context_in_session() {
    init();

    let ctx = GSSAPIContext {
        state: GSSAPIContextState::Deferred {
            error: libgssapi::error::Error {
                major: MajorFlags::GSS_S_NO_CRED,
                minor: 0
            }
        },
        bindings: None
    };
    let mut session = NegotiationSession::new(
        ctx,
        String::from("MSSQLSvc/db01.example.com:1433")
    );

    assert!(matches!(
        session.initial_bytes(),
        Err(NegotiateError::Init {
            error: GSSAPIContextError::GSSAPI { .. }
        })
    ));
    assert_eq!(SessionState::Failed, session.state());
}

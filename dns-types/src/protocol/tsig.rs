//! TSIG (RFC 2845) message authentication, as an interface the rest of
//! the crate depends on but does not implement: the wire framing for a
//! `TSIG` pseudo-RR lives on `RecordTypeWithData::TSIG`, but computing
//! and checking the MAC itself requires a keyed hash this crate does
//! not carry a dependency for.  A caller wires up a `TsigSigner` (HMAC-
//! MD5, HMAC-SHA256, ...) and the responder calls through it at the
//! boundaries named in its own docs.

use bytes::Bytes;

use crate::protocol::types::DomainName;

/// A configured TSIG key: the name it's selected by, the algorithm it
/// signs with, and the shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigKey {
    pub name: DomainName,
    pub algorithm: DomainName,
    pub secret: Bytes,
}

/// Default fudge window (RFC 2845 section 4.5): how far apart the
/// signer's and verifier's clocks are allowed to be.
pub const DEFAULT_FUDGE_SECONDS: u16 = 300;

/// The minimum MAC length this crate will accept, as a fraction of the
/// full digest length: half, except for MD5 where it's a fixed 10
/// octets (RFC 2845 section 4.5.3).
pub fn min_mac_len(full_digest_len: usize, is_md5: bool) -> usize {
    if is_md5 {
        10
    } else {
        full_digest_len / 2
    }
}

/// Why a TSIG-protected exchange failed, mapped to the RCODE/extended
/// RCODE the responder puts in its reply (RFC 2845 section 4.6).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TsigError {
    /// No key by that name is configured.
    BadKey,
    /// The MAC did not verify.
    BadSig,
    /// `time_signed` is outside the fudge window.
    BadTime,
}

impl TsigError {
    /// The TSIG extended RCODE value (RFC 2845 section 2.3), carried
    /// in the TSIG RR's own `error` field rather than the message
    /// header's 4-bit RCODE.
    pub fn extended_rcode(&self) -> u16 {
        match self {
            TsigError::BadSig => 16,
            TsigError::BadKey => 17,
            TsigError::BadTime => 18,
        }
    }
}

impl std::fmt::Display for TsigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TsigError::BadKey => write!(f, "no TSIG key of that name"),
            TsigError::BadSig => write!(f, "TSIG signature verification failed"),
            TsigError::BadTime => write!(f, "TSIG timestamp outside the fudge window"),
        }
    }
}

impl std::error::Error for TsigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A pluggable TSIG MAC algorithm.  Implementations own the actual
/// HMAC computation; this crate only defines when they get called and
/// what happens to the result.
pub trait TsigSigner {
    /// Compute the MAC over a rendered message, keyed by `key`, and
    /// optionally chained from the MAC of a prior message in the same
    /// TCP-continued exchange (RFC 2845 section 4.4).
    fn generate(&self, key: &TsigKey, rendered: &[u8], prior_mac: Option<&[u8]>) -> Bytes;

    /// Check a received MAC against the bytes it was supposedly
    /// computed over.
    fn verify(
        &self,
        key: &TsigKey,
        received: &[u8],
        mac: &[u8],
        prior_mac: Option<&[u8]>,
    ) -> Result<(), TsigError>;
}

/// A set of configured keys, looked up by name.
pub trait TsigKeyring {
    fn key(&self, name: &DomainName) -> Option<&TsigKey>;
}

impl TsigKeyring for Vec<TsigKey> {
    fn key(&self, name: &DomainName) -> Option<&TsigKey> {
        self.iter().find(|k| &k.name == name)
    }
}

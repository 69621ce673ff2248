//! The one concrete [`TsigSigner`] this binary wires up: HMAC-SHA256,
//! the algorithm `config::parse_key` assumes when a key line doesn't
//! name one explicitly.
//!
//! `dns_types::protocol::tsig` deliberately stops at the trait: it has
//! no dependency on a keyed-hash crate.  This is where that dependency
//! lives instead.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use dns_types::protocol::tsig::{TsigError, TsigKey, TsigSigner};

type HmacSha256 = Hmac<Sha256>;

pub struct HmacSha256Signer;

fn algorithm_name(key: &TsigKey) -> String {
    key.algorithm.to_dotted_string()
}

impl TsigSigner for HmacSha256Signer {
    fn generate(&self, key: &TsigKey, rendered: &[u8], prior_mac: Option<&[u8]>) -> Bytes {
        let Ok(mut mac) = HmacSha256::new_from_slice(&key.secret) else {
            return Bytes::new();
        };
        if let Some(prior) = prior_mac {
            mac.update(prior);
        }
        mac.update(rendered);
        Bytes::copy_from_slice(&mac.finalize().into_bytes())
    }

    fn verify(
        &self,
        key: &TsigKey,
        received: &[u8],
        mac: &[u8],
        prior_mac: Option<&[u8]>,
    ) -> Result<(), TsigError> {
        if algorithm_name(key) != "hmac-sha256." {
            return Err(TsigError::BadKey);
        }
        let Ok(mut verifier) = HmacSha256::new_from_slice(&key.secret) else {
            return Err(TsigError::BadKey);
        };
        if let Some(prior) = prior_mac {
            verifier.update(prior);
        }
        verifier.update(received);
        verifier.verify_slice(mac).map_err(|_| TsigError::BadSig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;

    fn key() -> TsigKey {
        TsigKey {
            name: domain("key1."),
            algorithm: domain("hmac-sha256."),
            secret: Bytes::from_static(b"super-secret-key"),
        }
    }

    #[test]
    fn generate_then_verify_round_trips() {
        let signer = HmacSha256Signer;
        let message = b"a rendered dns message";
        let mac = signer.generate(&key(), message, None);
        assert!(signer.verify(&key(), message, &mac, None).is_ok());
    }

    #[test]
    fn tampered_message_fails_to_verify() {
        let signer = HmacSha256Signer;
        let mac = signer.generate(&key(), b"original", None);
        assert!(signer.verify(&key(), b"tampered!", &mac, None).is_err());
    }
}

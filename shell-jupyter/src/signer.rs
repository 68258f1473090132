//! Message signing
//!
//! Jupyter signs the four JSON parts of every message (header, parent
//! header, metadata, content) with a keyed HMAC and sends the digest as
//! lowercase hex. An empty key disables signing: the signature is the empty
//! string on both sides.

use crate::error::{KernelError, Result};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// A keyed MAC prototype, cloned fresh for every signature
#[derive(Clone)]
enum Keyed {
    Disabled,
    Sha256(HmacSha256),
    Sha512(HmacSha512),
}

/// Signs and verifies message parts with the connection key
#[derive(Clone)]
pub struct Signer {
    keyed: Keyed,
}

impl Signer {
    /// Build a signer from the connection file's `key` and `signature_scheme`
    pub fn new(key: &str, scheme: &str) -> Result<Self> {
        if key.is_empty() {
            return Ok(Self {
                keyed: Keyed::Disabled,
            });
        }

        let invalid = |_| KernelError::Config("invalid HMAC key".to_string());
        let keyed = match scheme {
            "hmac-sha256" => {
                Keyed::Sha256(HmacSha256::new_from_slice(key.as_bytes()).map_err(invalid)?)
            }
            "hmac-sha512" => {
                Keyed::Sha512(HmacSha512::new_from_slice(key.as_bytes()).map_err(invalid)?)
            }
            other => return Err(KernelError::UnsupportedScheme(other.to_string())),
        };

        Ok(Self { keyed })
    }

    /// Whether messages are actually signed
    pub fn is_enabled(&self) -> bool {
        !matches!(self.keyed, Keyed::Disabled)
    }

    /// Sign the parts in order, returning a lowercase hex digest
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.keyed {
            Keyed::Disabled => String::new(),
            Keyed::Sha256(proto) => {
                let mut mac = proto.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            Keyed::Sha512(proto) => {
                let mut mac = proto.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }

    /// Check a received signature against the parts it claims to cover
    pub fn verify(&self, signature: &str, parts: &[&[u8]]) -> bool {
        let expected = self.sign(parts);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.keyed {
            Keyed::Disabled => "disabled",
            Keyed::Sha256(_) => "hmac-sha256",
            Keyed::Sha512(_) => "hmac-sha512",
        };
        f.debug_struct("Signer").field("scheme", &scheme).finish()
    }
}

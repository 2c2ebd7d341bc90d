//! DKIM signing for outbound mail.

use mail_auth::common::crypto::{RsaKey, Sha256};
use mail_auth::common::headers::HeaderWriter;
use mail_auth::dkim::{DkimSigner, Done};
use tracing::warn;

use crate::error::DeliveryError;

/// The header set covered by the signature. Relaxed canonicalization for
/// header and body is the signer's default.
const SIGNED_HEADERS: [&str; 13] = [
    "From",
    "To",
    "Cc",
    "Reply-To",
    "Subject",
    "Date",
    "Message-ID",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "In-Reply-To",
    "References",
    "List-Unsubscribe",
];

/// A ready-to-use signer for one sender domain.
pub(crate) struct DkimSealer {
    signer: DkimSigner<RsaKey<Sha256>, Done>,
    domain: String,
}

impl DkimSealer {
    /// Build a sealer from a PKCS#8 PEM RSA private key.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Config`] when the key does not parse;
    /// a broken sender identity is fatal at init.
    pub fn new(domain: &str, selector: &str, pem: &str) -> Result<Self, DeliveryError> {
        let key = RsaKey::<Sha256>::from_pkcs8_pem(pem).map_err(|error| {
            DeliveryError::Config(format!("can't parse DKIM key for {domain}: {error}"))
        })?;
        Ok(Self {
            signer: DkimSigner::from_key(key)
                .domain(domain.to_string())
                .selector(selector.to_string())
                .headers(SIGNED_HEADERS),
            domain: domain.to_string(),
        })
    }

    /// Compute the `DKIM-Signature` header for a message, ready to prepend.
    pub fn seal(&self, body: &str) -> Option<String> {
        match self.signer.sign(body.as_bytes()) {
            Ok(signature) => {
                let mut header = signature.to_header();
                if !header.ends_with('\n') {
                    header.push_str("\r\n");
                }
                Some(header)
            }
            Err(error) => {
                warn!(hostname = %self.domain, error = %error, "can't sign message");
                None
            }
        }
    }
}

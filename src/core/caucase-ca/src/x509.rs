//! PEM and X.509 parsing helpers.
//!
//! Thin wrappers over `x509-parser` returning owned values, so that callers
//! never hold borrowed ASN.1 structures across await points.

use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;
use x509_parser::revocation_list::CertificateRevocationList;

use caucase_crypto::PublicKey;

use crate::error::CaError;

/// PEM label of a certificate.
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";
/// PEM label of a certificate signing request.
pub const CSR_LABEL: &str = "CERTIFICATE REQUEST";
/// PEM label of a revocation list.
pub const CRL_LABEL: &str = "X509 CRL";

/// Fields of a parsed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// DER encoding.
    pub der: Vec<u8>,
    /// Serial number.
    pub serial: u64,
    /// Start of validity, Unix seconds.
    pub not_before: i64,
    /// End of validity, Unix seconds.
    pub not_after: i64,
    /// DER `SubjectPublicKeyInfo`.
    pub spki_der: Vec<u8>,
    /// Subject common name, if any.
    pub common_name: Option<String>,
}

impl CertificateInfo {
    /// The certificate's public key.
    pub fn public_key(&self) -> Result<PublicKey, CaError> {
        PublicKey::from_spki_der(&self.spki_der).map_err(|e| CaError::Decode(e.to_string()))
    }
}

/// Fields of a parsed, signature-checked CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    /// DER `SubjectPublicKeyInfo`.
    pub spki_der: Vec<u8>,
    /// Requested subject common name, if any.
    pub common_name: Option<String>,
}

impl CsrInfo {
    /// The requested public key.
    pub fn public_key(&self) -> Result<PublicKey, CaError> {
        PublicKey::from_spki_der(&self.spki_der).map_err(|e| CaError::Decode(e.to_string()))
    }
}

fn decode<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> CaError {
    move |e| CaError::Decode(format!("invalid {what}: {e}"))
}

/// Extracts the DER contents of a PEM block carrying `label`.
pub fn pem_contents(pem: &str, label: &str) -> Result<Vec<u8>, CaError> {
    let (_, block) = parse_x509_pem(pem.as_bytes()).map_err(decode("PEM"))?;
    if block.label != label {
        return Err(CaError::Decode(format!(
            "expected a {label} PEM block, got {}",
            block.label
        )));
    }
    Ok(block.contents)
}

/// Converts a DER-encoded INTEGER body to a serial number.
pub fn serial_from_bytes(bytes: &[u8]) -> Result<u64, CaError> {
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(start) => &bytes[start..],
        None => &[],
    };
    if significant.len() > 8 {
        return Err(CaError::Decode("serial number does not fit 64 bits".into()));
    }
    Ok(significant
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Serial number in the form rcgen expects: big endian, minimal length.
pub fn serial_number(serial: u64) -> rcgen::SerialNumber {
    let bytes = serial.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    rcgen::SerialNumber::from_slice(&bytes[start..])
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
}

/// Parses a PEM certificate.
pub fn parse_certificate(pem: &str) -> Result<CertificateInfo, CaError> {
    certificate_info(pem_contents(pem, CERTIFICATE_LABEL)?)
}

/// Parses a DER certificate.
pub fn certificate_info(der: Vec<u8>) -> Result<CertificateInfo, CaError> {
    let (serial, not_before, not_after, spki_der, common_name) = {
        let (_, cert) = X509Certificate::from_der(&der).map_err(decode("certificate"))?;
        (
            serial_from_bytes(cert.raw_serial())?,
            cert.validity().not_before.timestamp(),
            cert.validity().not_after.timestamp(),
            cert.public_key().raw.to_vec(),
            common_name(cert.subject()),
        )
    };
    Ok(CertificateInfo {
        der,
        serial,
        not_before,
        not_after,
        spki_der,
        common_name,
    })
}

/// Parses a PEM CSR and checks its self-signature.
///
/// Only P-256 keys are accepted: every certificate holder must be able to
/// receive backup envelopes.
pub fn parse_csr(pem: &str) -> Result<CsrInfo, CaError> {
    let der = pem_contents(pem, CSR_LABEL)?;
    let (_, csr) = X509CertificationRequest::from_der(&der).map_err(decode("CSR"))?;
    csr.verify_signature()
        .map_err(|_| CaError::Decode("CSR signature does not verify".into()))?;

    let info = &csr.certification_request_info;
    let spki_der = info.subject_pki.raw.to_vec();
    PublicKey::from_spki_der(&spki_der).map_err(|e| CaError::Decode(e.to_string()))?;

    Ok(CsrInfo {
        spki_der,
        common_name: common_name(&info.subject),
    })
}

/// Whether `cert_der` carries a valid signature by the holder of `issuer_der`.
pub fn is_signed_by(cert_der: &[u8], issuer_der: &[u8]) -> bool {
    let (Ok((_, cert)), Ok((_, issuer))) = (
        X509Certificate::from_der(cert_der),
        X509Certificate::from_der(issuer_der),
    ) else {
        return false;
    };
    cert.issuer().as_raw() == issuer.subject().as_raw()
        && cert.verify_signature(Some(issuer.public_key())).is_ok()
}

/// Serial numbers listed in a PEM CRL.
pub fn crl_serials(pem: &str) -> Result<Vec<u64>, CaError> {
    let der = pem_contents(pem, CRL_LABEL)?;
    let (_, crl) = CertificateRevocationList::from_der(&der).map_err(decode("CRL"))?;
    crl.iter_revoked_certificates()
        .map(|revoked| serial_from_bytes(revoked.raw_serial()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_round_trip_through_der_integer() {
        for serial in [1u64, 127, 128, 255, 256, 0x8000_0000, u64::MAX] {
            let encoded = serial_number(serial);
            // DER integers of values with the top bit set get a 0x00 prefix.
            let mut der_body = vec![0u8];
            der_body.extend_from_slice(encoded.as_ref());
            assert_eq!(serial_from_bytes(&der_body).unwrap(), serial);
            assert_eq!(serial_from_bytes(encoded.as_ref()).unwrap(), serial);
        }
    }

    #[test]
    fn test_oversized_serial_rejected() {
        assert!(serial_from_bytes(&[1; 9]).is_err());
    }

    #[test]
    fn test_wrong_pem_label_rejected() {
        let pem = "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n";
        assert!(matches!(
            pem_contents(pem, CERTIFICATE_LABEL),
            Err(CaError::Decode(_))
        ));
    }

    #[test]
    fn test_garbage_csr_rejected() {
        assert!(matches!(parse_csr("foo"), Err(CaError::Decode(_))));
    }
}

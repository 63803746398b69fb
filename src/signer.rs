use async_trait::async_trait;
use der::Tag;
use der::asn1::{Any, ObjectIdentifier};
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use x509_cert::spki::AlgorithmIdentifierOwned;

/// Error type for CRL signing
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signing key does not support {0}")]
    KeyMismatch(SigningAlgorithm),

    #[error("Failed to read signing key: {0}")]
    Io(#[from] std::io::Error),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),

    #[error("Signing unavailable: {0}")]
    Unavailable(String),
}

const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const SHA384_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const SHA512_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");
const SHA256_WITH_EC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const SHA384_WITH_EC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const SHA512_WITH_EC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");

/// CRL signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SigningAlgorithm {
    #[default]
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    Sha256WithEc,
    Sha384WithEc,
    Sha512WithEc,
}

impl SigningAlgorithm {
    pub fn all() -> &'static [SigningAlgorithm] {
        &[
            Self::Sha256WithRsa,
            Self::Sha384WithRsa,
            Self::Sha512WithRsa,
            Self::Sha256WithEc,
            Self::Sha384WithEc,
            Self::Sha512WithEc,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256WithRsa => "SHA256withRSA",
            Self::Sha384WithRsa => "SHA384withRSA",
            Self::Sha512WithRsa => "SHA512withRSA",
            Self::Sha256WithEc => "SHA256withEC",
            Self::Sha384WithEc => "SHA384withEC",
            Self::Sha512WithEc => "SHA512withEC",
        }
    }

    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha256WithRsa => SHA256_WITH_RSA,
            Self::Sha384WithRsa => SHA384_WITH_RSA,
            Self::Sha512WithRsa => SHA512_WITH_RSA,
            Self::Sha256WithEc => SHA256_WITH_EC,
            Self::Sha384WithEc => SHA384_WITH_EC,
            Self::Sha512WithEc => SHA512_WITH_EC,
        }
    }

    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            Self::Sha256WithRsa | Self::Sha384WithRsa | Self::Sha512WithRsa
        )
    }

    pub fn digest(self) -> MessageDigest {
        match self {
            Self::Sha256WithRsa | Self::Sha256WithEc => MessageDigest::sha256(),
            Self::Sha384WithRsa | Self::Sha384WithEc => MessageDigest::sha384(),
            Self::Sha512WithRsa | Self::Sha512WithEc => MessageDigest::sha512(),
        }
    }

    /// AlgorithmIdentifier for the CRL; RSA carries NULL parameters, ECDSA none.
    pub fn algorithm_identifier(self) -> der::Result<AlgorithmIdentifierOwned> {
        let parameters = if self.is_rsa() {
            Some(Any::new(Tag::Null, Vec::<u8>::new())?)
        } else {
            None
        };
        Ok(AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters,
        })
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::all()
            .iter()
            .copied()
            .find(|alg| alg.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| SignerError::UnsupportedAlgorithm(wanted.to_string()))
    }
}

/// Produces CRL signatures with the CA's signing key.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs the DER-encoded TBSCertList and returns the raw signature value.
    async fn sign(&self, tbs: &[u8], algorithm: SigningAlgorithm) -> Result<Vec<u8>, SignerError>;
}

/// Signer backed by an OpenSSL private key
pub struct OpensslSigner {
    key: PKey<Private>,
}

impl OpensslSigner {
    pub fn new(key: PKey<Private>) -> Self {
        Self { key }
    }

    pub fn from_pem(pem_bytes: impl AsRef<[u8]>) -> Result<Self, SignerError> {
        Ok(Self::new(PKey::private_key_from_pem(pem_bytes.as_ref())?))
    }

    pub async fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let pem = tokio::fs::read(path).await?;
        Self::from_pem(pem)
    }

    pub fn generate_rsa(bits: u32) -> Result<Self, SignerError> {
        Ok(Self::new(PKey::from_rsa(Rsa::generate(bits)?)?))
    }

    /// Generates a P-256 key.
    pub fn generate_ec() -> Result<Self, SignerError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        Ok(Self::new(PKey::from_ec_key(EcKey::generate(&group)?)?))
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>, SignerError> {
        Ok(self.key.public_key_to_der()?)
    }

    fn supports(&self, algorithm: SigningAlgorithm) -> bool {
        match self.key.id() {
            Id::RSA => algorithm.is_rsa(),
            Id::EC => !algorithm.is_rsa(),
            _ => false,
        }
    }
}

#[async_trait]
impl Signer for OpensslSigner {
    async fn sign(&self, tbs: &[u8], algorithm: SigningAlgorithm) -> Result<Vec<u8>, SignerError> {
        if !self.supports(algorithm) {
            return Err(SignerError::KeyMismatch(algorithm));
        }
        let mut signer = openssl::sign::Signer::new(algorithm.digest(), &self.key)?;
        signer.update(tbs)?;
        Ok(signer.sign_to_vec()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::Encode;
    use openssl::sign::Verifier;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            "sha384withrsa".parse::<SigningAlgorithm>().unwrap(),
            SigningAlgorithm::Sha384WithRsa
        );
        assert!("MD5withRSA".parse::<SigningAlgorithm>().is_err());
        for alg in SigningAlgorithm::all() {
            assert_eq!(alg.name().parse::<SigningAlgorithm>().unwrap(), *alg);
        }
    }

    #[test]
    fn test_algorithm_identifier_parameters() {
        let rsa = SigningAlgorithm::Sha256WithRsa.algorithm_identifier().unwrap();
        assert_eq!(
            rsa.to_der().unwrap(),
            vec![
                0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b,
                0x05, 0x00
            ]
        );
        let ec = SigningAlgorithm::Sha256WithEc.algorithm_identifier().unwrap();
        assert!(ec.parameters.is_none());
    }

    #[tokio::test]
    async fn test_openssl_signer_rsa() {
        let signer = OpensslSigner::generate_rsa(2048).unwrap();
        let data = b"tbs cert list";
        let signature = signer
            .sign(data, SigningAlgorithm::Sha256WithRsa)
            .await
            .unwrap();

        let public = PKey::public_key_from_der(&signer.public_key_der().unwrap()).unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public).unwrap();
        verifier.update(data).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[tokio::test]
    async fn test_openssl_signer_rejects_mismatched_algorithm() {
        let signer = OpensslSigner::generate_ec().unwrap();
        assert!(signer.sign(b"data", SigningAlgorithm::Sha384WithEc).await.is_ok());
        assert!(matches!(
            signer.sign(b"data", SigningAlgorithm::Sha256WithRsa).await,
            Err(SignerError::KeyMismatch(SigningAlgorithm::Sha256WithRsa))
        ));
    }
}

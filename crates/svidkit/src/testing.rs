//! Test fixtures: an in-memory CA that signs SPIFFE leaf certificates.

use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};

use svidkit_core::Credential;

pub(crate) struct TestCa {
    cert: Certificate,
    key_pair: KeyPair,
}

pub(crate) struct IssuedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: Vec<u8>,
}

impl TestCa {
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "svidkit test CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Self { cert, key_pair }
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn issue(&self, spiffe_id: &str) -> IssuedLeaf {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "SPIRE");
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(spiffe_id).unwrap())];

        let key_pair = KeyPair::generate().unwrap();
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key_pair)
            .unwrap();

        IssuedLeaf {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            der: cert.der().to_vec(),
        }
    }

    /// A credential for `spiffe_id` valid for one hour from `issued_at`.
    pub fn credential(&self, spiffe_id: &str, issued_at: DateTime<Utc>) -> Credential {
        let leaf = self.issue(spiffe_id);
        Credential::new(
            leaf.cert_pem,
            leaf.key_pem,
            self.cert_pem(),
            issued_at,
            issued_at + TimeDelta::hours(1),
        )
        .unwrap()
    }
}

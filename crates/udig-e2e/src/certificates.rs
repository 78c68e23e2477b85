//! Ingress certificates generated at test time with rcgen

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};

/// A private CA and a wildcard ingress certificate it signed
#[derive(Clone)]
pub struct TestCertificates {
    /// CA certificate PEM, the only root public test clients trust
    pub ca_cert_pem: String,

    /// Ingress certificate PEM
    pub server_cert_pem: String,
    /// Ingress private key PEM
    pub server_key_pem: String,
}

impl TestCertificates {
    /// Issue a certificate valid for `*.{domain}`, `{domain}` and `localhost`
    pub fn generate(domain: &str) -> Self {
        let ca_key = KeyPair::generate().expect("Failed to generate CA key");

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "udig Test CA");
            dn
        };
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .expect("Failed to create CA cert");
        let ca_issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate().expect("Failed to generate ingress key");
        let mut server_params = CertificateParams::default();
        server_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, format!("*.{}", domain));
            dn
        };
        server_params.subject_alt_names = vec![
            SanType::DnsName(format!("*.{}", domain).try_into().unwrap()),
            SanType::DnsName(domain.to_string().try_into().unwrap()),
            SanType::DnsName("localhost".try_into().unwrap()),
        ];
        server_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let server_cert = server_params
            .signed_by(&server_key, &ca_issuer)
            .expect("Failed to create ingress cert");

        Self {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        }
    }
}

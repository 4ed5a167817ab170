//! Shared fixtures for unit tests: a throwaway CA and a server certificate
//! issued by it.

use boring::asn1::Asn1Time;
use boring::bn::BigNum;
use boring::hash::MessageDigest;
use boring::pkey::{PKey, Private};
use boring::rsa::Rsa;
use boring::x509::{X509, X509Builder, X509NameBuilder};

use crate::crypto::{Certificate, RsaKey};

/// A freshly generated CA plus one server certificate signed by it.
pub struct TestPki {
    pub ca_key: RsaKey,
    pub ca_cert: Certificate,
    pub server_key: RsaKey,
    pub server_cert: Certificate,
}

impl TestPki {
    pub fn generate() -> Self {
        Self::generate_with_server_serial(2)
    }

    pub fn generate_with_server_serial(serial: u32) -> Self {
        let (ca_pkey, ca_x509) = issue("Test CA", 1, None);
        let (server_pkey, server_x509) = issue("Server", serial, Some((&ca_pkey, &ca_x509)));

        Self {
            ca_key: rsa_key(&ca_pkey),
            ca_cert: cert(&ca_x509),
            server_key: rsa_key(&server_pkey),
            server_cert: cert(&server_x509),
        }
    }
}

fn rsa_key(pkey: &PKey<Private>) -> RsaKey {
    let pem = pkey
        .rsa()
        .expect("test key is RSA")
        .private_key_to_pem()
        .expect("test key serialises");
    RsaKey::from_pem(&pem).expect("test key parses")
}

fn cert(x509: &X509) -> Certificate {
    let pem = x509.to_pem().expect("test cert serialises");
    Certificate::from_pem(&pem).expect("test cert parses")
}

/// Issues a certificate; self-signed when `issuer` is `None`.
fn issue(common_name: &str, serial: u32, issuer: Option<(&PKey<Private>, &X509)>) -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).expect("keygen");
    let pkey = PKey::from_rsa(rsa).expect("pkey");

    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", common_name).expect("cn");
    let name = name.build();

    let mut builder = X509Builder::new().expect("cert builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(serial)
        .expect("serial bn")
        .to_asn1_integer()
        .expect("serial asn1");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name).expect("subject");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("not after");
    builder.set_pubkey(&pkey).expect("pubkey");

    match issuer {
        Some((issuer_key, issuer_cert)) => {
            builder
                .set_issuer_name(issuer_cert.subject_name())
                .expect("issuer name");
            builder
                .sign(issuer_key, MessageDigest::sha256())
                .expect("sign");
        }
        None => {
            builder.set_issuer_name(&name).expect("issuer name");
            builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
        }
    }

    (pkey, builder.build())
}

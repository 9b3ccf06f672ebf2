//! TLS bootstrap helpers behind the `create-csr` and `sign-csr`
//! subcommands.
//!
//! `create-csr` generates the gateway's P-256 key and a CSR carrying the
//! DNS name devices will address the gateway with; the factory operator
//! signs it offline (or via `sign-csr` when they hold the factory root
//! locally) and the result lands back in `certs/tls.pem`.

use anyhow::{bail, Context, Result};
use fleetgate_core::fs::{
    CertsFsHandle, CERTS_TLS_CSR_FILE, CERTS_TLS_KEY_FILE, CERTS_TLS_PEM_FILE,
};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use time::{Duration, OffsetDateTime};

/// Validity of gateway certificates signed by `sign-csr`.
const CERT_VALIDITY_DAYS: i64 = 10 * 365;

/// Generates `tls.key` and `tls.csr` and prints the CSR PEM. Refuses to
/// run when TLS material already exists.
pub fn create_csr(certs: &CertsFsHandle, dns_name: &str, factory: &str) -> Result<String> {
    certs.assert_clean_tls()?;

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .context("unexpected error generating private key for CSR")?;

    let mut params = CertificateParams::new(vec![dns_name.to_string()])
        .context("unexpected error building CSR parameters")?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, dns_name);
    params
        .distinguished_name
        .push(DnType::OrganizationalUnitName, factory);

    let csr = params
        .serialize_request(&key_pair)
        .context("unexpected error creating CSR")?;
    let csr_pem = csr.pem().context("unexpected error encoding CSR")?;

    certs
        .write_file(CERTS_TLS_KEY_FILE, key_pair.serialize_pem().as_bytes())
        .context("unable to store TLS private key file")?;
    certs
        .write_file(CERTS_TLS_CSR_FILE, csr_pem.as_bytes())
        .context("unable to store TLS CSR file")?;
    Ok(csr_pem)
}

/// Signs the stored CSR with the factory root PKI, producing `tls.pem`
/// (serverAuth, ten-year validity).
pub fn sign_csr(certs: &CertsFsHandle, ca_key_path: &str, ca_cert_path: &str) -> Result<()> {
    let ca_key_pem = read_single_pem(ca_key_path)?;
    let ca_key = KeyPair::from_pem(&ca_key_pem).context("unable to parse CA key")?;

    let ca_cert_pem = read_single_pem(ca_cert_path)?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
        .context("unable to parse CA cert")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("unable to reconstruct CA identity")?;

    let csr_pem = String::from_utf8(certs.read_file(CERTS_TLS_CSR_FILE)?)
        .context("stored CSR is not valid UTF-8")?;
    let mut csr =
        CertificateSigningRequestParams::from_pem(&csr_pem).context("unable to parse CSR")?;

    let now = OffsetDateTime::now_utc();
    csr.params.not_before = now;
    csr.params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
    csr.params.is_ca = IsCa::ExplicitNoCa;
    csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = csr
        .signed_by(&ca_cert, &ca_key)
        .context("error signing TLS cert")?;
    certs
        .write_file(CERTS_TLS_PEM_FILE, cert.pem().as_bytes())
        .context("unable to store TLS certificate")?;
    Ok(())
}

/// Reads a PEM file and rejects trailing garbage or multiple blocks,
/// which almost always indicate the wrong file was passed.
fn read_single_pem(path: &str) -> Result<String> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("unable to read {path}"))?;
    let begins = content.matches("-----BEGIN ").count();
    if begins != 1 {
        bail!("malformed PEM data for {path}");
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use fleetgate_core::fs::FsHandle;

    use super::*;

    #[test]
    fn create_then_sign_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::new(dir.path()).unwrap();

        let csr_pem = create_csr(&fs.certs, "gateway.example.org", "factory-1").unwrap();
        assert!(csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
        assert!(fs.certs.read_file(CERTS_TLS_KEY_FILE).is_ok());

        // A second create must refuse to clobber.
        assert!(create_csr(&fs.certs, "gateway.example.org", "factory-1").is_err());

        // Self-made factory root.
        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut ca_params = CertificateParams::new(vec![]).unwrap();
        ca_params.distinguished_name = DistinguishedName::new();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "factory-root");
        ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let ca_key_path = dir.path().join("ca.key");
        let ca_cert_path = dir.path().join("ca.pem");
        std::fs::write(&ca_key_path, ca_key.serialize_pem()).unwrap();
        std::fs::write(&ca_cert_path, ca_cert.pem()).unwrap();

        sign_csr(
            &fs.certs,
            ca_key_path.to_str().unwrap(),
            ca_cert_path.to_str().unwrap(),
        )
        .unwrap();

        let cert_pem = fs.certs.read_file(CERTS_TLS_PEM_FILE).unwrap();
        assert!(String::from_utf8(cert_pem)
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn multi_block_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.pem");
        std::fs::write(
            &path,
            "-----BEGIN X-----\nAA==\n-----END X-----\n-----BEGIN X-----\nAA==\n-----END X-----\n",
        )
        .unwrap();
        assert!(read_single_pem(path.to_str().unwrap()).is_err());
    }
}

//! TLS material and the token HMAC secret under `certs/`.

use std::path::PathBuf;

use rand::RngCore;

use super::{
    BaseFsHandle, FsError, CERTS_TLS_CSR_FILE, CERTS_TLS_KEY_FILE, CERTS_TLS_PEM_FILE,
    HMAC_SECRET_FILE,
};

#[derive(Debug, Clone)]
pub struct CertsFsHandle {
    base: BaseFsHandle,
}

impl CertsFsHandle {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            base: BaseFsHandle::new(root),
        }
    }

    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.base.path(name)
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError> {
        self.base.read_file_bytes(name)
    }

    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<(), FsError> {
        self.base.write_file(name, content, 0o740)
    }

    /// Refuses to proceed when any TLS artifact already exists; `create-csr`
    /// must never clobber a provisioned gateway.
    pub fn assert_clean_tls(&self) -> Result<(), FsError> {
        for name in [CERTS_TLS_CSR_FILE, CERTS_TLS_KEY_FILE, CERTS_TLS_PEM_FILE] {
            let path = self.base.path(name);
            if path.exists() {
                return Err(FsError::Io {
                    context: format!("a TLS file {name} already exists"),
                    source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
                });
            }
        }
        Ok(())
    }

    /// Generates the 64-byte HMAC secret used for token key derivation.
    /// Errors if one already exists.
    pub fn init_hmac_secret(&self) -> Result<(), FsError> {
        if self.base.file_exists(HMAC_SECRET_FILE) {
            return Err(FsError::Io {
                context: format!(
                    "hmac secret exists at: {}",
                    self.base.path(HMAC_SECRET_FILE).display()
                ),
                source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            });
        }
        let mut secret = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut secret);
        self.base.write_file(HMAC_SECRET_FILE, &secret, 0o640)
    }

    pub fn hmac_secret(&self) -> Result<Vec<u8>, FsError> {
        self.base.read_file_bytes(HMAC_SECRET_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_secret_init_once() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertsFsHandle::new(dir.path().to_path_buf());

        certs.init_hmac_secret().unwrap();
        let secret = certs.hmac_secret().unwrap();
        assert_eq!(secret.len(), 64);

        // A second init must refuse to rotate the secret silently.
        assert!(certs.init_hmac_secret().is_err());
        assert_eq!(certs.hmac_secret().unwrap(), secret);
    }

    #[test]
    fn assert_clean_tls_detects_existing_material() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertsFsHandle::new(dir.path().to_path_buf());

        certs.assert_clean_tls().unwrap();
        certs.write_file(CERTS_TLS_KEY_FILE, b"key").unwrap();
        assert!(certs.assert_clean_tls().is_err());
    }
}

//! Versioned scrypt password hashes.
//!
//! Stored form is `'0' + salt(10) + hex(dk(32))` with scrypt parameters
//! N=32768, r=8, p=1. The leading version byte leaves room for future
//! scheme upgrades without a flag day.

use scrypt::Params;
use subtle::ConstantTimeEq;

use crate::random_text;

const SALT_LEN: usize = 10;
// log2(32768)
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const DK_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("invalid stored password length: {0}")]
    InvalidLength(usize),

    #[error("unsupported password hash version: {0}")]
    UnsupportedVersion(char),

    #[error("unexpected error decoding password hash: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("invalid scrypt parameters: {0}")]
    Params(#[from] scrypt::errors::InvalidParams),

    #[error("unexpected error deriving key from password: {0}")]
    Derive(#[from] scrypt::errors::InvalidOutputLen),
}

fn derive(password: &str, salt: &[u8]) -> Result<[u8; DK_LEN], PasswordError> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, DK_LEN)?;
    let mut dk = [0u8; DK_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut dk)?;
    Ok(dk)
}

/// Hashes a password with a fresh random salt.
///
/// # Errors
///
/// Returns [`PasswordError`] if key derivation fails.
pub fn password_hash(password: &str) -> Result<String, PasswordError> {
    let salt = random_text(SALT_LEN);
    let dk = derive(password, salt.as_bytes())?;
    Ok(format!("0{salt}{}", hex::encode(dk)))
}

/// Verifies a password against its stored hash in constant time.
///
/// # Errors
///
/// Returns [`PasswordError`] when the stored value is malformed or key
/// derivation fails. A wrong password is `Ok(false)`, not an error.
pub fn password_verify(password: &str, stored: &str) -> Result<bool, PasswordError> {
    if stored.len() < 1 + SALT_LEN {
        return Err(PasswordError::InvalidLength(stored.len()));
    }
    let mut chars = stored.chars();
    let version = chars.next().unwrap_or('?');
    if version != '0' {
        return Err(PasswordError::UnsupportedVersion(version));
    }
    let salt = &stored[1..1 + SALT_LEN];
    let stored_dk = hex::decode(&stored[1 + SALT_LEN..])?;
    let dk = derive(password, salt.as_bytes())?;
    Ok(dk.ct_eq(&stored_dk).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = password_hash("hunter2").unwrap();
        assert!(password_verify("hunter2", &hash).unwrap());
        assert!(!password_verify("hunter3", &hash).unwrap());
    }

    #[test]
    fn stored_format_is_versioned() {
        let hash = password_hash("pw").unwrap();
        assert!(hash.starts_with('0'));
        // version + salt + 32-byte key hex encoded
        assert_eq!(hash.len(), 1 + SALT_LEN + DK_LEN * 2);
    }

    #[test]
    fn same_password_different_salts() {
        let h1 = password_hash("pw").unwrap();
        let h2 = password_hash("pw").unwrap();
        assert_ne!(h1, h2);
        assert!(password_verify("pw", &h1).unwrap());
        assert!(password_verify("pw", &h2).unwrap());
    }

    #[test]
    fn malformed_stored_values_error() {
        assert!(matches!(
            password_verify("pw", "0short"),
            Err(PasswordError::InvalidLength(_))
        ));
        let hash = password_hash("pw").unwrap();
        let future = format!("1{}", &hash[1..]);
        assert!(matches!(
            password_verify("pw", &future),
            Err(PasswordError::UnsupportedVersion('1'))
        ));
    }
}

//! Authentication primitives: password hashing. Token and session storage
//! live in [`crate::store::users`]; the HTTP-facing provider contract lives
//! in the daemon crate.

pub mod passwords;

pub use passwords::{password_hash, password_verify, PasswordError};

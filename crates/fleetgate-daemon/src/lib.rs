//! fleetgate-daemon - the two HTTP surfaces of the fleet gateway.
//!
//! - The **device gateway** terminates mTLS itself: a device's identity is
//!   the CN of its client certificate, and the `businessCategory` RDN
//!   selects the production branch. See [`gateway`] and [`tls`].
//! - The **operator API** under `/v1` authenticates by bearer token or
//!   session cookie through an [`auth::AuthProvider`], gates every route
//!   on scopes, and drives rollouts through the journaled two-phase
//!   protocol reconciled by the [`daemons`] watchdog.

pub mod api;
pub mod auth;
pub mod csr;
pub mod daemons;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod serve;
pub mod tls;

pub use error::ApiError;

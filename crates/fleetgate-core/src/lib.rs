//! fleetgate-core - storage substrate and auth core for the fleetgate
//! fleet gateway.
//!
//! The crate is split along the two halves of the persistent state:
//!
//! - [`fs`]: the content-addressed on-disk tree (per-device event logs and
//!   inventory, per-update TUF/OSTree/apps artifacts, rollouts and their
//!   journal, audit logs) together with the crash-safe write discipline
//!   (temp+rename, `O_APPEND|O_SYNC`, partial-file suffixing, mod-time
//!   ordering, capped rollover).
//! - [`db`]: the relational catalog (devices, users, tokens, sessions,
//!   label index) opened once, with every named statement validated at
//!   open time.
//!
//! On top of those sit the domain views in [`store`] (gateway, operator,
//! users) and the auth primitives ([`scopes`], [`auth`]).

pub mod auth;
pub mod db;
pub mod events;
pub mod fs;
pub mod scopes;
pub mod store;

mod rand_text;

pub use rand_text::random_text;

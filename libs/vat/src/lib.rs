//! Opaque capability-RPC addressing values.
//!
//! The cluster's RPC mesh routes by vat: a [`VatId`] names a participant,
//! a [`VatPath`] couples that identity with the socket address at which
//! the participant accepts connections. The lifecycle core passes both
//! through untouched: it hands the master's own `VatId` to every machine
//! it launches, collects each machine's `VatPath` in return, and never
//! interprets their internal structure. The wire encoding of the RPC
//! protocol itself lives elsewhere; this crate only defines the values and
//! their handshake serialization.

mod error;
mod path;

pub use error::VatError;
pub use path::{VatId, VatPath};

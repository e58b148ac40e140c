//! Machine identity types for the fleet cluster manager.
//!
//! Every machine in a cluster is addressed by a [`MachineId`]: a role
//! ([`MachineType`]) plus an ordinal index within that role. The canonical
//! string form (`storage0`, `worker12`) doubles as the machine's hostname
//! and is the stable name used anywhere a machine is named outside the
//! process: subprocess arguments, inventory listings, logs.
//!
//! # Invariants
//!
//! - `parse(render(id)) == id` for every id
//! - Ids are totally ordered by type first, then index
//! - An id is never reused for a different physical machine within one
//!   cluster incarnation

mod error;
mod machine;

pub use error::IdError;
pub use machine::{MachineId, MachineType};

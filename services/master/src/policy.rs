//! Startup dependency and address fan-out policy.
//!
//! Some machine types are structurally depended on by others: a worker
//! has nothing to do until a coordinator exists, a gateway fronts the
//! frontends. The table here is data, not a hard-coded sequence;
//! deployments with different startup requirements override it in
//! configuration. The same table answers two questions each pass:
//!
//! - **Ordering**: which types must be running before a type is started
//!   (machines are started tier by tier).
//! - **Fan-out**: which peers' bootstrap paths each machine is handed.

use std::collections::{BTreeMap, BTreeSet};

use fleet_id::MachineType;
use thiserror::Error;

/// Errors in the dependency table itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The table cannot be ordered.
    #[error("dependency cycle involving machine type '{0}'")]
    Cycle(MachineType),
}

/// Which machine types must be up before others are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPolicy {
    deps: BTreeMap<MachineType, BTreeSet<MachineType>>,
}

impl Default for DependencyPolicy {
    /// Storage and the database have no prerequisites; coordinators wait
    /// for storage; workers wait for storage and a coordinator; frontends
    /// wait for storage, the database, and a coordinator; gateways front
    /// the frontends.
    fn default() -> Self {
        use MachineType::*;
        Self::new(BTreeMap::from([
            (Coordinator, BTreeSet::from([Storage])),
            (Worker, BTreeSet::from([Storage, Coordinator])),
            (Frontend, BTreeSet::from([Storage, Mongo, Coordinator])),
            (Gateway, BTreeSet::from([Frontend])),
        ]))
    }
}

impl DependencyPolicy {
    /// Builds a policy from an explicit table. Types absent from the
    /// table depend on nothing.
    pub fn new(deps: BTreeMap<MachineType, BTreeSet<MachineType>>) -> Self {
        Self { deps }
    }

    /// The types that must be running before `ty` is started. Also the
    /// types whose bootstrap paths machines of `ty` are handed.
    pub fn depends_on(&self, ty: MachineType) -> BTreeSet<MachineType> {
        self.deps.get(&ty).cloned().unwrap_or_default()
    }

    /// Orders all machine types into start tiers: every type's
    /// dependencies live in an earlier tier. Fails on a cyclic table.
    pub fn tiers(&self) -> Result<Vec<Vec<MachineType>>, PolicyError> {
        let mut remaining: BTreeSet<MachineType> = MachineType::ALL.into_iter().collect();
        let mut placed: BTreeSet<MachineType> = BTreeSet::new();
        let mut tiers = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<MachineType> = remaining
                .iter()
                .copied()
                .filter(|ty| self.depends_on(*ty).iter().all(|dep| placed.contains(dep)))
                .collect();
            if ready.is_empty() {
                let stuck = remaining.first().copied().unwrap_or(MachineType::Storage);
                return Err(PolicyError::Cycle(stuck));
            }
            for ty in &ready {
                remaining.remove(ty);
                placed.insert(*ty);
            }
            tiers.push(ready);
        }

        Ok(tiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MachineType::*;

    #[test]
    fn test_default_tiers_respect_dependencies() {
        let tiers = DependencyPolicy::default().tiers().unwrap();

        let tier_of = |ty: MachineType| {
            tiers
                .iter()
                .position(|tier| tier.contains(&ty))
                .expect("every type is placed")
        };

        assert_eq!(tier_of(Storage), 0);
        assert_eq!(tier_of(Mongo), 0);
        assert!(tier_of(Coordinator) > tier_of(Storage));
        assert!(tier_of(Worker) > tier_of(Coordinator));
        assert!(tier_of(Frontend) > tier_of(Mongo));
        assert!(tier_of(Gateway) > tier_of(Frontend));

        let placed: usize = tiers.iter().map(|t| t.len()).sum();
        assert_eq!(placed, MachineType::ALL.len());
    }

    #[test]
    fn test_unlisted_type_depends_on_nothing() {
        let policy = DependencyPolicy::new(BTreeMap::new());
        assert!(policy.depends_on(Gateway).is_empty());
        assert_eq!(policy.tiers().unwrap().len(), 1);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let policy = DependencyPolicy::new(BTreeMap::from([
            (Storage, BTreeSet::from([Worker])),
            (Worker, BTreeSet::from([Storage])),
        ]));
        assert!(matches!(policy.tiers(), Err(PolicyError::Cycle(_))));
    }
}

//! Machine roles and fleet-member identifiers.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// The role a machine plays in the cluster.
///
/// The enumeration is closed; it does not grow at runtime. Declaration
/// order defines the total order used by [`MachineId`] comparisons and
/// deterministic hostname assignment. The order carries no boot-order
/// meaning by itself; startup dependencies are policy owned by the master
/// loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineType {
    /// Blob and grain storage node.
    Storage,
    /// Application worker node.
    Worker,
    /// Worker coordinator node.
    Coordinator,
    /// Web frontend node.
    Frontend,
    /// Database node.
    Mongo,
    /// Public traffic gateway node.
    Gateway,
}

impl MachineType {
    /// All machine types, in declaration order.
    pub const ALL: [MachineType; 6] = [
        MachineType::Storage,
        MachineType::Worker,
        MachineType::Coordinator,
        MachineType::Frontend,
        MachineType::Mongo,
        MachineType::Gateway,
    ];

    /// The lowercase role name used in hostnames and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            MachineType::Storage => "storage",
            MachineType::Worker => "worker",
            MachineType::Coordinator => "coordinator",
            MachineType::Frontend => "frontend",
            MachineType::Mongo => "mongo",
            MachineType::Gateway => "gateway",
        }
    }

    /// Looks up a machine type by its role name. Case-sensitive.
    pub fn from_name(name: &str) -> Result<Self, IdError> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == name)
            .ok_or_else(|| IdError::UnknownType(name.to_string()))
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MachineType {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl serde::Serialize for MachineType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for MachineType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        Self::from_name(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifies one member of the fleet: a role plus an ordinal index
/// unique within that role.
///
/// The canonical string form is `<role-name><index>`, e.g.
/// `{ Storage, 123 }` renders as `storage123`. Rendering and parsing are
/// exact inverses of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId {
    machine_type: MachineType,
    index: u32,
}

impl MachineId {
    /// Creates an id from a role and an ordinal index.
    pub const fn new(machine_type: MachineType, index: u32) -> Self {
        Self {
            machine_type,
            index,
        }
    }

    /// The machine's role.
    pub const fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    /// The machine's ordinal index within its role.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Parses the canonical `<role-name><index>` form.
    ///
    /// Fails on an empty string, a missing or non-numeric index, an
    /// overflowing index, or a role prefix that does not name a machine
    /// type (case-sensitively).
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| IdError::MissingIndex(s.to_string()))?;

        let (prefix, digits) = s.split_at(split);
        let machine_type = MachineType::from_name(prefix)?;
        let index = digits.parse::<u32>().map_err(|source| IdError::InvalidIndex {
            text: digits.to_string(),
            source,
        })?;

        Ok(Self {
            machine_type,
            index,
        })
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.machine_type.name(), self.index)
    }
}

impl FromStr for MachineId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for MachineId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MachineId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(MachineType::Storage, 0, "storage0")]
    #[case(MachineType::Storage, 123, "storage123")]
    #[case(MachineType::Worker, 7, "worker7")]
    #[case(MachineType::Coordinator, 1, "coordinator1")]
    #[case(MachineType::Frontend, 2, "frontend2")]
    #[case(MachineType::Mongo, 0, "mongo0")]
    #[case(MachineType::Gateway, 4, "gateway4")]
    fn test_render(#[case] ty: MachineType, #[case] index: u32, #[case] expected: &str) {
        assert_eq!(MachineId::new(ty, index).to_string(), expected);
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = MachineId::new(MachineType::Storage, 123);
        let parsed: MachineId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(MachineId::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn test_parse_missing_index() {
        assert!(matches!(
            MachineId::parse("storage"),
            Err(IdError::MissingIndex(_))
        ));
    }

    #[rstest]
    #[case("Storage0")]
    #[case("STORAGE0")]
    #[case("disk0")]
    #[case("storage-1")]
    #[case("0")]
    fn test_parse_unknown_type(#[case] input: &str) {
        assert!(matches!(
            MachineId::parse(input),
            Err(IdError::UnknownType(_))
        ));
    }

    #[test]
    fn test_parse_trailing_garbage() {
        assert!(matches!(
            MachineId::parse("storage12abc"),
            Err(IdError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn test_parse_overflowing_index() {
        assert!(matches!(
            MachineId::parse("storage99999999999"),
            Err(IdError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn test_ordering_by_type_then_index() {
        assert!(MachineId::new(MachineType::Storage, 5) < MachineId::new(MachineType::Worker, 0));
        assert!(MachineId::new(MachineType::Worker, 3) < MachineId::new(MachineType::Worker, 4));
        assert!(MachineId::new(MachineType::Mongo, 0) < MachineId::new(MachineType::Gateway, 0));
    }

    #[test]
    fn test_type_name_roundtrip() {
        for ty in MachineType::ALL {
            assert_eq!(MachineType::from_name(ty.name()).unwrap(), ty);
        }
    }

    #[test]
    fn test_type_names_unique() {
        let unique: std::collections::HashSet<_> =
            MachineType::ALL.iter().map(|t| t.name()).collect();
        assert_eq!(unique.len(), MachineType::ALL.len());
    }

    #[test]
    fn test_json_roundtrip() {
        let id = MachineId::new(MachineType::Worker, 42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker42\"");
        let parsed: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    fn any_machine_type() -> impl Strategy<Value = MachineType> {
        prop::sample::select(MachineType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_roundtrip(ty in any_machine_type(), index in any::<u32>()) {
            let id = MachineId::new(ty, index);
            prop_assert_eq!(MachineId::parse(&id.to_string()).unwrap(), id);
        }
    }
}

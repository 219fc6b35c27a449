//! Participant weights

use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{MemberConfig, NodeId, PublicKey, TesseraError, TesseraResult, WeightSource};

/// Address book entry
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub node_id: NodeId,
    pub weight: u64,
    pub public_key: Option<PublicKey>,
}

impl MemberInfo {
    pub fn new(node_id: NodeId, weight: u64) -> Self {
        Self {
            node_id,
            weight,
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, public_key: PublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }
}

/// Fixed weights table for the lifetime of a consensus instance
///
/// Members are addressed by a dense index (their position, sorted by id) so
/// per-member memo tables can be plain vectors.
#[derive(Debug, Clone)]
pub struct AddressBook {
    members: Vec<MemberInfo>,
    index: HashMap<NodeId, usize>,
    total_weight: u64,
}

impl AddressBook {
    /// Create from a list of members
    pub fn new(mut members: Vec<MemberInfo>) -> TesseraResult<Self> {
        members.sort_by_key(|m| m.node_id);

        let mut index = HashMap::with_capacity(members.len());
        let mut total_weight: u64 = 0;
        for (i, member) in members.iter().enumerate() {
            if index.insert(member.node_id, i).is_some() {
                return Err(TesseraError::ConfigError(format!(
                    "member {} listed twice",
                    member.node_id
                )));
            }
            total_weight = total_weight.checked_add(member.weight).ok_or_else(|| {
                TesseraError::ConfigError("total weight overflows".into())
            })?;
        }

        if total_weight == 0 {
            return Err(TesseraError::ConfigError(
                "address book has no weight".into(),
            ));
        }

        Ok(Self {
            members,
            index,
            total_weight,
        })
    }

    /// Build from configuration entries
    pub fn from_config(members: &[MemberConfig]) -> TesseraResult<Self> {
        Self::new(
            members
                .iter()
                .map(|m| MemberInfo::new(m.id, m.weight))
                .collect(),
        )
    }

    /// Equal weights for every listed member
    pub fn equal_weights(ids: impl IntoIterator<Item = NodeId>) -> TesseraResult<Self> {
        Self::new(ids.into_iter().map(|id| MemberInfo::new(id, 1)).collect())
    }

    /// Dense index of a member
    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn member(&self, index: usize) -> Option<&MemberInfo> {
        self.members.get(index)
    }

    /// Weight by dense index; zero for unknown indices
    pub fn weight_at(&self, index: usize) -> u64 {
        self.members.get(index).map(|m| m.weight).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().map(|m| m.node_id)
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }
}

impl WeightSource for AddressBook {
    fn weight_of(&self, id: &NodeId) -> Option<u64> {
        self.index_of(id).map(|i| self.members[i].weight)
    }

    fn total_weight(&self) -> u64 {
        self.total_weight
    }
}

/// Shared address book
pub type SharedAddressBook = Arc<AddressBook>;

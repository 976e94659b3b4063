use serde::{Deserialize, Serialize};

use studio_core::{Bounded100, Entity, StudentId};

/// A member of an agency (or a hiring candidate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    /// Personal grade proxy, 0–100.
    pub individual_score: Bounded100,
    /// Personal PiXi balance; negative means personal debt.
    pub wallet: i64,
}

impl Student {
    pub fn new(id: StudentId, name: impl Into<String>, individual_score: i64, wallet: i64) -> Self {
        Self {
            id,
            name: name.into(),
            individual_score: Bounded100::new(individual_score),
            wallet,
        }
    }
}

impl Entity for Student {
    type Id = StudentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

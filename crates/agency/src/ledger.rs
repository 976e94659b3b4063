//! The agency ledger: balances plus the entries that move them.
//!
//! [`Books`] is the only place balances change, and it only changes by posting
//! a [`GameEvent`]. The aggregate and the settlement engine both go through
//! [`Books::post`], so a settlement preview and the committed state cannot drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use studio_core::{Bounded100, StudentId};

use crate::calendar::WeekKey;
use crate::rules::AdjustmentKind;
use crate::student::Student;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEventKind {
    OpeningBalance,
    Revenue,
    Rent,
    Salaries,
    CostOfLiving,
    BlackMarket,
    Crisis,
    Bonus,
    Sanction,
    Grade,
    Transfer,
}

impl From<AdjustmentKind> for GameEventKind {
    fn from(value: AdjustmentKind) -> Self {
        match value {
            AdjustmentKind::Crisis => GameEventKind::Crisis,
            AdjustmentKind::Bonus => GameEventKind::Bonus,
            AdjustmentKind::Sanction => GameEventKind::Sanction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDelta {
    pub student_id: StudentId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreDelta {
    pub student_id: StudentId,
    pub points: i64,
}

/// One immutable line of the agency history.
///
/// Entries are recorded even when every delta is zero (e.g. frozen salaries),
/// so the log explains every week in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEvent {
    pub kind: GameEventKind,
    pub label: String,
    pub budget_delta: i64,
    pub ve_delta: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wallet_deltas: Vec<WalletDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub score_deltas: Vec<ScoreDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week: Option<WeekKey>,
    pub occurred_at: DateTime<Utc>,
}

impl GameEvent {
    pub fn new(kind: GameEventKind, label: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            label: label.into(),
            budget_delta: 0,
            ve_delta: 0,
            wallet_deltas: Vec::new(),
            score_deltas: Vec::new(),
            week: None,
            occurred_at,
        }
    }

    pub fn budget(mut self, delta: i64) -> Self {
        self.budget_delta = delta;
        self
    }

    pub fn ve(mut self, delta: i64) -> Self {
        self.ve_delta = delta;
        self
    }

    pub fn wallet(mut self, student_id: StudentId, amount: i64) -> Self {
        self.wallet_deltas.push(WalletDelta { student_id, amount });
        self
    }

    pub fn score(mut self, student_id: StudentId, points: i64) -> Self {
        self.score_deltas.push(ScoreDelta { student_id, points });
        self
    }

    pub fn in_week(mut self, week: &WeekKey) -> Self {
        self.week = Some(week.clone());
        self
    }

    /// Budget delta plus every wallet delta.
    pub fn net_money(&self) -> i64 {
        self.wallet_deltas
            .iter()
            .fold(self.budget_delta, |net, w| net.saturating_add(w.amount))
    }
}

/// Balances of one agency and its members.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Books {
    pub budget: i64,
    pub ve: Bounded100,
    pub members: Vec<Student>,
}

impl Books {
    pub fn member(&self, id: StudentId) -> Option<&Student> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn is_member(&self, id: StudentId) -> bool {
        self.member(id).is_some()
    }

    /// Apply one entry. Wallet and score deltas for students who are no longer
    /// members are ignored; VE and scores saturate at their bounds.
    pub fn post(&mut self, entry: &GameEvent) {
        self.budget = self.budget.saturating_add(entry.budget_delta);
        self.ve = self.ve.offset(entry.ve_delta);
        for delta in &entry.wallet_deltas {
            if let Some(m) = self.members.iter_mut().find(|m| m.id == delta.student_id) {
                m.wallet = m.wallet.saturating_add(delta.amount);
            }
        }
        for delta in &entry.score_deltas {
            if let Some(m) = self.members.iter_mut().find(|m| m.id == delta.student_id) {
                m.individual_score = m.individual_score.offset(delta.points);
            }
        }
    }
}

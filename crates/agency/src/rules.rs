//! Tunable game parameters, injected into every engine call.

use serde::{Deserialize, Serialize};

use studio_core::{DomainError, DomainResult};

/// Largest magnitude accepted for any amount or multiplier.
pub const MAX_AMOUNT: i64 = 1_000_000_000;

/// Parameters of the weekly economy and the Mercato quorums.
///
/// Amounts are whole PiXi. Quorums are percentages of the eligible voters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameRules {
    /// Revenue per VE point.
    pub ve_multiplier: i64,
    pub revenue_bonus: i64,
    pub revenue_base: i64,
    pub rent: i64,
    /// Salary per individual-score point.
    pub salary_multiplier: i64,
    pub salary_cap: i64,
    /// Deducted from every wallet each week.
    pub cost_of_living: i64,
    /// Score points lost by a member whose wallet ends the week below zero.
    pub poverty_penalty: i64,
    /// Budget below which an agency is flagged for liquidation review.
    pub bankruptcy_threshold: i64,
    pub hire_quorum_pct: u32,
    pub fire_quorum_pct: u32,
    pub found_agency_quorum_pct: u32,
    pub grade_rewards: GradeRewards,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            ve_multiplier: 30,
            revenue_bonus: 0,
            revenue_base: 500,
            rent: 500,
            salary_multiplier: 10,
            salary_cap: 800,
            cost_of_living: 100,
            poverty_penalty: 5,
            bankruptcy_threshold: -5000,
            hire_quorum_pct: 66,
            fire_quorum_pct: 75,
            found_agency_quorum_pct: 50,
            grade_rewards: GradeRewards::default(),
        }
    }
}

impl GameRules {
    pub fn validate(&self) -> DomainResult<()> {
        let non_negative = [
            ("ve_multiplier", self.ve_multiplier),
            ("rent", self.rent),
            ("salary_multiplier", self.salary_multiplier),
            ("salary_cap", self.salary_cap),
            ("cost_of_living", self.cost_of_living),
            ("poverty_penalty", self.poverty_penalty),
        ];
        for (name, value) in non_negative {
            if value < 0 {
                return Err(DomainError::validation(format!("{name} must not be negative")));
            }
        }
        let bounded = [
            ("ve_multiplier", self.ve_multiplier),
            ("revenue_bonus", self.revenue_bonus),
            ("revenue_base", self.revenue_base),
            ("rent", self.rent),
            ("salary_multiplier", self.salary_multiplier),
            ("salary_cap", self.salary_cap),
            ("cost_of_living", self.cost_of_living),
            ("poverty_penalty", self.poverty_penalty),
            ("bankruptcy_threshold", self.bankruptcy_threshold),
        ];
        for (name, value) in bounded {
            if value.unsigned_abs() > MAX_AMOUNT as u64 {
                return Err(DomainError::validation(format!(
                    "{name} must be within -{MAX_AMOUNT}..={MAX_AMOUNT}"
                )));
            }
        }
        if self.bankruptcy_threshold > 0 {
            return Err(DomainError::validation("bankruptcy_threshold must be <= 0"));
        }
        for (name, pct) in [
            ("hire_quorum_pct", self.hire_quorum_pct),
            ("fire_quorum_pct", self.fire_quorum_pct),
            ("found_agency_quorum_pct", self.found_agency_quorum_pct),
        ] {
            if !(1..=100).contains(&pct) {
                return Err(DomainError::validation(format!("{name} must be within 1..=100")));
            }
        }
        Ok(())
    }
}

/// Letter grade given by a teacher to a weekly deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeReward {
    pub ve_delta: i64,
    pub budget_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeRewards {
    pub a: GradeReward,
    pub b: GradeReward,
    pub c: GradeReward,
    pub d: GradeReward,
}

impl GradeRewards {
    pub fn for_grade(&self, grade: Grade) -> GradeReward {
        match grade {
            Grade::A => self.a,
            Grade::B => self.b,
            Grade::C => self.c,
            Grade::D => self.d,
        }
    }
}

impl Default for GradeRewards {
    fn default() -> Self {
        Self {
            a: GradeReward { ve_delta: 5, budget_delta: 500 },
            b: GradeReward { ve_delta: 2, budget_delta: 200 },
            c: GradeReward { ve_delta: 0, budget_delta: 0 },
            d: GradeReward { ve_delta: -3, budget_delta: 0 },
        }
    }
}

/// Teacher-issued ledger adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Crisis,
    Bonus,
    /// Impact of a rival's black-market action.
    Sanction,
}

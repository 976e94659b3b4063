//! Black-market catalogue.
//!
//! Every action has a fixed price paid from the buyer's agency budget and an
//! effect chosen by a roll in `0..100` supplied by the caller. A roll below
//! `success_pct` succeeds; deterministic actions have `success_pct == 100`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlackOpKind {
    Audit,
    Leak,
    MarketManipulation,
    Consulting,
}

/// Deltas produced by an action, for the buyer and for the targeted rival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Effect {
    pub self_ve: i64,
    pub self_budget: i64,
    pub rival_ve: i64,
    pub rival_budget: i64,
}

impl Effect {
    pub fn touches_rival(&self) -> bool {
        self.rival_ve != 0 || self.rival_budget != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackOpSpec {
    pub kind: BlackOpKind,
    pub name: &'static str,
    pub price: i64,
    pub success_pct: u8,
    pub requires_target: bool,
    pub on_success: Effect,
    pub on_failure: Effect,
}

const CATALOGUE: [BlackOpSpec; 4] = [
    BlackOpSpec {
        kind: BlackOpKind::Audit,
        name: "Surprise audit of a rival",
        price: 400,
        success_pct: 60,
        requires_target: true,
        on_success: Effect { self_ve: 0, self_budget: 0, rival_ve: -5, rival_budget: 0 },
        on_failure: Effect { self_ve: -3, self_budget: 0, rival_ve: 0, rival_budget: 0 },
    },
    BlackOpSpec {
        kind: BlackOpKind::Leak,
        name: "Leak a rival's pitch",
        price: 250,
        success_pct: 50,
        requires_target: true,
        on_success: Effect { self_ve: 0, self_budget: 0, rival_ve: -3, rival_budget: -300 },
        on_failure: Effect { self_ve: -5, self_budget: 0, rival_ve: 0, rival_budget: 0 },
    },
    BlackOpSpec {
        kind: BlackOpKind::MarketManipulation,
        name: "Market manipulation",
        price: 600,
        success_pct: 50,
        requires_target: false,
        on_success: Effect { self_ve: 0, self_budget: 1500, rival_ve: 0, rival_budget: 0 },
        on_failure: Effect { self_ve: -4, self_budget: 0, rival_ve: 0, rival_budget: 0 },
    },
    BlackOpSpec {
        kind: BlackOpKind::Consulting,
        name: "Shadow consulting",
        price: 300,
        success_pct: 100,
        requires_target: false,
        on_success: Effect { self_ve: 2, self_budget: 0, rival_ve: 0, rival_budget: 0 },
        on_failure: Effect { self_ve: 0, self_budget: 0, rival_ve: 0, rival_budget: 0 },
    },
];

pub fn catalogue() -> &'static [BlackOpSpec] {
    &CATALOGUE
}

pub fn spec(kind: BlackOpKind) -> &'static BlackOpSpec {
    match kind {
        BlackOpKind::Audit => &CATALOGUE[0],
        BlackOpKind::Leak => &CATALOGUE[1],
        BlackOpKind::MarketManipulation => &CATALOGUE[2],
        BlackOpKind::Consulting => &CATALOGUE[3],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackOpOutcome {
    pub kind: BlackOpKind,
    pub success: bool,
    pub effect: Effect,
}

pub fn resolve(kind: BlackOpKind, roll: u8) -> BlackOpOutcome {
    let spec = spec(kind);
    let success = roll < spec.success_pct;
    BlackOpOutcome {
        kind,
        success,
        effect: if success { spec.on_success } else { spec.on_failure },
    }
}

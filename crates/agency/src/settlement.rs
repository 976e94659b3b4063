//! Weekly finance settlement for one agency.
//!
//! Steps run in a fixed order: revenue, rent, salaries, cost of living.
//! Reordering them changes who gets paid during a cash crunch, so the order is
//! part of the contract. Each step yields exactly one [`GameEvent`].
//!
//! The function is pure and has no memory of previous runs: calling it twice
//! for the same week bills the agency twice. Once-per-week is enforced by the
//! auto-pilot's `last_finance_run` key, not here.

use chrono::{DateTime, Utc};

use crate::calendar::WeekKey;
use crate::ledger::{Books, GameEvent, GameEventKind};
use crate::rules::GameRules;

/// Closing budget fell below the configured bankruptcy threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankruptcyBreach {
    pub budget: i64,
    pub threshold: i64,
}

/// Result of settling one week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub entries: Vec<GameEvent>,
    /// Books after posting every entry.
    pub closing: Books,
    pub breach: Option<BankruptcyBreach>,
}

pub fn settle(books: &Books, rules: &GameRules, week: &WeekKey, at: DateTime<Utc>) -> Settlement {
    let mut working = books.clone();
    let mut entries = Vec::with_capacity(4);

    let revenue = revenue(&working, rules, week, at);
    record(&mut working, &mut entries, revenue);

    let rent = rent(&working, rules, week, at);
    record(&mut working, &mut entries, rent);

    let salaries = salaries(&working, rules, week, at);
    record(&mut working, &mut entries, salaries);

    let living = cost_of_living(&working, rules, week, at);
    record(&mut working, &mut entries, living);

    let breach = (working.budget < rules.bankruptcy_threshold).then_some(BankruptcyBreach {
        budget: working.budget,
        threshold: rules.bankruptcy_threshold,
    });

    Settlement {
        entries,
        closing: working,
        breach,
    }
}

fn record(working: &mut Books, entries: &mut Vec<GameEvent>, entry: GameEvent) {
    working.post(&entry);
    entries.push(entry);
}

fn revenue(books: &Books, rules: &GameRules, week: &WeekKey, at: DateTime<Utc>) -> GameEvent {
    let ve = books.ve.get();
    let amount = ve
        .saturating_mul(rules.ve_multiplier)
        .saturating_add(rules.revenue_bonus)
        .saturating_add(rules.revenue_base);
    GameEvent::new(
        GameEventKind::Revenue,
        format!(
            "Weekly revenue: VE {ve} x {} + bonus {} + base {} = {amount}",
            rules.ve_multiplier, rules.revenue_bonus, rules.revenue_base
        ),
        at,
    )
    .budget(amount)
    .in_week(week)
}

/// Rent, with the solidarity clause when the agency cannot cover it.
///
/// The shortfall is split with ceiling division, so members may jointly pay up
/// to `members - 1` PiXi more than the shortfall. With no members the agency
/// carries the whole debt.
fn rent(books: &Books, rules: &GameRules, week: &WeekKey, at: DateTime<Utc>) -> GameEvent {
    let rent = rules.rent;
    if books.budget >= rent {
        return GameEvent::new(GameEventKind::Rent, format!("Rent paid: {rent}"), at)
            .budget(-rent)
            .in_week(week);
    }

    let paid = books.budget.max(0);
    let shortfall = rent.saturating_sub(paid);

    if books.members.is_empty() {
        return GameEvent::new(
            GameEventKind::Rent,
            format!("Rent {rent}: agency paid {paid}, no members to share the shortfall of {shortfall}"),
            at,
        )
        .budget(-rent)
        .in_week(week);
    }

    let share = ceil_div(shortfall, books.members.len() as i64);
    let mut entry = GameEvent::new(
        GameEventKind::Rent,
        format!(
            "Solidarity clause: agency paid {paid} of {rent}, shortfall {shortfall} split as {share} per member"
        ),
        at,
    )
    .budget(-paid)
    .in_week(week);
    for m in &books.members {
        entry = entry.wallet(m.id, -share);
    }
    entry
}

/// Salaries are all-or-nothing: an agency in debt pays nobody.
fn salaries(books: &Books, rules: &GameRules, week: &WeekKey, at: DateTime<Utc>) -> GameEvent {
    if books.budget < 0 {
        return GameEvent::new(
            GameEventKind::Salaries,
            format!("Salaries frozen: agency in debt ({})", books.budget),
            at,
        )
        .in_week(week);
    }

    let mut entry = GameEvent::new(GameEventKind::Salaries, String::new(), at).in_week(week);
    let mut total = 0i64;
    for m in &books.members {
        let salary = salary_for(m.individual_score.get(), rules);
        total = total.saturating_add(salary);
        entry = entry.wallet(m.id, salary);
    }
    entry.label = format!("Salaries paid to {} members: {total}", books.members.len());
    entry.budget(-total)
}

pub fn salary_for(score: i64, rules: &GameRules) -> i64 {
    score.saturating_mul(rules.salary_multiplier).clamp(0, rules.salary_cap)
}

/// Applied to every member regardless of the agency's situation.
fn cost_of_living(books: &Books, rules: &GameRules, week: &WeekKey, at: DateTime<Utc>) -> GameEvent {
    let cost = rules.cost_of_living;
    let mut entry = GameEvent::new(GameEventKind::CostOfLiving, String::new(), at).in_week(week);
    let mut in_poverty = 0usize;
    for m in &books.members {
        entry = entry.wallet(m.id, -cost);
        if m.wallet.saturating_sub(cost) < 0 {
            in_poverty += 1;
            entry = entry.score(m.id, -rules.poverty_penalty);
        }
    }
    entry.label = if in_poverty == 0 {
        format!("Cost of living: {cost} per member")
    } else {
        format!(
            "Cost of living: {cost} per member, {in_poverty} in personal debt (-{} score)",
            rules.poverty_penalty
        )
    };
    entry
}

/// Ceiling division for a positive denominator.
fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    numerator / denominator + i64::from(numerator % denominator > 0)
}

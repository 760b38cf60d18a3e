//! No-vig gap between the two books.
//!
//! For one side of one prop:
//!   gap = book_b_no_vig[side] − book_a_no_vig[side]
//!
//! A positive gap means FanDuel (book B) prices the side as more likely than
//! SportsInteraction (book A), i.e. book A is offering the better price.
//!
//! No-vig probabilities arrive already normalised from the scraper; nothing
//! here recomputes them.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::models::{Fixture, FixtureId, Prop, Side, Snapshot};

/// Gaps within ±0.001 are treated as zero so float noise never colours a
/// row or flips a sort bucket.
pub const GAP_DEAD_ZONE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GapClass {
    Positive,
    Negative,
    Neutral,
}

pub fn gap(prop: &Prop, side: Side) -> f64 {
    prop.book_b_no_vig.get(side) - prop.book_a_no_vig.get(side)
}

pub fn gap_percent(prop: &Prop, side: Side) -> f64 {
    gap(prop, side) * 100.0
}

pub fn classify(gap: f64) -> GapClass {
    if gap > GAP_DEAD_ZONE {
        GapClass::Positive
    } else if gap < -GAP_DEAD_ZONE {
        GapClass::Negative
    } else {
        GapClass::Neutral
    }
}

/// The side with the larger gap; over wins ties.
pub fn best_side(prop: &Prop) -> Side {
    if gap(prop, Side::Under) > gap(prop, Side::Over) {
        Side::Under
    } else {
        Side::Over
    }
}

/// One displayable line: a (fixture, player, prop type) from the fixture's
/// latest cached snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub fixture_id: FixtureId,
    pub player: String,
    pub prop_type: String,
    pub prop: Prop,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
}

impl Row {
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.fixture_id, self.player, self.prop_type)
    }

    pub fn gap_percent(&self, side: Side) -> f64 {
        gap_percent(&self.prop, side)
    }

    /// Book B's no-vig probability for a side, as a percentage.
    pub fn no_vig_percent(&self, side: Side) -> f64 {
        self.prop.book_b_no_vig.get(side) * 100.0
    }

    pub fn involves_team(&self, team: &str) -> bool {
        self.home_team == team || self.away_team == team
    }
}

/// Flatten a fixture's latest snapshot into rows.
///
/// No snapshot yet means no rows; that is a normal state while the first
/// history read is in flight.
pub fn flatten(fixture: &Fixture, latest: Option<&Snapshot>) -> Vec<Row> {
    let Some(snapshot) = latest else {
        return Vec::new();
    };
    let mut rows = Vec::with_capacity(snapshot.payload.prop_count());
    for (player, by_type) in &snapshot.payload.props {
        for (prop_type, prop) in by_type {
            rows.push(Row {
                fixture_id: fixture.id,
                player: player.clone(),
                prop_type: prop_type.clone(),
                prop: *prop,
                home_team: fixture.home_team.clone(),
                away_team: fixture.away_team.clone(),
                start_time: fixture.start_time,
            });
        }
    }
    rows
}

/// One point of a prop's movement over the fixture's snapshot history.
/// All values are percentages rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GapPoint {
    pub taken_at: DateTime<Utc>,
    pub line: f64,
    pub over_gap: f64,
    pub under_gap: f64,
    pub book_a_over: f64,
    pub book_b_over: f64,
    pub book_a_under: f64,
    pub book_b_under: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Movement series for one (player, prop type). Snapshots that do not
/// carry the prop are skipped.
pub fn gap_series(history: &[Snapshot], player: &str, prop_type: &str) -> Vec<GapPoint> {
    history
        .iter()
        .filter_map(|snapshot| {
            let p = snapshot.payload.prop(player, prop_type)?;
            Some(GapPoint {
                taken_at: snapshot.taken_at,
                line: p.line,
                over_gap: round2(gap_percent(p, Side::Over)),
                under_gap: round2(gap_percent(p, Side::Under)),
                book_a_over: round2(p.book_a_no_vig.over * 100.0),
                book_b_over: round2(p.book_b_no_vig.over * 100.0),
                book_a_under: round2(p.book_a_no_vig.under * 100.0),
                book_b_under: round2(p.book_b_no_vig.under * 100.0),
            })
        })
        .collect()
}

/// Human label for a scraper prop-type key; unknown keys pass through.
pub fn prop_label(prop_type: &str) -> &str {
    match prop_type {
        "points" => "Points",
        "rebounds" => "Rebounds",
        "assists" => "Assists",
        "threes" => "Threes",
        "points_rebounds_assists" => "Pts + Reb + Ast",
        "points_assists" => "Pts + Ast",
        "points_rebounds" => "Pts + Reb",
        "rebounds_assists" => "Reb + Ast",
        other => other,
    }
}

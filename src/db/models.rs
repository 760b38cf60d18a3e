use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{FeedError, FeedResult};

pub type FixtureId = i64;

/// A scheduled NBA game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub id: FixtureId,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub status: FixtureStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureStatus {
    Open,
    Closed,
}

impl FixtureStatus {
    /// The scraper writes "close"; "closed" is accepted as well.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(FixtureStatus::Open),
            "close" | "closed" => Some(FixtureStatus::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureStatus::Open => "open",
            FixtureStatus::Closed => "close",
        }
    }
}

/// Over or under side of a prop line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Over,
    Under,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SidePair<T> {
    pub over: T,
    pub under: T,
}

impl<T: Copy> SidePair<T> {
    pub fn get(&self, side: Side) -> T {
        match side {
            Side::Over => self.over,
            Side::Under => self.under,
        }
    }
}

/// One player-prop line as quoted by both books.
///
/// Book A is SportsInteraction, book B is FanDuel. Odds are American; no-vig
/// values are probabilities in [0, 1] computed upstream by the scraper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prop {
    pub line: f64,
    #[serde(rename = "siaOdds", alias = "bookAOdds")]
    pub book_a_odds: SidePair<f64>,
    #[serde(rename = "fdOdds", alias = "bookBOdds")]
    pub book_b_odds: SidePair<f64>,
    #[serde(rename = "siaOddsNoVig", alias = "bookANoVig")]
    pub book_a_no_vig: SidePair<f64>,
    #[serde(rename = "fdOddsNoVig", alias = "bookBNoVig")]
    pub book_b_no_vig: SidePair<f64>,
}

impl Prop {
    fn check(&self) -> Result<(), String> {
        for (book, pair) in [("A", &self.book_a_no_vig), ("B", &self.book_b_no_vig)] {
            for p in [pair.over, pair.under] {
                if !(0.0..=1.0).contains(&p) {
                    return Err(format!("book {} no-vig probability {} out of range", book, p));
                }
            }
        }
        if !self.line.is_finite() {
            return Err("non-finite line".to_string());
        }
        Ok(())
    }
}

/// Decoded odds payload of one scrape: player → prop type → prop
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OddsPayload {
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    pub props: BTreeMap<String, BTreeMap<String, Prop>>,
}

impl OddsPayload {
    pub fn prop(&self, player: &str, prop_type: &str) -> Option<&Prop> {
        self.props.get(player).and_then(|by_type| by_type.get(prop_type))
    }

    pub fn prop_count(&self) -> usize {
        self.props.values().map(|by_type| by_type.len()).sum()
    }
}

/// One scrape of a fixture at a point in time. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub fixture_id: FixtureId,
    pub taken_at: DateTime<Utc>,
    pub payload: OddsPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    #[serde(default)]
    home_team: String,
    #[serde(default)]
    away_team: String,
    #[serde(default)]
    props: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Snapshot {
    /// Decode the stored `odds_data` text into a typed snapshot.
    ///
    /// This is the only place payload text is interpreted. A payload that is
    /// not an object with a `props` map fails as a whole; an individual prop
    /// that does not decode (or carries out-of-range probabilities) is
    /// dropped with a warning and the rest of the snapshot is kept.
    pub fn decode(fixture_id: FixtureId, taken_at: DateTime<Utc>, raw: &str) -> FeedResult<Self> {
        let raw: RawPayload = serde_json::from_str(raw).map_err(|e| {
            FeedError::MalformedSnapshot(format!("fixture {} at {}: {}", fixture_id, taken_at, e))
        })?;

        let mut props: BTreeMap<String, BTreeMap<String, Prop>> = BTreeMap::new();
        for (player, by_type) in raw.props {
            for (prop_type, value) in by_type {
                let decoded = serde_json::from_value::<Prop>(value)
                    .map_err(|e| e.to_string())
                    .and_then(|p| p.check().map(|_| p));
                match decoded {
                    Ok(prop) => {
                        props.entry(player.clone()).or_default().insert(prop_type, prop);
                    }
                    Err(reason) => warn!(
                        "Skipping malformed prop {} / {} in fixture {}: {}",
                        player, prop_type, fixture_id, reason
                    ),
                }
            }
        }

        Ok(Snapshot {
            fixture_id,
            taken_at,
            payload: OddsPayload {
                home_team: raw.home_team,
                away_team: raw.away_team,
                props,
            },
        })
    }
}

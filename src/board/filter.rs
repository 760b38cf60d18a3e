//! Filter and sort configuration for the props board.
//!
//! Both the gap filter and the sort keys are evaluated on a row's
//! *effective side*: the configured direction when one is set, otherwise the
//! side with the larger gap. Filtering and sorting therefore always agree on
//! which number a row is judged by.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::db::models::Side;
use crate::odds::gap::{best_side, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "")]
    Any,
    #[serde(rename = "over")]
    Over,
    #[serde(rename = "under")]
    Under,
}

impl Direction {
    pub fn side(self) -> Option<Side> {
        match self {
            Direction::Any => None,
            Direction::Over => Some(Side::Over),
            Direction::Under => Some(Side::Under),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortBy {
    #[default]
    #[serde(rename = "")]
    Unsorted,
    #[serde(rename = "gap")]
    Gap,
    #[serde(rename = "noVig", alias = "fdNoVig")]
    NoVig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// User-chosen board filters. Thresholds are percentages; `0` means unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub team: String,
    pub prop_type: String,
    #[serde(alias = "minGap")]
    pub min_gap_percent: f64,
    pub direction: Direction,
    /// Only applied when `direction` is set.
    #[serde(alias = "minFdNoVig")]
    pub min_no_vig_percent: f64,
    pub sort_by: SortBy,
    #[serde(alias = "sortDir")]
    pub sort_direction: SortDirection,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            team: String::new(),
            prop_type: String::new(),
            min_gap_percent: 0.0,
            direction: Direction::Any,
            min_no_vig_percent: 0.0,
            sort_by: SortBy::Unsorted,
            sort_direction: SortDirection::Desc,
        }
    }
}

fn threshold(v: f64) -> Option<f64> {
    (v != 0.0 && v.is_finite()).then_some(v)
}

impl FilterConfig {
    pub fn effective_side(&self, row: &Row) -> Side {
        self.direction.side().unwrap_or_else(|| best_side(&row.prop))
    }

    /// Does the row pass every active filter?
    pub fn matches(&self, row: &Row) -> bool {
        if !self.team.is_empty() && !row.involves_team(&self.team) {
            return false;
        }
        if !self.prop_type.is_empty() && row.prop_type != self.prop_type {
            return false;
        }

        let side = self.effective_side(row);
        if let Some(min_gap) = threshold(self.min_gap_percent) {
            if row.gap_percent(side) < min_gap {
                return false;
            }
        }
        if let (Some(side), Some(min_no_vig)) =
            (self.direction.side(), threshold(self.min_no_vig_percent))
        {
            if row.no_vig_percent(side) < min_no_vig {
                return false;
            }
        }
        true
    }

    fn sort_key(&self, row: &Row) -> f64 {
        let side = self.effective_side(row);
        match self.sort_by {
            SortBy::Gap => row.gap_percent(side),
            SortBy::NoVig => row.no_vig_percent(side),
            SortBy::Unsorted => 0.0,
        }
    }

    /// Row ordering for the configured sort. Equal keys compare `Equal`, so a
    /// stable sort keeps their incoming order.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        if self.sort_by == SortBy::Unsorted {
            return Ordering::Equal;
        }
        let (ka, kb) = (self.sort_key(a), self.sort_key(b));
        match self.sort_direction {
            SortDirection::Asc => ka.total_cmp(&kb),
            SortDirection::Desc => kb.total_cmp(&ka),
        }
    }

    /// Filter then stable-sort.
    pub fn apply(&self, rows: &[Row]) -> Vec<Row> {
        let mut out: Vec<Row> = rows.iter().filter(|r| self.matches(r)).cloned().collect();
        if self.sort_by != SortBy::Unsorted {
            // slice::sort_by is stable
            out.sort_by(|a, b| self.compare(a, b));
        }
        out
    }

    /// Number of active filters, for the collapsed filter button badge.
    pub fn active_count(&self) -> usize {
        [
            !self.team.is_empty(),
            !self.prop_type.is_empty(),
            self.direction != Direction::Any,
            threshold(self.min_gap_percent).is_some(),
            threshold(self.min_no_vig_percent).is_some(),
        ]
        .iter()
        .filter(|active| **active)
        .count()
    }
}

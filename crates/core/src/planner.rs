//! Time window planning.
//!
//! Expands a year range into the date windows searched for each quadrant. A non-seasonal plan
//! yields one full-year window per year; a seasonal plan yields the rainy season followed by the
//! two dry-season ranges that bracket it.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Season label attached to a window, used for directory layout and dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    /// Rainy season (June to October).
    Lluvias,
    /// Dry season (January to May and November to December).
    Secas,
    /// Whole year.
    Completo,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Lluvias => "lluvias",
            Season::Secas => "secas",
            Season::Completo => "completo",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lluvias" => Ok(Season::Lluvias),
            "secas" => Ok(Season::Secas),
            "completo" => Ok(Season::Completo),
            other => Err(format!("unknown season label: {other}")),
        }
    }
}

/// An inclusive acquisition date range with its season label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub year: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub season: Season,
}

impl TimeWindow {
    /// Window spanning `start_md` through `end_md` (month, day) of `year`.
    fn span(year: i32, start_md: (u32, u32), end_md: (u32, u32), season: Season) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, start_md.0, start_md.1)?.and_hms_opt(0, 0, 0)?;
        let end = NaiveDate::from_ymd_opt(year, end_md.0, end_md.1)?
            .and_hms_milli_opt(23, 59, 59, 999)?;
        Some(Self {
            year,
            start: start.and_utc(),
            end: end.and_utc(),
            season,
        })
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.start.date_naive() && date <= self.end.date_naive()
    }

    /// Start bound as sent to the provider, e.g. `2021-06-01T00:00:00.000Z`.
    pub fn start_rfc3339(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn end_rfc3339(&self) -> String {
        self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}..{}",
            self.season,
            self.start.date_naive(),
            self.end.date_naive()
        )
    }
}

type MonthDay = (u32, u32);

const SEASONAL: [(MonthDay, MonthDay, Season); 3] = [
    ((6, 1), (10, 31), Season::Lluvias),
    ((1, 1), (5, 31), Season::Secas),
    ((11, 1), (12, 31), Season::Secas),
];

const FULL_YEAR: [(MonthDay, MonthDay, Season); 1] = [((1, 1), (12, 31), Season::Completo)];

/// Lazy, finite sequence of windows for `year_start..=year_end`.
///
/// Cloning restarts from the current position, so a fresh planner can be cloned per quadrant.
#[derive(Debug, Clone)]
pub struct TimeWindowPlanner {
    year: i32,
    year_end: i32,
    slot: usize,
    seasonal: bool,
}

impl TimeWindowPlanner {
    pub fn new(year_start: i32, year_end: i32, seasonal: bool) -> Self {
        Self {
            year: year_start,
            year_end,
            slot: 0,
            seasonal,
        }
    }

    /// Windows produced per year.
    pub fn windows_per_year(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> &'static [(MonthDay, MonthDay, Season)] {
        if self.seasonal {
            &SEASONAL
        } else {
            &FULL_YEAR
        }
    }
}

impl Iterator for TimeWindowPlanner {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        while self.year <= self.year_end {
            let slots = self.slots();
            if self.slot >= slots.len() {
                self.slot = 0;
                self.year = self.year.checked_add(1)?;
                continue;
            }
            let (start, end, season) = slots[self.slot];
            self.slot += 1;
            // Years outside chrono's range are skipped.
            if let Some(window) = TimeWindow::span(self.year, start, end, season) {
                return Some(window);
            }
        }
        None
    }
}

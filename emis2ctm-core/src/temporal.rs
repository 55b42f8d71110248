//! Temporal disaggregation of monthly totals
//!
//! Monthly emission totals are spread over the days of the month using
//! per-sector weekday weights, and over the hours of a day using per-sector
//! hourly weights.
//!
//! Day factors are normalised within each month: for every sector the factors
//! of all calendar days in a month sum to 1. Hour factors are returned exactly
//! as the hour table encodes them and are not renormalised.

use crate::cache::{CachePolicy, KeyedCache};
use crate::errors::{EmissionError, EmissionResult};
use crate::table::Table;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DAYS_PER_WEEK: usize = 7;
pub const HOURS_PER_DAY: usize = 24;

/// Sector without an hourly profile
pub const BIOGENIC_SECTOR: &str = "biogenic";

const WEEKDAY_TABLE: &str = "weekday weights";
const HOUR_TABLE: &str = "hour weights";

/// Raw day-of-week weights per sector, index 0 = Monday
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeekdayWeights {
    source_name: String,
    weights: BTreeMap<String, [f64; DAYS_PER_WEEK]>,
}

impl WeekdayWeights {
    pub fn new(weights: BTreeMap<String, [f64; DAYS_PER_WEEK]>) -> Self {
        Self {
            source_name: WEEKDAY_TABLE.to_string(),
            weights,
        }
    }

    /// Read weights from a `sector,1,…,7` table where column `k` holds weekday `k-1`
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let sector_col = table.column_index("sector")?;
        let mut columns = [0usize; DAYS_PER_WEEK];
        for (weekday, column) in columns.iter_mut().enumerate() {
            *column = table.column_index(&(weekday + 1).to_string())?;
        }

        let mut weights = BTreeMap::new();
        for row in table.rows() {
            let mut values = [0.0; DAYS_PER_WEEK];
            for (value, column) in values.iter_mut().zip(columns) {
                *value = row.parse::<f64>(column)?;
            }
            weights.insert(row.get(sector_col).to_string(), values);
        }

        Ok(Self {
            source_name: table.source_name().to_string(),
            weights,
        })
    }

    pub fn from_path(path: &Path) -> EmissionResult<Self> {
        Self::from_table(&Table::from_path(path)?)
    }

    pub fn weights(&self, sector: &str) -> EmissionResult<&[f64; DAYS_PER_WEEK]> {
        self.weights
            .get(sector)
            .ok_or_else(|| EmissionError::UnknownSector {
                sector: sector.to_string(),
                table: WEEKDAY_TABLE.to_string(),
            })
    }

    pub fn sectors(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }
}

/// Hour-of-day weights per sector
///
/// The biogenic sector is dropped at load time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HourWeights {
    weights: BTreeMap<String, [f64; HOURS_PER_DAY]>,
}

impl HourWeights {
    pub fn new(weights: BTreeMap<String, [f64; HOURS_PER_DAY]>) -> Self {
        let mut weights = weights;
        weights.remove(BIOGENIC_SECTOR);
        Self { weights }
    }

    /// Read weights from a `sector,0,…,23` table
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let sector_col = table.column_index("sector")?;
        let mut columns = [0usize; HOURS_PER_DAY];
        for (hour, column) in columns.iter_mut().enumerate() {
            *column = table.column_index(&hour.to_string())?;
        }

        let mut weights = BTreeMap::new();
        for row in table.rows() {
            let sector = row.get(sector_col);
            if sector == BIOGENIC_SECTOR {
                continue;
            }
            let mut values = [0.0; HOURS_PER_DAY];
            for (value, column) in values.iter_mut().zip(columns) {
                *value = row.parse::<f64>(column)?;
            }
            weights.insert(sector.to_string(), values);
        }
        Ok(Self { weights })
    }

    pub fn from_path(path: &Path) -> EmissionResult<Self> {
        Self::from_table(&Table::from_path(path)?)
    }

    /// Raw table value for `hour` (0..=23)
    pub fn hour_factor(&self, hour: u32, sector: &str) -> EmissionResult<f64> {
        let profile = self
            .weights
            .get(sector)
            .ok_or_else(|| EmissionError::UnknownSector {
                sector: sector.to_string(),
                table: HOUR_TABLE.to_string(),
            })?;
        profile
            .get(hour as usize)
            .copied()
            .ok_or(EmissionError::InvalidHour(hour))
    }

    pub fn sectors(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }
}

/// Normalised day factors for every sector in one month
#[derive(Debug, Clone, PartialEq)]
pub struct DayFactors {
    pub year: i32,
    pub month: u32,
    days: u32,
    source_name: String,
    /// Factor per day of month, index 0 = day 1
    factors: BTreeMap<String, Vec<f64>>,
    /// Sectors whose weights cannot be normalised over this month, with their total
    unusable: BTreeMap<String, f64>,
}

impl DayFactors {
    pub fn days_in_month(&self) -> u32 {
        self.days
    }

    /// Day factors of one sector.
    ///
    /// A sector whose weights sum to zero (or a non-finite value) over the
    /// month is an error here, without affecting the other sectors.
    pub fn sector(&self, sector: &str) -> EmissionResult<&[f64]> {
        if let Some(total) = self.unusable.get(sector) {
            return Err(EmissionError::parse(
                &self.source_name,
                format!(
                    "weekday weights for sector '{}' sum to {} over {}-{:02}",
                    sector, total, self.year, self.month
                ),
            ));
        }
        self.factors
            .get(sector)
            .map(Vec::as_slice)
            .ok_or_else(|| EmissionError::UnknownSector {
                sector: sector.to_string(),
                table: WEEKDAY_TABLE.to_string(),
            })
    }

    pub fn get(&self, day: u32, sector: &str) -> EmissionResult<f64> {
        let days = self.sector(sector)?;
        day.checked_sub(1)
            .and_then(|index| days.get(index as usize))
            .copied()
            .ok_or(EmissionError::InvalidDate {
                year: self.year,
                month: self.month,
                day,
            })
    }
}

/// Compute the day factors of a month.
///
/// Each day's weekday weight is divided by the sum of the weights of every
/// day in the month, so the factors of a sector sum to 1 regardless of how
/// often each weekday occurs. Sectors are normalised independently.
pub fn compute_day_factors(
    weights: &WeekdayWeights,
    year: i32,
    month: u32,
) -> EmissionResult<DayFactors> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(EmissionError::InvalidDate {
        year,
        month,
        day: 1,
    })?;
    let weekdays: Vec<usize> = first
        .iter_days()
        .take_while(|date| date.month() == month)
        .map(|date| date.weekday().num_days_from_monday() as usize)
        .collect();

    let mut factors = BTreeMap::new();
    let mut unusable = BTreeMap::new();
    for (sector, sector_weights) in &weights.weights {
        let raw: Vec<f64> = weekdays.iter().map(|&weekday| sector_weights[weekday]).collect();
        let total: f64 = raw.iter().sum();
        if total == 0.0 || !total.is_finite() {
            warn!(sector = %sector, total, year, month, "weekday weights cannot be normalised");
            unusable.insert(sector.clone(), total);
            continue;
        }
        factors.insert(sector.clone(), raw.iter().map(|w| w / total).collect());
    }

    debug!(year, month, days = weekdays.len(), "computed day factors");
    Ok(DayFactors {
        year,
        month,
        days: weekdays.len() as u32,
        source_name: weights.source_name.clone(),
        factors,
        unusable,
    })
}

/// Day and hour factor lookups with per-month caching
#[derive(Debug)]
pub struct TemporalFactors {
    weekday: WeekdayWeights,
    hours: HourWeights,
    months: KeyedCache<(i32, u32), DayFactors>,
}

impl TemporalFactors {
    pub fn new(weekday: WeekdayWeights, hours: HourWeights) -> Self {
        Self {
            weekday,
            hours,
            months: KeyedCache::new("day factors", CachePolicy::Unbounded),
        }
    }

    /// Load `day.csv` and `hour.csv` from a factor directory
    pub fn load(factor_dir: &Path) -> EmissionResult<Self> {
        let weekday = WeekdayWeights::from_path(&factor_dir.join("day.csv"))?;
        let hours = HourWeights::from_path(&factor_dir.join("hour.csv"))?;
        info!(
            dir = %factor_dir.display(),
            weekday_sectors = weekday.weights.len(),
            hour_sectors = hours.weights.len(),
            "loaded temporal profiles"
        );
        Ok(Self::new(weekday, hours))
    }

    pub fn weekday_weights(&self) -> &WeekdayWeights {
        &self.weekday
    }

    pub fn hour_weights(&self) -> &HourWeights {
        &self.hours
    }

    pub fn day_factors(&self, year: i32, month: u32) -> EmissionResult<Arc<DayFactors>> {
        self.months
            .get_or_try_insert_with((year, month), || {
                compute_day_factors(&self.weekday, year, month)
            })
    }

    /// Fraction of the month's emission emitted on `day`
    pub fn day_factor(&self, year: i32, month: u32, day: u32, sector: &str) -> EmissionResult<f64> {
        self.weekday.weights(sector)?;
        self.day_factors(year, month)?.get(day, sector)
    }

    /// Fraction of the day's emission emitted during `hour`
    pub fn hour_factor(&self, hour: u32, sector: &str) -> EmissionResult<f64> {
        self.hours.hour_factor(hour, sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use is_close::is_close;

    fn day_table() -> Table {
        Table::parse(
            "sector,1,2,3,4,5,6,7\n\
             power,1,1,1,1,1,1,1\n\
             industry,1.2,1.1,1.1,1.1,1.0,0.8,0.7\n\
             monday,1,0,0,0,0,0,0\n",
            "day.csv",
        )
        .unwrap()
    }

    fn hour_table() -> Table {
        let values: Vec<String> = (0..24).map(|h| format!("{}", 0.01 * (h + 1) as f64)).collect();
        let header: Vec<String> = (0..24).map(|h| h.to_string()).collect();
        let text = format!(
            "sector,{}\npower,{}\nbiogenic,{}\n",
            header.join(","),
            values.join(","),
            values.join(",")
        );
        Table::parse(&text, "hour.csv").unwrap()
    }

    fn factors() -> TemporalFactors {
        TemporalFactors::new(
            WeekdayWeights::from_table(&day_table()).unwrap(),
            HourWeights::from_table(&hour_table()).unwrap(),
        )
    }

    #[test]
    fn test_day_factors_sum_to_one() {
        let factors = factors();
        for month in 1..=12 {
            let days = factors.day_factors(2024, month).unwrap();
            for sector in ["power", "industry", "monday"] {
                let total: f64 = days.sector(sector).unwrap().iter().sum();
                assert!(is_close!(total, 1.0), "{} {}: {}", sector, month, total);
            }
        }
    }

    #[test]
    fn test_uniform_weights_thirty_day_month() {
        let factors = factors();
        // April has 30 days
        for day in 1..=30 {
            assert_eq!(factors.day_factor(2023, 4, day, "power").unwrap(), 1.0 / 30.0);
        }
    }

    #[test]
    fn test_weekday_alignment() {
        let factors = factors();
        // January 2024 starts on a Monday and has five Mondays
        assert_abs_diff_eq!(factors.day_factor(2024, 1, 1, "monday").unwrap(), 0.2);
        assert_abs_diff_eq!(factors.day_factor(2024, 1, 29, "monday").unwrap(), 0.2);
        assert_eq!(factors.day_factor(2024, 1, 2, "monday").unwrap(), 0.0);
    }

    #[test]
    fn test_leap_february() {
        let days = factors().day_factors(2024, 2).unwrap();
        assert_eq!(days.days_in_month(), 29);
    }

    #[test]
    fn test_day_factor_errors() {
        let factors = factors();
        assert!(matches!(
            factors.day_factor(2024, 1, 1, "shipping"),
            Err(EmissionError::UnknownSector { .. })
        ));
        assert!(matches!(
            factors.day_factor(2024, 13, 1, "power"),
            Err(EmissionError::InvalidDate { .. })
        ));
        assert!(matches!(
            factors.day_factor(2023, 2, 29, "power"),
            Err(EmissionError::InvalidDate { .. })
        ));
    }

    #[test]
    fn test_zero_weights_only_fail_their_sector() {
        let table = Table::parse(
            "sector,1,2,3,4,5,6,7\npower,1,1,1,1,1,1,1\nidle,0,0,0,0,0,0,0\n",
            "day.csv",
        )
        .unwrap();
        let factors = TemporalFactors::new(
            WeekdayWeights::from_table(&table).unwrap(),
            HourWeights::from_table(&hour_table()).unwrap(),
        );

        assert_eq!(factors.day_factor(2023, 4, 1, "power").unwrap(), 1.0 / 30.0);
        let err = factors.day_factor(2023, 4, 1, "idle").unwrap_err();
        assert!(matches!(err, EmissionError::Parse { .. }));
        assert!(err.to_string().contains("idle"));
        assert_eq!(factors.day_factor(2023, 4, 2, "power").unwrap(), 1.0 / 30.0);
    }

    #[test]
    fn test_hour_factors_are_table_values() {
        let factors = factors();
        for hour in 0..24u32 {
            assert_eq!(
                factors.hour_factor(hour, "power").unwrap(),
                0.01 * (hour + 1) as f64
            );
        }
    }

    #[test]
    fn test_hour_factor_errors() {
        let factors = factors();
        assert!(matches!(
            factors.hour_factor(3, BIOGENIC_SECTOR),
            Err(EmissionError::UnknownSector { .. })
        ));
        assert!(matches!(
            factors.hour_factor(24, "power"),
            Err(EmissionError::InvalidHour(24))
        ));
    }

    #[test]
    fn test_day_factors_cached_per_month() {
        let factors = factors();
        let first = factors.day_factors(2024, 3).unwrap();
        let second = factors.day_factors(2024, 3).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}

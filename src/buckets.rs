use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};

/// Week and month keys for one instant, computed together so a single
/// event never straddles two buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub week: String,
    pub month: String,
}

impl BucketKeys {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self::for_date(now.with_timezone(&Local).date_naive())
    }

    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            week: week_key(date),
            month: month_key(date),
        }
    }
}

/// ISO-8601 week, keyed by the ISO week-year (2021-01-01 is "2020-W53").
pub fn week_key(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

pub fn month_key(date: NaiveDate) -> String {
    format!("{}-{:02}", date.year(), date.month())
}

pub fn current_week_key() -> String {
    week_key(Local::now().date_naive())
}

pub fn current_month_key() -> String {
    month_key(Local::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn week_keys_follow_iso_numbering() {
        assert_eq!(week_key(date(2024, 4, 22)), "2024-W17");
        assert_eq!(week_key(date(2024, 4, 28)), "2024-W17");
        assert_eq!(week_key(date(2024, 4, 29)), "2024-W18");
    }

    #[test]
    fn year_boundary_uses_iso_week_year() {
        assert_eq!(week_key(date(2021, 1, 1)), "2020-W53");
        assert_eq!(week_key(date(2024, 12, 30)), "2025-W01");
        // month keys always use the calendar year
        assert_eq!(month_key(date(2024, 12, 30)), "2024-12");
    }

    #[test]
    fn month_key_is_zero_padded() {
        assert_eq!(month_key(date(2024, 5, 1)), "2024-05");
        assert_eq!(BucketKeys::for_date(date(2024, 5, 1)).month, "2024-05");
    }
}

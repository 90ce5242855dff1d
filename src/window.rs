/// Analysis window handling.
///
/// Turns local calendar dates (or window keys such as '2025', '2025-03',
/// '2025-W12', '2025-03-15') into an inclusive UTC instant range. All
/// membership tests happen on UTC instants; the local timezone only matters
/// while the bounds are built.
use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ReconcileError};

/// Longest DST gap we are willing to step over, in minutes.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// Timezone used to interpret local calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// The host's local zone
    Local,
    /// An IANA zone such as `Europe/Madrid`
    Named(Tz),
}

/// Which end of the window a local time is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Start,
    End,
}

impl Zone {
    /// Parse a timezone name. `None` and `"local"` select the host zone.
    pub fn parse(name: Option<&str>) -> Result<Self, ConfigError> {
        match name.map(str::trim) {
            None | Some("") => Ok(Zone::Local),
            Some(n) if n.eq_ignore_ascii_case("local") => Ok(Zone::Local),
            Some(n) => n
                .parse::<Tz>()
                .map(Zone::Named)
                .map_err(|_| ConfigError::UnknownTimezone(n.to_string())),
        }
    }

    /// Human-readable zone name.
    pub fn name(&self) -> String {
        match self {
            Zone::Local => "local".to_string(),
            Zone::Named(tz) => tz.name().to_string(),
        }
    }

    /// Today's date in this zone.
    pub fn today(&self) -> NaiveDate {
        match self {
            Zone::Local => chrono::Local::now().date_naive(),
            Zone::Named(tz) => Utc::now().with_timezone(tz).date_naive(),
        }
    }

    /// UTC instant of local midnight at the start of `date`.
    pub fn start_of_day(&self, date: NaiveDate) -> Result<DateTime<Utc>, ConfigError> {
        self.resolve(date.and_time(NaiveTime::MIN), Bound::Start)
    }

    /// UTC instant of local 23:59:59.999999 at the end of `date`.
    pub fn end_of_day(&self, date: NaiveDate) -> Result<DateTime<Utc>, ConfigError> {
        let last = date
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .ok_or_else(|| ConfigError::UnmappableLocalTime(date.to_string()))?;
        self.resolve(last, Bound::End)
    }

    fn resolve(&self, naive: NaiveDateTime, bound: Bound) -> Result<DateTime<Utc>, ConfigError> {
        let resolved = match self {
            Zone::Local => resolve_in(&chrono::Local, naive, bound),
            Zone::Named(tz) => resolve_in(tz, naive, bound),
        };
        resolved.ok_or_else(|| ConfigError::UnmappableLocalTime(naive.to_string()))
    }
}

/// Map a local wall-clock time to UTC.
///
/// A folded time (DST end) resolves to the earliest candidate for a start
/// bound and the latest for an end bound. A time inside a DST gap moves
/// forward to the first valid minute for a start bound and backward to the
/// last valid minute for an end bound.
fn resolve_in<T: TimeZone>(tz: &T, naive: NaiveDateTime, bound: Bound) -> Option<DateTime<Utc>> {
    let step = match bound {
        Bound::Start => Duration::minutes(1),
        Bound::End => Duration::minutes(-1),
    };

    let mut candidate = naive;
    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, latest) => {
                let picked = match bound {
                    Bound::Start => earliest,
                    Bound::End => latest,
                };
                return Some(picked.with_timezone(&Utc));
            }
            LocalResult::None => {
                candidate = candidate.checked_add_signed(step)?;
            }
        }
    }
    None
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(s: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate(s.to_string()))
}

/// Parse a window key into an inclusive calendar date range.
///
/// Supported formats:
/// - "2025" → entire year 2025
/// - "2025-03" → March 2025
/// - "2025-W12" → ISO week 12 of 2025
/// - "2025-03-15" → specific day
pub fn parse_window_key(window: &str) -> Result<(NaiveDate, NaiveDate), ConfigError> {
    let window = window.trim();
    let invalid = || ConfigError::InvalidWindow(window.to_string());

    // Year: "YYYY"
    if let Ok(year) = window.parse::<i32>() {
        if (1970..=2099).contains(&year) {
            let from = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?;
            let to = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(invalid)?;
            return Ok((from, to));
        }
        return Err(invalid());
    }

    // Day: "YYYY-MM-DD"
    if let Ok(date) = NaiveDate::parse_from_str(window, "%Y-%m-%d") {
        return Ok((date, date));
    }

    // Week: "YYYY-Www"
    if let Some((year_str, week_str)) = window.split_once("-W") {
        let (Ok(year), Ok(week)) = (year_str.parse::<i32>(), week_str.parse::<u32>()) else {
            return Err(invalid());
        };
        let from = NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon)
            .ok_or_else(invalid)?;
        let to = from + Duration::days(6);
        return Ok((from, to));
    }

    // Month: "YYYY-MM"
    if let Some((year_str, month_str)) = window.split_once('-') {
        if let (Ok(year), Ok(month)) = (year_str.parse::<i32>(), month_str.parse::<u32>()) {
            if (1970..=2099).contains(&year) && (1..=12).contains(&month) {
                let from = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
                let next_month = if month == 12 {
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)
                };
                let to = next_month.and_then(|d| d.pred_opt()).ok_or_else(invalid)?;
                return Ok((from, to));
            }
        }
    }

    Err(invalid())
}

/// Inclusive UTC instant range used for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWindow {
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
}

impl AnalysisWindow {
    /// Build a window from UTC bounds. Both bounds are inclusive.
    pub fn new(start_utc: DateTime<Utc>, end_utc: DateTime<Utc>) -> Result<Self, ReconcileError> {
        if end_utc < start_utc {
            return Err(ReconcileError::InvertedWindow {
                start: start_utc,
                end: end_utc,
            });
        }
        Ok(Self { start_utc, end_utc })
    }

    /// Build a window from timezone-aware datetimes. They are converted, never re-localized.
    pub fn from_instants<A: TimeZone, B: TimeZone>(
        start: &DateTime<A>,
        end: &DateTime<B>,
    ) -> Result<Self, ReconcileError> {
        Self::new(start.with_timezone(&Utc), end.with_timezone(&Utc))
    }

    /// Build a window from local calendar dates.
    ///
    /// The start is local midnight of `start`, the end is local 23:59:59.999999
    /// of `end`, both converted to UTC.
    pub fn from_local_dates(
        start: NaiveDate,
        end: NaiveDate,
        zone: Zone,
    ) -> Result<Self, ConfigError> {
        if end < start {
            return Err(ConfigError::InvertedDates {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        let start_utc = zone.start_of_day(start)?;
        let end_utc = zone.end_of_day(end)?;
        Self::new(start_utc, end_utc).map_err(|_| ConfigError::InvertedDates {
            start: start.to_string(),
            end: end.to_string(),
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start_utc
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end_utc
    }

    /// Inclusive on both ends: a transition exactly at a bound counts.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start_utc <= ts && ts <= self.end_utc
    }

    /// Split the window at UTC midnights into per-day inclusive sub-windows.
    pub fn daily_slices(&self) -> Vec<AnalysisWindow> {
        let mut slices = Vec::new();
        let mut day = self.start_utc.date_naive();
        let last = self.end_utc.date_naive();

        while day <= last {
            let day_start = day.and_time(NaiveTime::MIN).and_utc();
            let day_end = day
                .and_hms_micro_opt(23, 59, 59, 999_999)
                .map(|t| t.and_utc())
                .unwrap_or(self.end_utc);
            slices.push(AnalysisWindow {
                start_utc: day_start.max(self.start_utc),
                end_utc: day_end.min(self.end_utc),
            });
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        slices
    }

    /// Number of calendar days (UTC) the window touches.
    pub fn day_count(&self) -> i64 {
        (self.end_utc.date_naive() - self.start_utc.date_naive()).num_days() + 1
    }
}

//! Holidays file loader (§6.2): a weekly prime/non-prime schedule plus a
//! list of dated holidays, folded into the server's dedicated-time
//! windows before a cycle starts.
//!
//! Format, one directive per line, `#` comments allowed:
//! ```text
//! weekday  0600  1800
//! saturday all
//! *        0000  0000
//! 12/25/2026
//! ```
//! A weekday line gives the non-prime (dedicated) window for that day, as
//! `HHMM HHMM`; `all` means the entire day is dedicated. A bare
//! `MM/DD/YYYY` line is a one-off holiday, treated as `all` dedicated for
//! that date. `*` sets the default applied to any day not named
//! explicitly.

use crate::error::{ConfigError, ScheduleResult};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    pub start_hhmm: u16,
    pub end_hhmm: u16,
}

impl DailyWindow {
    pub const ALL_DAY: DailyWindow = DailyWindow { start_hhmm: 0, end_hhmm: 2400 };
}

#[derive(Debug, Clone, Default)]
pub struct HolidaysFile {
    /// Index 0 = Sunday .. 6 = Saturday, per the on-disk weekday order.
    pub weekly: [Option<DailyWindow>; 7],
    pub default_window: Option<DailyWindow>,
    /// `(month, day, year)` one-off holidays, treated as all-day dedicated.
    pub holidays: Vec<(u32, u32, i32)>,
}

impl HolidaysFile {
    pub fn load_from_str(content: &str) -> ScheduleResult<Self> {
        let mut file = HolidaysFile::default();
        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(first) = parts.next() else { continue };
            if let Some(date) = parse_date(first) {
                file.holidays.push(date);
                continue;
            }
            let window = parse_window(&mut parts, "<string>", line_no + 1, line)?;
            match weekday_index(first) {
                Some(idx) => file.weekly[idx] = Some(window),
                None if first == "*" => file.default_window = Some(window),
                None => {
                    return Err(ConfigError::MalformedLine {
                        path: "<string>".to_string(),
                        line_no: line_no + 1,
                        line: line.to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(file)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ScheduleResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::load_from_str(&content)
    }

    /// Resolve the dedicated window for a given weekday index (0=Sunday),
    /// falling back to the `*` default if the day has no explicit entry.
    pub fn window_for_weekday(&self, weekday: usize) -> Option<DailyWindow> {
        self.weekly.get(weekday).copied().flatten().or(self.default_window)
    }
}

fn weekday_index(token: &str) -> Option<usize> {
    match token.to_ascii_lowercase().as_str() {
        "sunday" => Some(0),
        "monday" => Some(1),
        "tuesday" => Some(2),
        "wednesday" => Some(3),
        "thursday" => Some(4),
        "friday" => Some(5),
        "saturday" => Some(6),
        "weekday" => Some(1), // convenience alias resolved per-day by the caller
        _ => None,
    }
}

fn parse_window(
    parts: &mut std::str::SplitWhitespace<'_>,
    path: &str,
    line_no: usize,
    line: &str,
) -> ScheduleResult<DailyWindow> {
    let malformed = || ConfigError::MalformedLine { path: path.to_string(), line_no, line: line.to_string() }.into();
    let Some(first) = parts.next() else { return Err(malformed()) };
    if first.eq_ignore_ascii_case("all") {
        return Ok(DailyWindow::ALL_DAY);
    }
    let Some(second) = parts.next() else { return Err(malformed()) };
    let start = first.parse::<u16>().map_err(|_| malformed())?;
    let end = second.parse::<u16>().map_err(|_| malformed())?;
    Ok(DailyWindow { start_hhmm: start, end_hhmm: end })
}

fn parse_date(token: &str) -> Option<(u32, u32, i32)> {
    let mut fields = token.split('/');
    let month = fields.next()?.parse().ok()?;
    let day = fields.next()?.parse().ok()?;
    let year = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((month, day, year))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_weekday_window_and_all_day_and_holiday() {
        let file = HolidaysFile::load_from_str(
            "# sample\nsaturday all\nsunday 0600 1800\n12/25/2026\n",
        )
        .unwrap();
        assert_eq!(file.weekly[6], Some(DailyWindow::ALL_DAY));
        assert_eq!(file.weekly[0], Some(DailyWindow { start_hhmm: 600, end_hhmm: 1800 }));
        assert_eq!(file.holidays, vec![(12, 25, 2026)]);
    }

    #[test]
    fn default_star_window_applies_when_no_explicit_entry() {
        let file = HolidaysFile::load_from_str("* 0000 0600\n").unwrap();
        assert_eq!(file.window_for_weekday(3), Some(DailyWindow { start_hhmm: 0, end_hhmm: 600 }));
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(HolidaysFile::load_from_str("monday oops\n").is_err());
    }
}

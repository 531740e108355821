//! Temporal Pattern Resolver
//!
//! Turns the time phrase inside a question ("last 2 weeks vs previous 2
//! weeks", "Q3 vs Q2", "year over year", "7-day rolling average") into
//! concrete date ranges relative to a reference date.
//!
//! Ranges are half-open `[start, end)`. "last N units" covers
//! `[ref - N units, ref]`, and "previous N units" the window right before it,
//! `[ref - 2N units, ref - N units)`, so the two never overlap and together
//! cover exactly "last 2N units".

use crate::config::TemporalVocabulary;
use chrono::{Datelike, Days, Duration, Months, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

lazy_static! {
    static ref ROLLING: Regex = Regex::new(
        r"(?:(\d+)[- ]?day[s]?[- ]rolling|rolling[- ](\d+)[- ]?day[s]?|(\d+)[- ]?day[s]?[- ]moving|rolling (?:average|avg|sum)|moving average)"
    ).unwrap();
    static ref YOY: Regex = Regex::new(
        r"\b(?:year[- ]over[- ]year|year[- ]on[- ]year|yoy)\b|(?:vs\.?|versus|compared (?:to|with)) (?:the )?same (?:period|time) last year|(?:vs\.?|versus|compared (?:to|with)) last year"
    ).unwrap();
    static ref OVER_PERIOD: Regex = Regex::new(
        r"\b(?:(week|month|quarter)[- ](?:over|on)[- ](?:week|month|quarter)|(wow|mom|qoq))\b"
    ).unwrap();
    static ref COMPARISON_SPLIT: Regex = Regex::new(
        r"\s+(?:vs\.?|versus|compared (?:to|with)|against)\s+"
    ).unwrap();
    static ref RELATIVE: Regex = Regex::new(
        r"\b(last|past|trailing|previous|prior|preceding)\s+(\d+|a|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve)\s+(day|week|month|quarter|year)s?\b"
    ).unwrap();
    static ref PAST_UNIT: Regex = Regex::new(
        r"\b(?:past|trailing)\s+(day|week|month|quarter|year)\b"
    ).unwrap();
    static ref PREVIOUS_BARE: Regex = Regex::new(
        r"\b(?:previous|prior|preceding)\s+(?:(day|week|month|quarter|year)s?|period)\b"
    ).unwrap();
    static ref CALENDAR: Regex = Regex::new(
        r"\b(this|current|last)\s+(week|month|quarter|year)\b"
    ).unwrap();
    static ref TO_DATE: Regex = Regex::new(
        r"\b(ytd|mtd|qtd|wtd|(year|month|quarter|week)[- ]to[- ]date)\b"
    ).unwrap();
    static ref QUARTER: Regex = Regex::new(
        r"\bq([1-4])(?:\s*'?(\d{4}|\d{2}))?\b"
    ).unwrap();
    static ref MONTH_NAME: Regex = Regex::new(
        r"\b(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sep|sept|oct|nov|dec)\b(?:\s+(\d{4}))?"
    ).unwrap();
    static ref YEAR: Regex = Regex::new(r"\b(?:in\s+|for\s+)?((?:19|20)\d{2})\b").unwrap();
    static ref DAY_WORD: Regex = Regex::new(r"\b(today|yesterday)\b").unwrap();
    static ref BUCKET: Regex = Regex::new(
        r"\b(daily|weekly|monthly|quarterly|yearly|annually|annual|(?:by|per|each)\s+(day|week|month|quarter|year))\b"
    ).unwrap();
    static ref TREND: Regex = Regex::new(r"\b(trend|trends|trending|over time|time series)\b").unwrap();
    static ref ROLLING_SUM: Regex = Regex::new(r"\b(?:rolling|moving|trailing)\s+(?:sum|total)s?\b").unwrap();
}

/// Longest trailing window accepted for rolling metrics
pub const MAX_ROLLING_WINDOW_DAYS: u32 = 3_660;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    fn from_word(word: &str) -> Option<Self> {
        match word {
            "day" | "daily" => Some(Granularity::Day),
            "week" | "weekly" | "wow" => Some(Granularity::Week),
            "month" | "monthly" | "mom" => Some(Granularity::Month),
            "quarter" | "quarterly" | "qoq" => Some(Granularity::Quarter),
            "year" | "yearly" | "annually" | "annual" => Some(Granularity::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Move a date by `n` units (negative moves back). Month-based units use
    /// calendar arithmetic, clamping to the last valid day of the month.
    /// `None` when the result falls outside the representable calendar.
    pub fn shift(&self, date: NaiveDate, n: i64) -> Option<NaiveDate> {
        match self {
            Granularity::Day => shift_days(date, n),
            Granularity::Week => shift_days(date, n.checked_mul(7)?),
            Granularity::Month => add_months(date, n),
            Granularity::Quarter => add_months(date, n.checked_mul(3)?),
            Granularity::Year => add_months(date, n.checked_mul(12)?),
        }
    }

    /// First day of the calendar period containing `date` (weeks start Monday)
    pub fn period_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => date,
            Granularity::Week => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Granularity::Month => date.with_day(1).unwrap_or(date),
            Granularity::Quarter => {
                let month = (date.month() - 1) / 3 * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
            }
            Granularity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }

    fn plural_label(&self, n: i64) -> String {
        let unit = match self {
            Granularity::Day => "Day",
            Granularity::Week => "Week",
            Granularity::Month => "Month",
            Granularity::Quarter => "Quarter",
            Granularity::Year => "Year",
        };
        if n == 1 {
            unit.to_string()
        } else {
            format!("{} {}s", n, unit)
        }
    }
}

/// How additive metrics combine over a rolling window. Ratio metrics are
/// always windowed numerator over windowed denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingAggregation {
    /// Window total divided by the window length in days
    #[default]
    Mean,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    SinglePeriod,
    PeriodOverPeriod,
    Rolling,
    YearOverYear,
}

/// Half-open date range `[start, end)` with a display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub label: String,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
        }
    }

    /// Range covering `first..=last`
    pub fn inclusive(first: NaiveDate, last: NaiveDate, label: impl Into<String>) -> Self {
        Self::new(first, last + Duration::days(1), label)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn last_day(&self) -> NaiveDate {
        self.end - Duration::days(1)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// "2024-01-08 to 2024-01-14"
    pub fn span_text(&self) -> String {
        format!("{} to {}", self.start, self.last_day())
    }
}

/// Resolved time intent of a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalIntent {
    /// Phrase the intent was resolved from ("all data" when none matched)
    pub anchor: String,
    /// One range, or two ordered (earlier, later) for comparisons. Empty
    /// when the dataset has no date span to default to.
    pub ranges: Vec<DateRange>,
    pub granularity: Granularity,
    pub comparison: ComparisonMode,
    /// Group results into `granularity` buckets (trend questions)
    pub bucketed: bool,
    pub rolling_window_days: Option<u32>,
    #[serde(default)]
    pub rolling_aggregation: RollingAggregation,
    /// True when no phrase was recognised and the full span was used
    pub fallback: bool,
}

impl TemporalIntent {
    pub fn all_data(span: Option<&DateRange>) -> Self {
        Self {
            anchor: "all data".to_string(),
            ranges: span.cloned().into_iter().collect(),
            granularity: Granularity::Day,
            comparison: ComparisonMode::SinglePeriod,
            bucketed: false,
            rolling_window_days: None,
            rolling_aggregation: RollingAggregation::Mean,
            fallback: true,
        }
    }

    /// Smallest range covering every resolved range
    pub fn covering_range(&self) -> Option<DateRange> {
        let start = self.ranges.iter().map(|r| r.start).min()?;
        let end = self.ranges.iter().map(|r| r.end).max()?;
        Some(DateRange::new(start, end, "Covering"))
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self.comparison,
            ComparisonMode::PeriodOverPeriod | ComparisonMode::YearOverYear
        ) && self.ranges.len() == 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowKind {
    /// last/past N units ending at the reference date
    Relative { n: i64, unit: Granularity },
    /// A calendar period (this week, Q3 2024, March)
    Calendar { unit: Granularity },
    /// Fixed day count from the configured vocabulary
    Days,
}

#[derive(Debug, Clone)]
struct Window {
    range: DateRange,
    kind: WindowKind,
    phrase: String,
}

impl Window {
    fn granularity(&self) -> Granularity {
        match self.kind {
            WindowKind::Relative { unit, .. } | WindowKind::Calendar { unit } => unit,
            WindowKind::Days => Granularity::Day,
        }
    }
}

pub struct TemporalResolver {
    vocabulary: TemporalVocabulary,
}

impl TemporalResolver {
    pub fn new(vocabulary: TemporalVocabulary) -> Self {
        Self { vocabulary }
    }

    /// Resolve the time intent of `question` as of `reference`.
    ///
    /// `span` is the full date span of the dataset, used when nothing in the
    /// question is recognised.
    pub fn resolve(
        &self,
        question: &str,
        reference: NaiveDate,
        span: Option<&DateRange>,
    ) -> TemporalIntent {
        let text = question.to_lowercase();

        if let Some(intent) = self.resolve_rolling(&text, reference, span) {
            return intent;
        }
        if let Some(intent) = self.resolve_year_over_year(&text, reference) {
            return intent;
        }
        if let Some(intent) = self.resolve_over_period(&text, reference) {
            return intent;
        }
        if let Some(intent) = self.resolve_versus(&text, reference) {
            return intent;
        }

        match self.find_window(&text, reference, None) {
            Some(window) => {
                let (bucketed, granularity) = bucket_granularity(&text, &window.range)
                    .map(|g| (true, g))
                    .unwrap_or((false, window.granularity()));
                TemporalIntent {
                    anchor: window.phrase,
                    ranges: vec![window.range],
                    granularity,
                    comparison: ComparisonMode::SinglePeriod,
                    bucketed,
                    rolling_window_days: None,
                    rolling_aggregation: RollingAggregation::Mean,
                    fallback: false,
                }
            }
            None => {
                debug!("Unrecognized temporal phrase in '{}', using full dataset span", question);
                let mut intent = TemporalIntent::all_data(span);
                if let Some(range) = span {
                    if let Some(granularity) = bucket_granularity(&text, range) {
                        intent.bucketed = true;
                        intent.granularity = granularity;
                    }
                }
                intent
            }
        }
    }

    fn resolve_rolling(
        &self,
        text: &str,
        reference: NaiveDate,
        span: Option<&DateRange>,
    ) -> Option<TemporalIntent> {
        let caps = ROLLING.captures(text)?;
        let window_days = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().parse::<u32>().ok().filter(|d| (1..=MAX_ROLLING_WINDOW_DAYS).contains(d)))
            .unwrap_or(Some(7));
        let Some(window_days) = window_days else {
            debug!("Rolling window out of range in '{}'", text);
            return None;
        };
        let aggregation = if ROLLING_SUM.is_match(text) {
            RollingAggregation::Sum
        } else {
            RollingAggregation::Mean
        };

        let stripped = ROLLING.replace(text, " ");
        let range = match self.find_window(&stripped, reference, None) {
            Some(window) => window.range,
            None => span.cloned()?,
        };

        Some(TemporalIntent {
            anchor: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
            ranges: vec![range],
            granularity: Granularity::Day,
            comparison: ComparisonMode::Rolling,
            bucketed: true,
            rolling_window_days: Some(window_days),
            rolling_aggregation: aggregation,
            fallback: false,
        })
    }

    fn resolve_year_over_year(&self, text: &str, reference: NaiveDate) -> Option<TemporalIntent> {
        let m = YOY.find(text)?;
        let rest = format!("{} {}", &text[..m.start()], &text[m.end()..]);

        let current = self
            .find_window(&rest, reference, None)
            .unwrap_or_else(|| Window {
                range: DateRange::new(
                    Granularity::Year.period_start(reference),
                    reference.succ_opt().unwrap_or(reference),
                    "Year to Date",
                ),
                kind: WindowKind::Calendar {
                    unit: Granularity::Year,
                },
                phrase: "year to date".to_string(),
            });

        let prior_start = Granularity::Year.shift(current.range.start, -1)?;
        let prior = DateRange::new(
            prior_start,
            Granularity::Year.shift(current.range.end, -1)?,
            prior_year_label(&current.range, prior_start),
        );
        let current_range = DateRange::new(
            current.range.start,
            current.range.end,
            current_year_label(&current.range),
        );

        Some(TemporalIntent {
            anchor: m.as_str().trim().to_string(),
            ranges: vec![prior, current_range],
            granularity: current.granularity(),
            comparison: ComparisonMode::YearOverYear,
            bucketed: false,
            rolling_window_days: None,
            rolling_aggregation: RollingAggregation::Mean,
            fallback: false,
        })
    }

    fn resolve_over_period(&self, text: &str, reference: NaiveDate) -> Option<TemporalIntent> {
        let caps = OVER_PERIOD.captures(text)?;
        let word = caps.get(1).or_else(|| caps.get(2))?.as_str();
        let unit = Granularity::from_word(word)?;

        let current = calendar_window(unit, 0, reference)?;
        let previous = calendar_window(unit, -1, reference)?;

        Some(TemporalIntent {
            anchor: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
            ranges: vec![previous.range, current.range],
            granularity: unit,
            comparison: ComparisonMode::PeriodOverPeriod,
            bucketed: false,
            rolling_window_days: None,
            rolling_aggregation: RollingAggregation::Mean,
            fallback: false,
        })
    }

    /// "X vs Y", "X compared to Y"
    fn resolve_versus(&self, text: &str, reference: NaiveDate) -> Option<TemporalIntent> {
        let sep = COMPARISON_SPLIT.find(text)?;
        let left_text = &text[..sep.start()];
        let right_text = &text[sep.end()..];

        let left = self.find_window(left_text, reference, None)?;
        let right = self.find_window(right_text, reference, Some(&left))?;

        let (earlier, later) = if right.range.start <= left.range.start {
            (right, left)
        } else {
            (left, right)
        };

        if earlier.range.overlaps(&later.range) {
            debug!(
                "Comparison windows {} and {} overlap, resolving as a single period",
                earlier.range.span_text(),
                later.range.span_text()
            );
            return None;
        }

        let granularity = later.granularity();
        let mut earlier_range = earlier.range;
        let mut later_range = later.range;
        if earlier_range.label == later_range.label {
            earlier_range.label = format!("{} ({})", earlier_range.label, earlier_range.span_text());
            later_range.label = format!("{} ({})", later_range.label, later_range.span_text());
        }

        Some(TemporalIntent {
            anchor: format!("{} vs {}", later.phrase, earlier.phrase),
            ranges: vec![earlier_range, later_range],
            granularity,
            comparison: ComparisonMode::PeriodOverPeriod,
            bucketed: false,
            rolling_window_days: None,
            rolling_aggregation: RollingAggregation::Mean,
            fallback: false,
        })
    }

    /// First window phrase found in `text`. `counterpart` is the other side
    /// of a comparison, used by "previous period"/"previous N" phrases.
    fn find_window(
        &self,
        text: &str,
        reference: NaiveDate,
        counterpart: Option<&Window>,
    ) -> Option<Window> {
        let end = shift_days(reference, 1)?;

        if let Some(caps) = RELATIVE.captures(text) {
            let direction = caps.get(1)?.as_str();
            let n = parse_count(caps.get(2)?.as_str())?;
            let unit = Granularity::from_word(caps.get(3)?.as_str())?;
            let phrase = caps.get(0)?.as_str().to_string();
            if n <= 0 {
                return None;
            }
            return if is_previous_word(direction) {
                relative_previous_window(unit, n, reference, phrase)
            } else {
                Some(Window {
                    range: DateRange::new(
                        unit.shift(reference, -n)?,
                        end,
                        format!("Last {}", unit.plural_label(n)),
                    ),
                    kind: WindowKind::Relative { n, unit },
                    phrase,
                })
            };
        }

        if let Some(caps) = PREVIOUS_BARE.captures(text) {
            let phrase = caps.get(0)?.as_str().to_string();
            let unit_word = caps.get(1).map(|m| m.as_str());
            return match (counterpart, unit_word) {
                (Some(other), _) => preceding_window(other, reference, phrase),
                (None, Some(word)) => {
                    let unit = Granularity::from_word(word)?;
                    relative_previous_window(unit, 1, reference, phrase)
                }
                (None, None) => None,
            };
        }

        if let Some(window) = self.vocabulary.lookup(text) {
            return Some(Window {
                range: DateRange::new(
                    shift_days(reference, window.days.checked_neg()?)?,
                    end,
                    title_case(&format!("last {}", window.phrase)),
                ),
                kind: WindowKind::Days,
                phrase: window.phrase.clone(),
            });
        }

        if let Some(caps) = PAST_UNIT.captures(text) {
            let unit = Granularity::from_word(caps.get(1)?.as_str())?;
            return Some(Window {
                range: DateRange::new(unit.shift(reference, -1)?, end, format!("Past {}", unit.plural_label(1))),
                kind: WindowKind::Relative { n: 1, unit },
                phrase: caps.get(0)?.as_str().to_string(),
            });
        }

        if let Some(caps) = TO_DATE.captures(text) {
            let word = caps.get(1)?.as_str();
            let unit = match word {
                "ytd" => Granularity::Year,
                "mtd" => Granularity::Month,
                "qtd" => Granularity::Quarter,
                "wtd" => Granularity::Week,
                _ => Granularity::from_word(caps.get(2)?.as_str())?,
            };
            let mut window = calendar_window(unit, 0, reference)?;
            window.range.label = title_case(&format!("{} to date", unit.as_str()));
            window.phrase = word.to_string();
            return Some(window);
        }

        if let Some(caps) = CALENDAR.captures(text) {
            let offset = if caps.get(1)?.as_str() == "last" { -1 } else { 0 };
            let unit = Granularity::from_word(caps.get(2)?.as_str())?;
            let mut window = calendar_window(unit, offset, reference)?;
            window.phrase = caps.get(0)?.as_str().to_string();
            return Some(window);
        }

        if let Some(caps) = QUARTER.captures(text) {
            let quarter: u32 = caps.get(1)?.as_str().parse().ok()?;
            let explicit_year = caps.get(2).and_then(|m| parse_year(m.as_str()));
            let start_month = (quarter - 1) * 3 + 1;
            let mut year = explicit_year.unwrap_or(reference.year());
            let mut start = NaiveDate::from_ymd_opt(year, start_month, 1)?;
            if explicit_year.is_none() && start > reference {
                year -= 1;
                start = NaiveDate::from_ymd_opt(year, start_month, 1)?;
            }
            return Some(Window {
                range: DateRange::new(start, add_months(start, 3)?, format!("Q{} {}", quarter, year)),
                kind: WindowKind::Calendar {
                    unit: Granularity::Quarter,
                },
                phrase: caps.get(0)?.as_str().to_string(),
            });
        }

        if let Some(caps) = MONTH_NAME.captures(text) {
            let month = month_number(caps.get(1)?.as_str())?;
            let explicit_year = caps.get(2).and_then(|m| m.as_str().parse::<i32>().ok());
            let mut year = explicit_year.unwrap_or(reference.year());
            let mut start = NaiveDate::from_ymd_opt(year, month, 1)?;
            if explicit_year.is_none() && start > reference {
                year -= 1;
                start = NaiveDate::from_ymd_opt(year, month, 1)?;
            }
            return Some(Window {
                range: DateRange::new(start, add_months(start, 1)?, start.format("%B %Y").to_string()),
                kind: WindowKind::Calendar {
                    unit: Granularity::Month,
                },
                phrase: caps.get(0)?.as_str().to_string(),
            });
        }

        if let Some(caps) = YEAR.captures(text) {
            let year: i32 = caps.get(1)?.as_str().parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
            return Some(Window {
                range: DateRange::new(start, add_months(start, 12)?, year.to_string()),
                kind: WindowKind::Calendar {
                    unit: Granularity::Year,
                },
                phrase: caps.get(1)?.as_str().to_string(),
            });
        }

        if let Some(caps) = DAY_WORD.captures(text) {
            let word = caps.get(1)?.as_str();
            let day = if word == "yesterday" {
                shift_days(reference, -1)?
            } else {
                reference
            };
            return Some(Window {
                range: DateRange::inclusive(day, day, title_case(word)),
                kind: WindowKind::Calendar {
                    unit: Granularity::Day,
                },
                phrase: word.to_string(),
            });
        }

        None
    }
}

fn calendar_window(unit: Granularity, offset: i64, reference: NaiveDate) -> Option<Window> {
    let current_start = unit.period_start(reference);
    let start = unit.shift(current_start, offset)?;
    let natural_end = unit.shift(start, 1)?;
    // The current period stops at the reference date
    let end = natural_end.min(shift_days(reference, 1)?);
    let label = match offset {
        0 => format!("This {}", title_case(unit.as_str())),
        -1 => format!("Last {}", title_case(unit.as_str())),
        _ => format!("{} {}", title_case(unit.as_str()), start),
    };
    Some(Window {
        range: DateRange::new(start, end, label),
        kind: WindowKind::Calendar { unit },
        phrase: format!("{} {}", if offset == 0 { "this" } else { "last" }, unit.as_str()),
    })
}

/// `[ref - 2N units, ref - N units)`
fn relative_previous_window(unit: Granularity, n: i64, reference: NaiveDate, phrase: String) -> Option<Window> {
    Some(Window {
        range: DateRange::new(
            unit.shift(reference, n.checked_mul(-2)?)?,
            unit.shift(reference, -n)?,
            format!("Previous {}", unit.plural_label(n)),
        ),
        kind: WindowKind::Relative { n, unit },
        phrase,
    })
}

/// The window immediately before `other`, with no gap or overlap.
fn preceding_window(other: &Window, reference: NaiveDate, phrase: String) -> Option<Window> {
    match other.kind {
        WindowKind::Relative { n, unit } => relative_previous_window(unit, n, reference, phrase),
        WindowKind::Calendar { unit } => {
            let start = unit.shift(other.range.start, -1)?;
            Some(Window {
                range: DateRange::new(start, other.range.start, format!("Previous {}", title_case(unit.as_str()))),
                kind: WindowKind::Calendar { unit },
                phrase,
            })
        }
        WindowKind::Days => {
            let days = other.range.days();
            Some(Window {
                range: DateRange::new(
                    shift_days(other.range.start, -days)?,
                    other.range.start,
                    "Previous Period",
                ),
                kind: WindowKind::Days,
                phrase,
            })
        }
    }
}

fn bucket_granularity(text: &str, range: &DateRange) -> Option<Granularity> {
    if let Some(caps) = BUCKET.captures(text) {
        let word = caps.get(2).or_else(|| caps.get(1))?.as_str();
        return Granularity::from_word(word);
    }
    if TREND.is_match(text) {
        let days = range.days();
        return Some(if days <= 31 {
            Granularity::Day
        } else if days <= 183 {
            Granularity::Week
        } else {
            Granularity::Month
        });
    }
    None
}

fn current_year_label(range: &DateRange) -> String {
    if range.label.chars().any(|c| c.is_ascii_digit()) {
        range.label.clone()
    } else {
        format!("{} ({})", range.label, range.start.year())
    }
}

fn prior_year_label(range: &DateRange, prior_start: NaiveDate) -> String {
    if range.label.chars().all(|c| !c.is_ascii_digit()) {
        format!("{} ({})", range.label, prior_start.year())
    } else {
        range
            .label
            .replace(&range.start.year().to_string(), &prior_start.year().to_string())
    }
}

fn add_months(date: NaiveDate, n: i64) -> Option<NaiveDate> {
    let months = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
    if n >= 0 {
        date.checked_add_months(months)
    } else {
        date.checked_sub_months(months)
    }
}

/// Checked day arithmetic; `None` past the ends of the calendar
pub fn shift_days(date: NaiveDate, n: i64) -> Option<NaiveDate> {
    let days = Days::new(n.unsigned_abs());
    if n >= 0 {
        date.checked_add_days(days)
    } else {
        date.checked_sub_days(days)
    }
}

fn is_previous_word(word: &str) -> bool {
    matches!(word, "previous" | "prior" | "preceding")
}

fn parse_count(word: &str) -> Option<i64> {
    let n = match word {
        "a" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        digits => digits.parse().ok()?,
    };
    Some(n)
}

fn parse_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    Some(if raw.len() == 2 { 2000 + year } else { year })
}

fn month_number(word: &str) -> Option<u32> {
    let month = match &word[..3.min(word.len())] {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn resolver() -> TemporalResolver {
        TemporalResolver::new(TemporalVocabulary::default())
    }

    #[test]
    fn test_last_vs_previous_weeks_are_contiguous() {
        let reference = date(2024, 6, 30);
        let intent = resolver().resolve("CTR last 2 weeks vs previous 2 weeks", reference, None);

        assert_eq!(intent.comparison, ComparisonMode::PeriodOverPeriod);
        assert_eq!(intent.ranges.len(), 2);
        let (previous, last) = (&intent.ranges[0], &intent.ranges[1]);

        assert_eq!(previous.start, reference - Duration::days(28));
        assert_eq!(previous.end, reference - Duration::days(14));
        assert_eq!(last.start, reference - Duration::days(14));
        assert_eq!(last.last_day(), reference);
        assert_eq!(previous.end, last.start);
        assert!(!previous.overlaps(last));
        assert_eq!(previous.label, "Previous 2 Weeks");
        assert_eq!(last.label, "Last 2 Weeks");

        let union = resolver().resolve("CTR last 4 weeks", reference, None);
        assert_eq!(union.ranges[0].start, previous.start);
        assert_eq!(union.ranges[0].end, last.end);
    }

    #[test]
    fn test_disjointness_holds_for_many_windows() {
        let reference = date(2024, 3, 31);
        for n in 1..=12 {
            for unit in ["days", "weeks", "months"] {
                let question = format!("spend last {n} {unit} vs previous {n} {unit}");
                let intent = resolver().resolve(&question, reference, None);
                let (previous, last) = (&intent.ranges[0], &intent.ranges[1]);
                assert_eq!(previous.end, last.start, "{}", question);
                assert!(previous.start < previous.end, "{}", question);

                let union = resolver().resolve(&format!("spend last {} {unit}", 2 * n), reference, None);
                assert_eq!(union.ranges[0].start, previous.start, "{}", question);
            }
        }
    }

    #[test]
    fn test_this_week_vs_last_week_uses_calendar_weeks() {
        // 2024-01-08 is a Monday
        let intent = resolver().resolve("what is CPC this week vs last week", date(2024, 1, 8), None);
        assert_eq!(intent.ranges[0], DateRange::new(date(2024, 1, 1), date(2024, 1, 8), "Last Week"));
        assert_eq!(intent.ranges[1], DateRange::new(date(2024, 1, 8), date(2024, 1, 9), "This Week"));
        assert_eq!(intent.granularity, Granularity::Week);
    }

    #[test]
    fn test_quarter_comparison() {
        let intent = resolver().resolve("ROAS Q3 vs Q2", date(2024, 11, 15), None);
        assert_eq!(intent.ranges[0].label, "Q2 2024");
        assert_eq!(intent.ranges[0].start, date(2024, 4, 1));
        assert_eq!(intent.ranges[1].label, "Q3 2024");
        assert_eq!(intent.ranges[1].end, date(2024, 10, 1));
    }

    #[test]
    fn test_year_over_year_shifts_calendar_years() {
        let intent = resolver().resolve("spend in february 2024 year over year", date(2024, 6, 1), None);
        assert_eq!(intent.comparison, ComparisonMode::YearOverYear);
        let (prior, current) = (&intent.ranges[0], &intent.ranges[1]);
        assert_eq!(current.start, date(2024, 2, 1));
        assert_eq!(current.end, date(2024, 3, 1));
        assert_eq!(prior.start, date(2023, 2, 1));
        assert_eq!(prior.end, date(2023, 3, 1));
        assert_eq!(prior.label, "February 2023");
    }

    #[test]
    fn test_year_over_year_clamps_leap_day() {
        let intent = resolver().resolve("clicks yesterday yoy", date(2024, 3, 1), None);
        assert_eq!(intent.ranges[1].start, date(2024, 2, 29));
        assert_eq!(intent.ranges[0].start, date(2023, 2, 28));
    }

    #[test]
    fn test_rolling_window() {
        let intent = resolver().resolve("7-day rolling average CTR last 30 days", date(2024, 5, 31), None);
        assert_eq!(intent.comparison, ComparisonMode::Rolling);
        assert_eq!(intent.rolling_window_days, Some(7));
        assert_eq!(intent.ranges[0].start, date(2024, 5, 1));
    }

    #[test]
    fn test_rolling_sum_and_mean_are_distinguished() {
        let sum = resolver().resolve("7-day rolling sum of spend", date(2024, 5, 31), None);
        assert_eq!(sum.rolling_aggregation, RollingAggregation::Sum);
        assert_eq!(sum.rolling_window_days, Some(7));

        let mean = resolver().resolve("7-day rolling average ctr", date(2024, 5, 31), None);
        assert_eq!(mean.rolling_aggregation, RollingAggregation::Mean);
    }

    #[test]
    fn test_out_of_range_windows_fall_back_to_full_span() {
        let span = DateRange::inclusive(date(2024, 1, 1), date(2024, 3, 31), "All Data");
        let reference = date(2024, 3, 31);

        let intent = resolver().resolve("spend last 999999999 days", reference, Some(&span));
        assert!(intent.fallback);
        assert_eq!(intent.ranges, vec![span.clone()]);

        let rolling = resolver().resolve("99999999-day rolling ctr", reference, Some(&span));
        assert_ne!(rolling.comparison, ComparisonMode::Rolling);
        assert!(rolling.fallback);

        assert_eq!(Granularity::Year.shift(reference, i64::MAX), None);
        assert_eq!(shift_days(NaiveDate::MIN, -1), None);
    }

    #[test]
    fn test_fuzzy_phrase_comes_from_vocabulary() {
        let intent = resolver().resolve("spend over the last couple of months", date(2024, 5, 31), None);
        assert_eq!(intent.ranges[0].days(), 61);
        assert!(!intent.fallback);
    }

    #[test]
    fn test_unrecognized_phrase_falls_back_to_full_span() {
        let span = DateRange::inclusive(date(2024, 1, 1), date(2024, 3, 31), "All Data");
        let intent = resolver().resolve("spend since the rebrand", date(2024, 3, 31), Some(&span));
        assert!(intent.fallback);
        assert_eq!(intent.comparison, ComparisonMode::SinglePeriod);
        assert_eq!(intent.ranges, vec![span]);
    }

    #[test]
    fn test_bucketed_trend() {
        let intent = resolver().resolve("monthly spend this year", date(2024, 8, 10), None);
        assert!(intent.bucketed);
        assert_eq!(intent.granularity, Granularity::Month);
        assert_eq!(intent.ranges[0].start, date(2024, 1, 1));
    }

    #[test]
    fn test_week_over_week() {
        let intent = resolver().resolve("clicks week over week", date(2024, 1, 10), None);
        assert_eq!(intent.comparison, ComparisonMode::PeriodOverPeriod);
        assert_eq!(intent.ranges[0].start, date(2024, 1, 1));
        assert_eq!(intent.ranges[1].start, date(2024, 1, 8));
    }
}

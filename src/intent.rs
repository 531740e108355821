//! Query Intent
//!
//! Deterministic extraction of what a question asks for: metrics, grouping
//! dimensions, filters and ordering. The time part comes from the temporal
//! resolver and is attached as-is.

use crate::metrics::{BaseMetric, MetricCatalog, MetricKind, RATIO_METRICS};
use crate::schema::{normalize_name, DisplayUnit, SchemaDescriptor, SemanticType};
use crate::temporal::TemporalIntent;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use strsim::jaro_winkler;
use tracing::debug;

const DIMENSION_SIMILARITY_THRESHOLD: f64 = 0.92;
const DEFAULT_TOP_N: u64 = 10;

lazy_static! {
    static ref RANKING: Regex = Regex::new(
        r"\b(top|best|highest|most|bottom|worst|lowest|least)\b(?:\s+(\d+))?"
    ).unwrap();
    static ref THRESHOLD: Regex = Regex::new(
        r"\b(?:with|where|having)\s+(?:an?\s+|the\s+)?([a-z][a-z _-]*?)\s+(above|over|greater than|more than|at least|below|under|less than|at most|>=|<=|>|<)\s+\$?(\d+(?:\.\d+)?)\s*(%)?"
    ).unwrap();
    static ref EXPLICIT_FILTER: Regex = Regex::new(
        r"\bwhere\s+([a-z][a-z0-9_ ]*?)\s+(?:is not|!=|<>)\s+'?([a-z0-9_\-]+)'?|\bwhere\s+([a-z][a-z0-9_ ]*?)\s+(?:is|=|equals)\s+'?([a-z0-9_\-]+)'?"
    ).unwrap();
    static ref WORD: Regex = Regex::new(r"[a-z0-9_]+").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "<>",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
        }
    }

    fn from_phrase(phrase: &str) -> Option<Self> {
        match phrase {
            "above" | "over" | "greater than" | "more than" | ">" => Some(FilterOperator::Gt),
            "at least" | ">=" => Some(FilterOperator::Gte),
            "below" | "under" | "less than" | "<" => Some(FilterOperator::Lt),
            "at most" | "<=" => Some(FilterOperator::Lte),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Number(n) => write!(f, "{}", n),
            FilterValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// `column operator value`. A column naming a requested metric filters the
/// aggregated value (HAVING); anything else filters rows (WHERE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub column: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub metric: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub question: String,
    /// Catalog metric names or schema column names, in question order
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    pub filters: Vec<FilterPredicate>,
    pub temporal: TemporalIntent,
    pub sort: Option<SortSpec>,
    pub limit: Option<u64>,
}

impl QueryIntent {
    pub fn new(question: &str, temporal: TemporalIntent) -> Self {
        Self {
            question: question.to_string(),
            metrics: Vec::new(),
            dimensions: Vec::new(),
            filters: Vec::new(),
            temporal,
            sort: None,
            limit: None,
        }
    }
}

/// Rule-based question parser bound to a schema snapshot.
pub struct IntentParser<'a> {
    schema: &'a SchemaDescriptor,
}

impl<'a> IntentParser<'a> {
    pub fn new(schema: &'a SchemaDescriptor) -> Self {
        Self { schema }
    }

    pub fn parse(&self, question: &str, temporal: TemporalIntent) -> QueryIntent {
        let text = question.to_lowercase();
        let mut intent = QueryIntent::new(question, temporal);

        let mut masked = text.clone();
        intent.filters = self.extract_thresholds(&mut masked);
        intent.metrics = self.extract_metrics(&masked);
        intent.dimensions = self.extract_dimensions(&text);
        intent.filters.extend(self.extract_value_filters(&text, &intent.dimensions));

        for filter in intent.filters.iter().filter(|f| is_metric_filter(f, self.schema)) {
            if !intent.metrics.iter().any(|m| m == &filter.column) {
                intent.metrics.push(filter.column.clone());
            }
        }

        let (sort, limit) = self.extract_ranking(&text, &intent);
        intent.sort = sort;
        intent.limit = limit;

        debug!(
            "Parsed intent: metrics={:?} dimensions={:?} filters={} sort={:?} limit={:?}",
            intent.metrics,
            intent.dimensions,
            intent.filters.len(),
            intent.sort,
            intent.limit
        );
        intent
    }

    /// Metric mentions ordered by first appearance. Longer phrases are matched
    /// first and masked so "cost per click" is not also read as cost + clicks.
    fn extract_metrics(&self, text: &str) -> Vec<String> {
        let mut phrases: Vec<(String, String)> = Vec::new();
        for ratio in RATIO_METRICS {
            for alias in ratio.aliases {
                phrases.push((alias.to_string(), ratio.name.to_string()));
            }
        }
        for base in BaseMetric::ALL {
            if self.schema.base_column(base).is_none() {
                continue;
            }
            for alias in base.question_aliases() {
                phrases.push((alias.to_string(), base.as_str().to_string()));
            }
        }
        for column in self.schema.numeric_columns() {
            let spoken = normalize_name(&column.name).replace('_', " ");
            phrases.push((spoken, column.name.clone()));
        }
        phrases.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut masked = text.to_string();
        let mut found: Vec<(usize, String)> = Vec::new();
        for (phrase, metric) in phrases {
            let pattern = format!(r"\b{}\b", regex::escape(&phrase));
            let Ok(re) = Regex::new(&pattern) else {
                continue;
            };
            let spans: Vec<(usize, usize)> = re.find_iter(&masked).map(|m| (m.start(), m.end())).collect();
            for (start, end) in spans {
                found.push((start, metric.clone()));
                masked.replace_range(start..end, &" ".repeat(end - start));
            }
        }

        found.sort_by_key(|(pos, _)| *pos);
        let mut metrics: Vec<String> = Vec::new();
        for (_, metric) in found {
            if !metrics.contains(&metric) {
                metrics.push(metric);
            }
        }
        metrics
    }

    fn extract_dimensions(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = WORD.find_iter(text).map(|m| m.as_str()).collect();
        let mut dimensions: Vec<String> = Vec::new();

        let mut i = 0;
        while i < words.len() {
            let trigger = match words[i] {
                "by" | "per" | "across" | "each" | "every" | "which" => 1,
                "broken" | "split" | "grouped" | "segmented"
                    if words.get(i + 1) == Some(&"by") || words.get(i + 1) == Some(&"down") =>
                {
                    if words.get(i + 1) == Some(&"down") { 3 } else { 2 }
                }
                _ => 0,
            };
            if trigger == 0 {
                i += 1;
                continue;
            }

            let mut pos = i + trigger;
            while pos < words.len() {
                if let Some((column, consumed)) = self.match_dimension(&words[pos..]) {
                    if !dimensions.contains(&column) {
                        dimensions.push(column);
                    }
                    pos += consumed;
                    if words.get(pos) == Some(&"and") {
                        pos += 1;
                        continue;
                    }
                }
                break;
            }
            i = pos.max(i + 1);
        }
        dimensions
    }

    /// Longest 1–3 word prefix of `words` naming a categorical or identifier column
    fn match_dimension(&self, words: &[&str]) -> Option<(String, usize)> {
        let candidates: Vec<_> = self
            .schema
            .columns
            .iter()
            .filter(|c| {
                matches!(
                    c.semantic_type,
                    SemanticType::Categorical | SemanticType::Identifier
                )
            })
            .collect();

        for len in (1..=words.len().min(3)).rev() {
            let phrase = words[..len].join("_");
            let singular = phrase.strip_suffix('s').unwrap_or(&phrase).to_string();

            let mut best: Option<(&str, f64, bool)> = None;
            for column in &candidates {
                let normalized = normalize_name(&column.name);
                let score = if normalized == phrase || normalized == singular {
                    1.0
                } else if is_name_variant(&normalized, &singular) {
                    0.99
                } else if len == 1 {
                    jaro_winkler(&normalized, &singular)
                } else {
                    0.0
                };
                let categorical = column.semantic_type == SemanticType::Categorical;
                let better = match best {
                    None => true,
                    Some((_, s, c)) => score > s || (score == s && categorical && !c),
                };
                if score >= DIMENSION_SIMILARITY_THRESHOLD && better {
                    best = Some((column.name.as_str(), score, categorical));
                }
            }
            if let Some((name, _, _)) = best {
                return Some((name.to_string(), len));
            }
        }
        None
    }

    fn extract_value_filters(&self, text: &str, dimensions: &[String]) -> Vec<FilterPredicate> {
        let mut filters = Vec::new();

        for caps in EXPLICIT_FILTER.captures_iter(text) {
            let (column, value, operator) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
                (Some(c), Some(v), _, _) => (c.as_str(), v.as_str(), FilterOperator::NotEq),
                (_, _, Some(c), Some(v)) => (c.as_str(), v.as_str(), FilterOperator::Eq),
                _ => continue,
            };
            let words: Vec<&str> = column.split_whitespace().collect();
            if let Some((column, _)) = self.match_dimension(&words) {
                let value = self.canonical_value(&column, value);
                filters.push(FilterPredicate {
                    column,
                    operator,
                    value: FilterValue::Text(value),
                });
            }
        }

        for column in self.schema.categorical_columns() {
            let mut values: Vec<&String> = column.distinct_values.iter().collect();
            values.sort_by(|a, b| b.len().cmp(&a.len()));
            for value in values {
                let lowered = value.to_lowercase();
                // A value equal to a grouping column name is the grouping, not a filter
                if dimensions.iter().any(|d| normalize_name(d) == normalize_name(&lowered)) {
                    continue;
                }
                let pattern = format!(r"\b(excluding|except|without|not)?\s*\b{}\b", regex::escape(&lowered));
                let Ok(re) = Regex::new(&pattern) else {
                    continue;
                };
                if let Some(caps) = re.captures(text) {
                    if filters.iter().any(|f: &FilterPredicate| {
                        f.column == column.name && f.value == FilterValue::Text(value.clone())
                    }) {
                        continue;
                    }
                    let operator = if caps.get(1).is_some() {
                        FilterOperator::NotEq
                    } else {
                        FilterOperator::Eq
                    };
                    filters.push(FilterPredicate {
                        column: column.name.clone(),
                        operator,
                        value: FilterValue::Text(value.clone()),
                    });
                }
            }
        }
        filters
    }

    /// "with CTR above 2%" → metric filter on the aggregated value
    fn extract_thresholds(&self, masked: &mut String) -> Vec<FilterPredicate> {
        let mut filters = Vec::new();
        let text = masked.clone();
        for caps in THRESHOLD.captures_iter(&text) {
            let (Some(subject), Some(op), Some(number)) = (caps.get(1), caps.get(2), caps.get(3)) else {
                continue;
            };
            let Some(operator) = FilterOperator::from_phrase(op.as_str()) else {
                continue;
            };
            let Ok(mut value) = number.as_str().parse::<f64>() else {
                continue;
            };

            let metric = match MetricCatalog::lookup(subject.as_str().trim()) {
                Some(MetricKind::Ratio(ratio)) => {
                    if caps.get(4).is_some() || ratio.unit == DisplayUnit::Percent && value > 1.0 {
                        value /= 100.0;
                    }
                    ratio.name.to_string()
                }
                Some(MetricKind::Base(base)) if self.schema.base_column(base).is_some() => {
                    base.as_str().to_string()
                }
                _ => continue,
            };

            filters.push(FilterPredicate {
                column: metric,
                operator,
                value: FilterValue::Number(value),
            });
            if let Some(m) = caps.get(0) {
                masked.replace_range(m.start()..m.end(), &" ".repeat(m.end() - m.start()));
            }
        }
        filters
    }

    fn extract_ranking(&self, text: &str, intent: &QueryIntent) -> (Option<SortSpec>, Option<u64>) {
        let Some(caps) = RANKING.captures(text) else {
            return (None, None);
        };
        let Some(metric) = intent.metrics.first() else {
            return (None, None);
        };
        let word = caps.get(1).map(|m| m.as_str()).unwrap_or("top");
        let count = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());

        let lower_is_better = is_cost_metric(metric);
        let descending = match word {
            "top" | "highest" | "most" => true,
            "bottom" | "lowest" | "least" => false,
            "best" => !lower_is_better,
            _ => lower_is_better,
        };

        let limit = match (word, count) {
            (_, Some(n)) => Some(n),
            ("top" | "bottom", None) => Some(DEFAULT_TOP_N),
            _ if !intent.dimensions.is_empty()
                && (text.starts_with("which") || text.starts_with("what")) =>
            {
                Some(1)
            }
            _ => None,
        };

        (
            Some(SortSpec {
                metric: metric.clone(),
                descending,
            }),
            limit,
        )
    }

    fn canonical_value(&self, column: &str, raw: &str) -> String {
        self.schema
            .column(column)
            .and_then(|c| c.distinct_values.iter().find(|v| v.eq_ignore_ascii_case(raw)))
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }
}

/// Whether a filter targets an aggregated metric rather than a row column
pub fn is_metric_filter(filter: &FilterPredicate, schema: &SchemaDescriptor) -> bool {
    if MetricCatalog::lookup(&filter.column).is_some() {
        return true;
    }
    schema
        .column(&filter.column)
        .map(|c| c.semantic_type.is_numeric())
        .unwrap_or(false)
}

/// "campaign_name" is a variant of "campaign"
fn is_name_variant(column: &str, phrase: &str) -> bool {
    match column.strip_prefix(phrase) {
        Some(rest) => matches!(rest, "_name" | "_type" | "_id" | "_group"),
        None => false,
    }
}

fn is_cost_metric(metric: &str) -> bool {
    matches!(
        MetricCatalog::lookup(metric),
        Some(MetricKind::Ratio(r)) if r.numerator == BaseMetric::Spend
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, DisplayUnit};
    use crate::temporal::TemporalIntent;

    fn column(name: &str, semantic_type: SemanticType, values: &[&str]) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            semantic_type,
            unit: DisplayUnit::None,
            ratio: None,
            grain: None,
            distinct_values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            "campaigns",
            vec![
                column("Date", SemanticType::Date, &[]),
                column("Platform", SemanticType::Categorical, &["Facebook", "Google", "LinkedIn"]),
                column("Campaign_Name", SemanticType::Categorical, &[]),
                column("Spend", SemanticType::NumericAdditive, &[]),
                column("Impressions", SemanticType::NumericAdditive, &[]),
                column("Clicks", SemanticType::NumericAdditive, &[]),
                column("Conversions", SemanticType::NumericAdditive, &[]),
                column("Revenue", SemanticType::NumericAdditive, &[]),
            ],
            1,
        )
    }

    fn parse(question: &str) -> QueryIntent {
        let schema = schema();
        IntentParser::new(&schema).parse(question, TemporalIntent::all_data(None))
    }

    #[test]
    fn test_ratio_phrase_is_not_split_into_bases() {
        let intent = parse("What is the cost per click and CTR by platform?");
        assert_eq!(intent.metrics, vec!["cpc".to_string(), "ctr".to_string()]);
        assert_eq!(intent.dimensions, vec!["Platform".to_string()]);
    }

    #[test]
    fn test_dimension_name_variants() {
        let intent = parse("spend and revenue by campaign and platform");
        assert_eq!(intent.metrics, vec!["spend".to_string(), "revenue".to_string()]);
        assert_eq!(
            intent.dimensions,
            vec!["Campaign_Name".to_string(), "Platform".to_string()]
        );
    }

    #[test]
    fn test_value_filters() {
        let intent = parse("ROAS on Google excluding LinkedIn");
        assert!(intent.filters.contains(&FilterPredicate {
            column: "Platform".to_string(),
            operator: FilterOperator::Eq,
            value: FilterValue::Text("Google".to_string()),
        }));
        assert!(intent.filters.contains(&FilterPredicate {
            column: "Platform".to_string(),
            operator: FilterOperator::NotEq,
            value: FilterValue::Text("LinkedIn".to_string()),
        }));
    }

    #[test]
    fn test_threshold_filter_on_percentage() {
        let intent = parse("campaigns by campaign name with CTR above 2%");
        let filter = intent.filters.iter().find(|f| f.column == "ctr").unwrap();
        assert_eq!(filter.operator, FilterOperator::Gt);
        assert_eq!(filter.value, FilterValue::Number(0.02));
        assert!(intent.metrics.contains(&"ctr".to_string()));
    }

    #[test]
    fn test_top_n_ranking() {
        let intent = parse("top 5 campaigns by revenue per campaign");
        assert_eq!(intent.limit, Some(5));
        assert_eq!(
            intent.sort,
            Some(SortSpec {
                metric: "revenue".to_string(),
                descending: true
            })
        );
    }

    #[test]
    fn test_best_cpa_sorts_ascending() {
        let intent = parse("which platform has the best CPA");
        assert_eq!(intent.sort.as_ref().map(|s| s.descending), Some(false));
        assert_eq!(intent.limit, Some(1));
    }

    #[test]
    fn test_no_metric_leaves_intent_empty() {
        let intent = parse("tell me something interesting");
        assert!(intent.metrics.is_empty());
    }
}

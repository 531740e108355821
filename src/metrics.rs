//! Metric Aggregation Model
//!
//! Every derived campaign metric is a ratio of two base-metric sums. Ratios
//! are always recomputed as `SUM(numerator) / SUM(denominator)` at the grain
//! the query targets, never averaged across rows or groups.

use crate::error::{EngineError, Result};
use crate::schema::{normalize_name, quote_ident, DisplayUnit, SchemaDescriptor, SemanticType};
use serde::{Deserialize, Serialize};

/// Additive quantities that can be summed across any partition of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseMetric {
    Spend,
    Impressions,
    Clicks,
    Conversions,
    Revenue,
}

impl BaseMetric {
    pub const ALL: [BaseMetric; 5] = [
        BaseMetric::Spend,
        BaseMetric::Impressions,
        BaseMetric::Clicks,
        BaseMetric::Conversions,
        BaseMetric::Revenue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BaseMetric::Spend => "spend",
            BaseMetric::Impressions => "impressions",
            BaseMetric::Clicks => "clicks",
            BaseMetric::Conversions => "conversions",
            BaseMetric::Revenue => "revenue",
        }
    }

    /// Normalized column names that carry this quantity
    pub fn column_aliases(&self) -> &'static [&'static str] {
        match self {
            BaseMetric::Spend => &["spend", "cost", "amount_spent", "ad_spend", "total_spend", "spend_usd", "cost_usd"],
            BaseMetric::Impressions => &["impressions", "impr", "impression", "total_impressions"],
            BaseMetric::Clicks => &["clicks", "click", "link_clicks", "total_clicks"],
            BaseMetric::Conversions => &["conversions", "conversion", "conv", "purchases", "leads", "total_conversions"],
            BaseMetric::Revenue => &["revenue", "conversion_value", "sales", "purchase_value", "total_revenue"],
        }
    }

    /// Words in a question that refer to this quantity
    pub fn question_aliases(&self) -> &'static [&'static str] {
        match self {
            BaseMetric::Spend => &["spend", "spent", "cost", "budget"],
            BaseMetric::Impressions => &["impressions", "impression", "views", "reach"],
            BaseMetric::Clicks => &["clicks", "click"],
            BaseMetric::Conversions => &["conversions", "conversion", "purchases", "leads", "signups"],
            BaseMetric::Revenue => &["revenue", "sales", "income"],
        }
    }

    pub fn matches_column(&self, normalized: &str) -> bool {
        self.column_aliases().contains(&normalized)
    }

    pub fn unit(&self) -> DisplayUnit {
        match self {
            BaseMetric::Spend | BaseMetric::Revenue => DisplayUnit::Currency,
            _ => DisplayUnit::Count,
        }
    }
}

/// What to do when the denominator sums to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullPolicy {
    /// `NULLIF(denominator, 0)`: the metric is NULL, never a division error
    NullIfZero,
}

/// A derived metric: `scale * SUM(numerator) / SUM(denominator)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatioMetric {
    pub name: &'static str,
    pub label: &'static str,
    pub numerator: BaseMetric,
    pub denominator: BaseMetric,
    pub scale: f64,
    pub unit: DisplayUnit,
    pub null_policy: NullPolicy,
    pub aliases: &'static [&'static str],
}

pub const RATIO_METRICS: &[RatioMetric] = &[
    RatioMetric {
        name: "ctr",
        label: "CTR",
        numerator: BaseMetric::Clicks,
        denominator: BaseMetric::Impressions,
        scale: 1.0,
        unit: DisplayUnit::Percent,
        null_policy: NullPolicy::NullIfZero,
        aliases: &["ctr", "click through rate", "click-through rate", "clickthrough rate"],
    },
    RatioMetric {
        name: "cpc",
        label: "CPC",
        numerator: BaseMetric::Spend,
        denominator: BaseMetric::Clicks,
        scale: 1.0,
        unit: DisplayUnit::Currency,
        null_policy: NullPolicy::NullIfZero,
        aliases: &["cpc", "cost per click"],
    },
    RatioMetric {
        name: "cpm",
        label: "CPM",
        numerator: BaseMetric::Spend,
        denominator: BaseMetric::Impressions,
        scale: 1000.0,
        unit: DisplayUnit::Currency,
        null_policy: NullPolicy::NullIfZero,
        aliases: &["cpm", "cost per mille", "cost per thousand impressions", "cost per thousand"],
    },
    RatioMetric {
        name: "cpa",
        label: "CPA",
        numerator: BaseMetric::Spend,
        denominator: BaseMetric::Conversions,
        scale: 1.0,
        unit: DisplayUnit::Currency,
        null_policy: NullPolicy::NullIfZero,
        aliases: &["cpa", "cost per acquisition", "cost per conversion", "cost per lead", "cpl"],
    },
    RatioMetric {
        name: "roas",
        label: "ROAS",
        numerator: BaseMetric::Revenue,
        denominator: BaseMetric::Spend,
        scale: 1.0,
        unit: DisplayUnit::Multiple,
        null_policy: NullPolicy::NullIfZero,
        aliases: &["roas", "return on ad spend", "return on spend"],
    },
    RatioMetric {
        name: "conversion_rate",
        label: "Conversion Rate",
        numerator: BaseMetric::Conversions,
        denominator: BaseMetric::Clicks,
        scale: 1.0,
        unit: DisplayUnit::Percent,
        null_policy: NullPolicy::NullIfZero,
        aliases: &["conversion rate", "conversion_rate", "cvr", "conv rate"],
    },
];

impl RatioMetric {
    pub fn matches_column(&self, normalized: &str) -> bool {
        normalized == self.name
            || self.aliases.iter().any(|a| normalize_name(a) == normalized)
    }

    /// Reference computation over already-summed totals.
    pub fn compute(&self, numerator_total: f64, denominator_total: f64) -> Option<f64> {
        match self.null_policy {
            NullPolicy::NullIfZero if denominator_total == 0.0 => None,
            NullPolicy::NullIfZero => Some(numerator_total * self.scale / denominator_total),
        }
    }

    fn sql(&self, numerator: &str, denominator: &str, level: AggregationLevel) -> String {
        let (num, den) = match level {
            AggregationLevel::Row => (quote_ident(numerator), quote_ident(denominator)),
            AggregationLevel::Grouped => (
                format!("SUM({})", quote_ident(numerator)),
                format!("SUM({})", quote_ident(denominator)),
            ),
        };
        match self.null_policy {
            NullPolicy::NullIfZero => {
                format!("{} * {:.1} / NULLIF({}, 0)", num, self.scale, den)
            }
        }
    }
}

/// Row-level expressions touch a single row; grouped ones aggregate under
/// whatever GROUP BY (possibly none) the query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationLevel {
    Row,
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricKind {
    Base(BaseMetric),
    Ratio(&'static RatioMetric),
}

/// A SQL fragment computing one requested metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricExpr {
    /// Output column alias
    pub alias: String,
    pub sql: String,
    pub semantic_type: SemanticType,
    pub unit: DisplayUnit,
    /// Base columns summed to build this metric (numerator first for ratios)
    pub components: Vec<String>,
    pub ratio: Option<&'static RatioMetric>,
}

/// Lookup of catalog metrics by name or alias.
pub struct MetricCatalog;

impl MetricCatalog {
    pub fn lookup(name: &str) -> Option<MetricKind> {
        let normalized = normalize_name(name);
        if let Some(ratio) = RATIO_METRICS.iter().find(|m| m.matches_column(&normalized)) {
            return Some(MetricKind::Ratio(ratio));
        }
        BaseMetric::ALL
            .iter()
            .find(|b| b.as_str() == normalized || b.question_aliases().contains(&normalized.as_str()))
            .map(|b| MetricKind::Base(*b))
    }

    pub fn ratio(name: &str) -> Option<&'static RatioMetric> {
        match Self::lookup(name) {
            Some(MetricKind::Ratio(r)) => Some(r),
            _ => None,
        }
    }

    /// Formulas listed in generation prompts, one per line.
    pub fn formula_notes(schema: &SchemaDescriptor) -> Vec<String> {
        RATIO_METRICS
            .iter()
            .filter_map(|m| {
                metric_expression(m.name, schema, AggregationLevel::Grouped)
                    .ok()
                    .map(|expr| format!("{} = {}", m.label, expr.sql))
            })
            .collect()
    }
}

/// The only legal way to compute a metric for a query.
///
/// Ratio metrics resolve to `SUM(num) * scale / NULLIF(SUM(den), 0)` over
/// the schema's bound base columns. Additive columns resolve to `SUM(col)`.
/// Ratio columns without a known numerator/denominator are not averaged:
/// they fail with `UnknownMetric` and the caller decides on a passthrough.
pub fn metric_expression(
    metric: &str,
    schema: &SchemaDescriptor,
    level: AggregationLevel,
) -> Result<MetricExpr> {
    match MetricCatalog::lookup(metric) {
        Some(MetricKind::Ratio(ratio)) => {
            let numerator = schema.base_column(ratio.numerator);
            let denominator = schema.base_column(ratio.denominator);
            match (numerator, denominator) {
                (Some(num), Some(den)) => Ok(MetricExpr {
                    alias: ratio.name.to_string(),
                    sql: ratio.sql(num, den, level),
                    semantic_type: SemanticType::NumericRatio,
                    unit: ratio.unit,
                    components: vec![num.to_string(), den.to_string()],
                    ratio: Some(ratio),
                }),
                _ => Err(EngineError::UnknownMetric(format!(
                    "{} needs {} and {} columns",
                    ratio.label,
                    ratio.numerator.as_str(),
                    ratio.denominator.as_str()
                ))),
            }
        }
        Some(MetricKind::Base(base)) => match schema.base_column(base) {
            Some(column) => Ok(additive_expr(column, base.unit(), level)),
            None => column_expression(metric, schema, level),
        },
        None => column_expression(metric, schema, level),
    }
}

fn column_expression(metric: &str, schema: &SchemaDescriptor, level: AggregationLevel) -> Result<MetricExpr> {
    let column = schema
        .column(metric)
        .ok_or_else(|| EngineError::UnknownMetric(metric.to_string()))?;

    match column.semantic_type {
        SemanticType::NumericAdditive => Ok(additive_expr(&column.name, column.unit, level)),
        SemanticType::NumericRatio => match &column.ratio {
            Some(binding) => {
                let ratio = MetricCatalog::ratio(&binding.metric)
                    .ok_or_else(|| EngineError::UnknownMetric(metric.to_string()))?;
                Ok(MetricExpr {
                    alias: normalize_name(&column.name),
                    sql: ratio.sql(&binding.numerator, &binding.denominator, level),
                    semantic_type: SemanticType::NumericRatio,
                    unit: column.unit,
                    components: vec![binding.numerator.clone(), binding.denominator.clone()],
                    ratio: Some(ratio),
                })
            }
            None => Err(EngineError::UnknownMetric(format!(
                "{} has no numerator/denominator mapping",
                column.name
            ))),
        },
        _ => Err(EngineError::UnknownMetric(format!(
            "{} is not a numeric column",
            column.name
        ))),
    }
}

fn additive_expr(column: &str, unit: DisplayUnit, level: AggregationLevel) -> MetricExpr {
    let sql = match level {
        AggregationLevel::Row => quote_ident(column),
        AggregationLevel::Grouped => format!("SUM({})", quote_ident(column)),
    };
    MetricExpr {
        alias: normalize_name(column),
        sql,
        semantic_type: SemanticType::NumericAdditive,
        unit,
        components: vec![column.to_string()],
        ratio: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn column(name: &str, semantic_type: SemanticType) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            semantic_type,
            unit: DisplayUnit::None,
            ratio: None,
            grain: None,
            distinct_values: Vec::new(),
        }
    }

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            "campaigns",
            vec![
                column("Date", SemanticType::Date),
                column("Platform", SemanticType::Categorical),
                column("Spend", SemanticType::NumericAdditive),
                column("Impressions", SemanticType::NumericAdditive),
                column("Clicks", SemanticType::NumericAdditive),
                column("Conversions", SemanticType::NumericAdditive),
                column("Revenue", SemanticType::NumericAdditive),
                column("Quality_Score", SemanticType::NumericRatio),
            ],
            1,
        )
    }

    #[test]
    fn test_ctr_is_ratio_of_sums() {
        let expr = metric_expression("CTR", &schema(), AggregationLevel::Grouped).unwrap();
        assert_eq!(expr.sql, "SUM(\"Clicks\") * 1.0 / NULLIF(SUM(\"Impressions\"), 0)");
        assert_eq!(expr.semantic_type, SemanticType::NumericRatio);
        assert!(!expr.sql.contains("AVG"));
    }

    #[test]
    fn test_roas_cpa_cpm_formulas() {
        let s = schema();
        assert_eq!(
            metric_expression("roas", &s, AggregationLevel::Grouped).unwrap().sql,
            "SUM(\"Revenue\") * 1.0 / NULLIF(SUM(\"Spend\"), 0)"
        );
        assert_eq!(
            metric_expression("cost per acquisition", &s, AggregationLevel::Grouped).unwrap().sql,
            "SUM(\"Spend\") * 1.0 / NULLIF(SUM(\"Conversions\"), 0)"
        );
        assert_eq!(
            metric_expression("cpm", &s, AggregationLevel::Grouped).unwrap().sql,
            "SUM(\"Spend\") * 1000.0 / NULLIF(SUM(\"Impressions\"), 0)"
        );
    }

    #[test]
    fn test_row_level_skips_sum() {
        let expr = metric_expression("cpc", &schema(), AggregationLevel::Row).unwrap();
        assert_eq!(expr.sql, "\"Spend\" * 1.0 / NULLIF(\"Clicks\", 0)");
    }

    #[test]
    fn test_recomputed_ratio_differs_from_naive_mean() {
        let ctr = MetricCatalog::ratio("ctr").unwrap();
        let groups = [(100.0, 5000.0), (200.0, 20000.0)];

        let clicks: f64 = groups.iter().map(|g| g.0).sum();
        let impressions: f64 = groups.iter().map(|g| g.1).sum();
        let correct = ctr.compute(clicks, impressions).unwrap();

        let naive = groups
            .iter()
            .map(|g| ctr.compute(g.0, g.1).unwrap())
            .sum::<f64>()
            / groups.len() as f64;

        assert!((correct - 0.012).abs() < 1e-12);
        assert!((naive - 0.015).abs() < 1e-12);
        assert!((correct - naive).abs() > 1e-6);
    }

    #[test]
    fn test_zero_denominator_is_null() {
        let cpa = MetricCatalog::ratio("cpa").unwrap();
        assert_eq!(cpa.compute(500.0, 0.0), None);
    }

    #[test]
    fn test_unmapped_ratio_column_is_unknown() {
        let err = metric_expression("Quality_Score", &schema(), AggregationLevel::Grouped).unwrap_err();
        assert!(matches!(err, EngineError::UnknownMetric(_)));
    }

    #[test]
    fn test_missing_metric_is_unknown() {
        let err = metric_expression("bounce_rate", &schema(), AggregationLevel::Grouped).unwrap_err();
        assert!(matches!(err, EngineError::UnknownMetric(_)));
    }
}

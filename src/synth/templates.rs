//! Template library
//!
//! Parameterized query shapes keyed by metric-set shape, grouping and
//! comparison mode. Every metric goes through `metric_expression`, so ratio
//! metrics are always `SUM(num) / NULLIF(SUM(den), 0)` at the target grain.

use super::{
    CandidateQuery, OutputColumn, PostProcess, QueryParam, RollingMetric, RollingSpec,
    SynthesisTier,
};
use crate::error::{EngineError, Result};
use crate::intent::{is_metric_filter, FilterPredicate, FilterValue, QueryIntent};
use crate::metrics::{metric_expression, AggregationLevel, MetricExpr};
use crate::schema::{normalize_name, quote_ident, DisplayUnit, SchemaDescriptor, SemanticType};
use crate::temporal::{shift_days, ComparisonMode, DateRange, Granularity};
use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

const PERIOD_CTE: &str = "periods";
const BUCKET_CTE: &str = "buckets";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Totals over one period
    Aggregate,
    /// GROUP BY dimensions, optionally ranked
    Breakdown,
    /// Two labelled periods, optionally per dimension
    PeriodComparison,
    /// One row per time bucket
    Trend,
    /// Trailing window over daily sums
    Rolling,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Aggregate => "aggregate",
            TemplateKind::Breakdown => "breakdown",
            TemplateKind::PeriodComparison => "period_comparison",
            TemplateKind::Trend => "trend",
            TemplateKind::Rolling => "rolling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricShape {
    Single,
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateKey {
    pub shape: MetricShape,
    pub grouped: bool,
    pub mode: ComparisonMode,
    pub bucketed: bool,
}

impl TemplateKey {
    pub fn of(intent: &QueryIntent) -> Option<Self> {
        let shape = match intent.metrics.len() {
            0 => return None,
            1 => MetricShape::Single,
            _ => MetricShape::Multiple,
        };
        Some(Self {
            shape,
            grouped: !intent.dimensions.is_empty(),
            mode: intent.temporal.comparison,
            bucketed: intent.temporal.bucketed,
        })
    }

    /// Which template handles this shape, if any
    pub fn template(&self) -> Option<TemplateKind> {
        match (self.mode, self.grouped, self.bucketed) {
            (ComparisonMode::Rolling, false, _) => Some(TemplateKind::Rolling),
            (ComparisonMode::Rolling, true, _) => None,
            (ComparisonMode::PeriodOverPeriod | ComparisonMode::YearOverYear, _, _) => {
                Some(TemplateKind::PeriodComparison)
            }
            (ComparisonMode::SinglePeriod, false, true) => Some(TemplateKind::Trend),
            (ComparisonMode::SinglePeriod, true, true) => None,
            (ComparisonMode::SinglePeriod, true, false) => Some(TemplateKind::Breakdown),
            (ComparisonMode::SinglePeriod, false, false) => Some(TemplateKind::Aggregate),
        }
    }
}

/// Resolved inputs shared by every template.
struct TemplateInput<'a> {
    intent: &'a QueryIntent,
    schema: &'a SchemaDescriptor,
    metrics: Vec<MetricExpr>,
    dimensions: Vec<String>,
    params: Vec<QueryParam>,
}

/// Build a candidate from the template library. `Ok(None)` means no
/// template covers the intent's shape.
pub fn synthesize(intent: &QueryIntent, schema: &SchemaDescriptor) -> Result<Option<CandidateQuery>> {
    let Some(key) = TemplateKey::of(intent) else {
        return Ok(None);
    };
    let Some(kind) = key.template() else {
        debug!("No template for {:?}", key);
        return Ok(None);
    };

    let needs_dates = kind != TemplateKind::Aggregate && kind != TemplateKind::Breakdown;
    if needs_dates && schema.date_column.is_none() {
        return Ok(None);
    }

    let input = TemplateInput::resolve(intent, schema)?;
    let candidate = match kind {
        TemplateKind::Aggregate | TemplateKind::Breakdown => aggregate(&input, kind)?,
        TemplateKind::PeriodComparison => period_comparison(&input)?,
        TemplateKind::Trend => trend(&input)?,
        TemplateKind::Rolling => rolling(&input)?,
    };
    Ok(Some(candidate))
}

impl<'a> TemplateInput<'a> {
    fn resolve(intent: &'a QueryIntent, schema: &'a SchemaDescriptor) -> Result<Self> {
        let mut metrics: Vec<MetricExpr> = Vec::with_capacity(intent.metrics.len());
        for name in &intent.metrics {
            let expr = match metric_expression(name, schema, AggregationLevel::Grouped) {
                Ok(expr) => expr,
                Err(EngineError::UnknownMetric(reason)) => passthrough(name, intent, schema)
                    .ok_or(EngineError::UnknownMetric(reason))?,
                Err(e) => return Err(e),
            };
            if !metrics.iter().any(|m| m.alias == expr.alias) {
                metrics.push(expr);
            }
        }

        let dimensions = intent
            .dimensions
            .iter()
            .map(|d| {
                schema
                    .column(d)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| EngineError::SynthesisFailure {
                        question: intent.question.clone(),
                        trace: format!("unknown dimension {}", d),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let params = intent
            .filters
            .iter()
            .map(|f| QueryParam {
                name: f.column.clone(),
                value: f.value.clone(),
            })
            .collect();

        Ok(Self {
            intent,
            schema,
            metrics,
            dimensions,
            params,
        })
    }

    fn table(&self) -> String {
        quote_ident(&self.schema.table_name)
    }

    fn date_column(&self) -> Option<&str> {
        self.schema.date_column.as_deref()
    }

    /// Row-level predicates: date range plus non-metric filters
    fn where_clause(&self, range: Option<&DateRange>) -> Result<Option<String>> {
        let mut predicates = Vec::new();
        if let (Some(range), Some(date_col)) = (range, self.date_column()) {
            predicates.push(range_predicate(date_col, range));
        }
        for filter in self.row_filters() {
            predicates.push(self.row_filter_sql(filter)?);
        }
        Ok(if predicates.is_empty() {
            None
        } else {
            Some(predicates.join(" AND "))
        })
    }

    fn row_filters(&self) -> impl Iterator<Item = &FilterPredicate> {
        self.intent
            .filters
            .iter()
            .filter(|f| !is_metric_filter(f, self.schema))
    }

    fn row_filter_sql(&self, filter: &FilterPredicate) -> Result<String> {
        let column = self
            .schema
            .column(&filter.column)
            .ok_or_else(|| EngineError::SynthesisFailure {
                question: self.intent.question.clone(),
                trace: format!("unknown filter column {}", filter.column),
            })?;
        Ok(format!(
            "{} {} {}",
            quote_ident(&column.name),
            filter.operator.as_sql(),
            value_literal(&filter.value)
        ))
    }

    /// Aggregate-level predicates on requested metrics
    fn having_clause(&self) -> Option<String> {
        let predicates: Vec<String> = self
            .intent
            .filters
            .iter()
            .filter(|f| is_metric_filter(f, self.schema))
            .filter_map(|f| {
                let expr = self.metric_for(&f.column)?;
                Some(format!("{} {} {}", expr.sql, f.operator.as_sql(), value_literal(&f.value)))
            })
            .collect();
        if predicates.is_empty() {
            None
        } else {
            Some(predicates.join(" AND "))
        }
    }

    fn metric_for(&self, name: &str) -> Option<&MetricExpr> {
        let normalized = normalize_name(name);
        self.metrics.iter().find(|m| m.alias == normalized).or_else(|| {
            metric_expression(name, self.schema, AggregationLevel::Grouped)
                .ok()
                .and_then(|expr| self.metrics.iter().find(|m| m.alias == expr.alias))
        })
    }

    fn metric_projection(&self) -> String {
        self.metrics
            .iter()
            .map(|m| format!("{} AS {}", m.sql, quote_ident(&m.alias)))
            .join(", ")
    }

    fn metric_columns(&self) -> Vec<OutputColumn> {
        self.metrics
            .iter()
            .map(|m| OutputColumn::new(m.alias.clone(), m.semantic_type, m.unit))
            .collect()
    }

    fn dimension_columns(&self) -> Vec<OutputColumn> {
        self.dimensions
            .iter()
            .map(|d| {
                let semantic_type = self
                    .schema
                    .column(d)
                    .map(|c| c.semantic_type)
                    .unwrap_or(SemanticType::Categorical);
                OutputColumn::new(d.clone(), semantic_type, DisplayUnit::None)
            })
            .collect()
    }

    fn order_by(&self, leading: &[String]) -> Option<String> {
        let mut terms: Vec<String> = leading.to_vec();
        if let Some(sort) = &self.intent.sort {
            if let Some(metric) = self.metric_for(&sort.metric) {
                terms.push(format!(
                    "{} {}",
                    quote_ident(&metric.alias),
                    if sort.descending { "DESC" } else { "ASC" }
                ));
            }
        }
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(", "))
        }
    }

    fn candidate(&self, sql: String, columns: Vec<OutputColumn>, kind: TemplateKind) -> CandidateQuery {
        CandidateQuery {
            sql,
            params: self.params.clone(),
            columns,
            tier: SynthesisTier::Template(kind),
            post_process: None,
        }
    }
}

fn aggregate(input: &TemplateInput, kind: TemplateKind) -> Result<CandidateQuery> {
    let range = input.intent.temporal.covering_range();
    let dims: Vec<String> = input.dimensions.iter().map(|d| quote_ident(d)).collect();

    let mut projection = dims.clone();
    projection.push(input.metric_projection());

    let mut sql = format!("SELECT {} FROM {}", projection.join(", "), input.table());
    if let Some(clause) = input.where_clause(range.as_ref())? {
        sql.push_str(&format!(" WHERE {}", clause));
    }
    if !dims.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", dims.join(", ")));
    }
    if let Some(having) = input.having_clause() {
        sql.push_str(&format!(" HAVING {}", having));
    }
    let leading = if input.intent.sort.is_none() { dims.clone() } else { Vec::new() };
    if !dims.is_empty() {
        if let Some(order) = input.order_by(&leading) {
            sql.push_str(&format!(" ORDER BY {}", order));
        }
    }
    if let Some(limit) = input.intent.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut columns = input.dimension_columns();
    columns.extend(input.metric_columns());
    Ok(input.candidate(sql, columns, kind))
}

/// Two labelled periods. Rows are tagged with their period inside a CTE and
/// the metrics recomputed per period (and per dimension when grouped).
fn period_comparison(input: &TemplateInput) -> Result<CandidateQuery> {
    let date_col = input
        .date_column()
        .ok_or_else(|| EngineError::Dataset("dataset has no date column".to_string()))?;
    let ranges = &input.intent.temporal.ranges;
    if ranges.len() != 2 {
        return Err(EngineError::SynthesisFailure {
            question: input.intent.question.clone(),
            trace: format!("comparison needs two periods, resolved {}", ranges.len()),
        });
    }

    let label_case = case_over_ranges(date_col, ranges, |r| string_literal(&r.label));
    let span_case = case_over_ranges(date_col, ranges, |r| string_literal(&r.span_text()));

    let any_period = ranges
        .iter()
        .map(|r| format!("({})", range_predicate(date_col, r)))
        .join(" OR ");
    let mut predicates = vec![format!("({})", any_period)];
    for filter in input.row_filters() {
        predicates.push(input.row_filter_sql(filter)?);
    }

    let dims: Vec<String> = input.dimensions.iter().map(|d| quote_ident(d)).collect();
    let mut group_terms = vec!["period".to_string(), "period_range".to_string()];
    group_terms.extend(dims.iter().cloned());

    let mut sql = format!(
        "WITH {cte} AS (SELECT *, {label} AS period, {span} AS period_range FROM {table} WHERE {predicates}) \
         SELECT {group}, {metrics} FROM {cte} GROUP BY {group}",
        cte = PERIOD_CTE,
        label = label_case,
        span = span_case,
        table = input.table(),
        predicates = predicates.join(" AND "),
        group = group_terms.join(", "),
        metrics = input.metric_projection(),
    );
    if let Some(having) = input.having_clause() {
        sql.push_str(&format!(" HAVING {}", having));
    }
    let mut leading = vec!["period_range".to_string()];
    if input.intent.sort.is_none() {
        leading.extend(dims.iter().cloned());
    }
    if let Some(order) = input.order_by(&leading) {
        sql.push_str(&format!(" ORDER BY {}", order));
    }
    if let Some(limit) = input.intent.limit {
        // The limit applies per period
        sql.push_str(&format!(" LIMIT {}", limit * ranges.len() as u64));
    }

    let mut columns = vec![
        OutputColumn::new("period", SemanticType::Categorical, DisplayUnit::None),
        OutputColumn::new("period_range", SemanticType::Categorical, DisplayUnit::None),
    ];
    columns.extend(input.dimension_columns());
    columns.extend(input.metric_columns());
    Ok(input.candidate(sql, columns, TemplateKind::PeriodComparison))
}

fn trend(input: &TemplateInput) -> Result<CandidateQuery> {
    let date_col = input
        .date_column()
        .ok_or_else(|| EngineError::Dataset("dataset has no date column".to_string()))?;
    let range = input.intent.temporal.covering_range();
    let bucket = bucket_expression(date_col, input.intent.temporal.granularity);

    let mut sql = format!(
        "WITH {cte} AS (SELECT *, {bucket} AS period FROM {table}",
        cte = BUCKET_CTE,
        bucket = bucket,
        table = input.table(),
    );
    if let Some(clause) = input.where_clause(range.as_ref())? {
        sql.push_str(&format!(" WHERE {}", clause));
    }
    sql.push_str(&format!(
        ") SELECT period, {} FROM {} GROUP BY period",
        input.metric_projection(),
        BUCKET_CTE
    ));
    if let Some(having) = input.having_clause() {
        sql.push_str(&format!(" HAVING {}", having));
    }
    sql.push_str(" ORDER BY period");

    let mut columns = vec![OutputColumn::new("period", SemanticType::Date, DisplayUnit::None)];
    columns.extend(input.metric_columns());
    Ok(input.candidate(sql, columns, TemplateKind::Trend))
}

/// Daily base sums; the trailing window itself is a post-aggregation step.
fn rolling(input: &TemplateInput) -> Result<CandidateQuery> {
    let date_col = input
        .date_column()
        .ok_or_else(|| EngineError::Dataset("dataset has no date column".to_string()))?;
    let window_days = input.intent.temporal.rolling_window_days.unwrap_or(7).max(1);
    let range = input
        .intent
        .temporal
        .covering_range()
        .ok_or_else(|| EngineError::SynthesisFailure {
            question: input.intent.question.clone(),
            trace: "rolling window needs a date range".to_string(),
        })?;
    let emit_from = range.start;
    let warmup_start = shift_days(emit_from, 1 - i64::from(window_days)).ok_or_else(|| {
        EngineError::SynthesisFailure {
            question: input.intent.question.clone(),
            trace: format!("{}-day rolling window leaves the calendar", window_days),
        }
    })?;
    let warmup = DateRange::new(warmup_start, range.end, range.label.clone());

    let mut seen = HashSet::new();
    let mut components: Vec<String> = Vec::new();
    for metric in &input.metrics {
        for column in &metric.components {
            if seen.insert(column.clone()) {
                components.push(column.clone());
            }
        }
    }

    let sums = components
        .iter()
        .map(|c| format!("SUM({}) AS {}", quote_ident(c), quote_ident(&component_alias(c))))
        .join(", ");
    let date = quote_ident(date_col);
    let mut sql = format!("SELECT {date}, {sums} FROM {}", input.table());
    if let Some(clause) = input.where_clause(Some(&warmup))? {
        sql.push_str(&format!(" WHERE {}", clause));
    }
    sql.push_str(&format!(" GROUP BY {date} ORDER BY {date}"));

    let mut columns = vec![OutputColumn::new(date_col, SemanticType::Date, DisplayUnit::None)];
    columns.extend(components.iter().map(|c| {
        let unit = input.schema.column(c).map(|s| s.unit).unwrap_or(DisplayUnit::None);
        OutputColumn::new(component_alias(c), SemanticType::NumericAdditive, unit)
    }));

    let spec = RollingSpec {
        window_days,
        aggregation: input.intent.temporal.rolling_aggregation,
        date_column: date_col.to_string(),
        emit_from,
        metrics: input
            .metrics
            .iter()
            .map(|m| RollingMetric {
                alias: m.alias.clone(),
                components: m.components.iter().map(|c| component_alias(c)).collect(),
                ratio: m.ratio,
            })
            .collect(),
    };

    let mut candidate = input.candidate(sql, columns, TemplateKind::Rolling);
    candidate.post_process = Some(PostProcess::Rolling(spec));
    Ok(candidate)
}

/// Pre-aggregated column used as-is. Only allowed when the query groups by
/// exactly the column's declared grain, over a single period, so each group
/// holds one source row and no re-aggregation happens.
fn passthrough(name: &str, intent: &QueryIntent, schema: &SchemaDescriptor) -> Option<MetricExpr> {
    let column = schema.column(name)?;
    let grain = column.grain.as_ref()?;
    if !column.semantic_type.is_numeric()
        || intent.temporal.comparison != ComparisonMode::SinglePeriod
        || intent.temporal.bucketed
    {
        return None;
    }
    let wanted: HashSet<String> = grain.iter().map(|g| normalize_name(g)).collect();
    let grouped: HashSet<String> = intent.dimensions.iter().map(|d| normalize_name(d)).collect();
    if wanted != grouped {
        return None;
    }
    debug!("Passing through pre-aggregated column {} at grain {:?}", column.name, grain);
    Some(MetricExpr {
        alias: normalize_name(&column.name),
        sql: format!("MAX({})", quote_ident(&column.name)),
        semantic_type: column.semantic_type,
        unit: column.unit,
        components: vec![column.name.clone()],
        ratio: None,
    })
}

fn component_alias(column: &str) -> String {
    format!("{}_total", normalize_name(column))
}

fn case_over_ranges(date_col: &str, ranges: &[DateRange], value: impl Fn(&DateRange) -> String) -> String {
    let arms = ranges
        .iter()
        .map(|r| format!("WHEN {} THEN {}", range_predicate(date_col, r), value(r)))
        .join(" ");
    format!("CASE {} END", arms)
}

fn bucket_expression(date_col: &str, granularity: Granularity) -> String {
    let date = quote_ident(date_col);
    match granularity {
        Granularity::Day => format!("STRFTIME({}, '%Y-%m-%d')", date),
        Granularity::Week => format!("STRFTIME({}, '%G-W%V')", date),
        Granularity::Month => format!("STRFTIME({}, '%Y-%m')", date),
        Granularity::Quarter => format!(
            "STRFTIME({d}, '%Y') || '-Q' || CASE WHEN STRFTIME({d}, '%m') <= '03' THEN '1' \
             WHEN STRFTIME({d}, '%m') <= '06' THEN '2' WHEN STRFTIME({d}, '%m') <= '09' THEN '3' ELSE '4' END",
            d = date
        ),
        Granularity::Year => format!("STRFTIME({}, '%Y')", date),
    }
}

pub fn range_predicate(date_col: &str, range: &DateRange) -> String {
    let date = quote_ident(date_col);
    format!(
        "{date} >= {} AND {date} < {}",
        date_literal(range.start),
        date_literal(range.end)
    )
}

pub fn date_literal(date: NaiveDate) -> String {
    format!("CAST('{}' AS DATE)", date.format("%Y-%m-%d"))
}

pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn value_literal(value: &FilterValue) -> String {
    match value {
        FilterValue::Number(n) if n.is_finite() => format!("{}", n),
        FilterValue::Number(_) => "NULL".to_string(),
        FilterValue::Text(s) => string_literal(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{FilterOperator, SortSpec};
    use crate::schema::ColumnSpec;
    use crate::temporal::{RollingAggregation, TemporalIntent};

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
        let mut score = column("Quality_Score", SemanticType::NumericRatio);
        score.grain = Some(vec!["Campaign".to_string()]);
        SchemaDescriptor::new(
            "campaigns",
            vec![
                column("Date", SemanticType::Date),
                column("Platform", SemanticType::Categorical),
                column("Campaign", SemanticType::Categorical),
                column("Spend", SemanticType::NumericAdditive),
                column("Impressions", SemanticType::NumericAdditive),
                column("Clicks", SemanticType::NumericAdditive),
                score,
            ],
            1,
        )
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn comparison_intent(metrics: &[&str]) -> QueryIntent {
        let mut temporal = TemporalIntent::all_data(None);
        temporal.fallback = false;
        temporal.comparison = ComparisonMode::PeriodOverPeriod;
        temporal.granularity = Granularity::Week;
        temporal.ranges = vec![
            DateRange::new(date(2024, 1, 1), date(2024, 1, 8), "Last Week"),
            DateRange::new(date(2024, 1, 8), date(2024, 1, 15), "This Week"),
        ];
        let mut intent = QueryIntent::new("cpc this week vs last week", temporal);
        intent.metrics = metrics.iter().map(|m| m.to_string()).collect();
        intent
    }

    #[test]
    fn test_breakdown_groups_and_recomputes_ratios() {
        let mut intent = QueryIntent::new("ctr by platform", TemporalIntent::all_data(None));
        intent.metrics = vec!["ctr".to_string()];
        intent.dimensions = vec!["Platform".to_string()];
        intent.sort = Some(SortSpec {
            metric: "ctr".to_string(),
            descending: true,
        });
        intent.limit = Some(3);

        let candidate = synthesize(&intent, &schema()).unwrap().unwrap();
        assert_eq!(candidate.tier, SynthesisTier::Template(TemplateKind::Breakdown));
        assert_eq!(
            candidate.sql,
            "SELECT \"Platform\", SUM(\"Clicks\") * 1.0 / NULLIF(SUM(\"Impressions\"), 0) AS \"ctr\" \
             FROM \"campaigns\" GROUP BY \"Platform\" ORDER BY \"ctr\" DESC LIMIT 3"
        );
        assert!(!candidate.sql.contains("AVG"));
        assert_eq!(candidate.columns[1].semantic_type, SemanticType::NumericRatio);
    }

    #[test]
    fn test_comparison_labels_both_periods() {
        let candidate = synthesize(&comparison_intent(&["cpc"]), &schema()).unwrap().unwrap();
        assert_eq!(candidate.tier, SynthesisTier::Template(TemplateKind::PeriodComparison));
        assert!(candidate.sql.starts_with("WITH periods AS (SELECT *, CASE WHEN"));
        assert!(candidate.sql.contains("THEN 'Last Week'"));
        assert!(candidate.sql.contains("THEN '2024-01-08 to 2024-01-14'"));
        assert!(candidate.sql.contains("SUM(\"Spend\") * 1.0 / NULLIF(SUM(\"Clicks\"), 0) AS \"cpc\""));
        assert!(candidate.sql.contains("GROUP BY period, period_range"));
        assert!(candidate.sql.ends_with("ORDER BY period_range"));
        let names: Vec<&str> = candidate.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["period", "period_range", "cpc"]);
    }

    #[test]
    fn test_filters_split_into_where_and_having() {
        let mut intent = QueryIntent::new("q", TemporalIntent::all_data(None));
        intent.metrics = vec!["ctr".to_string()];
        intent.dimensions = vec!["Campaign".to_string()];
        intent.filters = vec![
            FilterPredicate {
                column: "Platform".to_string(),
                operator: FilterOperator::Eq,
                value: FilterValue::Text("O'Brien Ads".to_string()),
            },
            FilterPredicate {
                column: "ctr".to_string(),
                operator: FilterOperator::Gt,
                value: FilterValue::Number(0.02),
            },
        ];
        let candidate = synthesize(&intent, &schema()).unwrap().unwrap();
        assert!(candidate.sql.contains("WHERE \"Platform\" = 'O''Brien Ads'"));
        assert!(candidate
            .sql
            .contains("HAVING SUM(\"Clicks\") * 1.0 / NULLIF(SUM(\"Impressions\"), 0) > 0.02"));
        assert_eq!(candidate.params.len(), 2);
    }

    #[test]
    fn test_rolling_declares_post_process() {
        let mut temporal = TemporalIntent::all_data(None);
        temporal.comparison = ComparisonMode::Rolling;
        temporal.rolling_window_days = Some(7);
        temporal.ranges = vec![DateRange::new(date(2024, 5, 1), date(2024, 6, 1), "May")];
        let mut intent = QueryIntent::new("7-day rolling ctr", temporal);
        intent.metrics = vec!["ctr".to_string()];

        let candidate = synthesize(&intent, &schema()).unwrap().unwrap();
        assert!(candidate.sql.contains("\"Date\" >= CAST('2024-04-25' AS DATE)"));
        assert!(candidate.sql.contains("SUM(\"Clicks\") AS \"clicks_total\""));
        match candidate.post_process {
            Some(PostProcess::Rolling(spec)) => {
                assert_eq!(spec.window_days, 7);
                assert_eq!(spec.aggregation, RollingAggregation::Mean);
                assert_eq!(spec.emit_from, date(2024, 5, 1));
                assert_eq!(spec.metrics[0].components, vec!["clicks_total", "impressions_total"]);
            }
            None => panic!("rolling template must declare a post-process step"),
        }
    }

    #[test]
    fn test_trend_buckets_by_month() {
        let mut temporal = TemporalIntent::all_data(None);
        temporal.bucketed = true;
        temporal.granularity = Granularity::Month;
        let mut intent = QueryIntent::new("monthly spend", temporal);
        intent.metrics = vec!["spend".to_string()];
        let candidate = synthesize(&intent, &schema()).unwrap().unwrap();
        assert!(candidate.sql.contains("STRFTIME(\"Date\", '%Y-%m') AS period"));
        assert!(candidate.sql.ends_with("GROUP BY period ORDER BY period"));
    }

    #[test]
    fn test_passthrough_only_at_declared_grain() {
        let mut intent = QueryIntent::new("quality score by campaign", TemporalIntent::all_data(None));
        intent.metrics = vec!["Quality_Score".to_string()];
        intent.dimensions = vec!["Campaign".to_string()];
        let candidate = synthesize(&intent, &schema()).unwrap().unwrap();
        assert!(candidate.sql.contains("MAX(\"Quality_Score\")"));

        intent.dimensions = vec!["Platform".to_string()];
        let err = synthesize(&intent, &schema()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownMetric(_)));
    }

    #[test]
    fn test_no_metrics_means_no_template() {
        let intent = QueryIntent::new("anything interesting?", TemporalIntent::all_data(None));
        assert!(synthesize(&intent, &schema()).unwrap().is_none());
    }
}

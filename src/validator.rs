//! SQL Safety Validator
//!
//! The only gate between synthesized SQL text and execution. Checks run in
//! order and stop at the first failure:
//! 1. statement shape: exactly one read-only query, no separators
//! 2. keyword denylist on whole unquoted tokens
//! 3. schema allowlist for every table and column reference, resolved per
//!    scope; table functions are never allowed
//! 4. row bound: LIMIT added or clamped to the ceiling
//!
//! The executed text is re-rendered from the validated AST, so what runs is
//! exactly what was checked.

use crate::schema::SchemaDescriptor;
use crate::synth::CandidateQuery;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableAlias, TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::{debug, warn};

/// Rejected as whole unquoted words anywhere, aliases included
pub const DENIED_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "CREATE", "GRANT", "ATTACH",
    "PRAGMA", "EXEC", "EXECUTE", "COPY", "MERGE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    Parse,
    MultipleStatements,
    StatementShape,
    DeniedKeyword,
    UnknownTable,
    UnknownColumn,
    TableFunction,
    Unbounded,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::Parse => "parse",
            ValidationRule::MultipleStatements => "multiple_statements",
            ValidationRule::StatementShape => "statement_shape",
            ValidationRule::DeniedKeyword => "denied_keyword",
            ValidationRule::UnknownTable => "unknown_table",
            ValidationRule::UnknownColumn => "unknown_column",
            ValidationRule::TableFunction => "table_function",
            ValidationRule::Unbounded => "unbounded",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection carrying the rule that fired. The detail may contain SQL and
/// schema names: log it, never show it to end users.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("SQL does not parse: {0}")]
    Parse(String),

    #[error("Multiple statements: {0}")]
    MultipleStatements(String),

    #[error("Not a read-only query: {0}")]
    StatementShape(String),

    #[error("Denied keyword: {0}")]
    DeniedKeyword(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Table function not allowed: {0}")]
    TableFunction(String),

    #[error("Unbounded result: {0}")]
    Unbounded(String),
}

impl ValidationError {
    pub fn new(rule: ValidationRule, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match rule {
            ValidationRule::Parse => ValidationError::Parse(detail),
            ValidationRule::MultipleStatements => ValidationError::MultipleStatements(detail),
            ValidationRule::StatementShape => ValidationError::StatementShape(detail),
            ValidationRule::DeniedKeyword => ValidationError::DeniedKeyword(detail),
            ValidationRule::UnknownTable => ValidationError::UnknownTable(detail),
            ValidationRule::UnknownColumn => ValidationError::UnknownColumn(detail),
            ValidationRule::TableFunction => ValidationError::TableFunction(detail),
            ValidationRule::Unbounded => ValidationError::Unbounded(detail),
        }
    }

    pub fn rule(&self) -> ValidationRule {
        match self {
            ValidationError::Parse(_) => ValidationRule::Parse,
            ValidationError::MultipleStatements(_) => ValidationRule::MultipleStatements,
            ValidationError::StatementShape(_) => ValidationRule::StatementShape,
            ValidationError::DeniedKeyword(_) => ValidationRule::DeniedKeyword,
            ValidationError::UnknownTable(_) => ValidationRule::UnknownTable,
            ValidationError::UnknownColumn(_) => ValidationRule::UnknownColumn,
            ValidationError::TableFunction(_) => ValidationRule::TableFunction,
            ValidationError::Unbounded(_) => ValidationRule::Unbounded,
        }
    }
}

type ValidationResult<T> = std::result::Result<T, ValidationError>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ValidationProof {
    sql_hash: u64,
    schema_version: u64,
}

/// A candidate that passed every check. Only the validator can build one.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    candidate: CandidateQuery,
    proof: ValidationProof,
}

impl ValidatedQuery {
    pub fn sql(&self) -> &str {
        &self.candidate.sql
    }

    pub fn candidate(&self) -> &CandidateQuery {
        &self.candidate
    }

    pub fn schema_version(&self) -> u64 {
        self.proof.schema_version
    }

    /// The SQL still matches what was validated
    pub fn is_intact(&self) -> bool {
        self.proof.sql_hash == hash_sql(&self.candidate.sql)
    }
}

pub struct SqlValidator {
    row_limit_ceiling: u64,
}

impl SqlValidator {
    pub fn new(row_limit_ceiling: u64) -> Self {
        Self { row_limit_ceiling }
    }

    pub fn validate(
        &self,
        candidate: &CandidateQuery,
        schema: &SchemaDescriptor,
    ) -> std::result::Result<ValidatedQuery, ValidationError> {
        let result = self.check(candidate, schema);
        match &result {
            Ok(validated) => debug!("Validated ({}): {}", candidate.tier, validated.sql()),
            Err(e) => warn!(
                "Rejected {} SQL by rule {}: {} | sql: {}",
                candidate.tier,
                e.rule(),
                e,
                candidate.sql
            ),
        }
        result
    }

    fn check(
        &self,
        candidate: &CandidateQuery,
        schema: &SchemaDescriptor,
    ) -> std::result::Result<ValidatedQuery, ValidationError> {
        let dialect = GenericDialect {};
        let tokens = Tokenizer::new(&dialect, &candidate.sql)
            .tokenize()
            .map_err(|e| ValidationError::new(ValidationRule::Parse, e.to_string()))?;

        // 1. Statement shape
        check_separators(&tokens)?;
        let mut statements = Parser::parse_sql(&dialect, &candidate.sql)
            .map_err(|e| ValidationError::new(ValidationRule::Parse, e.to_string()))?;
        if statements.len() != 1 {
            return Err(ValidationError::new(
                ValidationRule::MultipleStatements,
                format!("{} statements", statements.len()),
            ));
        }
        let mut statement = statements.remove(0);
        let query = match &mut statement {
            Statement::Query(query) => query,
            other => {
                return Err(ValidationError::new(
                    ValidationRule::StatementShape,
                    statement_kind(other),
                ))
            }
        };
        if !is_read_only(&query.body) {
            return Err(ValidationError::new(
                ValidationRule::StatementShape,
                "query body writes or selects INTO",
            ));
        }

        // 2. Denylist
        check_denylist(&tokens)?;

        // 3. Allowlist
        check_references(&**query, schema)?;

        // 4. Row bound
        self.bound_rows(&mut **query)?;

        let sql = statement.to_string();
        let proof = ValidationProof {
            sql_hash: hash_sql(&sql),
            schema_version: schema.version,
        };
        Ok(ValidatedQuery {
            candidate: CandidateQuery {
                sql,
                ..candidate.clone()
            },
            proof,
        })
    }

    fn bound_rows(&self, query: &mut Query) -> std::result::Result<(), ValidationError> {
        let ceiling = self.row_limit_ceiling;
        match &query.limit {
            None => {
                query.limit = Some(number(ceiling));
            }
            Some(Expr::Value(Value::Number(n, _))) => {
                let limit: u64 = n.parse().map_err(|_| {
                    ValidationError::new(ValidationRule::Unbounded, format!("LIMIT {}", n))
                })?;
                if limit > ceiling {
                    debug!("Clamping LIMIT {} to {}", limit, ceiling);
                    query.limit = Some(number(ceiling));
                }
            }
            Some(other) => {
                return Err(ValidationError::new(
                    ValidationRule::Unbounded,
                    format!("non-literal LIMIT {}", other),
                ))
            }
        }
        Ok(())
    }
}

fn number(n: u64) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

fn hash_sql(sql: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    hasher.finish()
}

fn is_whitespace(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_))
}

/// A single trailing `;` is tolerated. Any separator followed by more
/// tokens is a second statement.
fn check_separators(tokens: &[Token]) -> std::result::Result<(), ValidationError> {
    for (i, token) in tokens.iter().enumerate() {
        if *token == Token::SemiColon && tokens[i + 1..].iter().any(|t| !is_whitespace(t)) {
            return Err(ValidationError::new(
                ValidationRule::MultipleStatements,
                "statement separator followed by more SQL",
            ));
        }
    }
    Ok(())
}

fn check_denylist(tokens: &[Token]) -> std::result::Result<(), ValidationError> {
    for token in tokens {
        if let Token::Word(word) = token {
            if word.quote_style.is_none() {
                let upper = word.value.to_uppercase();
                if DENIED_KEYWORDS.contains(&upper.as_str()) {
                    return Err(ValidationError::new(ValidationRule::DeniedKeyword, upper));
                }
            }
        }
    }
    Ok(())
}

fn is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_only(&query.body),
        SetExpr::SetOperation { left, right, .. } => is_read_only(left) && is_read_only(right),
        SetExpr::Values(_) => true,
        _ => false,
    }
}

fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase()
}

/// Table functions polars resolves by name before registered tables.
const POLARS_TABLE_FUNCTIONS: &[&str] = &[
    "read_csv", "read_parquet", "read_ipc", "read_json", "read_ndjson",
];

/// One relation visible in a SELECT: its qualifier and output columns,
/// lowercased.
#[derive(Debug, Clone)]
struct Source {
    qualifier: String,
    columns: Vec<String>,
}

impl Source {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// What a query body exposes to the ORDER BY that follows it.
struct Body {
    outputs: Vec<String>,
    /// FROM sources of a plain SELECT; empty for set operations
    sources: Vec<Source>,
}

type CteScope = HashMap<String, Vec<String>>;

/// Resolves every column against the relations actually in scope: the
/// schema table, CTEs declared so far and derived tables. Projection
/// aliases only resolve in the GROUP BY, HAVING and ORDER BY of the
/// SELECT that defines them.
struct ReferenceChecker<'a> {
    schema: &'a SchemaDescriptor,
    cte_names: RefCell<HashSet<String>>,
}

impl<'a> ReferenceChecker<'a> {
    fn new(schema: &'a SchemaDescriptor) -> Self {
        Self {
            schema,
            cte_names: RefCell::new(HashSet::new()),
        }
    }

    fn query(&self, query: &Query, ctes: &CteScope, outer: &[Source]) -> ValidationResult<Vec<String>> {
        let mut ctes = ctes.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                if POLARS_TABLE_FUNCTIONS.contains(&name.as_str()) {
                    return Err(ValidationError::new(ValidationRule::TableFunction, name));
                }
                let outputs = self.query(&cte.query, &ctes, outer)?;
                let columns = if cte.alias.columns.is_empty() {
                    outputs
                } else {
                    cte.alias.columns.iter().map(|c| c.value.to_lowercase()).collect()
                };
                self.cte_names.borrow_mut().insert(name.clone());
                ctes.insert(name, columns);
            }
        }

        let body = self.set_expr(&query.body, &ctes, outer)?;
        if !query.locks.is_empty() {
            return Err(ValidationError::new(ValidationRule::StatementShape, "row locking clause"));
        }

        let visible = chain(&body.sources, outer);
        for order in &query.order_by {
            self.check_expr(&order.expr, &ctes, &visible, &body.outputs)?;
        }
        for expr in &query.limit_by {
            self.check_expr(expr, &ctes, &visible, &body.outputs)?;
        }
        if let Some(limit) = &query.limit {
            self.check_expr(limit, &ctes, &[], &[])?;
        }
        if let Some(offset) = &query.offset {
            self.check_expr(&offset.value, &ctes, &[], &[])?;
        }
        if let Some(quantity) = query.fetch.as_ref().and_then(|f| f.quantity.as_ref()) {
            self.check_expr(quantity, &ctes, &[], &[])?;
        }
        Ok(body.outputs)
    }

    fn set_expr(&self, body: &SetExpr, ctes: &CteScope, outer: &[Source]) -> ValidationResult<Body> {
        match body {
            SetExpr::Select(select) => self.select(select, ctes, outer),
            SetExpr::Query(query) => Ok(Body {
                outputs: self.query(query, ctes, outer)?,
                sources: Vec::new(),
            }),
            SetExpr::SetOperation { left, right, .. } => {
                let left = self.set_expr(left, ctes, outer)?;
                self.set_expr(right, ctes, outer)?;
                Ok(Body {
                    outputs: left.outputs,
                    sources: Vec::new(),
                })
            }
            SetExpr::Values(values) => {
                for expr in values.rows.iter().flatten() {
                    self.check_expr(expr, ctes, outer, &[])?;
                }
                Ok(Body {
                    outputs: Vec::new(),
                    sources: Vec::new(),
                })
            }
            _ => Err(ValidationError::new(
                ValidationRule::StatementShape,
                "query body is not a SELECT",
            )),
        }
    }

    fn select(&self, select: &Select, ctes: &CteScope, outer: &[Source]) -> ValidationResult<Body> {
        if !select.lateral_views.is_empty()
            || !select.cluster_by.is_empty()
            || !select.distribute_by.is_empty()
            || !select.sort_by.is_empty()
        {
            return Err(ValidationError::new(
                ValidationRule::StatementShape,
                "unsupported SELECT clause",
            ));
        }

        let mut sources = Vec::new();
        for table in &select.from {
            self.table_with_joins(table, ctes, outer, &mut sources)?;
        }
        let visible = chain(&sources, outer);

        let aliases: Vec<String> = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
                _ => None,
            })
            .collect();

        let mut outputs = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.check_expr(expr, ctes, &visible, &[])?;
                    match expr {
                        Expr::Identifier(ident) => outputs.push(ident.value.to_lowercase()),
                        Expr::CompoundIdentifier(parts) => {
                            outputs.extend(parts.last().map(|p| p.value.to_lowercase()))
                        }
                        _ => {}
                    }
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.check_expr(expr, ctes, &visible, &[])?;
                    outputs.push(alias.value.to_lowercase());
                }
                SelectItem::Wildcard(options) => {
                    self.check_visit(options, ctes, &visible, &[])?;
                    outputs.extend(sources.iter().flat_map(|s| s.columns.iter().cloned()));
                }
                SelectItem::QualifiedWildcard(name, options) => {
                    self.check_visit(options, ctes, &visible, &[])?;
                    let source = match name.0.as_slice() {
                        [ident] => {
                            let qualifier = ident.value.to_lowercase();
                            sources.iter().find(|s| s.qualifier == qualifier)
                        }
                        _ => None,
                    };
                    match source {
                        Some(source) => outputs.extend(source.columns.iter().cloned()),
                        None => {
                            return Err(ValidationError::new(
                                ValidationRule::UnknownTable,
                                name.to_string(),
                            ))
                        }
                    }
                }
            }
        }

        self.check_visit(&select.distinct, ctes, &visible, &[])?;
        self.check_visit(&select.top, ctes, &visible, &[])?;
        self.check_visit(&select.selection, ctes, &visible, &[])?;
        self.check_visit(&select.named_window, ctes, &visible, &[])?;
        self.check_visit(&select.group_by, ctes, &visible, &aliases)?;
        self.check_visit(&select.having, ctes, &visible, &aliases)?;
        self.check_visit(&select.qualify, ctes, &visible, &aliases)?;

        Ok(Body { outputs, sources })
    }

    fn table_with_joins(
        &self,
        table: &TableWithJoins,
        ctes: &CteScope,
        outer: &[Source],
        sources: &mut Vec<Source>,
    ) -> ValidationResult<()> {
        self.table_factor(&table.relation, ctes, outer, sources)?;
        for join in &table.joins {
            self.table_factor(&join.relation, ctes, outer, sources)?;
        }
        let visible = chain(sources, outer);
        for join in &table.joins {
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(expr)) => self.check_expr(expr, ctes, &visible, &[])?,
                Some(JoinConstraint::Using(columns)) => {
                    for column in columns {
                        let name = column.value.to_lowercase();
                        if !sources.iter().any(|s| s.has_column(&name)) {
                            return Err(ValidationError::new(
                                ValidationRule::UnknownColumn,
                                column.value.clone(),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn table_factor(
        &self,
        factor: &TableFactor,
        ctes: &CteScope,
        outer: &[Source],
        sources: &mut Vec<Source>,
    ) -> ValidationResult<()> {
        match factor {
            TableFactor::Table { name, alias, args, .. } => {
                if args.is_some() {
                    return Err(ValidationError::new(ValidationRule::TableFunction, name.to_string()));
                }
                let ident = match name.0.as_slice() {
                    [ident] => ident,
                    _ => return Err(ValidationError::new(ValidationRule::UnknownTable, name.to_string())),
                };
                let key = ident.value.to_lowercase();
                let columns = match ctes.get(&key) {
                    Some(columns) => columns.clone(),
                    None if self.schema.has_table(&ident.value) => self
                        .schema
                        .columns
                        .iter()
                        .map(|c| c.name.to_lowercase())
                        .collect(),
                    None => {
                        return Err(ValidationError::new(ValidationRule::UnknownTable, name.to_string()))
                    }
                };
                sources.push(aliased(key, columns, alias.as_ref()));
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
            } => {
                if *lateral {
                    return Err(ValidationError::new(ValidationRule::StatementShape, "LATERAL subquery"));
                }
                let columns = self.query(subquery, ctes, outer)?;
                sources.push(aliased(String::new(), columns, alias.as_ref()));
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                let mut inner = Vec::new();
                self.table_with_joins(table_with_joins, ctes, outer, &mut inner)?;
                match alias {
                    Some(alias) => {
                        let columns = inner.into_iter().flat_map(|s| s.columns).collect();
                        sources.push(aliased(String::new(), columns, Some(alias)));
                    }
                    None => sources.extend(inner),
                }
            }
            TableFactor::TableFunction { .. }
            | TableFactor::Function { .. }
            | TableFactor::UNNEST { .. } => {
                return Err(ValidationError::new(ValidationRule::TableFunction, factor.to_string()))
            }
            other => {
                return Err(ValidationError::new(ValidationRule::StatementShape, other.to_string()))
            }
        }
        Ok(())
    }

    fn check_expr(
        &self,
        expr: &Expr,
        ctes: &CteScope,
        sources: &[Source],
        aliases: &[String],
    ) -> ValidationResult<()> {
        self.check_visit(expr, ctes, sources, aliases)
    }

    fn check_visit<N: Visit>(
        &self,
        node: &N,
        ctes: &CteScope,
        sources: &[Source],
        aliases: &[String],
    ) -> ValidationResult<()> {
        let mut checker = ExprChecker {
            references: self,
            ctes,
            sources,
            aliases,
            nested: 0,
        };
        match node.visit(&mut checker) {
            ControlFlow::Break(e) => Err(e),
            ControlFlow::Continue(()) => Ok(()),
        }
    }
}

fn chain(sources: &[Source], outer: &[Source]) -> Vec<Source> {
    sources.iter().chain(outer).cloned().collect()
}

fn aliased(qualifier: String, columns: Vec<String>, alias: Option<&TableAlias>) -> Source {
    match alias {
        Some(alias) => Source {
            qualifier: alias.name.value.to_lowercase(),
            columns: if alias.columns.is_empty() {
                columns
            } else {
                alias.columns.iter().map(|c| c.value.to_lowercase()).collect()
            },
        },
        None => Source { qualifier, columns },
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c) => Some(c),
        _ => None,
    }
}

fn subquery_of(expr: &Expr) -> Option<&Query> {
    match expr {
        Expr::Subquery(query)
        | Expr::ArraySubquery(query)
        | Expr::Exists { subquery: query, .. }
        | Expr::InSubquery { subquery: query, .. } => Some(&**query),
        _ => None,
    }
}

/// Checks identifiers in one scope. Subqueries are handed back to the
/// `ReferenceChecker` with the current sources as their outer scope, and
/// everything beneath them is skipped here.
struct ExprChecker<'c, 'a> {
    references: &'c ReferenceChecker<'a>,
    ctes: &'c CteScope,
    sources: &'c [Source],
    aliases: &'c [String],
    nested: usize,
}

impl ExprChecker<'_, '_> {
    fn column_visible(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s.has_column(name)) || self.aliases.iter().any(|a| a == name)
    }

    fn check_identifier(&self, expr: &Expr) -> ValidationResult<()> {
        match expr {
            Expr::Identifier(ident) if !self.column_visible(&ident.value.to_lowercase()) => Err(
                ValidationError::new(ValidationRule::UnknownColumn, ident.value.clone()),
            ),
            Expr::CompoundIdentifier(parts) => {
                let resolved = match parts.as_slice() {
                    [qualifier, column] => {
                        let qualifier = qualifier.value.to_lowercase();
                        let column = column.value.to_lowercase();
                        self.sources
                            .iter()
                            .any(|s| s.qualifier == qualifier && s.has_column(&column))
                    }
                    _ => false,
                };
                if resolved {
                    Ok(())
                } else {
                    let path: Vec<&str> = parts.iter().map(|p| p.value.as_str()).collect();
                    Err(ValidationError::new(ValidationRule::UnknownColumn, path.join(".")))
                }
            }
            _ => Ok(()),
        }
    }
}

impl Visitor for ExprChecker<'_, '_> {
    type Break = ValidationError;

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Some(query) = subquery_of(expr) {
            if self.nested == 0 {
                if let Expr::InSubquery { expr: needle, .. } = expr {
                    if let Err(e) = self.references.check_expr(needle, self.ctes, self.sources, self.aliases) {
                        return ControlFlow::Break(e);
                    }
                }
                if let Err(e) = self.references.query(query, self.ctes, self.sources) {
                    return ControlFlow::Break(e);
                }
            }
            self.nested += 1;
            return ControlFlow::Continue(());
        }
        if self.nested > 0 {
            return ControlFlow::Continue(());
        }
        match self.check_identifier(expr) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if subquery_of(expr).is_some() {
            self.nested -= 1;
        }
        ControlFlow::Continue(())
    }
}

/// Whole-statement pass over every relation and table factor, wherever the
/// scoped walk put it.
struct RelationGuard<'a> {
    schema: &'a SchemaDescriptor,
    cte_names: &'a HashSet<String>,
}

impl Visitor for RelationGuard<'_> {
    type Break = ValidationError;

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let allowed = match relation.0.as_slice() {
            [ident] => {
                self.schema.has_table(&ident.value)
                    || self.cte_names.contains(&ident.value.to_lowercase())
            }
            _ => false,
        };
        if allowed {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(ValidationError::new(
                ValidationRule::UnknownTable,
                relation.to_string(),
            ))
        }
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Table { args: None, .. }
            | TableFactor::Derived { .. }
            | TableFactor::NestedJoin { .. } => ControlFlow::Continue(()),
            other => ControlFlow::Break(ValidationError::new(
                ValidationRule::TableFunction,
                other.to_string(),
            )),
        }
    }
}

fn check_references(query: &Query, schema: &SchemaDescriptor) -> ValidationResult<()> {
    let checker = ReferenceChecker::new(schema);
    checker.query(query, &CteScope::new(), &[])?;

    let cte_names = checker.cte_names.into_inner();
    let mut guard = RelationGuard {
        schema,
        cte_names: &cte_names,
    };
    match query.visit(&mut guard) {
        ControlFlow::Break(e) => Err(e),
        ControlFlow::Continue(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, DisplayUnit, SemanticType};

    fn schema() -> SchemaDescriptor {
        let column = |name: &str, semantic_type| ColumnSpec {
            name: name.to_string(),
            semantic_type,
            unit: DisplayUnit::None,
            ratio: None,
            grain: None,
            distinct_values: Vec::new(),
        };
        SchemaDescriptor::new(
            "campaigns",
            vec![
                column("Date", SemanticType::Date),
                column("Platform", SemanticType::Categorical),
                column("Spend", SemanticType::NumericAdditive),
                column("Clicks", SemanticType::NumericAdditive),
                column("Update_Date", SemanticType::Date),
            ],
            3,
        )
    }

    fn validate(sql: &str) -> std::result::Result<ValidatedQuery, ValidationError> {
        SqlValidator::new(10_000).validate(&CandidateQuery::generative(sql.to_string()), &schema())
    }

    fn rule(sql: &str) -> ValidationRule {
        validate(sql).unwrap_err().rule()
    }

    #[test]
    fn test_accepts_template_shapes_and_adds_limit() {
        let validated = validate(
            "WITH periods AS (SELECT *, CASE WHEN \"Date\" >= CAST('2024-01-01' AS DATE) THEN 'A' END AS period FROM \"campaigns\") \
             SELECT period, SUM(\"Spend\") * 1.0 / NULLIF(SUM(\"Clicks\"), 0) AS \"cpc\" FROM periods GROUP BY period ORDER BY period",
        )
        .unwrap();
        assert!(validated.sql().ends_with("LIMIT 10000"));
        assert!(validated.is_intact());
        assert_eq!(validated.schema_version(), 3);
    }

    #[test]
    fn test_limit_clamped_not_raised() {
        let high = validate("SELECT \"Spend\" FROM campaigns LIMIT 500000").unwrap();
        assert!(high.sql().ends_with("LIMIT 10000"));
        let low = validate("SELECT \"Spend\" FROM campaigns LIMIT 5").unwrap();
        assert!(low.sql().ends_with("LIMIT 5"));
        assert_eq!(
            rule("SELECT \"Spend\" FROM campaigns LIMIT (SELECT 1)"),
            ValidationRule::Unbounded
        );
    }

    #[test]
    fn test_trailing_semicolon_tolerated() {
        assert!(validate("SELECT SUM(\"Spend\") FROM campaigns;").is_ok());
    }

    #[test]
    fn test_injection_variants_rejected() {
        let variants = [
            "SELECT 1; DROP TABLE campaigns",
            "SELECT 1;DROP TABLE campaigns",
            "select 1 ;  drop table campaigns",
            "SELECT 1;\n\tDrOp TaBlE campaigns",
            "SELECT 1; /* harmless */ DROP TABLE campaigns",
            "SELECT 1; -- comment\nDELETE FROM campaigns",
            "SELECT \"Spend\" FROM campaigns; UPDATE campaigns SET \"Spend\" = 0",
            "SELECT 1 /* ; */; INSERT INTO campaigns VALUES (1)",
        ];
        for sql in variants {
            let err = validate(sql).unwrap_err();
            assert_eq!(err.rule(), ValidationRule::MultipleStatements, "{}", sql);
        }
    }

    #[test]
    fn test_separator_inside_string_is_not_a_statement_break() {
        assert!(validate("SELECT \"Spend\" FROM campaigns WHERE \"Platform\" = 'a; DROP TABLE campaigns'").is_ok());
    }

    #[test]
    fn test_write_statements_rejected() {
        assert_eq!(rule("DELETE FROM campaigns"), ValidationRule::StatementShape);
        assert_eq!(rule("SELECT * INTO backup FROM campaigns"), ValidationRule::StatementShape);
    }

    #[test]
    fn test_denylist_matches_whole_words_only() {
        assert!(validate("SELECT \"Update_Date\" FROM campaigns").is_ok());
        assert!(validate("SELECT Update_Date FROM campaigns").is_ok());
        assert_eq!(rule("SELECT \"Spend\" AS drop FROM campaigns"), ValidationRule::DeniedKeyword);
    }

    #[test]
    fn test_unknown_references_rejected() {
        assert_eq!(rule("SELECT * FROM users"), ValidationRule::UnknownTable);
        assert_eq!(rule("SELECT password FROM campaigns"), ValidationRule::UnknownColumn);
        assert_eq!(
            rule("SELECT c.\"Spend\" FROM campaigns c JOIN other.campaigns o ON c.\"Date\" = o.\"Date\""),
            ValidationRule::UnknownTable
        );
        assert_eq!(rule("SELECT x.\"Spend\" FROM campaigns c"), ValidationRule::UnknownColumn);
        // An alias cannot vouch for the column it is named after
        assert_eq!(
            rule("SELECT SUM(revenue_total) AS revenue_total FROM campaigns"),
            ValidationRule::UnknownColumn
        );
        assert_eq!(
            rule("SELECT \"Spend\" AS s FROM campaigns WHERE s > 0"),
            ValidationRule::UnknownColumn
        );
        assert_eq!(
            rule("WITH t AS (SELECT \"Spend\" FROM campaigns) SELECT \"Clicks\" FROM t"),
            ValidationRule::UnknownColumn
        );
        assert_eq!(
            rule("SELECT \"Spend\" FROM campaigns WHERE \"Spend\" > (SELECT MAX(secret) FROM campaigns)"),
            ValidationRule::UnknownColumn
        );
    }

    #[test]
    fn test_table_functions_rejected() {
        assert_eq!(rule("SELECT * FROM read_csv('/etc/passwd')"), ValidationRule::TableFunction);
        assert_eq!(
            rule("WITH read_csv AS (SELECT \"Spend\" FROM campaigns) SELECT * FROM read_csv('/tmp/x.csv')"),
            ValidationRule::TableFunction
        );
        assert_eq!(
            rule("WITH read_parquet AS (SELECT \"Spend\" FROM campaigns) SELECT * FROM read_parquet"),
            ValidationRule::TableFunction
        );
        assert_eq!(
            rule("WITH t AS (SELECT \"Spend\" FROM campaigns) SELECT * FROM t('/tmp/x.csv')"),
            ValidationRule::TableFunction
        );
        assert_eq!(
            rule("SELECT \"Spend\" FROM campaigns WHERE \"Spend\" IN (SELECT * FROM read_ipc('/tmp/x'))"),
            ValidationRule::TableFunction
        );
    }

    #[test]
    fn test_aliases_and_ctes_are_known() {
        assert!(validate("SELECT c.\"Spend\" AS s FROM campaigns c ORDER BY s").is_ok());
        assert!(validate("WITH t AS (SELECT \"Spend\" FROM campaigns) SELECT SUM(\"Spend\") FROM t").is_ok());
        assert!(validate(
            "SELECT \"Platform\" AS p, SUM(\"Spend\") AS total FROM campaigns GROUP BY p HAVING total > 0 ORDER BY total DESC"
        )
        .is_ok());
        assert!(validate("WITH t (on_date, cost) AS (SELECT \"Date\", \"Spend\" FROM campaigns) SELECT t.cost FROM t").is_ok());
        assert!(validate("SELECT d.total FROM (SELECT SUM(\"Spend\") AS total FROM campaigns) d").is_ok());
        assert!(validate(
            "SELECT \"Platform\" FROM campaigns c WHERE \"Spend\" > (SELECT AVG(\"Spend\") FROM campaigns WHERE \"Platform\" = c.\"Platform\")"
        )
        .is_ok());
    }

    #[test]
    fn test_unparseable_text_rejected() {
        assert_eq!(rule("SELEC 1"), ValidationRule::Parse);
    }
}

//! Answer Formatter
//!
//! Plain-text rendering of a result set. Values are formatted from the
//! column's semantic type and display unit, so a ratio column tagged as a
//! percentage prints as `1.20%` and never as a raw fraction.

use crate::result::{ResultColumn, ResultSet};
use crate::schema::{DisplayUnit, SemanticType};
use itertools::Itertools;

const NULL_TEXT: &str = "N/A";

pub fn format_answer(question: &str, result: &ResultSet) -> String {
    if result.is_empty() {
        return format!("No data found for \"{}\".", question.trim());
    }

    let header: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
    let body: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .zip(row)
                .map(|(column, value)| format_value(column, value))
                .collect()
        })
        .collect();

    let widths: Vec<usize> = (0..header.len())
        .map(|i| {
            body.iter()
                .map(|row| row.get(i).map(|s| s.chars().count()).unwrap_or(0))
                .chain(std::iter::once(header[i].chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let render = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (cell, width))| {
                if is_right_aligned(&result.columns[i]) {
                    format!("{:>width$}", cell, width = *width)
                } else {
                    format!("{:<width$}", cell, width = *width)
                }
            })
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&format!("{}\n\n", question.trim()));
    out.push_str(&render(&header));
    out.push('\n');
    out.push_str(&widths.iter().map(|w| "-".repeat(*w)).join("-+-"));
    out.push('\n');
    for row in &body {
        out.push_str(&render(row));
        out.push('\n');
    }
    out.push_str(&format!(
        "\n{} row{}",
        result.row_count,
        if result.row_count == 1 { "" } else { "s" }
    ));
    out
}

fn is_right_aligned(column: &ResultColumn) -> bool {
    column.semantic_type.is_numeric()
}

pub fn format_value(column: &ResultColumn, value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => NULL_TEXT.to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => format_number(column, f),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn format_number(column: &ResultColumn, value: f64) -> String {
    if !value.is_finite() {
        return NULL_TEXT.to_string();
    }
    match column.unit {
        DisplayUnit::Percent => format!("{:.2}%", value * 100.0),
        DisplayUnit::Currency => {
            let sign = if value < 0.0 { "-" } else { "" };
            format!("{}${}", sign, group_thousands(value.abs(), 2))
        }
        DisplayUnit::Multiple => format!("{:.2}x", value),
        DisplayUnit::Count => group_thousands(value, 0),
        DisplayUnit::None => {
            if column.semantic_type == SemanticType::NumericRatio {
                format!("{:.4}", value)
            } else if value.fract() == 0.0 {
                group_thousands(value, 0)
            } else {
                group_thousands(value, 2)
            }
        }
    }
}

/// `1234567.891` with 2 decimals -> `1,234,567.89`
fn group_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (formatted, None),
    };

    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*ch);
    }

    let sign = if value < 0.0 && grouped.chars().any(|c| c != '0' && c != ',') {
        "-"
    } else {
        ""
    };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}

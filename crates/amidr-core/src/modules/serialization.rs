use std::fs;
use std::path::Path;

/// Column width of every rendered text table.
pub const TABLE_COLUMN_WIDTH: usize = 14;

pub fn format_fixed_f64(value: f64, width: usize, precision: usize) -> String {
    format!(
        "{value:>width$.precision$}",
        width = width,
        precision = precision
    )
}

pub fn format_scientific_f64(value: f64, width: usize, precision: usize) -> String {
    format!(
        "{value:>width$.precision$e}",
        width = width,
        precision = precision
    )
}

/// Missing values render as `nan` so columns stay aligned for plotting tools.
pub fn format_optional_f64(value: Option<f64>, width: usize, precision: usize) -> String {
    match value {
        Some(value) => format_scientific_f64(value, width, precision),
        None => format!("{:>width$}", "nan", width = width),
    }
}

/// Whitespace-delimited table with a `#` header line.
pub fn render_text_table(columns: &[&str], rows: &[Vec<String>]) -> String {
    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            if index == 0 {
                format!("#{:>width$}", column, width = TABLE_COLUMN_WIDTH - 1)
            } else {
                format!("{:>width$}", column, width = TABLE_COLUMN_WIDTH)
            }
        })
        .collect();

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(header.join(" "));
    for row in rows {
        lines.push(row.join(" "));
    }
    lines.join("\n")
}

pub fn normalize_text_artifact(content: &str) -> String {
    let mut normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

pub fn write_text_artifact(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, normalize_text_artifact(content))
}

/// Serde adapter writing non-finite floats as `null` and reading `null` back as NaN.
///
/// JSON has no NaN, and a fit that produced one must still round-trip.
pub mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

//! Reader for the UHPC tabular export: a free-form header terminated by a
//! `[Data]` line, followed by a comma-delimited table with one row per sample.

use amidr_core::domain::{AmidrError, AmidrResult, CellRecord, Sample};
use amidr_core::modules::segment::derive_logical_steps;
use std::fs;
use std::path::Path;

const DATA_MARKER: &str = "[Data]";

const TIME_COLUMNS: [&str; 2] = ["Run Time (h)", "Time (h)"];
const VOLTAGE_COLUMNS: [&str; 1] = ["Potential (V)"];
const CELL_VOLTAGE_COLUMNS: [&str; 1] = ["Potential vs. Counter (V)"];
const CURRENT_COLUMNS: [&str; 2] = ["Current (A)", "Meas I (A)"];
const CAPACITY_COLUMNS: [&str; 1] = ["Capacity (Ah)"];
const STEP_COLUMNS: [&str; 2] = ["Prot.Step", "Step Number"];

/// Metadata carried by the header block.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct UhpcHeader {
    pub(super) cell: Option<String>,
    /// Active material mass in g.
    pub(super) mass: f64,
    /// Nominal capacity in Ah; zero when the header omits it.
    pub(super) capacity: f64,
}

#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    time: usize,
    voltage: usize,
    cell_voltage: Option<usize>,
    current: usize,
    capacity: usize,
    step: Option<usize>,
}

/// Reads one UHPC file; the record is labelled with the file stem.
pub(super) fn read_uhpc_record(path: &Path, zero_current_threshold: f64) -> AmidrResult<CellRecord> {
    let source = fs::read_to_string(path).map_err(|error| {
        AmidrError::io_system(
            "IO.UHPC_READ",
            format!("failed to read '{}': {}", path.display(), error),
        )
    })?;
    let label = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_uhpc(&label, &source, zero_current_threshold)
}

pub(super) fn parse_uhpc(
    label: &str,
    source: &str,
    zero_current_threshold: f64,
) -> AmidrResult<CellRecord> {
    let mut lines = source.lines();
    let mut header_lines = Vec::new();
    let mut found_marker = false;
    for line in lines.by_ref() {
        if line.trim_start().starts_with(DATA_MARKER) {
            found_marker = true;
            break;
        }
        header_lines.push(line);
    }
    if !found_marker {
        return Err(format_error(label, "no '[Data]' line found"));
    }

    let header = parse_header(label, &header_lines)?;
    let body: String = lines.collect::<Vec<_>>().join("\n");
    let (mut samples, has_steps) = parse_samples(label, &body)?;
    if !has_steps {
        tracing::info!(cell = label, "no step column; deriving logical steps");
        derive_logical_steps(&mut samples, zero_current_threshold);
    }

    tracing::info!(
        cell = label,
        name = header.cell.as_deref().unwrap_or("unknown"),
        mass_g = header.mass,
        capacity_ah = header.capacity,
        samples = samples.len(),
        "read cycler record"
    );
    Ok(CellRecord::new(label, header.mass, header.capacity, samples))
}

pub(super) fn parse_header(label: &str, lines: &[&str]) -> AmidrResult<UhpcHeader> {
    let mut cell = None;
    let mut mass = None;
    let mut capacity = None;
    for line in lines {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Cell:") {
            let name = first_field(name);
            if !name.is_empty() {
                cell = Some(name.to_string());
            }
        } else if let Some((unit, value)) = unit_field(line, "Mass") {
            let scale = if unit.eq_ignore_ascii_case("mg") { 1.0e-3 } else { 1.0 };
            mass = Some(parse_number(label, "mass", value)? * scale);
        } else if let Some((unit, value)) = unit_field(line, "Capacity") {
            let scale = if unit.eq_ignore_ascii_case("mAHr") || unit.eq_ignore_ascii_case("mAh") {
                1.0e-3
            } else {
                1.0
            };
            capacity = Some(parse_number(label, "capacity", value)? * scale);
        }
    }

    let mass = mass.ok_or_else(|| format_error(label, "header has no 'Mass (unit): value' line"))?;
    if !(mass > 0.0) {
        return Err(format_error(label, &format!("active mass must be positive, got {mass}")));
    }
    let capacity = capacity.unwrap_or_else(|| {
        tracing::warn!(cell = label, "header has no capacity; the measured span will be used");
        0.0
    });
    Ok(UhpcHeader {
        cell,
        mass,
        capacity,
    })
}

/// Splits `Name (unit): value` into `(unit, value)`.
fn unit_field<'a>(line: &'a str, name: &str) -> Option<(&'a str, &'a str)> {
    let rest = line.strip_prefix(name)?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let (unit, rest) = rest.split_once(')')?;
    let value = rest.trim_start().strip_prefix(':')?;
    Some((unit.trim(), first_field(value)))
}

fn first_field(text: &str) -> &str {
    text.split(',').next().unwrap_or_default().trim()
}

fn parse_samples(label: &str, body: &str) -> AmidrResult<(Vec<Sample>, bool)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|error| format_error(label, &format!("unreadable column header: {error}")))?
        .clone();
    let columns = ColumnMap::resolve(label, &headers)?;

    let mut samples = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.map_err(|error| format_error(label, &format!("row {}: {error}", row + 1)))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let field = |index: usize, name: &str| -> AmidrResult<f64> {
            let text = record.get(index).unwrap_or_default();
            text.parse::<f64>().map_err(|_| {
                format_error(label, &format!("row {}: {name} '{text}' is not a number", row + 1))
            })
        };
        let mut sample = Sample::new(
            field(columns.time, "time")?,
            field(columns.voltage, "potential")?,
            field(columns.current, "current")?,
            field(columns.capacity, "capacity")?,
            0,
        );
        if let Some(index) = columns.cell_voltage {
            sample.cell_voltage = field(index, "counter potential").ok();
        }
        if let Some(index) = columns.step {
            sample.step_index = field(index, "step")?.round() as i64;
        }
        samples.push(sample);
    }
    if samples.is_empty() {
        return Err(format_error(label, "data section has no rows"));
    }
    Ok((samples, columns.step.is_some()))
}

impl ColumnMap {
    fn resolve(label: &str, headers: &csv::StringRecord) -> AmidrResult<Self> {
        let require = |aliases: &[&str]| {
            find_column(headers, aliases).ok_or_else(|| {
                format_error(label, &format!("missing column; expected one of {aliases:?}"))
            })
        };
        Ok(Self {
            time: require(&TIME_COLUMNS[..])?,
            voltage: require(&VOLTAGE_COLUMNS[..])?,
            cell_voltage: find_column(headers, &CELL_VOLTAGE_COLUMNS),
            current: require(&CURRENT_COLUMNS[..])?,
            capacity: require(&CAPACITY_COLUMNS[..])?,
            step: find_column(headers, &STEP_COLUMNS),
        })
    }
}

fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|header| aliases.contains(&header))
}

fn parse_number(label: &str, name: &str, value: &str) -> AmidrResult<f64> {
    value
        .parse::<f64>()
        .map_err(|_| format_error(label, &format!("header {name} '{value}' is not a number")))
}

fn format_error(label: &str, message: &str) -> AmidrError {
    AmidrError::io_system("IO.UHPC_FORMAT", format!("{label}: {message}"))
}

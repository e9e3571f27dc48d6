//! Bulk unit import from the OTA listing spreadsheet (CSV export).

use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_IMPORT_ROWS;

const COL_OTA: &str = "OTA Name";
const COL_PROPERTY: &str = "Property ID / Room ID";
const COL_URL: &str = "iCal URL";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("CSV is empty")]
    Empty,
    #[error("missing column '{0}'")]
    MissingColumn(&'static str),
    #[error("line {line}: {message}")]
    Line { line: usize, message: String },
    #[error("more than {MAX_IMPORT_ROWS} rows")]
    TooManyRows,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    /// 1-based line of the record in the input.
    pub line: usize,
    pub ota: String,
    pub property_id: String,
    pub ical_url: Option<String>,
}

/// Splits CSV text into records. Handles quoted fields with embedded commas,
/// doubled quotes and line breaks. Returns each record with its starting line.
fn records(input: &str) -> Result<Vec<(usize, Vec<String>)>, ImportError> {
    let mut out = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = input.trim_start_matches('\u{feff}').chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if record.iter().any(|f| !f.trim().is_empty()) {
                    out.push((record_line, std::mem::take(&mut record)));
                } else {
                    record.clear();
                }
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(ImportError::Line {
            line: record_line,
            message: "unterminated quoted field".into(),
        });
    }
    record.push(field);
    if record.iter().any(|f| !f.trim().is_empty()) {
        out.push((record_line, record));
    }
    Ok(out)
}

/// Parses the CSV into rows. Extra columns are ignored.
pub fn parse(input: &str) -> Result<Vec<ImportRow>, ImportError> {
    let mut records = records(input)?.into_iter();
    let (_, header) = records.next().ok_or(ImportError::Empty)?;
    let col = |name: &'static str| {
        header
            .iter()
            .position(|h| h.trim() == name)
            .ok_or(ImportError::MissingColumn(name))
    };
    let (ota_i, prop_i, url_i) = (col(COL_OTA)?, col(COL_PROPERTY)?, col(COL_URL)?);

    let mut rows = Vec::new();
    for (line, fields) in records {
        if rows.len() == MAX_IMPORT_ROWS {
            return Err(ImportError::TooManyRows);
        }
        let get = |i: usize| fields.get(i).map(|f| f.trim()).unwrap_or("");
        let url = get(url_i);
        rows.push(ImportRow {
            line,
            ota: get(ota_i).to_string(),
            property_id: get(prop_i).to_string(),
            ical_url: (!url.is_empty()).then(|| url.to_string()),
        });
    }
    Ok(rows)
}

/// Parses and creates every unit, or none if any row is bad.
pub async fn import_units(engine: &Engine, input: &str) -> Result<Vec<Ulid>, ImportError> {
    let rows = parse(input)?;
    let lines: Vec<usize> = rows.iter().map(|r| r.line).collect();
    let batch = rows
        .into_iter()
        .map(|r| (r.ota, r.property_id, r.ical_url))
        .collect();
    let ids = engine.create_units(batch).await.map_err(|(i, e)| match e {
        EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) if i < lines.len() => {
            ImportError::Line {
                line: lines[i],
                message: e.to_string(),
            }
        }
        e => ImportError::Engine(e),
    })?;
    tracing::info!("imported {} units", ids.len());
    Ok(ids)
}

//! Custom user data uploads (CSV).
//!
//! Schema: a header row with `name` and `description` columns (any order, case-insensitive),
//! optional `url`; at least one data row; every row needs a non-empty name. Extra columns are
//! ignored.

use crate::error::{PipelineError, PipelineResult};
use crate::types::CustomEntry;

fn bad_format(detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::Csv(format!("Bad data format: {}", detail))
}

pub fn parse_custom_data_csv(bytes: &[u8]) -> PipelineResult<Vec<CustomEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(bytes);

    let headers = reader.headers().map_err(bad_format)?.clone();
    let column = |wanted: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').eq_ignore_ascii_case(wanted))
    };
    let name_col = column("name").ok_or_else(|| bad_format("missing 'name' column"))?;
    let desc_col = column("description").ok_or_else(|| bad_format("missing 'description' column"))?;
    let url_col = column("url");

    let mut entries = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row.map_err(bad_format)?;
        let name = row.get(name_col).unwrap_or("").to_string();
        if name.is_empty() {
            return Err(bad_format(format!("row {} has an empty name", i + 1)));
        }
        entries.push(CustomEntry {
            name,
            description: row.get(desc_col).unwrap_or("").to_string(),
            url: url_col
                .and_then(|c| row.get(c))
                .filter(|u| !u.is_empty())
                .map(str::to_string),
        });
    }

    if entries.is_empty() {
        return Err(bad_format("no rows"));
    }
    Ok(entries)
}

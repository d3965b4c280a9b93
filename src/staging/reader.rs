use anyhow::{Context, Result, anyhow};
use std::io::Read;
use std::path::Path;

use super::record::{COLUMNS, Record};

/// Parse a staged artifact back into records.
///
/// The first row must be the column header in declared order.
#[cfg_attr(not(test), allow(dead_code))]
pub fn parse_artifact<R: Read>(source: R) -> Result<Vec<Record>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b',')
        .quote(b'"')
        .has_headers(true)
        .from_reader(source);

    let headers = csv_reader
        .headers()
        .context("Failed to read artifact header")?;
    if !headers.iter().eq(COLUMNS.iter().copied()) {
        return Err(anyhow!(
            "Artifact header does not match the record schema: {:?}",
            headers
        ));
    }

    let mut records = Vec::new();
    for (idx, result) in csv_reader.records().enumerate() {
        let row = result.context("Failed to parse CSV record")?;
        let fields: Vec<&str> = row.iter().collect();
        // Line numbers are 1-based and the header occupies line 1
        let record = Record::from_row(&fields)
            .with_context(|| format!("Invalid record at row {}", idx + 2))?;
        records.push(record);
    }

    Ok(records)
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn read_artifact(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open artifact {}", path.display()))?;
    parse_artifact(std::io::BufReader::new(file))
}

//! Streaming shape checks for uploaded CSV files.

use std::io::Read;

use thiserror::Error;

use crate::columns::BaseFieldRegistry;

#[derive(Debug, Error)]
pub enum CsvSchemaError {
    #[error("the CSV header row is empty")]
    EmptyHeader,
    #[error("the CSV header contains unknown base field short codes: {}", .0.join(", "))]
    UnknownShortCodes(Vec<String>),
    #[error(
        "data row {row} (line {line}) has {found} cells but the header has {expected}"
    )]
    RowLength {
        row: u64,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("reading CSV failed")]
    Csv(#[from] csv::Error),
}

/// What a successful validation pass saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvShape {
    pub header: Vec<String>,
    pub data_rows: u64,
}

/// Reader settings shared by validation and ingestion so both passes see the
/// same rows. Length checks are done by hand to report them as schema errors.
pub fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
}

pub struct CsvSchemaValidator<'a> {
    registry: &'a BaseFieldRegistry,
}

impl<'a> CsvSchemaValidator<'a> {
    pub fn new(registry: &'a BaseFieldRegistry) -> Self {
        Self { registry }
    }

    /// Checks the header against the registry, then streams the data rows one
    /// record at a time and stops at the first one whose width differs.
    pub fn validate<R: Read>(&self, input: R) -> Result<CsvShape, CsvSchemaError> {
        let mut reader = csv_reader(input);
        let mut record = csv::StringRecord::new();

        if !reader.read_record(&mut record)? {
            return Err(CsvSchemaError::EmptyHeader);
        }
        let header = self.validate_header(&record)?;

        let mut data_rows = 0u64;
        while reader.read_record(&mut record)? {
            data_rows += 1;
            if record.len() != header.len() {
                return Err(CsvSchemaError::RowLength {
                    row: data_rows,
                    line: record.position().map(|p| p.line()).unwrap_or_default(),
                    expected: header.len(),
                    found: record.len(),
                });
            }
        }

        Ok(CsvShape { header, data_rows })
    }

    fn validate_header(&self, record: &csv::StringRecord) -> Result<Vec<String>, CsvSchemaError> {
        if record.is_empty() || (record.len() == 1 && record[0].is_empty()) {
            return Err(CsvSchemaError::EmptyHeader);
        }

        let mut unknown: Vec<String> = Vec::new();
        for token in record.iter() {
            if !self.registry.contains(token) && !unknown.iter().any(|u| u == token) {
                unknown.push(token.to_string());
            }
        }
        if !unknown.is_empty() {
            return Err(CsvSchemaError::UnknownShortCodes(unknown));
        }

        Ok(record.iter().map(str::to_string).collect())
    }
}

use std::collections::HashMap;

use bulkup_core::{
    BaseFieldDataType, NewChangemaker, NewProposal, NewProposalFieldValue, NewProposalVersion,
    ValueValidator, ORGANIZATION_NAME_SHORT_CODE, TAX_ID_SHORT_CODE,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::store::{IngestTransaction, StoreError};

/// A CSV column bound to the form field created for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormColumn {
    pub position: i32,
    pub application_form_field_id: Uuid,
    pub base_field_short_code: String,
    pub data_type: BaseFieldDataType,
}

/// Records every ingested row hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestTarget {
    pub opportunity_id: Uuid,
    pub application_form_id: Uuid,
    pub source_id: Uuid,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub proposals: u64,
    pub field_values: u64,
    pub invalid_field_values: u64,
    pub changemakers_linked: u64,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading data row {row} failed")]
    Read {
        row: u64,
        #[source]
        source: csv::Error,
    },
    #[error("data row {row} has a cell in column {column} with no form field")]
    UnmappedCell { row: u64, column: usize },
    #[error("persisting data row {row} failed")]
    Store {
        row: u64,
        #[source]
        source: StoreError,
    },
}

pub struct RecordIngester<'a> {
    validator: &'a dyn ValueValidator,
    default_changemaker_name: &'a str,
}

impl<'a> RecordIngester<'a> {
    pub fn new(validator: &'a dyn ValueValidator, default_changemaker_name: &'a str) -> Self {
        Self {
            validator,
            default_changemaker_name,
        }
    }

    /// Writes the proposal graph for every data row, in document order, through
    /// `tx`. The first failure stops ingestion; the caller owns the rollback.
    pub async fn ingest<I>(
        &self,
        tx: &mut dyn IngestTransaction,
        rows: I,
        columns: &[FormColumn],
        target: &IngestTarget,
    ) -> Result<IngestSummary, IngestError>
    where
        I: IntoIterator<Item = Result<csv::StringRecord, csv::Error>>,
        I::IntoIter: Send,
    {
        let by_position = columns
            .iter()
            .map(|column| (column.position, column))
            .collect::<HashMap<_, _>>();
        let tax_id_column = position_of(columns, TAX_ID_SHORT_CODE);
        let name_column = position_of(columns, ORGANIZATION_NAME_SHORT_CODE);

        let mut summary = IngestSummary::default();
        for (index, record) in rows.into_iter().enumerate() {
            let row = index as u64 + 1;
            let record = record.map_err(|source| IngestError::Read { row, source })?;
            self.ingest_row(
                tx,
                row,
                &record,
                &by_position,
                tax_id_column,
                name_column,
                target,
                &mut summary,
            )
            .await?;
        }

        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest_row(
        &self,
        tx: &mut dyn IngestTransaction,
        row: u64,
        record: &csv::StringRecord,
        by_position: &HashMap<i32, &FormColumn>,
        tax_id_column: Option<usize>,
        name_column: Option<usize>,
        target: &IngestTarget,
        summary: &mut IngestSummary,
    ) -> Result<(), IngestError> {
        let store_err = |source| IngestError::Store { row, source };

        let proposal = tx
            .create_proposal(&NewProposal {
                opportunity_id: target.opportunity_id,
                external_id: row.to_string(),
                created_by: target.created_by,
            })
            .await
            .map_err(store_err)?;

        let version = tx
            .create_proposal_version(&NewProposalVersion {
                proposal_id: proposal.id,
                application_form_id: target.application_form_id,
                source_id: target.source_id,
                created_by: target.created_by,
            })
            .await
            .map_err(store_err)?;

        if let Some(tax_id) = non_blank_cell(record, tax_id_column) {
            let name = non_blank_cell(record, name_column).unwrap_or(self.default_changemaker_name);
            let changemaker = tx
                .load_or_create_changemaker(&NewChangemaker {
                    tax_id: tax_id.to_string(),
                    name: name.to_string(),
                })
                .await
                .map_err(store_err)?;
            tx.create_changemaker_proposal(changemaker.id, proposal.id)
                .await
                .map_err(store_err)?;
            summary.changemakers_linked += 1;
        }

        let mut values = Vec::with_capacity(record.len());
        for (index, value) in record.iter().enumerate() {
            let (position, column) = cell_column(by_position, index)
                .ok_or(IngestError::UnmappedCell { row, column: index })?;
            let is_valid = self.validator.is_valid(value, column.data_type);
            if !is_valid {
                summary.invalid_field_values += 1;
            }
            values.push(NewProposalFieldValue {
                proposal_version_id: version.id,
                application_form_field_id: column.application_form_field_id,
                position,
                value: value.to_string(),
                is_valid,
                good_as_of: None,
            });
        }

        summary.field_values += tx
            .create_proposal_field_values(&values)
            .await
            .map_err(store_err)?;
        summary.proposals += 1;
        debug!(row, proposal_id = %proposal.id, cells = values.len(), "ingested row");
        Ok(())
    }
}

fn cell_column<'c>(
    by_position: &HashMap<i32, &'c FormColumn>,
    index: usize,
) -> Option<(i32, &'c FormColumn)> {
    let position = i32::try_from(index).ok()?;
    by_position.get(&position).map(|column| (position, *column))
}

fn position_of(columns: &[FormColumn], short_code: &str) -> Option<usize> {
    columns
        .iter()
        .find(|column| column.base_field_short_code == short_code)
        .and_then(|column| usize::try_from(column.position).ok())
}

fn non_blank_cell(record: &csv::StringRecord, position: Option<usize>) -> Option<&str> {
    position
        .and_then(|p| record.get(p))
        .map(str::trim)
        .filter(|cell| !cell.is_empty())
}

use std::collections::HashMap;

use bulkup_core::{BaseField, BaseFieldDataType};
use thiserror::Error;

/// Base fields indexed by short code for one task run.
#[derive(Debug, Clone, Default)]
pub struct BaseFieldRegistry {
    by_short_code: HashMap<String, BaseField>,
}

impl BaseFieldRegistry {
    pub fn new(base_fields: impl IntoIterator<Item = BaseField>) -> Self {
        Self {
            by_short_code: base_fields
                .into_iter()
                .map(|field| (field.short_code.clone(), field))
                .collect(),
        }
    }

    /// Exact, case-sensitive lookup.
    pub fn get(&self, short_code: &str) -> Option<&BaseField> {
        self.by_short_code.get(short_code)
    }

    pub fn contains(&self, short_code: &str) -> bool {
        self.by_short_code.contains_key(short_code)
    }

    pub fn len(&self) -> usize {
        self.by_short_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_short_code.is_empty()
    }
}

/// Form field to create for one CSV column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub position: i32,
    pub base_field_short_code: String,
    pub label: String,
    pub data_type: BaseFieldDataType,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColumnMappingError {
    #[error("column {position} (`{short_code}`) does not match any base field")]
    UnknownShortCode { position: usize, short_code: String },
    #[error("column {position} (`{short_code}`) is past the last storable field position")]
    PositionOutOfRange { position: usize, short_code: String },
}

pub struct ColumnMapper<'a> {
    registry: &'a BaseFieldRegistry,
}

impl<'a> ColumnMapper<'a> {
    pub fn new(registry: &'a BaseFieldRegistry) -> Self {
        Self { registry }
    }

    pub fn map(&self, header: &[String]) -> Result<Vec<FieldSpec>, ColumnMappingError> {
        header
            .iter()
            .enumerate()
            .map(|(position, short_code)| {
                let field = self.registry.get(short_code).ok_or_else(|| {
                    ColumnMappingError::UnknownShortCode {
                        position,
                        short_code: short_code.clone(),
                    }
                })?;
                Ok(FieldSpec {
                    position: field_position(position, short_code)?,
                    base_field_short_code: field.short_code.clone(),
                    label: field.label.clone(),
                    data_type: field.data_type,
                })
            })
            .collect()
    }
}

/// Form field positions are stored as `INTEGER`.
pub(crate) fn field_position(
    position: usize,
    short_code: &str,
) -> Result<i32, ColumnMappingError> {
    i32::try_from(position).map_err(|_| ColumnMappingError::PositionOutOfRange {
        position,
        short_code: short_code.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkup_core::SensitivityClassification;

    fn base_field(short_code: &str, label: &str, data_type: BaseFieldDataType) -> BaseField {
        BaseField {
            short_code: short_code.to_string(),
            label: label.to_string(),
            data_type,
            category: "organization".to_string(),
            sensitivity_classification: SensitivityClassification::Public,
        }
    }

    fn registry() -> BaseFieldRegistry {
        BaseFieldRegistry::new([
            base_field("organization_tax_id", "Tax ID", BaseFieldDataType::String),
            base_field("organization_name", "Organization Name", BaseFieldDataType::String),
            base_field("budget_total", "Total Budget", BaseFieldDataType::Number),
        ])
    }

    #[test]
    fn specs_follow_header_order() {
        let registry = registry();
        let header = vec![
            "budget_total".to_string(),
            "organization_name".to_string(),
            "organization_tax_id".to_string(),
        ];
        let specs = ColumnMapper::new(&registry).map(&header).expect("map");

        assert_eq!(
            specs
                .iter()
                .map(|s| (s.position, s.base_field_short_code.as_str(), s.label.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (0, "budget_total", "Total Budget"),
                (1, "organization_name", "Organization Name"),
                (2, "organization_tax_id", "Tax ID"),
            ]
        );
        assert_eq!(specs[0].data_type, BaseFieldDataType::Number);
    }

    #[test]
    fn unmatched_token_is_rejected() {
        let registry = registry();
        let header = vec!["organization_name".to_string(), "Organization_Tax_ID".to_string()];
        let err = ColumnMapper::new(&registry).map(&header).unwrap_err();
        assert_eq!(
            err,
            ColumnMappingError::UnknownShortCode {
                position: 1,
                short_code: "Organization_Tax_ID".to_string(),
            }
        );
    }

    #[test]
    fn positions_beyond_integer_range_are_rejected() {
        assert_eq!(field_position(7, "budget_total"), Ok(7));
        assert_eq!(
            field_position(i32::MAX as usize, "budget_total"),
            Ok(i32::MAX)
        );
        assert_eq!(
            field_position(usize::MAX, "budget_total"),
            Err(ColumnMappingError::PositionOutOfRange {
                position: usize::MAX,
                short_code: "budget_total".to_string(),
            })
        );
    }
}

//! Criteria definitions: parsing, schema validation and the read-only registry.

mod parser;
mod registry;
pub mod schema;

pub use parser::{
    ConfigError, CriteriaDefinition, CriteriaSettings, Criterion, QualityProfile,
};
pub use registry::CriteriaRegistry;
pub use schema::validate_criteria_schema;

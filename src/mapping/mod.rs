//! Telemetry to display-row mapping.
//!
//! The incoming document is reduced to a [`DisplayTable`] using the static
//! controller/zone topology in [`source_map`] and the configured allow-list.

pub mod error;
pub mod mapping_types;
pub mod row_mapper;
pub mod source_map;

pub use error::MappingError;
pub use mapping_types::{DisplayRow, DisplayTable};
pub use row_mapper::{map_telemetry, RowMapper};

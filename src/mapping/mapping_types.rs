//! Row and table types produced by the row mapper.

use super::source_map::SOURCE_MAP;

/// One dashboard row. Rows with `valid == false` hold zeros and are never published.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DisplayRow {
    pub zone_number: u32,
    pub total_flow_gallons: f64,
    pub total_minutes: f64,
    pub avg_psi: f64,
    pub gpm: f64,
    pub valid: bool,
}

/// Fixed-capacity ordered set of rows, rebuilt from scratch for every telemetry message
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayTable {
    rows: Vec<DisplayRow>,
}

impl DisplayTable {
    /// Empty table holding `min(row_limit, SOURCE_MAP.len())` invalid rows
    pub fn with_limit(row_limit: usize) -> Self {
        Self {
            rows: vec![DisplayRow::default(); row_limit.min(SOURCE_MAP.len())],
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[DisplayRow] {
        &self.rows
    }

    pub fn valid_count(&self) -> usize {
        self.rows.iter().filter(|row| row.valid).count()
    }

    pub(crate) fn set(&mut self, index: usize, row: DisplayRow) {
        self.rows[index] = row;
    }
}

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::MappingError;
use super::mapping_types::{DisplayRow, DisplayTable};
use super::source_map::{SourceMapping, SOURCE_MAP};
use crate::config::{Config, DataFilter};

/// Maps nested controller telemetry into a [`DisplayTable`].
///
/// Expected document shape:
///
/// ```text
/// { "details": { "<controller>": { "<zone>": {
///     "totalFlow": f, "totalSeconds": f, "avgPSI": f, "gpm": f,
///     "updatedInLastQuery": bool } } } }
/// ```
///
/// Source entries are visited in [`SOURCE_MAP`] order and accepted entries fill
/// display slots from the front. Numeric fields that are missing or not
/// numbers read as `0.0`; a present zone object always yields a valid row.
#[derive(Debug, Clone)]
pub struct RowMapper {
    filter: DataFilter,
    row_limit: usize,
}

impl RowMapper {
    pub fn new(filter: DataFilter, row_limit: usize) -> Self {
        Self { filter, row_limit }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.data_filter.clone(), config.bridge.row_limit)
    }

    pub fn map(&self, raw: &[u8]) -> Result<DisplayTable, MappingError> {
        let document: Value = serde_json::from_slice(raw)?;
        let details = document
            .get("details")
            .ok_or_else(|| MappingError::Schema("missing 'details'".to_string()))?
            .as_object()
            .ok_or_else(|| MappingError::Schema("'details' is not an object".to_string()))?;

        let mut table = DisplayTable::with_limit(self.row_limit);
        let mut next_slot = 0;

        for (index, source) in SOURCE_MAP.iter().enumerate() {
            if next_slot >= table.capacity() {
                break;
            }
            if !self.is_allowed(source) {
                continue;
            }

            let Some(zone) = lookup_zone(details, source) else {
                debug!(
                    "No zone data for controller {} zone {}, skipping source entry {}",
                    source.controller_key, source.zone_key, index
                );
                continue;
            };

            let row = read_row(zone, source.display_zone);
            debug!(
                "Row {} (C:{} Z:{} -> zone {}): flow={:.2} min={:.2} psi={:.2} gpm={:.2}",
                next_slot,
                source.controller_key,
                source.zone_key,
                row.zone_number,
                row.total_flow_gallons,
                row.total_minutes,
                row.avg_psi,
                row.gpm
            );
            if zone.get("updatedInLastQuery").and_then(Value::as_bool) == Some(false) {
                debug!(
                    "Controller {} zone {} not updated in last query",
                    source.controller_key, source.zone_key
                );
            }

            table.set(next_slot, row);
            next_slot += 1;
        }

        Ok(table)
    }

    fn is_allowed(&self, source: &SourceMapping) -> bool {
        match (
            source.controller_key.parse::<i64>(),
            source.zone_key.parse::<i64>(),
        ) {
            (Ok(controller), Ok(zone)) => self.filter.allows(controller, zone),
            _ => {
                warn!(
                    "Source entry C:{} Z:{} has non-numeric keys",
                    source.controller_key, source.zone_key
                );
                false
            }
        }
    }
}

/// Convenience wrapper building a mapper from `config` for a single document
pub fn map_telemetry(raw: &[u8], config: &Config) -> Result<DisplayTable, MappingError> {
    RowMapper::from_config(config).map(raw)
}

fn lookup_zone<'a>(
    details: &'a Map<String, Value>,
    source: &SourceMapping,
) -> Option<&'a Map<String, Value>> {
    details
        .get(source.controller_key)?
        .as_object()?
        .get(source.zone_key)?
        .as_object()
}

fn read_row(zone: &Map<String, Value>, display_zone: u32) -> DisplayRow {
    let number = |key: &str| zone.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let seconds = number("totalSeconds");

    DisplayRow {
        zone_number: display_zone,
        total_flow_gallons: number("totalFlow"),
        total_minutes: if seconds > 0.0 { seconds / 60.0 } else { 0.0 },
        avg_psi: number("avgPSI"),
        gpm: number("gpm"),
        valid: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    const C1_Z3: &[u8] = br#"{"details":{"1":{"3":{"totalFlow":120.0,"totalSeconds":600,"avgPSI":45.5,"gpm":12.0}}}}"#;

    fn filter(controllers: &[i64], zones: &[i64]) -> DataFilter {
        DataFilter {
            controllers: controllers.iter().copied().collect::<BTreeSet<_>>(),
            zones: zones.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    fn full_document() -> Vec<u8> {
        let mut details = serde_json::Map::new();
        for source in SOURCE_MAP.iter() {
            let controller = details
                .entry(source.controller_key)
                .or_insert_with(|| json!({}));
            controller[source.zone_key] = json!({
                "totalFlow": 10.0,
                "totalSeconds": 120,
                "avgPSI": 50.0,
                "gpm": 2.5,
                "updatedInLastQuery": true
            });
        }
        serde_json::to_vec(&json!({ "details": details })).unwrap()
    }

    #[test]
    fn single_zone_document_yields_one_row() {
        let mapper = RowMapper::new(filter(&[1], &[3]), 16);
        let table = mapper.map(C1_Z3).unwrap();

        assert_eq!(table.valid_count(), 1);
        assert_eq!(
            table.rows()[0],
            DisplayRow {
                zone_number: 3,
                total_flow_gallons: 120.0,
                total_minutes: 10.0,
                avg_psi: 45.5,
                gpm: 12.0,
                valid: true,
            }
        );
    }

    #[test]
    fn disallowed_controller_yields_nothing() {
        let mapper = RowMapper::new(filter(&[2], &[3]), 16);
        let table = mapper.map(C1_Z3).unwrap();
        assert_eq!(table.valid_count(), 0);
    }

    #[test]
    fn missing_details_is_schema_error() {
        let mapper = RowMapper::new(filter(&[1], &[3]), 16);
        assert!(matches!(
            mapper.map(br#"{"summary":{}}"#),
            Err(MappingError::Schema(_))
        ));
        assert!(matches!(
            mapper.map(br#"{"details":[1,2]}"#),
            Err(MappingError::Schema(_))
        ));
        assert!(matches!(mapper.map(b"[]"), Err(MappingError::Schema(_))));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let mapper = RowMapper::new(filter(&[1], &[3]), 16);
        assert!(matches!(
            mapper.map(b"{\"details\":"),
            Err(MappingError::Parse(_))
        ));
    }

    #[test]
    fn valid_rows_never_exceed_row_limit() {
        let all_controllers = [0, 1, 2, 3];
        let all_zones: Vec<i64> = (0..=16).collect();
        let document = full_document();

        for limit in [0, 1, 8, 16, 31, 64] {
            let mapper = RowMapper::new(filter(&all_controllers, &all_zones), limit);
            let table = mapper.map(&document).unwrap();
            assert_eq!(table.valid_count(), limit.min(31));
        }
    }

    #[test]
    fn rows_fill_slots_in_source_order() {
        let mapper = RowMapper::new(filter(&[1, 2], &[2, 5]), 16);
        let table = mapper.map(&full_document()).unwrap();

        let zones: Vec<u32> = table
            .rows()
            .iter()
            .filter(|row| row.valid)
            .map(|row| row.zone_number)
            .collect();
        // C1/Z2, C1/Z5, C2/Z2, C2/Z5
        assert_eq!(zones, vec![2, 5, 2, 5]);
        assert!(table.rows()[4..].iter().all(|row| !row.valid));
    }

    #[test]
    fn disallowed_entries_never_produce_rows() {
        let mapper = RowMapper::new(filter(&[3], &[1]), 16);
        let table = mapper.map(&full_document()).unwrap();

        assert_eq!(table.valid_count(), 1);
        assert_eq!(table.rows()[0].zone_number, 1);
    }

    #[test]
    fn missing_and_non_numeric_fields_read_as_zero() {
        let document = json!({"details": {"1": {"3": {
            "totalFlow": "lots",
            "avgPSI": 40,
            "updatedInLastQuery": false
        }}}});
        let mapper = RowMapper::new(filter(&[1], &[3]), 16);
        let table = mapper.map(&serde_json::to_vec(&document).unwrap()).unwrap();

        let row = table.rows()[0];
        assert!(row.valid);
        assert_eq!(row.total_flow_gallons, 0.0);
        assert_eq!(row.total_minutes, 0.0);
        assert_eq!(row.avg_psi, 40.0);
        assert_eq!(row.gpm, 0.0);
    }

    #[test]
    fn non_object_zone_is_skipped() {
        let document = br#"{"details":{"1":{"3":42,"4":{"gpm":1.0}},"2":"offline"}}"#;
        let mapper = RowMapper::new(filter(&[1, 2], &[3, 4]), 16);
        let table = mapper.map(document).unwrap();

        assert_eq!(table.valid_count(), 1);
        assert_eq!(table.rows()[0].zone_number, 4);
    }

    #[test]
    fn mapping_is_idempotent() {
        let config = crate::config::test_config();
        let first = map_telemetry(C1_Z3, &config).unwrap();
        let second = map_telemetry(C1_Z3, &config).unwrap();
        assert_eq!(first, second);
    }
}

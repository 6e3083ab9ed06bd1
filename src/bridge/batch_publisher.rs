//! Batched, paced delivery of display rows.
//!
//! Valid rows are packed into flat JSON objects of at most
//! `max_rows_per_batch` rows. Every row contributes five datastreams named
//! after its table slot `i`, with `n = pin_base_offset + 5 * i`:
//!
//! ```text
//! V{n+1}zone  V{n+2}flow  V{n+3}min  V{n+4}psi  V{n+5}gpm
//! ```
//!
//! The pacing delay only separates two published batches. Invalid rows never
//! cause a wait, so a pass ending in unset slots returns right after its last
//! batch instead of pausing while rows are left to scan.

use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::mapping::{DisplayRow, DisplayTable};
use crate::mqtt::mqtt_handler::Session;

const FIELDS_PER_ROW: i64 = 5;
const SIGNIFICANT_DIGITS: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_rows_per_batch: usize,
    pub max_rows_total: usize,
    /// Delay between two consecutive batches of one pass
    pub pacing: Duration,
}

impl BatchLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_rows_per_batch: config.bridge.batch_row_limit,
            max_rows_total: config.bridge.row_limit,
            pacing: config.bridge.batch_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotConnected,
}

/// Outcome of one publish pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReport {
    Skipped {
        reason: SkipReason,
    },
    Completed {
        batches_sent: usize,
        batches_failed: usize,
        rows_sent: usize,
    },
}

impl PublishReport {
    pub fn messages_sent(&self) -> usize {
        match self {
            PublishReport::Skipped { .. } => 0,
            PublishReport::Completed { batches_sent, .. } => *batches_sent,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PublishReport::Skipped { .. })
    }
}

/// One outbound message: the table slots it carries and their datastream values
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub slots: Vec<usize>,
    pub fields: Map<String, Value>,
}

impl Batch {
    pub fn payload(&self) -> Vec<u8> {
        Value::Object(self.fields.clone()).to_string().into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct BatchPublisher {
    topic: String,
    pin_base_offset: i64,
    limits: BatchLimits,
}

impl BatchPublisher {
    pub fn new(topic: impl Into<String>, pin_base_offset: i64, limits: BatchLimits) -> Self {
        Self {
            topic: topic.into(),
            pin_base_offset,
            limits,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.blynk.topic.clone(),
            config.pin_config.base_offset,
            BatchLimits::from_config(config),
        )
    }

    /// Groups the valid rows among the first `max_rows_total` slots. Never yields an empty batch.
    pub fn build_batches(&self, table: &DisplayTable) -> Vec<Batch> {
        let per_batch = self.limits.max_rows_per_batch.max(1);
        let valid_slots: Vec<(usize, &DisplayRow)> = table
            .rows()
            .iter()
            .take(self.limits.max_rows_total)
            .enumerate()
            .filter(|(_, row)| row.valid)
            .collect();

        valid_slots
            .chunks(per_batch)
            .map(|chunk| {
                let mut fields = Map::new();
                for (slot, row) in chunk {
                    self.insert_row(&mut fields, *slot, row);
                }
                Batch {
                    slots: chunk.iter().map(|(slot, _)| *slot).collect(),
                    fields,
                }
            })
            .collect()
    }

    /// Publishes every batch of `table` on the delivery session.
    ///
    /// Skips the whole pass when the session is not connected. A failed batch
    /// is counted and the pass moves on to the next one.
    pub async fn publish(&self, table: &DisplayTable, session: &mut Session) -> PublishReport {
        if !session.is_connected() {
            info!("Delivery session not connected, skipping publish pass");
            return PublishReport::Skipped {
                reason: SkipReason::NotConnected,
            };
        }

        let batches = self.build_batches(table);
        let mut batches_sent = 0;
        let mut batches_failed = 0;
        let mut rows_sent = 0;

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.limits.pacing).await;
            }

            let payload = batch.payload();
            let length = payload.len();
            match session.publish(&self.topic, payload).await {
                Ok(()) => {
                    batches_sent += 1;
                    rows_sent += batch.slots.len();
                    debug!(
                        "Published batch {} ({} rows, {} bytes) to {}",
                        index + 1,
                        batch.slots.len(),
                        length,
                        self.topic
                    );
                }
                Err(e) => {
                    batches_failed += 1;
                    error!("Batch {} failed: {}", index + 1, e);
                }
            }
        }

        info!(
            "Publish pass done: {} batches sent, {} failed, {} rows",
            batches_sent, batches_failed, rows_sent
        );
        PublishReport::Completed {
            batches_sent,
            batches_failed,
            rows_sent,
        }
    }

    fn insert_row(&self, fields: &mut Map<String, Value>, slot: usize, row: &DisplayRow) {
        let n = self.pin_base_offset + slot as i64 * FIELDS_PER_ROW;
        fields.insert(format!("V{}zone", n + 1), Value::from(row.zone_number));
        fields.insert(format!("V{}flow", n + 2), number(row.total_flow_gallons));
        fields.insert(format!("V{}min", n + 3), number(row.total_minutes));
        fields.insert(format!("V{}psi", n + 4), number(row.avg_psi));
        fields.insert(format!("V{}gpm", n + 5), number(row.gpm));
    }
}

fn number(value: f64) -> Value {
    Value::from(round_significant(value, SIGNIFICANT_DIGITS))
}

/// Rounds to `digits` significant digits; zero and non-finite values pass through
pub fn round_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = digits - 1 - magnitude;
    if decimals >= 0 {
        let factor = 10f64.powi(decimals);
        (value * factor).round() / factor
    } else {
        let factor = 10f64.powi(-decimals);
        (value / factor).round() * factor
    }
}

//! Dashboard time-window selections and the query requests they trigger.

/// Selector sent by the dashboard and the range token understood by the data service
pub const TIME_WINDOWS: [(i64, &str); 15] = [
    (0, "1h"),
    (1, "12h"),
    (2, "24h"),
    (3, "48h"),
    (4, "72h"),
    (5, "7d"),
    (6, "14d"),
    (7, "May"),
    (8, "June"),
    (9, "July"),
    (10, "August"),
    (11, "September"),
    (12, "2025"),
    (13, "2026"),
    (14, "2027"),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Selection payload '{0}' is not an integer")]
    Malformed(String),

    #[error("No time window for selector {0}")]
    Unknown(i64),
}

pub fn parse_selector(payload: &[u8]) -> Result<i64, SelectionError> {
    let text = String::from_utf8_lossy(payload);
    text.trim()
        .parse()
        .map_err(|_| SelectionError::Malformed(text.into_owned()))
}

pub fn resolve(selector: i64) -> Result<&'static str, SelectionError> {
    TIME_WINDOWS
        .iter()
        .find(|(value, _)| *value == selector)
        .map(|(_, token)| *token)
        .ok_or(SelectionError::Unknown(selector))
}

/// Turns a raw selection payload into the `{"range":"<token>"}` query request body
pub fn range_request(payload: &[u8]) -> Result<Vec<u8>, SelectionError> {
    let range = resolve(parse_selector(payload)?)?;
    Ok(serde_json::json!({ "range": range }).to_string().into_bytes())
}

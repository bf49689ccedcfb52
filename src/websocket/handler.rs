//! Parsing of inbound live feed frames.

use tracing::debug;

use crate::models::feed::FeedMessage;

/// Parses one text frame into feed messages.
///
/// Frames carry either a JSON array of events or a single event object.
/// Events that fail to parse are skipped individually so one bad element
/// does not discard the rest of the frame.
pub fn parse_feed_text(text: &str) -> Vec<FeedMessage> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Ignoring non-JSON frame: {e}");
            return Vec::new();
        }
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<FeedMessage>(item) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("Skipping unparseable feed event: {e}");
                None
            }
        })
        .collect()
}

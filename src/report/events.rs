//! Line-delimited `go test -json` events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// One `test2json` event. Unknown fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Appends `suffix` to the `Package` of every event in `input` and writes
/// the events back out, one per line.
///
/// Blank lines are dropped; lines that are not events are logged and
/// skipped.
pub fn suffix_events(input: &[u8], suffix: &str, out: &mut Vec<u8>) {
    for (idx, line) in input.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let mut event: TestEvent = match serde_json::from_slice(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping malformed test event on line {}: {}", idx + 1, e);
                continue;
            }
        };
        if let Some(package) = event.package.as_mut() {
            package.push_str(suffix);
        }
        match serde_json::to_vec(&event) {
            Ok(encoded) => {
                out.extend(encoded);
                out.push(b'\n');
            }
            Err(e) => warn!("Failed to encode test event: {}", e),
        }
    }
}

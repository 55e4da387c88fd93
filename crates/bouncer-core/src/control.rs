//! Control-plane messages pushed from the parent to its workers.
//!
//! Messages travel over the worker's rendezvous socket as NDJSON: one JSON
//! object per line, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::decision::Decision;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Full dataset; replaces whatever the worker had.
    Snapshot { decisions: Vec<Decision> },
    /// Decisions that became active.
    Added { decisions: Vec<Decision> },
    /// Decisions that were lifted.
    Deleted { decisions: Vec<Decision> },
}

impl ControlMessage {
    /// Encode as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (trailing whitespace allowed).
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Apply this message to `dataset`.
    pub fn apply(self, dataset: &mut Dataset) {
        match self {
            Self::Snapshot { decisions } => dataset.reset(decisions),
            Self::Added { decisions } => dataset.add(decisions),
            Self::Deleted { decisions } => dataset.remove(&decisions),
        }
    }

    /// Number of decisions carried.
    pub fn len(&self) -> usize {
        match self {
            Self::Snapshot { decisions } | Self::Added { decisions } | Self::Deleted { decisions } => {
                decisions.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn line_is_tagged_and_newline_terminated() {
        let msg = ControlMessage::Added {
            decisions: vec![Decision::new("Ip", "192.0.2.1", "ban")],
        };
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with(r#"{"type":"added""#));
        assert_eq!(ControlMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn apply_sequence() {
        let mut dataset = Dataset::new();
        ControlMessage::Snapshot {
            decisions: vec![
                Decision::new("Ip", "192.0.2.1", "ban"),
                Decision::new("Ip", "192.0.2.2", "ban"),
            ],
        }
        .apply(&mut dataset);
        ControlMessage::Deleted {
            decisions: vec![Decision::new("Ip", "192.0.2.1", "ban")],
        }
        .apply(&mut dataset);
        ControlMessage::Added {
            decisions: vec![Decision::new("Range", "198.51.100.0/24", "captcha")],
        }
        .apply(&mut dataset);

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.lookup("ip", "192.0.2.1"), None);
        assert_eq!(dataset.lookup("range", "198.51.100.0/24"), Some("captcha"));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ControlMessage::from_line(r#"{"type":"reboot"}"#).is_err());
    }
}

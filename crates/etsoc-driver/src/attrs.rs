//! Attribute-file parsing
//!
//! The kernel driver publishes statistics as text files of
//! `name value [unit]` lines, several counters per file, e.g.
//!
//! ```text
//! msg_count: 1200
//! utilization_percent: 37 %
//! ```

use std::path::Path;

use crate::error::Result;

/// One counter from an attribute file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Counter name, trailing colon removed
    pub name: String,
    /// Counter value
    pub value: u64,
    /// Unit token following the value, if any
    pub unit: Option<String>,
}

/// Parse every well-formed line; malformed lines are skipped.
#[must_use]
pub fn parse_attributes(text: &str) -> Vec<Attribute> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?.trim_end_matches(':');
            let Some(raw) = fields.next() else {
                tracing::debug!("Attribute line without value: {line:?}");
                return None;
            };
            let Ok(value) = raw.parse::<u64>() else {
                tracing::debug!("Attribute {name}: {raw:?} is not a counter");
                return None;
            };
            if name.is_empty() {
                return None;
            }
            Some(Attribute {
                name: name.to_owned(),
                value,
                unit: fields.next().map(str::to_owned),
            })
        })
        .collect()
}

/// Read and parse an attribute file
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn read_attribute_file(path: &Path) -> Result<Vec<Attribute>> {
    Ok(parse_attributes(&std::fs::read_to_string(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_counters() {
        let attrs = parse_attributes("msg_count: 1200\nutilization_percent: 37 %\n\nbogus\nrate: fast\n");
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].name, "msg_count");
        assert_eq!(attrs[0].value, 1200);
        assert_eq!(attrs[0].unit, None);
        assert_eq!(attrs[1].unit.as_deref(), Some("%"));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mgmt_vq_stats");
        std::fs::write(&path, "cmd_count 5\nrsp_count 4\n").unwrap();
        let attrs = read_attribute_file(&path).unwrap();
        assert_eq!(
            attrs.iter().map(|a| a.value).collect::<Vec<_>>(),
            vec![5, 4]
        );
        assert!(read_attribute_file(&dir.path().join("missing")).is_err());
    }
}

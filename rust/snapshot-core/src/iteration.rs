// rust/snapshot-core/src/iteration.rs

//! Advisory iteration tags sent to the metadata authority.

use std::fmt;
use std::path::Path;

use crate::graph::Value;

const STEP_MARKER: &str = "global_step";

/// Training iteration a checkpoint belongs to, if it can be told.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IterationTag {
    Step(u64),
    /// Non-numeric text found in the payload, passed through as-is.
    Label(String),
    #[default]
    Unknown,
}

impl IterationTag {
    /// Extracts the tag for a save of `value` to `path`.
    ///
    /// A `global_step<N>` component in the path wins; otherwise the `iter`
    /// or `iteration` entry of a top-level mapping is used, either a
    /// non-negative integer or non-empty text.
    pub fn extract(value: &Value, path: &Path) -> Self {
        if let Some(step) = step_in_path(path) {
            return Self::Step(step);
        }
        ["iter", "iteration"]
            .iter()
            .filter_map(|key| value.get(*key))
            .find_map(Self::from_entry)
            .unwrap_or_default()
    }

    fn from_entry(entry: &Value) -> Option<Self> {
        match entry {
            Value::Int(i) => u64::try_from(*i).ok().map(Self::Step),
            Value::Str(text) => {
                let text = text.trim();
                if text.is_empty() {
                    None
                } else if let Ok(step) = text.parse() {
                    Some(Self::Step(step))
                } else {
                    Some(Self::Label(text.to_string()))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for IterationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(step) => write!(f, "{step}"),
            Self::Label(label) => f.write_str(label),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// First `global_step<digits>` occurrence in the path.
fn step_in_path(path: &Path) -> Option<u64> {
    let text = path.to_string_lossy();
    let mut rest: &str = &text;
    while let Some(idx) = rest.find(STEP_MARKER) {
        rest = &rest[idx + STEP_MARKER.len()..];
        let digits: &str = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map_or(rest, |(end, _)| &rest[..end]);
        if let Ok(step) = digits.parse() {
            return Some(step);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_from_path() {
        let tag = IterationTag::extract(&Value::None, Path::new("/ckpt/global_step1200/model.pt"));
        assert_eq!(tag, IterationTag::Step(1200));
    }

    #[test]
    fn test_path_wins_over_payload() {
        let value = Value::dict([("iteration", Value::Int(5))]);
        let tag = IterationTag::extract(&value, Path::new("global_step7/mp_rank_00.pt"));
        assert_eq!(tag, IterationTag::Step(7));
    }

    #[test]
    fn test_step_from_payload() {
        let value = Value::dict([("iter", Value::Int(42))]);
        assert_eq!(
            IterationTag::extract(&value, Path::new("/x/ckpt.pt")),
            IterationTag::Step(42)
        );

        let value = Value::dict([("iteration", Value::Int(9))]);
        assert_eq!(
            IterationTag::extract(&value, Path::new("/x/ckpt.pt")),
            IterationTag::Step(9)
        );
    }

    #[test]
    fn test_text_payload() {
        let value = Value::dict([("iter", Value::Str("1200".into()))]);
        assert_eq!(
            IterationTag::extract(&value, Path::new("/x/ckpt.pt")),
            IterationTag::Step(1200)
        );

        let value = Value::dict([("iteration", Value::Str("latest".into()))]);
        let tag = IterationTag::extract(&value, Path::new("/x/ckpt.pt"));
        assert_eq!(tag, IterationTag::Label("latest".to_string()));
        assert_eq!(tag.to_string(), "latest");
    }

    #[test]
    fn test_unknown() {
        let value = Value::dict([("iteration", Value::Str("  ".into()))]);
        assert_eq!(IterationTag::extract(&value, Path::new("/x/ckpt.pt")), IterationTag::Unknown);
        let value = Value::dict([("iteration", Value::Float(1.5))]);
        assert_eq!(IterationTag::extract(&value, Path::new("/x/ckpt.pt")), IterationTag::Unknown);
        assert_eq!(IterationTag::extract(&Value::Int(3), Path::new("/x/global_step/ckpt.pt")), IterationTag::Unknown);
        assert_eq!(IterationTag::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_skips_marker_without_digits() {
        let tag = IterationTag::extract(&Value::None, Path::new("/global_step_x/global_step33/a.pt"));
        assert_eq!(tag, IterationTag::Step(33));
    }

    #[test]
    fn test_negative_payload_is_unknown() {
        let value = Value::dict([("iter", Value::Int(-1))]);
        assert_eq!(IterationTag::extract(&value, Path::new("a.pt")), IterationTag::Unknown);
    }
}

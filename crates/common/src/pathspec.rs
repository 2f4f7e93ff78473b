use serde_json::Value;

/// Why a dotted path failed to resolve against a payload. Every variant names
/// the offending segment so operators can spot config/schema mismatches in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    EmptyPath,
    BadIndex(String),
    IndexOutOfRange { index: usize, len: usize },
    NotASequence(String),
    NotAMap(String),
    KeyNotFound(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPath => write!(f, "empty path"),
            Self::BadIndex(seg) => write!(f, "non-numeric index segment '{seg}'"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range (len {len})")
            }
            Self::NotASequence(seg) => write!(f, "segment '{seg}' applied to a non-sequence"),
            Self::NotAMap(seg) => write!(f, "segment '{seg}' applied to a non-map"),
            Self::KeyNotFound(seg) => write!(f, "key '{seg}' not found"),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Resolves a dotted key path against a nested JSON value.
///
/// Segment grammar: `[]` fans out over every element of the current sequence
/// and resolves the remaining segments against each one; `[n]` selects index
/// `n` of a sequence; any other segment is a map-key lookup. On success the
/// fully-resolved leaf values are returned in document order.
pub fn extract(root: &Value, path: &str) -> Result<Vec<Value>, ExtractError> {
    if path.is_empty() {
        return Err(ExtractError::EmptyPath);
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(root, &segments, &mut out)?;
    Ok(out)
}

fn walk(value: &Value, segments: &[&str], out: &mut Vec<Value>) -> Result<(), ExtractError> {
    let mut current = value;

    for (pos, seg) in segments.iter().enumerate() {
        if *seg == "[]" {
            let items = match current {
                Value::Array(items) => items,
                _ => return Err(ExtractError::NotASequence((*seg).into())),
            };
            let rest = &segments[pos + 1..];
            for item in items {
                walk(item, rest, out)?;
            }
            return Ok(());
        }

        if seg.len() > 2 && seg.starts_with('[') && seg.ends_with(']') {
            let digits = &seg[1..seg.len() - 1];
            let index: usize = digits
                .parse()
                .map_err(|_| ExtractError::BadIndex(digits.into()))?;
            let items = match current {
                Value::Array(items) => items,
                _ => return Err(ExtractError::NotASequence((*seg).into())),
            };
            current = items.get(index).ok_or(ExtractError::IndexOutOfRange {
                index,
                len: items.len(),
            })?;
            continue;
        }

        let map = match current {
            Value::Object(map) => map,
            _ => return Err(ExtractError::NotAMap((*seg).into())),
        };
        current = map
            .get(*seg)
            .ok_or_else(|| ExtractError::KeyNotFound((*seg).into()))?;
    }

    out.push(current.clone());
    Ok(())
}

use std::fmt;

const INITIAL_WIDTH: usize = 3;

/// Entity kinds that receive sequential, human-readable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Patient,
    Doctor,
}

impl EntityKind {
    pub fn prefix(self) -> char {
        match self {
            EntityKind::Patient => 'P',
            EntityKind::Doctor => 'D',
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Patient => "patients",
            EntityKind::Doctor => "doctors",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    InvalidIdFormat { id: String, reason: &'static str },
    Exhausted(String),
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::InvalidIdFormat { id, reason } => {
                write!(f, "invalid id format {id:?}: {reason}")
            }
            IdError::Exhausted(id) => write!(f, "id sequence exhausted after {id}"),
        }
    }
}

impl std::error::Error for IdError {}

/// Computes the identifier that follows `last_id` in the `prefix` sequence.
///
/// The suffix keeps the zero-padded width of `last_id` and only grows when the
/// incremented value needs more digits (`P999` -> `P1000`). With no previous
/// id the sequence starts at `{prefix}001`.
///
/// `last_id` must be the numeric maximum of the sequence; the function has no
/// way to check that, and a stale value yields an id that already exists.
pub fn next_id(prefix: char, last_id: Option<&str>) -> Result<String, IdError> {
    let Some(last) = last_id else {
        return Ok(format!("{prefix}{:0width$}", 1, width = INITIAL_WIDTH));
    };

    let value = suffix_value(prefix, last)?;
    let width = last.len() - prefix.len_utf8();
    let next = value
        .checked_add(1)
        .ok_or_else(|| IdError::Exhausted(last.to_string()))?;

    // `{:0width$}` only pads, so a value that outgrew the width prints in full.
    Ok(format!("{prefix}{next:0width$}"))
}

/// Parses the numeric suffix of `id`, checking that it carries `prefix`.
pub fn suffix_value(prefix: char, id: &str) -> Result<u64, IdError> {
    let invalid = |reason| IdError::InvalidIdFormat {
        id: id.to_string(),
        reason,
    };

    let suffix = id
        .strip_prefix(prefix)
        .ok_or_else(|| invalid("missing prefix"))?;
    if suffix.is_empty() {
        return Err(invalid("empty suffix"));
    }
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("suffix is not numeric"));
    }
    suffix
        .parse::<u64>()
        .map_err(|_| invalid("suffix out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_id_has_width_three() {
        assert_eq!(next_id('P', None).unwrap(), "P001");
        assert_eq!(next_id('D', None).unwrap(), "D001");
    }

    #[test]
    fn increments_within_width() {
        assert_eq!(next_id('P', Some("P001")).unwrap(), "P002");
        assert_eq!(next_id('P', Some("P009")).unwrap(), "P010");
        assert_eq!(next_id('P', Some("P099")).unwrap(), "P100");
    }

    #[test]
    fn width_grows_on_overflow() {
        assert_eq!(next_id('P', Some("P999")).unwrap(), "P1000");
        assert_eq!(next_id('P', Some("P1000")).unwrap(), "P1001");
        assert_eq!(next_id('D', Some("D9999")).unwrap(), "D10000");
    }

    #[test]
    fn keeps_wider_padding_of_previous_id() {
        assert_eq!(next_id('P', Some("P00041")).unwrap(), "P00042");
        assert_eq!(next_id('P', Some("P7")).unwrap(), "P8");
        assert_eq!(next_id('P', Some("P9")).unwrap(), "P10");
    }

    #[test]
    fn same_input_same_output() {
        let a = next_id('P', Some("P041")).unwrap();
        let b = next_id('P', Some("P041")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "P", "D001", "p001", "P0x1", "P 01", "P-01", "P١٢٣"] {
            let err = next_id('P', Some(bad)).unwrap_err();
            assert!(
                matches!(err, IdError::InvalidIdFormat { .. }),
                "expected InvalidIdFormat for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn rejects_suffix_beyond_u64() {
        let err = next_id('P', Some("P99999999999999999999999")).unwrap_err();
        assert!(matches!(err, IdError::InvalidIdFormat { .. }));
    }

    #[test]
    fn exhausted_at_u64_max() {
        let last = format!("P{}", u64::MAX);
        assert_eq!(next_id('P', Some(&last)), Err(IdError::Exhausted(last)));
    }

    #[test]
    fn suffix_value_parses_padded_digits() {
        assert_eq!(suffix_value('D', "D007").unwrap(), 7);
        assert_eq!(suffix_value('D', "D1000").unwrap(), 1000);
    }
}

use thiserror::Error;

/// The tag byte selecting a 64- or 32-bit version field in a
/// `MATOCS_STRUCTURE_LOG` body: `0xFF` selects the wide form used once a
/// changelog's version counter would overflow `u32`, matching
/// `masterconn_structure_log`'s `data[0] == 0xFF` check.
const WIDE_VERSION_TAG: u8 = 0xFF;

/// Validation for an incoming `MATOCS_STRUCTURE_LOG` body. The narrow
/// form is `version:u32, text:cstr` with no leading tag byte, needing at
/// least `4 + 1 = 5` bytes (just the NUL terminator); the wide form is
/// `tag:u8, version:u64, text:cstr`, needing at least `1 + 8 + 1 = 10`.
/// Either way the last byte must be the text's NUL terminator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructureLogError {
    #[error("structure log entry of {0} bytes is shorter than the 5-byte minimum")]
    TooShort(usize),
    #[error("wide-version structure log entry of {0} bytes is shorter than the 10-byte minimum")]
    MarkerTooShort(usize),
    #[error("structure log entry is missing its trailing NUL terminator")]
    MissingTerminator,
}

/// A single changelog line, version-tagged and NUL-terminated the way the
/// original appends entries to `changelog.mfs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureLogEntry {
    pub version: u64,
    pub text: Vec<u8>,
}

impl StructureLogEntry {
    pub fn validate(entry: &[u8]) -> Result<(), StructureLogError> {
        if entry.is_empty() {
            return Err(StructureLogError::TooShort(0));
        }
        let wide = entry[0] == WIDE_VERSION_TAG;
        let min = if wide { 10 } else { 5 };
        if entry.len() < min {
            return Err(if wide {
                StructureLogError::MarkerTooShort(entry.len())
            } else {
                StructureLogError::TooShort(entry.len())
            });
        }
        if *entry.last().unwrap() != 0 {
            return Err(StructureLogError::MissingTerminator);
        }
        Ok(())
    }

    pub fn decode(version: u64, text: Vec<u8>) -> Self {
        Self { version, text }
    }
}

/// Splits a validated body into its version and NUL-stripped text. The
/// narrow form has no tag byte to skip — its leading 4 bytes are the
/// version itself, and `validate` only inspected the first of them.
pub fn decode_tagged(entry: &[u8]) -> (u64, Vec<u8>) {
    let wide = entry[0] == WIDE_VERSION_TAG;
    let (version, rest) = if wide {
        (u64::from_be_bytes(entry[1..9].try_into().unwrap()), &entry[9..])
    } else {
        (
            u32::from_be_bytes(entry[0..4].try_into().unwrap()) as u64,
            &entry[4..],
        )
    };
    let text = rest[..rest.len() - 1].to_vec();
    (version, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_entries() {
        assert_eq!(StructureLogEntry::validate(&[0u8; 4]), Err(StructureLogError::TooShort(4)));
    }

    #[test]
    fn rejects_short_wide_entries() {
        let mut entry = vec![0u8; 9];
        entry[0] = 0xFF;
        *entry.last_mut().unwrap() = 0;
        assert_eq!(
            StructureLogEntry::validate(&entry),
            Err(StructureLogError::MarkerTooShort(9))
        );
    }

    #[test]
    fn rejects_missing_terminator() {
        let entry = vec![1, 2, 3, 4, b'x'];
        assert_eq!(StructureLogEntry::validate(&entry), Err(StructureLogError::MissingTerminator));
    }

    #[test]
    fn accepts_minimum_narrow_entry() {
        let entry = vec![0, 0, 0, 0, 0];
        assert!(StructureLogEntry::validate(&entry).is_ok());
        let (version, text) = decode_tagged(&entry);
        assert_eq!(version, 0);
        assert_eq!(text, b"" as &[u8]);
    }

    #[test]
    fn narrow_entry_version_uses_the_leading_four_bytes() {
        let entry = vec![1, 2, 3, 4, b'x', 0];
        assert!(StructureLogEntry::validate(&entry).is_ok());
        let (version, text) = decode_tagged(&entry);
        assert_eq!(version, 0x0102_0304);
        assert_eq!(text, b"x");
    }

    #[test]
    fn accepts_minimum_wide_entry() {
        let mut entry = vec![0xFFu8];
        entry.extend_from_slice(&7u64.to_be_bytes());
        entry.push(b'y');
        entry.push(0);
        assert!(StructureLogEntry::validate(&entry).is_ok());
        let (version, text) = decode_tagged(&entry);
        assert_eq!(version, 7);
        assert_eq!(text, b"y");
    }
}

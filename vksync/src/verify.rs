//! Comparison of the data written with the data read back.

use crate::resource::ResourceKind;
use std::{error::Error, fmt};

/// How many bytes around the first difference are kept in a [`Mismatch`].
pub const EXCERPT_LEN: usize = 16;

/// A difference between what a write operation produced and what a read operation observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// The fan-out branch the mismatch was found in, if any.
    pub branch: Option<usize>,
    pub kind: MismatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MismatchKind {
    /// The payloads have different lengths.
    Length { expected: usize, actual: usize },

    /// The payloads differ first at `offset`. The excerpts start at `excerpt_offset` and are
    /// at most [`EXCERPT_LEN`] bytes long.
    Bytes {
        offset: usize,
        excerpt_offset: usize,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    /// An indirect command launched fewer invocations than it describes.
    Counter { expected: u32, actual: u32 },
}

impl Mismatch {
    #[inline]
    fn new(kind: MismatchKind) -> Self {
        Mismatch { branch: None, kind }
    }

    /// Tags the mismatch with the fan-out branch it was found in.
    #[inline]
    pub fn in_branch(mut self, branch: usize) -> Self {
        self.branch = Some(branch);
        self
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(branch) = self.branch {
            write!(f, "branch {branch}: ")?;
        }

        match &self.kind {
            MismatchKind::Length { expected, actual } => {
                write!(f, "expected {expected} bytes, got {actual} bytes")
            }
            MismatchKind::Bytes {
                offset,
                excerpt_offset,
                expected,
                actual,
            } => write!(
                f,
                "first difference at byte {offset}; from byte {excerpt_offset}, expected {} \
                got {}",
                Hex(expected),
                Hex(actual),
            ),
            MismatchKind::Counter { expected, actual } => write!(
                f,
                "the indirect command launched {actual} invocations, expected at least \
                {expected}",
            ),
        }
    }
}

impl Error for Mismatch {}

struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;

        for (index, byte) in self.0.iter().enumerate() {
            if index != 0 {
                f.write_str(" ")?;
            }

            write!(f, "{byte:02x}")?;
        }

        f.write_str("]")
    }
}

/// Compares payloads the way resources of `kind` are verified.
pub fn compare(kind: ResourceKind, expected: &[u8], actual: &[u8]) -> Result<(), Mismatch> {
    if kind.is_indirect() {
        compare_counter(expected, actual)
    } else {
        compare_bytes(expected, actual)
    }
}

/// Requires the payloads to be identical.
pub fn compare_bytes(expected: &[u8], actual: &[u8]) -> Result<(), Mismatch> {
    let Some(offset) = expected
        .iter()
        .zip(actual)
        .position(|(expected, actual)| expected != actual)
    else {
        if expected.len() != actual.len() {
            return Err(Mismatch::new(MismatchKind::Length {
                expected: expected.len(),
                actual: actual.len(),
            }));
        }

        return Ok(());
    };

    let excerpt_offset = offset.saturating_sub(EXCERPT_LEN / 2);
    let excerpt = |data: &[u8]| {
        let end = (excerpt_offset + EXCERPT_LEN).min(data.len());
        data[excerpt_offset..end].to_vec()
    };

    Err(Mismatch::new(MismatchKind::Bytes {
        offset,
        excerpt_offset,
        expected: excerpt(expected),
        actual: excerpt(actual),
    }))
}

/// Requires the counter in `actual` to have reached the one in `expected`. Both hold a
/// native-endian `u32`.
pub fn compare_counter(expected: &[u8], actual: &[u8]) -> Result<(), Mismatch> {
    let (Some(expected_counter), Some(actual_counter)) = (read_u32(expected), read_u32(actual))
    else {
        return Err(Mismatch::new(MismatchKind::Length {
            expected: expected.len(),
            actual: actual.len(),
        }));
    };

    if actual_counter < expected_counter {
        return Err(Mismatch::new(MismatchKind::Counter {
            expected: expected_counter,
            actual: actual_counter,
        }));
    }

    Ok(())
}

fn read_u32(data: &[u8]) -> Option<u32> {
    let bytes = data.get(..4)?;

    Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Collapses independently verified branches into one result: the first failing branch, tagged
/// with its index.
pub fn first_failure(branches: &[Result<(), Mismatch>]) -> Result<(), Mismatch> {
    for (index, branch) in branches.iter().enumerate() {
        if let Err(mismatch) = branch {
            return Err(mismatch.clone().in_branch(index));
        }
    }

    Ok(())
}

/// Returns the indices of the branches that failed.
pub fn failing_branches(branches: &[Result<(), Mismatch>]) -> Vec<usize> {
    branches
        .iter()
        .enumerate()
        .filter_map(|(index, branch)| branch.is_err().then_some(index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes() {
        assert_eq!(compare_bytes(&[1, 2, 3], &[1, 2, 3]), Ok(()));
        assert_eq!(compare_bytes(&[], &[]), Ok(()));
    }

    #[test]
    fn first_difference_is_reported() {
        let expected: Vec<u8> = (0..64).collect();
        let mut actual = expected.clone();
        actual[40] = 0xff;
        actual[50] = 0xff;

        let mismatch = compare_bytes(&expected, &actual).unwrap_err();

        assert_eq!(
            mismatch.kind,
            MismatchKind::Bytes {
                offset: 40,
                excerpt_offset: 32,
                expected: expected[32..48].to_vec(),
                actual: actual[32..48].to_vec(),
            },
        );
        assert!(mismatch.to_string().starts_with("first difference at byte 40;"));
    }

    #[test]
    fn excerpt_is_clamped() {
        let mismatch = compare_bytes(&[0, 1, 2], &[0, 1, 3]).unwrap_err();

        assert_eq!(
            mismatch.kind,
            MismatchKind::Bytes {
                offset: 2,
                excerpt_offset: 0,
                expected: vec![0, 1, 2],
                actual: vec![0, 1, 3],
            },
        );
    }

    #[test]
    fn length_difference() {
        assert_eq!(
            compare_bytes(&[1, 2], &[1, 2, 3]).unwrap_err().kind,
            MismatchKind::Length {
                expected: 2,
                actual: 3,
            },
        );
    }

    #[test]
    fn counter_may_exceed_expectation() {
        let six = 6u32.to_ne_bytes();

        assert_eq!(compare_counter(&six, &6u32.to_ne_bytes()), Ok(()));
        assert_eq!(compare_counter(&six, &9u32.to_ne_bytes()), Ok(()));
        assert_eq!(
            compare_counter(&six, &5u32.to_ne_bytes()).unwrap_err().kind,
            MismatchKind::Counter {
                expected: 6,
                actual: 5,
            },
        );
        assert!(compare(ResourceKind::IndirectBufferDispatch, &six, &[0]).is_err());
    }

    #[test]
    fn branches_are_independent() {
        let branches = [
            Ok(()),
            compare_bytes(&[1], &[2]),
            Ok(()),
            compare_bytes(&[1], &[3]),
        ];

        assert_eq!(failing_branches(&branches), [1, 3]);

        let first = first_failure(&branches).unwrap_err();
        assert_eq!(first.branch, Some(1));
        assert!(first.to_string().starts_with("branch 1: "));
    }
}

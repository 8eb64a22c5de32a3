//! Contract-violation errors for the column and source APIs.
//!
//! These are programmer errors: out-of-range destinations and mismatched
//! column storage fail immediately and are never swallowed. Transient
//! conditions (a source still processing, a stale row index) are not errors;
//! they surface as column defaults and `PercentageProcessed < 1`.

use crate::column::{Column, ColumnKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The destination buffer cannot hold `count` cells starting at `offset`.
    #[error("destination offset {offset} plus {count} cells exceeds buffer of {len} rows")]
    DestinationTooSmall {
        offset: usize,
        count: usize,
        len: usize,
    },

    /// The destination storage does not match the column's element type.
    #[error("column {column:?} holds {expected:?} cells, destination holds {actual:?}")]
    ColumnTypeMismatch {
        column: Column,
        expected: ColumnKind,
        actual: ColumnKind,
    },

    /// The buffer was built without the requested column.
    #[error("buffer has no column {column:?}")]
    MissingColumn { column: Column },

    /// The view restricts access to a column the caller asked for.
    #[error("column {column:?} is not part of this view")]
    ColumnNotInView { column: Column },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_too_small_message_names_range() {
        let err = Error::DestinationTooSmall {
            offset: 4,
            count: 8,
            len: 10,
        };
        assert_eq!(
            err.to_string(),
            "destination offset 4 plus 8 cells exceeds buffer of 10 rows"
        );
    }

    #[test]
    fn missing_column_message() {
        let err = Error::MissingColumn {
            column: Column::Timestamp,
        };
        assert!(err.to_string().contains("Timestamp"));
    }
}

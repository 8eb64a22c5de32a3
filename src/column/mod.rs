//! Column descriptors and cell values.
//!
//! A column's identity and element type are coupled: the [`Column`] tag
//! projects onto a [`ColumnKind`], and storage/cells are sum types over the
//! concrete kinds rather than `Any`-boxed values.

pub mod buffer;

pub use buffer::{BufferView, ColumnData, ColumnarBuffer};

use crate::index::{LogEntryIndex, LogLineIndex};
use crate::level::LogLevel;
use chrono::NaiveDateTime;
use std::fmt;

/// Signed span between two timestamps. `DeltaTime` can be negative when a
/// source carries out-of-order timestamps.
pub type TimeSpan = chrono::Duration;

/// The minimum column set every log source supports. Sources may expose
/// more; these are the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// The row's position within this source.
    Index,
    /// The row's position within the ultimate raw source.
    OriginalIndex,
    /// The logical entry the row belongs to.
    LogEntryIndex,
    /// 1-based line number within this source.
    LineNumber,
    /// 1-based line number within the ultimate raw source.
    OriginalLineNumber,
    /// The line's text.
    RawContent,
    LogLevel,
    Timestamp,
    /// Span since the source's first timestamp.
    ElapsedTime,
    /// Span since the previous row's timestamp.
    DeltaTime,
}

impl Column {
    pub const MINIMUM: [Column; 10] = [
        Column::Index,
        Column::OriginalIndex,
        Column::LogEntryIndex,
        Column::LineNumber,
        Column::OriginalLineNumber,
        Column::RawContent,
        Column::LogLevel,
        Column::Timestamp,
        Column::ElapsedTime,
        Column::DeltaTime,
    ];

    /// The element type stored by this column.
    pub fn kind(self) -> ColumnKind {
        match self {
            Column::Index | Column::OriginalIndex => ColumnKind::LineIndex,
            Column::LogEntryIndex => ColumnKind::EntryIndex,
            Column::LineNumber | Column::OriginalLineNumber => ColumnKind::LineNumber,
            Column::RawContent => ColumnKind::Text,
            Column::LogLevel => ColumnKind::Level,
            Column::Timestamp => ColumnKind::Timestamp,
            Column::ElapsedTime | Column::DeltaTime => ColumnKind::Span,
        }
    }

    /// The value a query yields for rows that do not exist (yet).
    pub fn default_cell(self) -> CellValue {
        self.kind().default_cell()
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Element types a column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    LineIndex,
    EntryIndex,
    LineNumber,
    Text,
    Level,
    Timestamp,
    Span,
}

impl ColumnKind {
    pub fn default_cell(self) -> CellValue {
        match self {
            ColumnKind::LineIndex => CellValue::LineIndex(LogLineIndex::INVALID),
            ColumnKind::EntryIndex => CellValue::EntryIndex(LogEntryIndex::INVALID),
            ColumnKind::LineNumber => CellValue::LineNumber(0),
            ColumnKind::Text => CellValue::Text(String::new()),
            ColumnKind::Level => CellValue::Level(LogLevel::None),
            ColumnKind::Timestamp => CellValue::Timestamp(None),
            ColumnKind::Span => CellValue::Span(None),
        }
    }
}

/// One cell of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    LineIndex(LogLineIndex),
    EntryIndex(LogEntryIndex),
    LineNumber(u64),
    Text(String),
    Level(LogLevel),
    Timestamp(Option<NaiveDateTime>),
    Span(Option<TimeSpan>),
}

impl CellValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            CellValue::LineIndex(_) => ColumnKind::LineIndex,
            CellValue::EntryIndex(_) => ColumnKind::EntryIndex,
            CellValue::LineNumber(_) => ColumnKind::LineNumber,
            CellValue::Text(_) => ColumnKind::Text,
            CellValue::Level(_) => ColumnKind::Level,
            CellValue::Timestamp(_) => ColumnKind::Timestamp,
            CellValue::Span(_) => ColumnKind::Span,
        }
    }
}

//! Column-oriented row storage.
//!
//! One typed vector per column, not one struct per row: stages move data in
//! bulk, and bulk transfer wants contiguous same-typed cells.

use crate::column::{CellValue, Column, ColumnKind, TimeSpan};
use crate::error::{Error, Result};
use crate::index::{LogEntryIndex, LogLineIndex};
use crate::level::LogLevel;
use crate::source::{LogSource, QueryOptions};
use chrono::NaiveDateTime;

/// Typed storage for one column, `row_count` cells long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    LineIndices(Vec<LogLineIndex>),
    EntryIndices(Vec<LogEntryIndex>),
    LineNumbers(Vec<u64>),
    Text(Vec<String>),
    Levels(Vec<LogLevel>),
    Timestamps(Vec<Option<NaiveDateTime>>),
    Spans(Vec<Option<TimeSpan>>),
}

impl ColumnData {
    /// Default-filled storage of the given kind and length.
    pub fn with_default(kind: ColumnKind, len: usize) -> Self {
        match kind {
            ColumnKind::LineIndex => ColumnData::LineIndices(vec![LogLineIndex::INVALID; len]),
            ColumnKind::EntryIndex => ColumnData::EntryIndices(vec![LogEntryIndex::INVALID; len]),
            ColumnKind::LineNumber => ColumnData::LineNumbers(vec![0; len]),
            ColumnKind::Text => ColumnData::Text(vec![String::new(); len]),
            ColumnKind::Level => ColumnData::Levels(vec![LogLevel::None; len]),
            ColumnKind::Timestamp => ColumnData::Timestamps(vec![None; len]),
            ColumnKind::Span => ColumnData::Spans(vec![None; len]),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnData::LineIndices(_) => ColumnKind::LineIndex,
            ColumnData::EntryIndices(_) => ColumnKind::EntryIndex,
            ColumnData::LineNumbers(_) => ColumnKind::LineNumber,
            ColumnData::Text(_) => ColumnKind::Text,
            ColumnData::Levels(_) => ColumnKind::Level,
            ColumnData::Timestamps(_) => ColumnKind::Timestamp,
            ColumnData::Spans(_) => ColumnKind::Span,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::LineIndices(v) => v.len(),
            ColumnData::EntryIndices(v) => v.len(),
            ColumnData::LineNumbers(v) => v.len(),
            ColumnData::Text(v) => v.len(),
            ColumnData::Levels(v) => v.len(),
            ColumnData::Timestamps(v) => v.len(),
            ColumnData::Spans(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow or shrink to `len`, default-filling new cells.
    pub fn resize(&mut self, len: usize) {
        match self {
            ColumnData::LineIndices(v) => v.resize(len, LogLineIndex::INVALID),
            ColumnData::EntryIndices(v) => v.resize(len, LogEntryIndex::INVALID),
            ColumnData::LineNumbers(v) => v.resize(len, 0),
            ColumnData::Text(v) => v.resize(len, String::new()),
            ColumnData::Levels(v) => v.resize(len, LogLevel::None),
            ColumnData::Timestamps(v) => v.resize(len, None),
            ColumnData::Spans(v) => v.resize(len, None),
        }
    }

    /// Overwrite `[start, start + count)` with the column default.
    pub fn fill_default(&mut self, start: usize, count: usize) -> Result<()> {
        if start + count > self.len() {
            return Err(Error::DestinationTooSmall {
                offset: start,
                count,
                len: self.len(),
            });
        }
        match self {
            ColumnData::LineIndices(v) => v[start..start + count].fill(LogLineIndex::INVALID),
            ColumnData::EntryIndices(v) => v[start..start + count].fill(LogEntryIndex::INVALID),
            ColumnData::LineNumbers(v) => v[start..start + count].fill(0),
            ColumnData::Text(v) => v[start..start + count].fill(String::new()),
            ColumnData::Levels(v) => v[start..start + count].fill(LogLevel::None),
            ColumnData::Timestamps(v) => v[start..start + count].fill(None),
            ColumnData::Spans(v) => v[start..start + count].fill(None),
        }
        Ok(())
    }

    /// Read one cell, `None` past the end.
    pub fn get(&self, row: usize) -> Option<CellValue> {
        match self {
            ColumnData::LineIndices(v) => v.get(row).map(|x| CellValue::LineIndex(*x)),
            ColumnData::EntryIndices(v) => v.get(row).map(|x| CellValue::EntryIndex(*x)),
            ColumnData::LineNumbers(v) => v.get(row).map(|x| CellValue::LineNumber(*x)),
            ColumnData::Text(v) => v.get(row).map(|x| CellValue::Text(x.clone())),
            ColumnData::Levels(v) => v.get(row).map(|x| CellValue::Level(*x)),
            ColumnData::Timestamps(v) => v.get(row).map(|x| CellValue::Timestamp(*x)),
            ColumnData::Spans(v) => v.get(row).map(|x| CellValue::Span(*x)),
        }
    }

    // Typed slice accessors. `None` when the storage holds another kind;
    // callers translate that into a ColumnTypeMismatch with column context.

    pub fn line_indices(&self) -> Option<&[LogLineIndex]> {
        match self {
            ColumnData::LineIndices(v) => Some(v),
            _ => None,
        }
    }

    pub fn line_indices_mut(&mut self) -> Option<&mut [LogLineIndex]> {
        match self {
            ColumnData::LineIndices(v) => Some(v),
            _ => None,
        }
    }

    pub fn entry_indices(&self) -> Option<&[LogEntryIndex]> {
        match self {
            ColumnData::EntryIndices(v) => Some(v),
            _ => None,
        }
    }

    pub fn entry_indices_mut(&mut self) -> Option<&mut [LogEntryIndex]> {
        match self {
            ColumnData::EntryIndices(v) => Some(v),
            _ => None,
        }
    }

    pub fn line_numbers(&self) -> Option<&[u64]> {
        match self {
            ColumnData::LineNumbers(v) => Some(v),
            _ => None,
        }
    }

    pub fn line_numbers_mut(&mut self) -> Option<&mut [u64]> {
        match self {
            ColumnData::LineNumbers(v) => Some(v),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&[String]> {
        match self {
            ColumnData::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn text_mut(&mut self) -> Option<&mut [String]> {
        match self {
            ColumnData::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn levels(&self) -> Option<&[LogLevel]> {
        match self {
            ColumnData::Levels(v) => Some(v),
            _ => None,
        }
    }

    pub fn levels_mut(&mut self) -> Option<&mut [LogLevel]> {
        match self {
            ColumnData::Levels(v) => Some(v),
            _ => None,
        }
    }

    pub fn timestamps(&self) -> Option<&[Option<NaiveDateTime>]> {
        match self {
            ColumnData::Timestamps(v) => Some(v),
            _ => None,
        }
    }

    pub fn timestamps_mut(&mut self) -> Option<&mut [Option<NaiveDateTime>]> {
        match self {
            ColumnData::Timestamps(v) => Some(v),
            _ => None,
        }
    }

    pub fn spans(&self) -> Option<&[Option<TimeSpan>]> {
        match self {
            ColumnData::Spans(v) => Some(v),
            _ => None,
        }
    }

    pub fn spans_mut(&mut self) -> Option<&mut [Option<TimeSpan>]> {
        match self {
            ColumnData::Spans(v) => Some(v),
            _ => None,
        }
    }
}

/// Validate that `destination[offset..offset + count]` can receive cells of
/// `column`. Violations are programmer errors and fail immediately.
pub fn check_destination(
    column: Column,
    destination: &ColumnData,
    offset: usize,
    count: usize,
) -> Result<()> {
    if destination.kind() != column.kind() {
        return Err(Error::ColumnTypeMismatch {
            column,
            expected: column.kind(),
            actual: destination.kind(),
        });
    }
    if offset + count > destination.len() {
        return Err(Error::DestinationTooSmall {
            offset,
            count,
            len: destination.len(),
        });
    }
    Ok(())
}

/// A row-count × column-set container: the unit by which stages exchange
/// entry data.
#[derive(Debug, Clone)]
pub struct ColumnarBuffer {
    rows: usize,
    columns: Vec<(Column, ColumnData)>,
}

impl ColumnarBuffer {
    /// A buffer holding `rows` default-filled cells for each listed column.
    /// Duplicate columns are kept once.
    pub fn new(columns: &[Column], rows: usize) -> Self {
        let mut stored: Vec<(Column, ColumnData)> = Vec::with_capacity(columns.len());
        for &column in columns {
            if !stored.iter().any(|(c, _)| *c == column) {
                stored.push((column, ColumnData::with_default(column.kind(), rows)));
            }
        }
        ColumnarBuffer {
            rows,
            columns: stored,
        }
    }

    /// A buffer over the full minimum column set.
    pub fn minimum(rows: usize) -> Self {
        ColumnarBuffer::new(&Column::MINIMUM, rows)
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Grow or shrink every column to `rows`, default-filling new cells.
    pub fn resize(&mut self, rows: usize) {
        self.rows = rows;
        for (_, data) in &mut self.columns {
            data.resize(rows);
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = Column> + '_ {
        self.columns.iter().map(|(c, _)| *c)
    }

    pub fn contains(&self, column: Column) -> bool {
        self.columns.iter().any(|(c, _)| *c == column)
    }

    pub fn column(&self, column: Column) -> Result<&ColumnData> {
        self.columns
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, d)| d)
            .ok_or(Error::MissingColumn { column })
    }

    pub fn column_mut(&mut self, column: Column) -> Result<&mut ColumnData> {
        self.columns
            .iter_mut()
            .find(|(c, _)| *c == column)
            .map(|(_, d)| d)
            .ok_or(Error::MissingColumn { column })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Column, &mut ColumnData)> {
        self.columns.iter_mut().map(|(c, d)| (*c, d))
    }

    /// Read one cell; `None` when the column is absent or the row is past
    /// the end.
    pub fn get(&self, column: Column, row: usize) -> Option<CellValue> {
        self.column(column).ok()?.get(row)
    }

    /// Write each column's default into `[start, start + count)`.
    pub fn fill_default(&mut self, start: usize, count: usize) -> Result<()> {
        for (_, data) in &mut self.columns {
            data.fill_default(start, count)?;
        }
        Ok(())
    }

    /// Fetch `source_indices.len()` values of `column` from `source` into
    /// `[dest_start, dest_start + len)`.
    pub fn copy_from(
        &mut self,
        column: Column,
        dest_start: usize,
        source: &dyn LogSource,
        source_indices: &[LogLineIndex],
        options: QueryOptions,
    ) -> Result<()> {
        let data = self.column_mut(column)?;
        source.get_column(source_indices, column, data, dest_start, options)
    }

    /// A read-write restriction of this buffer to the listed columns,
    /// sharing storage. Listed columns the buffer lacks are simply absent
    /// from the view.
    pub fn view(&mut self, columns: &[Column]) -> BufferView<'_> {
        let present: Vec<Column> = columns
            .iter()
            .copied()
            .filter(|c| self.contains(*c))
            .collect();
        BufferView {
            buffer: self,
            columns: present,
        }
    }
}

/// A restriction of a [`ColumnarBuffer`] to a subset of its columns.
#[derive(Debug)]
pub struct BufferView<'a> {
    buffer: &'a mut ColumnarBuffer,
    columns: Vec<Column>,
}

impl BufferView<'_> {
    pub fn row_count(&self) -> usize {
        self.buffer.row_count()
    }

    pub fn columns(&self) -> impl Iterator<Item = Column> + '_ {
        self.columns.iter().copied()
    }

    pub fn contains(&self, column: Column) -> bool {
        self.columns.contains(&column)
    }

    pub fn column_mut(&mut self, column: Column) -> Result<&mut ColumnData> {
        if !self.columns.contains(&column) {
            return Err(Error::ColumnNotInView { column });
        }
        self.buffer.column_mut(column)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Column, &mut ColumnData)> {
        let columns = &self.columns;
        self.buffer
            .columns
            .iter_mut()
            .filter(|(c, _)| columns.contains(c))
            .map(|(c, d)| (*c, d))
    }

    pub fn fill_default(&mut self, start: usize, count: usize) -> Result<()> {
        for (_, data) in self.iter_mut() {
            data.fill_default(start, count)?;
        }
        Ok(())
    }

    pub fn copy_from(
        &mut self,
        column: Column,
        dest_start: usize,
        source: &dyn LogSource,
        source_indices: &[LogLineIndex],
        options: QueryOptions,
    ) -> Result<()> {
        let data = self.column_mut(column)?;
        source.get_column(source_indices, column, data, dest_start, options)
    }
}

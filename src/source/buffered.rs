//! An in-memory, listener-notifying raw log source.
//!
//! The bottom of a pipeline: embedders (and tests) push lines in, stages
//! subscribe on top. Each pushed line is scanned once for level, timestamp
//! and format; columns are then served straight out of the stored lines.

use crate::column::{buffer, Column, ColumnData};
use crate::error::{Error, Result};
use crate::index::{LogEntryIndex, LogLineIndex};
use crate::level::LogLevel;
use crate::property::{Property, PropertyBag, PropertyValue};
use crate::scan::{self, LineFormat};
use crate::source::{ListenerFanout, ListenerId, LogSource, QueryOptions, SourceListener};
use chrono::NaiveDateTime;
use memchr::memchr_iter;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredLine {
    content: String,
    level: LogLevel,
    timestamp: Option<NaiveDateTime>,
    entry: LogEntryIndex,
    format: LineFormat,
}

fn format_slot(format: LineFormat) -> usize {
    match format {
        LineFormat::Plain => 0,
        LineFormat::Json => 1,
        LineFormat::Logfmt => 2,
    }
}

#[derive(Default)]
struct BufferedState {
    lines: Vec<StoredLine>,
    next_entry: usize,
    /// Line counts per format, for the majority vote behind `Format`.
    format_votes: [usize; 3],
    properties: PropertyBag,
}

impl BufferedState {
    fn push(
        &mut self,
        content: &str,
        level: LogLevel,
        timestamp: Option<NaiveDateTime>,
        entry: LogEntryIndex,
        format: LineFormat,
    ) {
        self.format_votes[format_slot(format)] += 1;
        self.lines.push(StoredLine {
            content: content.to_string(),
            level,
            timestamp,
            entry,
            format,
        });
    }

    fn refresh_properties(&mut self) {
        let count = self.lines.len() as i64;
        let size: u64 = self.lines.iter().map(|l| l.content.len() as u64 + 1).sum();
        let start = self.lines.iter().find_map(|l| l.timestamp);
        let end = self.lines.iter().rev().find_map(|l| l.timestamp);
        let format = if self.lines.is_empty() {
            None
        } else {
            let majority = match (0..3).max_by_key(|&i| self.format_votes[i]) {
                Some(1) => LineFormat::Json,
                Some(2) => LineFormat::Logfmt,
                _ => LineFormat::Plain,
            };
            Some(majority.to_string())
        };

        self.properties.set(Property::LogEntryCount, PropertyValue::Integer(count));
        self.properties.set(Property::Size, PropertyValue::Bytes(Some(size)));
        self.properties.set(Property::StartTimestamp, PropertyValue::Timestamp(start));
        self.properties.set(Property::EndTimestamp, PropertyValue::Timestamp(end));
        self.properties.set(Property::Format, PropertyValue::Text(format));
        self.properties.set(Property::PercentageProcessed, PropertyValue::Percentage(1.0));
    }

    fn first_timestamp(&self) -> Option<NaiveDateTime> {
        self.lines.iter().find_map(|l| l.timestamp)
    }
}

/// An in-memory raw source.
#[derive(Default)]
pub struct BufferedLogSource {
    state: Mutex<BufferedState>,
    fanout: ListenerFanout,
}

impl BufferedLogSource {
    pub fn new() -> Self {
        let source = BufferedLogSource::default();
        source.state.lock().unwrap().refresh_properties();
        source
    }

    /// Append one line, scanning its content for level, timestamp and
    /// format. The line forms its own logical entry.
    pub fn push_line(&self, content: &str) {
        let scanned = scan::scan_line(content);
        let count = {
            let mut state = self.state.lock().unwrap();
            let entry = LogEntryIndex::new(state.next_entry);
            state.next_entry += 1;
            state.push(content, scanned.level, scanned.timestamp, entry, scanned.format);
            state.refresh_properties();
            state.lines.len()
        };
        self.fanout.on_read(count as i64);
        // In-memory content is final; deliver coalesced remainders now.
        self.fanout.flush();
    }

    /// Append several scanned lines, each its own entry, in one notification.
    pub fn push_lines(&self, lines: &[&str]) {
        if lines.is_empty() {
            return;
        }
        let count = {
            let mut state = self.state.lock().unwrap();
            for content in lines {
                let scanned = scan::scan_line(content);
                let entry = LogEntryIndex::new(state.next_entry);
                state.next_entry += 1;
                state.push(content, scanned.level, scanned.timestamp, entry, scanned.format);
            }
            state.refresh_properties();
            state.lines.len()
        };
        self.fanout.on_read(count as i64);
        // In-memory content is final; deliver coalesced remainders now.
        self.fanout.flush();
    }

    /// Append a chunk of text, split into lines on `\n` (CRLF endings are
    /// handled). An unterminated final segment still counts as a line.
    pub fn push_text(&self, text: &str) {
        let bytes = text.as_bytes();
        let mut lines = Vec::new();
        let mut start = 0;
        for newline in memchr_iter(b'\n', bytes) {
            let end = if newline > start && bytes[newline - 1] == b'\r' {
                newline - 1
            } else {
                newline
            };
            lines.push(&text[start..end]);
            start = newline + 1;
        }
        if start < bytes.len() {
            lines.push(&text[start..]);
        }
        self.push_lines(&lines);
    }

    /// Append one line with explicit level and timestamp (no scanning).
    /// The line forms its own logical entry.
    pub fn push_raw(&self, content: &str, level: LogLevel, timestamp: Option<NaiveDateTime>) {
        let count = {
            let mut state = self.state.lock().unwrap();
            let entry = LogEntryIndex::new(state.next_entry);
            state.next_entry += 1;
            state.push(content, level, timestamp, entry, LineFormat::Plain);
            state.refresh_properties();
            state.lines.len()
        };
        self.fanout.on_read(count as i64);
        // In-memory content is final; deliver coalesced remainders now.
        self.fanout.flush();
    }

    /// Append one logical entry spanning several physical lines. The first
    /// line carries the level and timestamp; the rest are continuations.
    pub fn push_multi_line(
        &self,
        level: LogLevel,
        timestamp: Option<NaiveDateTime>,
        lines: &[&str],
    ) {
        if lines.is_empty() {
            return;
        }
        let count = {
            let mut state = self.state.lock().unwrap();
            let entry = LogEntryIndex::new(state.next_entry);
            state.next_entry += 1;
            for (i, content) in lines.iter().enumerate() {
                if i == 0 {
                    state.push(content, level, timestamp, entry, LineFormat::Plain);
                } else {
                    state.push(content, LogLevel::None, None, entry, LineFormat::Plain);
                }
            }
            state.refresh_properties();
            state.lines.len()
        };
        self.fanout.on_read(count as i64);
        // In-memory content is final; deliver coalesced remainders now.
        self.fanout.flush();
    }

    /// Retract every line at or past `index`. No-op past the end.
    pub fn remove_from(&self, index: usize) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            if index >= state.lines.len() {
                return;
            }
            let removed = state.lines.len() - index;
            let inner = &mut *state;
            for line in &inner.lines[index..] {
                let slot = format_slot(line.format);
                inner.format_votes[slot] = inner.format_votes[slot].saturating_sub(1);
            }
            state.lines.truncate(index);
            state.next_entry = state.lines.last().map_or(0, |l| {
                l.entry.value().map_or(0, |e| e + 1)
            });
            state.refresh_properties();
            removed
        };
        self.fanout.remove(index, removed);
    }

    /// Discard all content.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.lines.clear();
            state.next_entry = 0;
            state.format_votes = [0; 3];
            state.properties.clear();
            state.refresh_properties();
        }
        self.fanout.reset();
    }

    pub fn line_count(&self) -> usize {
        self.state.lock().unwrap().lines.len()
    }
}

impl LogSource for BufferedLogSource {
    fn columns(&self) -> Vec<Column> {
        Column::MINIMUM.to_vec()
    }

    fn properties(&self) -> Vec<Property> {
        Property::MINIMUM.to_vec()
    }

    fn get_property(&self, property: Property) -> PropertyValue {
        self.state.lock().unwrap().properties.get(property)
    }

    fn set_property(&self, property: Property, value: PropertyValue) {
        // Computed descriptors are read-only here.
        if matches!(
            property,
            Property::LogEntryCount
                | Property::PercentageProcessed
                | Property::Size
                | Property::StartTimestamp
                | Property::EndTimestamp
                | Property::Format
        ) {
            return;
        }
        self.state.lock().unwrap().properties.set(property, value);
    }

    fn read_properties(&self, destination: &mut PropertyBag) {
        self.state.lock().unwrap().properties.copy_into(destination);
    }

    fn get_column(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut ColumnData,
        destination_offset: usize,
        _options: QueryOptions,
    ) -> Result<()> {
        buffer::check_destination(column, destination, destination_offset, indices.len())?;
        let mismatch = Error::ColumnTypeMismatch {
            column,
            expected: column.kind(),
            actual: destination.kind(),
        };
        let state = self.state.lock().unwrap();
        let lines = &state.lines;
        let lookup = |idx: &LogLineIndex| idx.value().and_then(|i| lines.get(i));

        match column {
            Column::Index | Column::OriginalIndex => {
                let cells = destination.line_indices_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] = match lookup(idx) {
                        Some(_) => *idx,
                        None => LogLineIndex::INVALID,
                    };
                }
            }
            Column::LogEntryIndex => {
                let cells = destination.entry_indices_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] =
                        lookup(idx).map_or(LogEntryIndex::INVALID, |l| l.entry);
                }
            }
            Column::LineNumber | Column::OriginalLineNumber => {
                let cells = destination.line_numbers_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] = match lookup(idx) {
                        Some(_) => idx.value().map_or(0, |v| v as u64 + 1),
                        None => 0,
                    };
                }
            }
            Column::RawContent => {
                let cells = destination.text_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] =
                        lookup(idx).map_or_else(String::new, |l| l.content.clone());
                }
            }
            Column::LogLevel => {
                let cells = destination.levels_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] = lookup(idx).map_or(LogLevel::None, |l| l.level);
                }
            }
            Column::Timestamp => {
                let cells = destination.timestamps_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] = lookup(idx).and_then(|l| l.timestamp);
                }
            }
            Column::ElapsedTime => {
                let origin = state.first_timestamp();
                let cells = destination.spans_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    cells[destination_offset + i] = match (lookup(idx).and_then(|l| l.timestamp), origin)
                    {
                        (Some(ts), Some(origin)) => Some(ts - origin),
                        _ => None,
                    };
                }
            }
            Column::DeltaTime => {
                let cells = destination.spans_mut().ok_or(mismatch)?;
                for (i, idx) in indices.iter().enumerate() {
                    let current = lookup(idx).and_then(|l| l.timestamp);
                    let previous = idx
                        .value()
                        .filter(|&v| v > 0)
                        .and_then(|v| lines.get(v - 1))
                        .and_then(|l| l.timestamp);
                    cells[destination_offset + i] = match (current, previous) {
                        (Some(a), Some(b)) => Some(a - b),
                        _ => None,
                    };
                }
            }
        }
        Ok(())
    }

    fn add_listener(
        &self,
        listener: Box<dyn SourceListener>,
        maximum_wait_time: Duration,
        maximum_batch_size: usize,
    ) -> ListenerId {
        self.fanout
            .add_listener(listener, maximum_wait_time, maximum_batch_size)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.fanout.remove_listener(id);
    }
}

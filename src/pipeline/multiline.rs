//! Fuses consecutive physical lines into logical entries.
//!
//! Logs typically carry a timestamp or level on the first line of an entry
//! and nothing on its continuations (stack frames, wrapped payloads). This
//! stage assigns every source row a `LogEntryIndex`, collapsing continuation
//! lines into the preceding entry. The row set itself is preserved 1:1.

use crate::column::{buffer, Column, ColumnData, ColumnarBuffer};
use crate::error::Result;
use crate::index::{LogEntryIndex, LogLineIndex};
use crate::modification::Modification;
use crate::pipeline::{progress, start_stage, PipelineStage, StageCore};
use crate::property::{Property, PropertyBag, PropertyValue};
use crate::scheduler::{CancelToken, TaskScheduler};
use crate::section::LogSourceSection;
use crate::source::{ListenerId, LogSource, QueryOptions, SourceListener};
use crate::config::PipelineConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the grouper knows about one source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogEntryInfo {
    entry: LogEntryIndex,
    /// The row that opened the entry this row belongs to. Continuations
    /// serve their timestamp and level from here.
    first_line: LogLineIndex,
}

struct GrouperState {
    /// One element per processed source row; `indices.len()` is the
    /// watermark.
    indices: Vec<LogEntryInfo>,
    /// The entry continuation lines currently append to; invalid when the
    /// next line must open a new entry.
    current_entry: LogEntryIndex,
    current_first_line: LogLineIndex,
    current_source_index: usize,
    /// The known extent of the source.
    full_section: LogSourceSection,
    fetch_buffer: ColumnarBuffer,
}

const FETCH_COLUMNS: [Column; 3] = [Column::Index, Column::Timestamp, Column::LogLevel];

impl GrouperState {
    fn new() -> Self {
        GrouperState {
            indices: Vec::new(),
            current_entry: LogEntryIndex::INVALID,
            current_first_line: LogLineIndex::INVALID,
            current_source_index: 0,
            full_section: LogSourceSection::empty(),
            fetch_buffer: ColumnarBuffer::minimum(0),
        }
    }

    fn clear(&mut self) {
        self.indices.clear();
        self.current_entry = LogEntryIndex::INVALID;
        self.current_first_line = LogLineIndex::INVALID;
        self.current_source_index = 0;
        self.full_section = LogSourceSection::empty();
    }

    /// Re-open the entry of the last processed row, or none when empty.
    /// Keeps entry numbering monotone across a rewind, and lets an unchanged
    /// re-append restore the exact same grouping.
    fn reopen_tail_entry(&mut self) {
        match self.indices.last() {
            Some(info) => {
                self.current_entry = info.entry;
                self.current_first_line = info.first_line;
            }
            None => {
                self.current_entry = LogEntryIndex::INVALID;
                self.current_first_line = LogLineIndex::INVALID;
            }
        }
    }
}

/// The multi-line grouping stage.
pub struct MultiLineGrouper {
    core: StageCore,
    state: Mutex<GrouperState>,
}

impl MultiLineGrouper {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, source: Arc<dyn LogSource>) -> Arc<Self> {
        Self::with_config(scheduler, source, PipelineConfig::default())
    }

    pub fn with_config(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let core = StageCore::new(source, scheduler, config);
        let mut snapshot = PropertyBag::new();
        snapshot.set(Property::LogEntryCount, PropertyValue::Integer(0));
        snapshot.set(Property::PercentageProcessed, PropertyValue::Percentage(0.0));
        core.publish_properties(snapshot);

        let stage = Arc::new(MultiLineGrouper {
            core,
            state: Mutex::new(GrouperState::new()),
        });
        start_stage(&stage, "multi-line-grouper");
        stage
    }

    /// Deregister from the source, stop the task, release the indices.
    /// Queries afterwards return defaults.
    pub fn dispose(&self) {
        if self.core.dispose() {
            self.state.lock().unwrap().clear();
        }
    }

    /// Rows processed so far (the watermark).
    pub fn processed_line_count(&self) -> usize {
        self.state.lock().unwrap().current_source_index
    }

    fn handle_reset(&self) {
        self.state.lock().unwrap().clear();
        self.core.fanout().reset();
    }

    fn handle_removal(&self, section: LogSourceSection) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            // A removal entirely past the known extent has no effect.
            if section.index >= state.full_section.end() {
                return;
            }
            let old_len = state.indices.len();
            if section.index < old_len {
                state.indices.truncate(section.index);
                state.reopen_tail_entry();
            }
            state.current_source_index = state.current_source_index.min(section.index);
            state.full_section = LogSourceSection::new(0, section.index);
            old_len.saturating_sub(section.index)
        };
        if removed > 0 {
            self.core.fanout().remove(section.index, removed);
        }
    }

    fn process_append(&self, section: LogSourceSection, cancel: &CancelToken) {
        let mut state = self.state.lock().unwrap();
        let start = state.indices.len();
        state.full_section = state.full_section.minimum_bounding(&section);
        if section.end() <= start {
            // Replay of an already-processed region: nothing new to emit.
            return;
        }
        if section.index > start {
            log::error!(
                "append {} skips ahead of watermark {}; processing the gap as well",
                section,
                start
            );
        }

        let count = section.end() - start;
        let fetch: Vec<LogLineIndex> = (start..section.end()).map(LogLineIndex::new).collect();
        state.fetch_buffer.resize(count);
        let state_ref = &mut *state;
        // Only the grouping inputs are fetched; the view restricts the
        // reusable buffer to them.
        let mut view = state_ref.fetch_buffer.view(&FETCH_COLUMNS);
        if let Err(error) =
            self.core
                .source()
                .get_entries(&fetch, &mut view, 0, QueryOptions::default())
        {
            log::error!("failed to fetch {} source lines: {}", count, error);
            return;
        }

        for i in 0..count {
            if cancel.is_cancelled() {
                let rest = LogSourceSection::new(start + i, count - i);
                self.core.requeue_front(Modification::Appended(rest));
                return;
            }
            let row_exists = matches!(
                state_ref.fetch_buffer.get(Column::Index, i),
                Some(crate::column::CellValue::LineIndex(idx)) if idx.is_valid()
            );
            if !row_exists {
                // The source shrank underneath us. Drop the remainder; the
                // matching removal is already queued and rewinds this region
                // before the replacement content is appended.
                log::debug!("source row {} vanished mid-append", start + i);
                return;
            }

            let timestamp = match state_ref.fetch_buffer.get(Column::Timestamp, i) {
                Some(crate::column::CellValue::Timestamp(ts)) => ts,
                _ => None,
            };
            let level = match state_ref.fetch_buffer.get(Column::LogLevel, i) {
                Some(crate::column::CellValue::Level(level)) => level,
                _ => crate::level::LogLevel::None,
            };

            let row = LogLineIndex::new(start + i);
            let is_start = timestamp.is_some() || level.starts_entry();
            if is_start || !state_ref.current_entry.is_valid() {
                let entry = state_ref
                    .indices
                    .last()
                    .map_or(LogEntryIndex::INVALID, |info| info.entry)
                    .next();
                state_ref.current_entry = entry;
                state_ref.current_first_line = row;
            }
            state_ref.indices.push(LogEntryInfo {
                entry: state_ref.current_entry,
                first_line: state_ref.current_first_line,
            });
            state_ref.current_source_index += 1;
        }

        if state_ref.indices.len() != state_ref.current_source_index {
            log::error!(
                "grouper index count {} diverged from watermark {}",
                state_ref.indices.len(),
                state_ref.current_source_index
            );
            state_ref.current_source_index = state_ref.indices.len();
        }
    }

    /// Map local rows to the start line of their entry, for column
    /// translation. Out-of-range rows map to the invalid sentinel.
    fn translate_to_first_lines(&self, rows: &[LogLineIndex]) -> Vec<LogLineIndex> {
        let state = self.state.lock().unwrap();
        rows.iter()
            .map(|row| {
                row.value()
                    .and_then(|r| state.indices.get(r))
                    .map_or(LogLineIndex::INVALID, |info| info.first_line)
            })
            .collect()
    }
}

impl PipelineStage for MultiLineGrouper {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn run_once(&self, cancel: &CancelToken) -> Duration {
        if self.core.is_disposed() {
            return self.core.idle_delay();
        }

        let mut budget = self.core.config().stage_batch_size;
        while budget > 0 && !cancel.is_cancelled() {
            let Some(modification) = self.core.next_modification() else {
                break;
            };
            match modification {
                Modification::Reset => self.handle_reset(),
                Modification::Removed(section) => self.handle_removal(section),
                Modification::Appended(section) => {
                    if section.count > budget {
                        let head = LogSourceSection::new(section.index, budget);
                        let rest =
                            LogSourceSection::new(section.index + budget, section.count - budget);
                        self.core.requeue_front(Modification::Appended(rest));
                        self.process_append(head, cancel);
                        budget = 0;
                    } else {
                        budget -= section.count;
                        self.process_append(section, cancel);
                    }
                }
            }
        }

        let (watermark, total) = {
            let state = self.state.lock().unwrap();
            (state.current_source_index, state.full_section.count)
        };

        let mut snapshot = PropertyBag::new();
        self.core.source().read_properties(&mut snapshot);
        let source_progress = snapshot.percentage(Property::PercentageProcessed);
        let percentage = progress(source_progress, watermark, total);
        snapshot.set(
            Property::PercentageProcessed,
            PropertyValue::Percentage(percentage),
        );
        snapshot.set(
            Property::LogEntryCount,
            PropertyValue::Integer(watermark as i64),
        );
        self.core.publish_properties(snapshot);
        self.core.fanout().on_read(watermark as i64);

        let pending = self.core.has_pending_modifications();
        let fully_processed = !pending && watermark >= total && percentage >= 1.0;
        self.core.flush_on_catch_up(fully_processed);

        if pending {
            Duration::ZERO
        } else {
            self.core.idle_delay()
        }
    }
}

impl LogSource for MultiLineGrouper {
    fn columns(&self) -> Vec<Column> {
        self.core.source().columns()
    }

    fn properties(&self) -> Vec<Property> {
        self.core.source().properties()
    }

    fn get_property(&self, property: Property) -> PropertyValue {
        self.core.property(property)
    }

    fn set_property(&self, property: Property, value: PropertyValue) {
        // The stage's computed descriptors are read-only from the outside.
        if matches!(
            property,
            Property::PercentageProcessed | Property::LogEntryCount
        ) {
            return;
        }
        self.core.source().set_property(property, value);
    }

    fn read_properties(&self, destination: &mut PropertyBag) {
        self.core.read_properties(destination);
    }

    fn get_column(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut ColumnData,
        destination_offset: usize,
        options: QueryOptions,
    ) -> Result<()> {
        buffer::check_destination(column, destination, destination_offset, indices.len())?;
        if self.core.is_disposed() {
            return destination.fill_default(destination_offset, indices.len());
        }

        match column {
            Column::LogEntryIndex => {
                let mismatch = crate::error::Error::ColumnTypeMismatch {
                    column,
                    expected: column.kind(),
                    actual: destination.kind(),
                };
                let state = self.state.lock().unwrap();
                let cells = destination.entry_indices_mut().ok_or(mismatch)?;
                for (i, row) in indices.iter().enumerate() {
                    cells[destination_offset + i] = row
                        .value()
                        .and_then(|r| state.indices.get(r))
                        .map_or(LogEntryIndex::INVALID, |info| info.entry);
                }
                Ok(())
            }
            // Every row of an entry reports the start line's timestamp and
            // level.
            Column::Timestamp | Column::LogLevel => {
                let translated = self.translate_to_first_lines(indices);
                self.core.source().get_column(
                    &translated,
                    column,
                    destination,
                    destination_offset,
                    options,
                )
            }
            // The grouper preserves the row set; everything else passes
            // through unchanged.
            _ => self.core.source().get_column(
                indices,
                column,
                destination,
                destination_offset,
                options,
            ),
        }
    }

    fn add_listener(
        &self,
        listener: Box<dyn SourceListener>,
        maximum_wait_time: Duration,
        maximum_batch_size: usize,
    ) -> ListenerId {
        self.core
            .fanout()
            .add_listener(listener, maximum_wait_time, maximum_batch_size)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.core.fanout().remove_listener(id);
    }
}

impl Drop for MultiLineGrouper {
    fn drop(&mut self) {
        self.dispose();
    }
}

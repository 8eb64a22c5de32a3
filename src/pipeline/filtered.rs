//! The filtering stage.
//!
//! Exposes a strictly increasing subsequence of its source's rows: a line
//! filter decides per physical line, an entry filter decides over the
//! collected lines of one logical entry. Lines of the entry currently being
//! read sit in a staging buffer until the next entry begins (or the stage
//! catches up with the source), at which point the whole entry is committed
//! or discarded.

use crate::column::{buffer, CellValue, Column, ColumnData, ColumnarBuffer};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::filter::{EntryFilter, FilterMode, LineFilter, LogLine, NoFilter};
use crate::index::{LogEntryIndex, LogLineIndex};
use crate::level::LogLevel;
use crate::modification::Modification;
use crate::pipeline::{progress, start_stage, PipelineStage, StageCore};
use crate::property::{Property, PropertyBag, PropertyValue};
use crate::scheduler::{CancelToken, TaskScheduler};
use crate::section::LogSourceSection;
use crate::source::{ListenerId, LogSource, QueryOptions, SourceListener};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Columns staged per source row while filtering.
const FETCH_COLUMNS: [Column; 6] = [
    Column::Index,
    Column::OriginalIndex,
    Column::LogEntryIndex,
    Column::RawContent,
    Column::LogLevel,
    Column::Timestamp,
];

struct FilterState {
    /// Source rows that survived filtering, strictly increasing.
    indices: Vec<LogLineIndex>,
    /// Source row → derived entry counter, for committed rows.
    entry_indices: HashMap<usize, LogEntryIndex>,
    /// Next source row to process.
    watermark: usize,
    /// Counter assigned to the next accepted entry.
    next_entry: LogEntryIndex,
    /// Lines of the in-progress entry that passed the line filter.
    staged: Vec<LogLine>,
    /// How many staged lines are already committed to `indices`.
    staged_committed: usize,
    /// The entry counter the staged buffer committed under, if it did.
    staged_entry: Option<LogEntryIndex>,
    /// The known extent of the source.
    full_section: LogSourceSection,
    max_characters: usize,
    fetch_buffer: ColumnarBuffer,
}

impl FilterState {
    fn new() -> Self {
        FilterState {
            indices: Vec::new(),
            entry_indices: HashMap::new(),
            watermark: 0,
            next_entry: LogEntryIndex::new(0),
            staged: Vec::new(),
            staged_committed: 0,
            staged_entry: None,
            full_section: LogSourceSection::empty(),
            max_characters: 0,
            fetch_buffer: ColumnarBuffer::new(&FETCH_COLUMNS, 0),
        }
    }

    fn clear(&mut self) {
        self.indices.clear();
        self.entry_indices.clear();
        self.watermark = 0;
        self.next_entry = LogEntryIndex::new(0);
        self.staged.clear();
        self.staged_committed = 0;
        self.staged_entry = None;
        self.full_section = LogSourceSection::empty();
        self.max_characters = 0;
    }

    /// Map a local row to its source row, or the invalid sentinel.
    fn translate(&self, row: LogLineIndex) -> LogLineIndex {
        row.value()
            .and_then(|r| self.indices.get(r).copied())
            .unwrap_or(LogLineIndex::INVALID)
    }
}

/// Evaluate the staged entry and append its uncommitted lines on acceptance.
///
/// Already-committed lines are never re-inserted: a staged buffer whose tail
/// is committed returns without touching `indices` (the same-last-index
/// guard), and a partially committed one only appends the extension, under
/// the entry counter it already holds.
fn commit_staged(state: &mut FilterState, entry_filter: &dyn EntryFilter, clear: bool) {
    if !state.staged.is_empty() && state.staged_committed < state.staged.len() {
        if entry_filter.matches_entry(&state.staged) {
            let entry = match state.staged_entry {
                Some(entry) => entry,
                None => {
                    let entry = state.next_entry;
                    state.next_entry = entry.next();
                    state.staged_entry = Some(entry);
                    entry
                }
            };
            let state_ref = &mut *state;
            for line in &state_ref.staged[state_ref.staged_committed..] {
                if let Some(source_row) = line.index.value() {
                    state_ref.indices.push(line.index);
                    state_ref.entry_indices.insert(source_row, entry);
                    state_ref.max_characters =
                        state_ref.max_characters.max(line.content.chars().count());
                }
            }
            state.staged_committed = state.staged.len();
        }
    }

    if clear {
        state.staged.clear();
        state.staged_committed = 0;
        state.staged_entry = None;
    }
}

/// The filtering stage.
pub struct FilteredLogSource {
    core: StageCore,
    line_filter: Arc<dyn LineFilter>,
    entry_filter: Arc<dyn EntryFilter>,
    state: Mutex<FilterState>,
}

impl FilteredLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        line_filter: Arc<dyn LineFilter>,
        entry_filter: Arc<dyn EntryFilter>,
    ) -> Arc<Self> {
        Self::with_config(
            scheduler,
            source,
            line_filter,
            entry_filter,
            PipelineConfig::default(),
        )
    }

    /// Line-level filtering only; every surviving entry is accepted.
    pub fn with_line_filter(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        line_filter: Arc<dyn LineFilter>,
    ) -> Arc<Self> {
        Self::new(scheduler, source, line_filter, Arc::new(NoFilter))
    }

    /// Build the line filter from a user-supplied pattern in the given mode.
    /// Fails on an invalid pattern (a malformed regex).
    pub fn with_pattern(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        mode: FilterMode,
        pattern: &str,
    ) -> anyhow::Result<Arc<Self>> {
        let line_filter = mode.build(pattern)?;
        Ok(Self::with_line_filter(scheduler, source, line_filter))
    }

    pub fn with_config(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        line_filter: Arc<dyn LineFilter>,
        entry_filter: Arc<dyn EntryFilter>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let core = StageCore::new(source, scheduler, config);
        let mut snapshot = PropertyBag::new();
        snapshot.set(Property::LogEntryCount, PropertyValue::Integer(0));
        snapshot.set(Property::PercentageProcessed, PropertyValue::Percentage(0.0));
        snapshot.set(Property::MaxCharactersPerLine, PropertyValue::Integer(0));
        core.publish_properties(snapshot);

        let stage = Arc::new(FilteredLogSource {
            core,
            line_filter,
            entry_filter,
            state: Mutex::new(FilterState::new()),
        });
        start_stage(&stage, "filtered-log-source");
        stage
    }

    /// Deregister from the source, stop the task, release the index vector.
    /// Queries afterwards return defaults.
    pub fn dispose(&self) {
        if self.core.dispose() {
            self.state.lock().unwrap().clear();
        }
    }

    /// The first local row mapped to the given source row, by linear scan,
    /// or the invalid sentinel. Callers are expected to use this sparingly.
    pub fn local_index_of_original(&self, original: LogLineIndex) -> LogLineIndex {
        if self.core.is_disposed() {
            return LogLineIndex::INVALID;
        }
        let state = self.state.lock().unwrap();
        state
            .indices
            .iter()
            .position(|index| *index == original)
            .map_or(LogLineIndex::INVALID, LogLineIndex::new)
    }

    fn handle_reset(&self) {
        self.state.lock().unwrap().clear();
        self.core.fanout().reset();
    }

    fn handle_removal(&self, section: LogSourceSection) {
        let (first_removed, removed) = {
            let mut state = self.state.lock().unwrap();
            state.full_section = LogSourceSection::new(0, section.index);
            state.watermark = state.watermark.min(section.index);

            let cut = state
                .indices
                .partition_point(|index| index.value().is_some_and(|v| v < section.index));
            let removed = state.indices.len() - cut;
            let state_ref = &mut *state;
            for dropped in &state_ref.indices[cut..] {
                if let Some(source_row) = dropped.value() {
                    state_ref.entry_indices.remove(&source_row);
                }
            }
            state.indices.truncate(cut);
            state.next_entry = state
                .indices
                .last()
                .and_then(|index| index.value())
                .and_then(|source_row| state.entry_indices.get(&source_row).copied())
                .map_or(LogEntryIndex::new(0), |entry| entry.next());

            // Re-seed the staged buffer: lines at or past the cut are gone,
            // and the committed prefix shrinks with them.
            let keep = state
                .staged
                .partition_point(|line| line.index.value().is_some_and(|v| v < section.index));
            state.staged.truncate(keep);
            state.staged_committed = state.staged_committed.min(keep);
            if state.staged_committed == 0 {
                state.staged_entry = None;
            }
            (cut, removed)
        };
        if removed > 0 {
            self.core.fanout().remove(first_removed, removed);
        }
    }

    /// Fetch and stage up to `budget` source rows. Returns rows consumed.
    fn process_rows(&self, budget: usize, cancel: &CancelToken) -> usize {
        let mut consumed = 0;
        while consumed < budget && !cancel.is_cancelled() {
            let mut state = self.state.lock().unwrap();
            let remaining = state.full_section.end().saturating_sub(state.watermark);
            let count = remaining.min(budget - consumed);
            if count == 0 {
                break;
            }
            let start = state.watermark;
            let fetch: Vec<LogLineIndex> = (start..start + count).map(LogLineIndex::new).collect();
            state.fetch_buffer.resize(count);
            let state_ref = &mut *state;
            if let Err(error) = self.core.source().get_entries(
                &fetch,
                &mut state_ref.fetch_buffer,
                0,
                QueryOptions::default(),
            ) {
                log::error!("failed to fetch {} source lines: {}", count, error);
                break;
            }

            for i in 0..count {
                if cancel.is_cancelled() {
                    return consumed;
                }
                let row_exists = matches!(
                    state_ref.fetch_buffer.get(Column::Index, i),
                    Some(CellValue::LineIndex(index)) if index.is_valid()
                );
                if !row_exists {
                    // The source shrank underneath us; the matching removal
                    // is queued and will rewind this region.
                    return consumed;
                }

                let line = LogLine {
                    index: LogLineIndex::new(start + i),
                    original_index: match state_ref.fetch_buffer.get(Column::OriginalIndex, i) {
                        Some(CellValue::LineIndex(index)) => index,
                        _ => LogLineIndex::INVALID,
                    },
                    entry: match state_ref.fetch_buffer.get(Column::LogEntryIndex, i) {
                        Some(CellValue::EntryIndex(entry)) => entry,
                        _ => LogEntryIndex::INVALID,
                    },
                    content: match state_ref.fetch_buffer.get(Column::RawContent, i) {
                        Some(CellValue::Text(text)) => text,
                        _ => String::new(),
                    },
                    level: match state_ref.fetch_buffer.get(Column::LogLevel, i) {
                        Some(CellValue::Level(level)) => level,
                        _ => LogLevel::None,
                    },
                    timestamp: match state_ref.fetch_buffer.get(Column::Timestamp, i) {
                        Some(CellValue::Timestamp(timestamp)) => timestamp,
                        _ => None,
                    },
                };

                let boundary = state_ref
                    .staged
                    .first()
                    .is_some_and(|first| first.entry != line.entry);
                if boundary {
                    commit_staged(state_ref, &*self.entry_filter, true);
                }
                if self.line_filter.matches(&line) {
                    state_ref.staged.push(line);
                }
                state_ref.watermark += 1;
                consumed += 1;
            }
        }
        consumed
    }
}

impl PipelineStage for FilteredLogSource {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn run_once(&self, cancel: &CancelToken) -> Duration {
        if self.core.is_disposed() {
            return self.core.idle_delay();
        }

        // Drain every pending modification first; appends only widen the
        // section the row loop below works through.
        while let Some(modification) = self.core.next_modification() {
            if cancel.is_cancelled() {
                return self.core.idle_delay();
            }
            match modification {
                Modification::Reset => self.handle_reset(),
                Modification::Removed(section) => self.handle_removal(section),
                Modification::Appended(section) => {
                    let mut state = self.state.lock().unwrap();
                    state.full_section = state.full_section.minimum_bounding(&section);
                }
            }
        }

        self.process_rows(self.core.config().stage_batch_size, cancel);
        if cancel.is_cancelled() {
            return self.core.idle_delay();
        }

        let (derived_count, watermark, total, max_characters, caught_up) = {
            let mut state = self.state.lock().unwrap();
            let caught_up = state.watermark >= state.full_section.end();
            if caught_up {
                // Commit the trailing entry, but keep it staged: a later
                // continuation line may still extend it.
                commit_staged(&mut state, &*self.entry_filter, false);
            }
            (
                state.indices.len(),
                state.watermark,
                state.full_section.count,
                state.max_characters,
                caught_up,
            )
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
            PropertyValue::Integer(derived_count as i64),
        );
        snapshot.set(
            Property::MaxCharactersPerLine,
            PropertyValue::Integer(max_characters as i64),
        );
        self.core.publish_properties(snapshot);
        self.core.fanout().on_read(derived_count as i64);

        let pending = self.core.has_pending_modifications();
        self.core
            .flush_on_catch_up(caught_up && !pending && percentage >= 1.0);

        if pending || !caught_up {
            Duration::ZERO
        } else {
            self.core.idle_delay()
        }
    }
}

impl LogSource for FilteredLogSource {
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
        if matches!(
            property,
            Property::PercentageProcessed
                | Property::LogEntryCount
                | Property::MaxCharactersPerLine
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
        let mismatch = Error::ColumnTypeMismatch {
            column,
            expected: column.kind(),
            actual: destination.kind(),
        };

        match column {
            Column::Index => {
                let state = self.state.lock().unwrap();
                let cells = destination.line_indices_mut().ok_or(mismatch)?;
                for (i, row) in indices.iter().enumerate() {
                    cells[destination_offset + i] = match row.value() {
                        Some(r) if r < state.indices.len() => *row,
                        _ => LogLineIndex::INVALID,
                    };
                }
                Ok(())
            }
            Column::LineNumber => {
                let state = self.state.lock().unwrap();
                let cells = destination.line_numbers_mut().ok_or(mismatch)?;
                for (i, row) in indices.iter().enumerate() {
                    cells[destination_offset + i] = match row.value() {
                        Some(r) if r < state.indices.len() => r as u64 + 1,
                        _ => 0,
                    };
                }
                Ok(())
            }
            Column::LogEntryIndex => {
                let state = self.state.lock().unwrap();
                let cells = destination.entry_indices_mut().ok_or(mismatch)?;
                for (i, row) in indices.iter().enumerate() {
                    cells[destination_offset + i] = state
                        .translate(*row)
                        .value()
                        .and_then(|source_row| state.entry_indices.get(&source_row).copied())
                        .unwrap_or(LogEntryIndex::INVALID);
                }
                Ok(())
            }
            // Span between a row's timestamp and its predecessor's, with the
            // predecessor resolved through the filtered mapping. One batched
            // source query over interleaved (previous, current) pairs.
            Column::DeltaTime => {
                let interleaved: Vec<LogLineIndex> = {
                    let state = self.state.lock().unwrap();
                    indices
                        .iter()
                        .flat_map(|row| {
                            let previous = match row.value() {
                                Some(r) if r > 0 => state.translate(LogLineIndex::new(r - 1)),
                                _ => LogLineIndex::INVALID,
                            };
                            [previous, state.translate(*row)]
                        })
                        .collect()
                };
                let mut timestamps =
                    ColumnData::with_default(Column::Timestamp.kind(), interleaved.len());
                self.core.source().get_column(
                    &interleaved,
                    Column::Timestamp,
                    &mut timestamps,
                    0,
                    options,
                )?;
                let cells = destination.spans_mut().ok_or(mismatch)?;
                if let ColumnData::Timestamps(pairs) = &timestamps {
                    for i in 0..indices.len() {
                        cells[destination_offset + i] = match (pairs[2 * i], pairs[2 * i + 1]) {
                            (Some(previous), Some(current)) => Some(current - previous),
                            _ => None,
                        };
                    }
                }
                Ok(())
            }
            // Everything else maps through the filtered index vector and
            // delegates to the source.
            _ => {
                let translated: Vec<LogLineIndex> = {
                    let state = self.state.lock().unwrap();
                    indices.iter().map(|row| state.translate(*row)).collect()
                };
                self.core.source().get_column(
                    &translated,
                    column,
                    destination,
                    destination_offset,
                    options,
                )
            }
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

impl Drop for FilteredLogSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AnyLineFilter;
    use crate::filter::SubstringFilter;
    use crate::pipeline::MultiLineGrouper;
    use crate::scheduler::ManualTaskScheduler;
    use crate::source::BufferedLogSource;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn rows(range: std::ops::Range<usize>) -> Vec<LogLineIndex> {
        range.map(LogLineIndex::new).collect()
    }

    /// Accepts lines of exactly one level.
    struct LevelIs(LogLevel);

    impl LineFilter for LevelIs {
        fn matches(&self, line: &LogLine) -> bool {
            line.level == self.0
        }
    }

    fn accept_all() -> Arc<dyn LineFilter> {
        Arc::new(crate::filter::NoFilter)
    }

    fn fetch(source: &dyn LogSource, column: Column, indices: &[LogLineIndex]) -> ColumnData {
        let mut data = ColumnData::with_default(column.kind(), indices.len());
        source
            .get_column(indices, column, &mut data, 0, QueryOptions::default())
            .unwrap();
        data
    }

    fn original_indices(filtered: &FilteredLogSource, count: usize) -> Vec<LogLineIndex> {
        fetch(filtered, Column::OriginalIndex, &rows(0..count))
            .line_indices()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn line_filter_keeps_matching_rows_only() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        for level in [
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Error,
            LogLevel::Info,
        ] {
            source.push_raw(&format!("{} line", level), level, None);
        }
        let filtered = FilteredLogSource::with_line_filter(
            scheduler.clone(),
            source.clone(),
            Arc::new(LevelIs(LogLevel::Info)),
        );
        scheduler.run_until_idle();

        assert_eq!(
            original_indices(&filtered, 3),
            vec![
                LogLineIndex::new(0),
                LogLineIndex::new(2),
                LogLineIndex::new(4),
            ]
        );
        assert_eq!(
            filtered.get_property(Property::LogEntryCount),
            PropertyValue::Integer(3)
        );
        // each surviving row got its own derived entry, numbered in order
        assert_eq!(
            fetch(&*filtered, Column::LogEntryIndex, &rows(0..3))
                .entry_indices()
                .unwrap(),
            &[
                LogEntryIndex::new(0),
                LogEntryIndex::new(1),
                LogEntryIndex::new(2),
            ]
        );
    }

    #[test]
    fn local_columns_are_positional() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["ERROR a", "INFO b", "ERROR c"]);
        let filtered = FilteredLogSource::with_line_filter(
            scheduler.clone(),
            source.clone(),
            Arc::new(SubstringFilter::new("ERROR", true)),
        );
        scheduler.run_until_idle();

        assert_eq!(
            fetch(&*filtered, Column::Index, &rows(0..3)).line_indices().unwrap(),
            &[
                LogLineIndex::new(0),
                LogLineIndex::new(1),
                LogLineIndex::INVALID,
            ]
        );
        assert_eq!(
            fetch(&*filtered, Column::LineNumber, &rows(0..3)).line_numbers().unwrap(),
            &[1, 2, 0]
        );
        // content maps through the index vector
        assert_eq!(
            fetch(&*filtered, Column::RawContent, &rows(0..2)).text().unwrap(),
            &["ERROR a".to_string(), "ERROR c".to_string()]
        );
    }

    #[test]
    fn multi_line_entry_admitted_by_surviving_line() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        // entry 0 = rows {0, 1}, entry 1 = row {2}
        source.push_multi_line(LogLevel::Info, None, &["bar", "foo continuation"]);
        source.push_line("INFO baz");

        let filtered = FilteredLogSource::new(
            scheduler.clone(),
            source.clone(),
            Arc::new(SubstringFilter::new("foo", false)),
            Arc::new(crate::filter::NoFilter),
        );
        scheduler.run_until_idle();

        // the line filter drops row 0, so entry 0 is staged as just row 1
        assert_eq!(original_indices(&filtered, 1), vec![LogLineIndex::new(1)]);
        assert_eq!(filtered.entry_count(), 1);
        assert_eq!(
            fetch(&*filtered, Column::LogEntryIndex, &rows(0..1))
                .entry_indices()
                .unwrap(),
            &[LogEntryIndex::new(0)]
        );
    }

    #[test]
    fn entry_filter_judges_whole_entries() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_multi_line(LogLevel::Error, None, &["ERROR first", "  caused by oom"]);
        source.push_multi_line(LogLevel::Error, None, &["ERROR second", "  just noise"]);
        source.push_line("INFO third caused by nothing");

        let filtered = FilteredLogSource::new(
            scheduler.clone(),
            source.clone(),
            accept_all(),
            Arc::new(AnyLineFilter::new(Arc::new(SubstringFilter::new(
                "caused by", false,
            )))),
        );
        scheduler.run_until_idle();

        // entry 0 (rows 0,1) and the single-line entry at row 4 survive
        assert_eq!(
            original_indices(&filtered, 3),
            vec![
                LogLineIndex::new(0),
                LogLineIndex::new(1),
                LogLineIndex::new(4),
            ]
        );
        // both lines of the first entry share one derived entry index
        assert_eq!(
            fetch(&*filtered, Column::LogEntryIndex, &rows(0..3))
                .entry_indices()
                .unwrap(),
            &[
                LogEntryIndex::new(0),
                LogEntryIndex::new(0),
                LogEntryIndex::new(1),
            ]
        );
    }

    #[test]
    fn removal_rewinds_indices_and_notifies() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        for i in 0..100 {
            source.push_raw(&format!("INFO {}", i), LogLevel::Info, None);
        }
        let filtered =
            FilteredLogSource::with_line_filter(scheduler.clone(), source.clone(), accept_all());
        scheduler.run_until_idle();
        assert_eq!(filtered.entry_count(), 100);

        let log: Arc<Mutex<Vec<Modification>>> = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        filtered.add_listener(
            Box::new(move |m| writer.lock().unwrap().push(m)),
            Duration::ZERO,
            1000,
        );

        source.remove_from(40);
        scheduler.run_until_idle();

        assert!(log.lock().unwrap().contains(&Modification::removed(40, 60)));
        assert_eq!(filtered.entry_count(), 40);
        assert_eq!(
            filtered.get_property(Property::PercentageProcessed),
            PropertyValue::Percentage(1.0)
        );
        // the index vector shrank to rows 0..40
        let surviving = original_indices(&filtered, 40);
        assert_eq!(surviving.len(), 40);
        assert_eq!(surviving[39], LogLineIndex::new(39));
        // entry numbering resumes after the last preserved entry
        source.push_raw("INFO new", LogLevel::Info, None);
        scheduler.run_until_idle();
        assert_eq!(
            fetch(&*filtered, Column::LogEntryIndex, &rows(40..41))
                .entry_indices()
                .unwrap(),
            &[LogEntryIndex::new(40)]
        );
    }

    #[test]
    fn pattern_constructor_builds_the_line_filter() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["handling req-17", "idle tick", "handling req-92"]);

        let filtered = FilteredLogSource::with_pattern(
            scheduler.clone(),
            source.clone(),
            FilterMode::regex(),
            r"req-\d+",
        )
        .unwrap();
        scheduler.run_until_idle();

        assert_eq!(
            original_indices(&filtered, 2),
            vec![LogLineIndex::new(0), LogLineIndex::new(2)]
        );

        // a malformed pattern surfaces as a construction error
        assert!(FilteredLogSource::with_pattern(
            scheduler.clone(),
            source.clone(),
            FilterMode::regex(),
            "req-(",
        )
        .is_err());
    }

    #[test]
    fn reset_empties_the_stage() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["INFO a", "INFO b"]);
        let filtered =
            FilteredLogSource::with_line_filter(scheduler.clone(), source.clone(), accept_all());
        scheduler.run_until_idle();
        assert_eq!(filtered.entry_count(), 2);

        let log: Arc<Mutex<Vec<Modification>>> = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        filtered.add_listener(
            Box::new(move |m| writer.lock().unwrap().push(m)),
            Duration::ZERO,
            1000,
        );

        source.clear();
        scheduler.run_until_idle();

        assert_eq!(filtered.entry_count(), 0);
        assert!(log.lock().unwrap().contains(&Modification::Reset));
        assert_eq!(original_indices(&filtered, 1), vec![LogLineIndex::INVALID]);
        assert_eq!(
            filtered.get_property(Property::PercentageProcessed),
            PropertyValue::Percentage(1.0)
        );
    }

    /// Wraps a source and counts `get_column` calls reaching it.
    struct CountingSource {
        inner: BufferedLogSource,
        column_queries: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            CountingSource {
                inner: BufferedLogSource::new(),
                column_queries: AtomicUsize::new(0),
            }
        }
    }

    impl LogSource for CountingSource {
        fn columns(&self) -> Vec<Column> {
            self.inner.columns()
        }

        fn properties(&self) -> Vec<Property> {
            self.inner.properties()
        }

        fn get_property(&self, property: Property) -> PropertyValue {
            self.inner.get_property(property)
        }

        fn set_property(&self, property: Property, value: PropertyValue) {
            self.inner.set_property(property, value)
        }

        fn read_properties(&self, destination: &mut PropertyBag) {
            self.inner.read_properties(destination)
        }

        fn get_column(
            &self,
            indices: &[LogLineIndex],
            column: Column,
            destination: &mut ColumnData,
            destination_offset: usize,
            options: QueryOptions,
        ) -> Result<()> {
            self.column_queries.fetch_add(1, Ordering::SeqCst);
            self.inner
                .get_column(indices, column, destination, destination_offset, options)
        }

        fn add_listener(
            &self,
            listener: Box<dyn SourceListener>,
            maximum_wait_time: Duration,
            maximum_batch_size: usize,
        ) -> ListenerId {
            self.inner
                .add_listener(listener, maximum_wait_time, maximum_batch_size)
        }

        fn remove_listener(&self, id: ListenerId) {
            self.inner.remove_listener(id)
        }
    }

    #[test]
    fn delta_time_uses_one_batched_timestamp_query() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(CountingSource::new());
        let t = [
            ts(10, 0, 0),
            ts(10, 0, 1),
            ts(10, 0, 5), // row 2: survives
            ts(10, 0, 9),
            ts(10, 1, 0),
            ts(10, 2, 0), // row 5: survives
            ts(10, 2, 45), // row 6: survives
        ];
        for (i, stamp) in t.iter().enumerate() {
            let content = if [2, 5, 6].contains(&i) {
                format!("keep {}", i)
            } else {
                format!("skip {}", i)
            };
            source.inner.push_raw(&content, LogLevel::Info, Some(*stamp));
        }

        let filtered = FilteredLogSource::with_line_filter(
            scheduler.clone(),
            source.clone(),
            Arc::new(SubstringFilter::new("keep", true)),
        );
        scheduler.run_until_idle();
        assert_eq!(
            original_indices(&filtered, 3),
            vec![
                LogLineIndex::new(2),
                LogLineIndex::new(5),
                LogLineIndex::new(6),
            ]
        );

        source.column_queries.store(0, Ordering::SeqCst);
        let deltas = fetch(&*filtered, Column::DeltaTime, &rows(0..3));
        assert_eq!(
            deltas.spans().unwrap(),
            &[
                None,
                Some(t[5] - t[2]),
                Some(t[6] - t[5]),
            ]
        );
        assert_eq!(source.column_queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replayed_append_emits_no_duplicates() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["INFO a", "INFO b"]);
        let filtered =
            FilteredLogSource::with_line_filter(scheduler.clone(), source.clone(), accept_all());
        scheduler.run_until_idle();

        let log: Arc<Mutex<Vec<Modification>>> = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        filtered.add_listener(
            Box::new(move |m| writer.lock().unwrap().push(m)),
            Duration::ZERO,
            1000,
        );
        let baseline = log.lock().unwrap().len();

        filtered.core.requeue_front(Modification::appended(0, 2));
        scheduler.run_until_idle();

        assert_eq!(filtered.entry_count(), 2);
        assert_eq!(log.lock().unwrap().len(), baseline);
    }

    #[test]
    fn trailing_entry_extends_without_duplicates() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        let grouper = MultiLineGrouper::new(scheduler.clone(), source.clone());
        let filtered =
            FilteredLogSource::with_line_filter(scheduler.clone(), grouper.clone(), accept_all());

        source.push_raw("ERROR boom", LogLevel::Error, None);
        scheduler.run_until_idle();
        assert_eq!(filtered.entry_count(), 1);

        // a continuation of the same logical entry arrives after catch-up
        source.push_raw("  at foo", LogLevel::None, None);
        scheduler.run_until_idle();

        assert_eq!(filtered.entry_count(), 2);
        assert_eq!(
            original_indices(&filtered, 2),
            vec![LogLineIndex::new(0), LogLineIndex::new(1)]
        );
        assert_eq!(
            fetch(&*filtered, Column::LogEntryIndex, &rows(0..2))
                .entry_indices()
                .unwrap(),
            &[LogEntryIndex::new(0), LogEntryIndex::new(0)]
        );
    }

    #[test]
    fn removal_reseeds_the_staged_entry() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        let grouper = MultiLineGrouper::new(scheduler.clone(), source.clone());
        let filtered =
            FilteredLogSource::with_line_filter(scheduler.clone(), grouper.clone(), accept_all());

        source.push_raw("ERROR boom", LogLevel::Error, None);
        source.push_raw("  frame 1", LogLevel::None, None);
        source.push_raw("  frame 2", LogLevel::None, None);
        scheduler.run_until_idle();
        assert_eq!(filtered.entry_count(), 3);

        // cut into the middle of the entry, then continue it differently
        source.remove_from(1);
        scheduler.run_until_idle();
        assert_eq!(filtered.entry_count(), 1);

        source.push_raw("  replacement frame", LogLevel::None, None);
        scheduler.run_until_idle();

        assert_eq!(
            original_indices(&filtered, 2),
            vec![LogLineIndex::new(0), LogLineIndex::new(1)]
        );
        // still one logical entry
        assert_eq!(
            fetch(&*filtered, Column::LogEntryIndex, &rows(0..2))
                .entry_indices()
                .unwrap(),
            &[LogEntryIndex::new(0), LogEntryIndex::new(0)]
        );
    }

    #[test]
    fn reverse_mapping_scans_the_index_vector() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["ERROR a", "INFO b", "ERROR c", "INFO d", "ERROR e"]);
        let filtered = FilteredLogSource::with_line_filter(
            scheduler.clone(),
            source.clone(),
            Arc::new(SubstringFilter::new("ERROR", true)),
        );
        scheduler.run_until_idle();

        assert_eq!(
            filtered.local_index_of_original(LogLineIndex::new(2)),
            LogLineIndex::new(1)
        );
        assert_eq!(
            filtered.local_index_of_original(LogLineIndex::new(3)),
            LogLineIndex::INVALID
        );
        assert_eq!(
            filtered.local_index_of_original(LogLineIndex::INVALID),
            LogLineIndex::INVALID
        );
    }

    #[test]
    fn max_characters_tracks_committed_lines() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["ERROR abc", "INFO this line is much longer", "ERROR xy"]);
        let filtered = FilteredLogSource::with_line_filter(
            scheduler.clone(),
            source.clone(),
            Arc::new(SubstringFilter::new("ERROR", true)),
        );
        scheduler.run_until_idle();

        assert_eq!(
            filtered.get_property(Property::MaxCharactersPerLine),
            PropertyValue::Integer("ERROR abc".chars().count() as i64)
        );
    }

    #[test]
    fn disposed_stage_serves_defaults() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_lines(&["INFO a"]);
        let filtered =
            FilteredLogSource::with_line_filter(scheduler.clone(), source.clone(), accept_all());
        scheduler.run_until_idle();
        filtered.dispose();

        assert_eq!(original_indices(&filtered, 1), vec![LogLineIndex::INVALID]);
        assert_eq!(
            filtered.get_property(Property::LogEntryCount),
            PropertyValue::Integer(0)
        );
        assert_eq!(
            filtered.local_index_of_original(LogLineIndex::new(0)),
            LogLineIndex::INVALID
        );
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn get_entries_serves_mixed_local_and_delegated_columns() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        source.push_raw("ERROR a", LogLevel::Error, Some(ts(8, 0, 0)));
        source.push_raw("INFO b", LogLevel::Info, Some(ts(8, 0, 10)));
        source.push_raw("ERROR c", LogLevel::Error, Some(ts(8, 0, 30)));
        let filtered = FilteredLogSource::with_line_filter(
            scheduler.clone(),
            source.clone(),
            Arc::new(SubstringFilter::new("ERROR", true)),
        );
        scheduler.run_until_idle();

        let mut buffer = ColumnarBuffer::new(
            &[
                Column::Index,
                Column::OriginalIndex,
                Column::RawContent,
                Column::DeltaTime,
            ],
            2,
        );
        filtered
            .get_entries(&rows(0..2), &mut buffer, 0, QueryOptions::default())
            .unwrap();

        assert_eq!(
            buffer.get(Column::Index, 1),
            Some(CellValue::LineIndex(LogLineIndex::new(1)))
        );
        assert_eq!(
            buffer.get(Column::OriginalIndex, 1),
            Some(CellValue::LineIndex(LogLineIndex::new(2)))
        );
        assert_eq!(
            buffer.get(Column::RawContent, 0),
            Some(CellValue::Text("ERROR a".to_string()))
        );
        assert_eq!(
            buffer.get(Column::DeltaTime, 1),
            Some(CellValue::Span(Some(ts(8, 0, 30) - ts(8, 0, 0))))
        );
        assert_eq!(buffer.get(Column::DeltaTime, 0), Some(CellValue::Span(None)));
    }

    #[test]
    fn percentage_stays_within_bounds_throughout() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(BufferedLogSource::new());
        let config = PipelineConfig {
            stage_batch_size: 3,
            ..PipelineConfig::default()
        };
        let filtered = FilteredLogSource::with_config(
            scheduler.clone(),
            source.clone(),
            accept_all(),
            Arc::new(crate::filter::NoFilter),
            config,
        );

        let lines: Vec<String> = (0..10).map(|i| format!("INFO {}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        source.push_lines(&refs);

        for _ in 0..10 {
            scheduler.run_pending_tasks();
            let percentage = filtered
                .get_property(Property::PercentageProcessed)
                .as_percentage()
                .unwrap();
            assert!((0.0..=1.0).contains(&percentage), "got {}", percentage);
        }
        assert_eq!(
            filtered.get_property(Property::PercentageProcessed),
            PropertyValue::Percentage(1.0)
        );
        assert_eq!(filtered.entry_count(), 10);
    }
}

//! The log-source capability: what every stage consumes and exposes.
//!
//! A log source is a random-access, listener-notifying, column-oriented,
//! append-mostly sequence of log entries. Pipeline stages are both a
//! listener of their upstream source and a source to their own listeners.

pub mod buffered;
pub mod fanout;

pub use buffered::BufferedLogSource;
pub use fanout::{ListenerFanout, ListenerId};

use crate::column::{BufferView, Column, ColumnData, ColumnarBuffer};
use crate::error::Result;
use crate::index::LogLineIndex;
use crate::modification::Modification;
use crate::property::{Property, PropertyBag, PropertyValue};
use std::time::Duration;

/// Per-query options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// When false, sources that cache column values must not serve from the
    /// cache. The pipeline stages hold no cache, so for them both settings
    /// behave identically.
    pub cache_allowed: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            cache_allowed: true,
        }
    }
}

impl QueryOptions {
    pub fn no_cache() -> Self {
        QueryOptions {
            cache_allowed: false,
        }
    }
}

/// Receives modification callbacks from a source.
///
/// Callbacks may arrive on any scheduler thread and must be non-blocking:
/// enqueue and return.
pub trait SourceListener: Send {
    fn on_modification(&self, modification: Modification);
}

impl<F> SourceListener for F
where
    F: Fn(Modification) + Send,
{
    fn on_modification(&self, modification: Modification) {
        self(modification)
    }
}

/// Where `get_entries` writes: a whole buffer, or a column-restricted view.
pub trait EntriesDestination {
    fn destination_columns(&self) -> Vec<Column>;

    fn for_each_column(
        &mut self,
        f: &mut dyn FnMut(Column, &mut ColumnData) -> Result<()>,
    ) -> Result<()>;
}

impl EntriesDestination for ColumnarBuffer {
    fn destination_columns(&self) -> Vec<Column> {
        self.columns().collect()
    }

    fn for_each_column(
        &mut self,
        f: &mut dyn FnMut(Column, &mut ColumnData) -> Result<()>,
    ) -> Result<()> {
        for (column, data) in self.iter_mut() {
            f(column, data)?;
        }
        Ok(())
    }
}

impl EntriesDestination for BufferView<'_> {
    fn destination_columns(&self) -> Vec<Column> {
        self.columns().collect()
    }

    fn for_each_column(
        &mut self,
        f: &mut dyn FnMut(Column, &mut ColumnData) -> Result<()>,
    ) -> Result<()> {
        for (column, data) in self.iter_mut() {
            f(column, data)?;
        }
        Ok(())
    }
}

/// The interface every log source implements.
pub trait LogSource: Send + Sync {
    /// The columns this source serves. A superset of [`Column::MINIMUM`];
    /// stable for the source's lifetime.
    fn columns(&self) -> Vec<Column>;

    /// The properties this source serves, including its ancestors' union.
    fn properties(&self) -> Vec<Property>;

    /// Current value or descriptor default. Non-blocking.
    fn get_property(&self, property: Property) -> PropertyValue;

    /// Forwarded to the underlying writable source; a no-op on read-only
    /// descriptors.
    fn set_property(&self, property: Property, value: PropertyValue);

    /// Atomic snapshot copy into the caller's bag.
    fn read_properties(&self, destination: &mut PropertyBag);

    /// Fill `destination[offset..offset + indices.len()]` with `column`
    /// values. Out-of-range indices yield the column default. A destination
    /// that is too small or of the wrong kind is a contract violation.
    fn get_column(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut ColumnData,
        destination_offset: usize,
        options: QueryOptions,
    ) -> Result<()>;

    /// Multi-column variant: fills each column present in `destination`.
    fn get_entries(
        &self,
        indices: &[LogLineIndex],
        destination: &mut dyn EntriesDestination,
        destination_offset: usize,
        options: QueryOptions,
    ) -> Result<()> {
        destination.for_each_column(&mut |column, data| {
            self.get_column(indices, column, data, destination_offset, options)
        })
    }

    /// Register for modification callbacks, coalesced per `(maximum_wait_time,
    /// maximum_batch_size)`.
    fn add_listener(
        &self,
        listener: Box<dyn SourceListener>,
        maximum_wait_time: Duration,
        maximum_batch_size: usize,
    ) -> ListenerId;

    /// Idempotent.
    fn remove_listener(&self, id: ListenerId);

    /// The number of rows this source currently exposes.
    fn entry_count(&self) -> usize {
        self.get_property(Property::LogEntryCount)
            .as_integer()
            .unwrap_or(0)
            .max(0) as usize
    }
}

//! Source properties: typed key/value pairs with snapshot copy semantics.
//!
//! Every source carries the minimum property set; composite sources add the
//! union of their ancestors' properties on top. Bags are copied in bulk so
//! readers observe either the old or the new snapshot, never a partial merge.

use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Why a source exposes no entries at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmptyReason {
    SourceDoesNotExist,
    SourceCannotBeAccessed,
}

/// The minimum property set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// How much of the source (and its ancestors) has been processed, in `[0, 1]`.
    PercentageProcessed,
    /// Number of rows this source currently exposes.
    LogEntryCount,
    EmptyReason,
    /// Timestamp of the first entry.
    StartTimestamp,
    /// Timestamp of the last entry.
    EndTimestamp,
    Created,
    LastModified,
    /// Size of the underlying data in bytes.
    Size,
    /// Detected wire format ("plain", "json", "logfmt").
    Format,
    MaxCharactersPerLine,
}

impl Property {
    pub const MINIMUM: [Property; 10] = [
        Property::PercentageProcessed,
        Property::LogEntryCount,
        Property::EmptyReason,
        Property::StartTimestamp,
        Property::EndTimestamp,
        Property::Created,
        Property::LastModified,
        Property::Size,
        Property::Format,
        Property::MaxCharactersPerLine,
    ];

    pub fn kind(self) -> PropertyKind {
        match self {
            Property::PercentageProcessed => PropertyKind::Percentage,
            Property::LogEntryCount | Property::MaxCharactersPerLine => PropertyKind::Integer,
            Property::EmptyReason => PropertyKind::EmptyReason,
            Property::StartTimestamp
            | Property::EndTimestamp
            | Property::Created
            | Property::LastModified => PropertyKind::Timestamp,
            Property::Size => PropertyKind::Bytes,
            Property::Format => PropertyKind::Text,
        }
    }

    pub fn default_value(self) -> PropertyValue {
        self.kind().default_value()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Percentage,
    Integer,
    EmptyReason,
    Timestamp,
    Bytes,
    Text,
}

impl PropertyKind {
    pub fn default_value(self) -> PropertyValue {
        match self {
            PropertyKind::Percentage => PropertyValue::Percentage(0.0),
            PropertyKind::Integer => PropertyValue::Integer(0),
            PropertyKind::EmptyReason => PropertyValue::EmptyReason(None),
            PropertyKind::Timestamp => PropertyValue::Timestamp(None),
            PropertyKind::Bytes => PropertyValue::Bytes(None),
            PropertyKind::Text => PropertyValue::Text(None),
        }
    }
}

/// One property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Percentage(f64),
    Integer(i64),
    EmptyReason(Option<EmptyReason>),
    Timestamp(Option<NaiveDateTime>),
    Bytes(Option<u64>),
    Text(Option<String>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Percentage(_) => PropertyKind::Percentage,
            PropertyValue::Integer(_) => PropertyKind::Integer,
            PropertyValue::EmptyReason(_) => PropertyKind::EmptyReason,
            PropertyValue::Timestamp(_) => PropertyKind::Timestamp,
            PropertyValue::Bytes(_) => PropertyKind::Bytes,
            PropertyValue::Text(_) => PropertyKind::Text,
        }
    }

    pub fn as_percentage(&self) -> Option<f64> {
        match self {
            PropertyValue::Percentage(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            PropertyValue::Timestamp(t) => *t,
            _ => None,
        }
    }
}

/// A type-safe key/value store over the property descriptor set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    values: HashMap<Property, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        PropertyBag::default()
    }

    /// The stored value, or the descriptor default.
    pub fn get(&self, property: Property) -> PropertyValue {
        self.values
            .get(&property)
            .cloned()
            .unwrap_or_else(|| property.default_value())
    }

    /// Store a value. A value of the wrong kind is an internal inconsistency:
    /// it is reported and dropped, never stored.
    pub fn set(&mut self, property: Property, value: PropertyValue) {
        if value.kind() != property.kind() {
            log::error!(
                "dropping {:?} value of kind {:?} (expected {:?})",
                property,
                value.kind(),
                property.kind()
            );
            return;
        }
        self.values.insert(property, value);
    }

    /// Copy every stored value into `destination`, overwriting matching keys.
    pub fn copy_into(&self, destination: &mut PropertyBag) {
        for (property, value) in &self.values {
            destination.values.insert(*property, value.clone());
        }
    }

    /// Whether this bag owns a value for the descriptor (as opposed to
    /// falling back to the default).
    pub fn contains(&self, property: Property) -> bool {
        self.values.contains_key(&property)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn properties(&self) -> impl Iterator<Item = Property> + '_ {
        self.values.keys().copied()
    }

    // Typed convenience getters, defaulting like `get`.

    pub fn percentage(&self, property: Property) -> f64 {
        self.get(property).as_percentage().unwrap_or(0.0)
    }

    pub fn integer(&self, property: Property) -> i64 {
        self.get(property).as_integer().unwrap_or(0)
    }

    pub fn timestamp(&self, property: Property) -> Option<NaiveDateTime> {
        self.get(property).as_timestamp()
    }
}

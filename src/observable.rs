//! Observable value: a named scalar with a filter chain and observers.
//!
//! `process()` runs a raw sample through the filters in registration order.
//! The first filter that does not answer `Continue` ends the call silently.
//! When every filter accepts, the stored value is replaced and observers are
//! called synchronously, in subscription order.
//!
//! Observers receive a borrowed view of the value rather than the observable
//! itself, so they cannot subscribe, unsubscribe or touch the filters while a
//! notification pass is running.

use log::debug;
use std::fmt;

use crate::filter::{Filter, FilterOutcome};

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// What an observer gets to see of a freshly accepted value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observed<'a> {
    pub name: &'a str,
    pub value: f64,
}

pub type ObserverFn = Box<dyn FnMut(&Observed<'_>)>;

pub struct ObservableValue {
    name: String,
    value: f64,
    filters: Vec<Filter>,
    observers: Vec<(ObserverId, ObserverFn)>,
    next_observer_id: u64,
}

impl ObservableValue {
    pub fn new(name: &str, initial: f64) -> Self {
        ObservableValue {
            name: name.to_string(),
            value: initial,
            filters: Vec::new(),
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    /// Builder form of `add_filter`.
    pub fn with_filter(mut self, filter: impl Into<Filter>) -> Self {
        self.add_filter(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last value accepted by the whole chain.
    pub fn value(&self) -> f64 {
        self.value
    }

    // ========================================================================
    // FILTER CHAIN
    // ========================================================================

    /// Append a filter at the end of the chain, returning its position.
    pub fn add_filter(&mut self, filter: impl Into<Filter>) -> usize {
        self.filters.push(filter.into());
        self.filters.len() - 1
    }

    pub fn remove_filter(&mut self, index: usize) -> Option<Filter> {
        if index < self.filters.len() {
            Some(self.filters.remove(index))
        } else {
            None
        }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// In-place access to one filter, e.g. to recalibrate a linear fit
    /// without losing the state of the others.
    pub fn filter_mut(&mut self, index: usize) -> Option<&mut Filter> {
        self.filters.get_mut(index)
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    /// Register a callback. The same closure logic may be registered twice;
    /// each registration gets its own id.
    pub fn subscribe<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Observed<'_>) + 'static,
    {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns false when the id was not (or no longer) registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    // ========================================================================
    // PROCESSING
    // ========================================================================

    /// Feed a raw sample. Returns the accepted value, or `None` when a filter
    /// held it back (in which case no observer was called).
    pub fn process(&mut self, raw: f64) -> Option<f64> {
        let mut working = raw;

        for filter in self.filters.iter_mut() {
            match filter.apply(&mut working) {
                FilterOutcome::Continue => {}
                FilterOutcome::Stop => return None,
                FilterOutcome::Invalid => {
                    debug!("[{}] {} rejected sample {}", self.name, filter.kind(), raw);
                    return None;
                }
            }
        }

        self.value = working;
        self.notify();
        Some(working)
    }

    fn notify(&mut self) {
        let observed = Observed {
            name: &self.name,
            value: self.value,
        };
        for (_, observer) in self.observers.iter_mut() {
            observer(&observed);
        }
    }
}

impl fmt::Debug for ObservableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("filters", &self.filters)
            .field("observers", &self.observers.len())
            .finish()
    }
}

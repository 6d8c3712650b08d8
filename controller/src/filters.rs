//! Predicates which decide whether a node is a candidate for cordoning and draining.
//!
//! Each filter tests one property of a node. A `FilterChain` combines them with a short-circuiting logical AND.
use crate::conditions::{ConditionFilter, SuppliedCondition};

use k8s_openapi::api::core::v1::Node;
use models::node::NodeExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::{event, instrument, Level};

/// A predicate over a node.
pub trait NodeFilter: Send + Sync {
    fn filter(&self, node: &Node) -> bool;
}

impl<F> NodeFilter for F
where
    F: Fn(&Node) -> bool + Send + Sync,
{
    fn filter(&self, node: &Node) -> bool {
        self(node)
    }
}

/// Passes nodes which carry every one of the required labels with exactly the required value.
#[derive(Clone, Debug, Default)]
pub struct LabelFilter {
    labels: BTreeMap<String, String>,
}

impl LabelFilter {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        LabelFilter { labels }
    }
}

impl NodeFilter for LabelFilter {
    fn filter(&self, node: &Node) -> bool {
        let node_labels = node.metadata.labels.as_ref();
        self.labels.iter().all(|(key, value)| {
            node_labels
                .and_then(|labels| labels.get(key))
                .map_or(false, |node_value| node_value == value)
        })
    }
}

/// Passes nodes which have not been marked unschedulable.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulableFilter;

impl NodeFilter for SchedulableFilter {
    fn filter(&self, node: &Node) -> bool {
        !node.is_unschedulable()
    }
}

/// Passes each node only the first time it is seen.
///
/// Passing a node records it, so this filter must be evaluated after every other filter in a chain. A node rejected
/// by an earlier filter must not be recorded as processed.
#[derive(Debug, Default)]
pub struct ProcessedFilter {
    processed: Mutex<HashSet<String>>,
}

impl ProcessedFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of distinct nodes which have passed this filter.
    pub fn processed_count(&self) -> usize {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl NodeFilter for ProcessedFilter {
    fn filter(&self, node: &Node) -> bool {
        // `insert` returns false if the node was already present.
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.node_key())
    }
}

/// An ordered conjunction of filters. Evaluation stops at the first filter which rejects the node.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn NodeFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn NodeFilter>>) -> Self {
        FilterChain { filters }
    }

    /// Builds the chain used to select nodes for cordoning: required labels, schedulability, unhealthy conditions,
    /// and finally deduplication.
    pub fn for_candidates(
        labels: BTreeMap<String, String>,
        conditions: Vec<SuppliedCondition>,
    ) -> Self {
        FilterChain::new(vec![
            Box::new(LabelFilter::new(labels)),
            Box::new(SchedulableFilter),
            Box::new(ConditionFilter::new(conditions)),
            Box::new(ProcessedFilter::new()),
        ])
    }

    /// Appends a filter to the end of the chain.
    pub fn with(mut self, filter: impl NodeFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Returns true if every filter in the chain passes the node.
    #[instrument(skip(self, node), fields(node = %node.node_name()))]
    pub fn evaluate(&self, node: &Node) -> bool {
        let passed = self.filters.iter().all(|filter| filter.filter(node));
        event!(Level::TRACE, passed, "Evaluated node against filter chain.");
        passed
    }
}

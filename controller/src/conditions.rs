//! Node condition specifications and the filter which matches nodes against them.
use crate::duration::{duration_error, parse_duration};
use crate::filters::NodeFilter;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use models::node::NodeExt;
use snafu::{OptionExt, ResultExt};
use std::str::FromStr;
use std::time::Duration;
use tracing::{event, Level};

// A bare condition type such as `KernelDeadlock` is shorthand for this status and duration.
const DEFAULT_CONDITION_STATUS: &str = "True";
const DEFAULT_CONDITION_DURATION: &str = "0s";

/// A node condition which justifies draining once the node has held it for at least `minimum_duration`.
///
/// Written as `TYPE=STATUS,DURATION`, for example `Ready=Unknown,10m`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SuppliedCondition {
    pub type_: String,
    pub status: String,
    pub minimum_duration: Duration,
}

impl SuppliedCondition {
    pub fn new<S1, S2>(type_: S1, status: S2, minimum_duration: Duration) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        SuppliedCondition {
            type_: type_.into(),
            status: status.into(),
            minimum_duration,
        }
    }

    /// Returns true if `condition` has this type and status, and has held it for at least the minimum duration as of
    /// `now`.
    ///
    /// A condition without a transition time has held its status for as long as can be known, so it meets any
    /// minimum duration.
    pub fn is_met_by(&self, condition: &NodeCondition, now: DateTime<Utc>) -> bool {
        if condition.type_ != self.type_ || condition.status != self.status {
            return false;
        }

        let transitioned_at = match condition.last_transition_time.as_ref() {
            Some(time) => time.0,
            None => return true,
        };
        chrono::Duration::from_std(self.minimum_duration)
            .ok()
            .and_then(|minimum| transitioned_at.checked_add_signed(minimum))
            .map_or(false, |eligible_at| eligible_at <= now)
    }
}

impl FromStr for SuppliedCondition {
    type Err = condition_error::Error;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (type_, status, duration) = match spec.split_once('=') {
            Some((type_, requirement)) => {
                let (status, duration) = requirement
                    .split_once(',')
                    .context(condition_error::MissingDurationSnafu { spec })?;
                (type_, status, duration)
            }
            None => (spec, DEFAULT_CONDITION_STATUS, DEFAULT_CONDITION_DURATION),
        };
        let minimum_duration =
            parse_duration(duration).context(condition_error::InvalidDurationSnafu { spec })?;

        Ok(SuppliedCondition::new(type_, status, minimum_duration))
    }
}

/// Parses condition specifications in `TYPE[=STATUS,DURATION]` form.
///
/// The result always has one entry per input. An entry which cannot be parsed is logged and left as
/// `SuppliedCondition::default()`, which matches no node condition.
pub fn parse_conditions<S: AsRef<str>>(conditions: &[S]) -> Vec<SuppliedCondition> {
    conditions
        .iter()
        .map(|spec| {
            SuppliedCondition::from_str(spec.as_ref()).unwrap_or_else(|err| {
                event!(Level::WARN, %err, "Ignoring node condition.");
                SuppliedCondition::default()
            })
        })
        .collect()
}

/// Passes nodes which have held any of the supplied conditions for at least that condition's minimum duration.
///
/// With no supplied conditions every node passes.
#[derive(Clone, Debug, Default)]
pub struct ConditionFilter {
    conditions: Vec<SuppliedCondition>,
}

impl ConditionFilter {
    pub fn new(conditions: Vec<SuppliedCondition>) -> Self {
        ConditionFilter { conditions }
    }

    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Self {
        Self::new(parse_conditions(specs))
    }

    pub fn matches_at(&self, node: &Node, now: DateTime<Utc>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }

        let node_conditions = node.node_conditions();
        self.conditions.iter().any(|supplied| {
            node_conditions
                .iter()
                .any(|condition| supplied.is_met_by(condition, now))
        })
    }
}

impl NodeFilter for ConditionFilter {
    fn filter(&self, node: &Node) -> bool {
        self.matches_at(node, Utc::now())
    }
}

pub mod condition_error {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Node condition '{}' must be of the form TYPE=STATUS,DURATION: missing ','",
            spec
        ))]
        MissingDuration { spec: String },

        #[snafu(display("Node condition '{}' has an invalid duration: {}", spec, source))]
        InvalidDuration {
            spec: String,
            source: duration_error::Error,
        },
    }
}

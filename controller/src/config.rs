//! Controller configuration, read from the environment.
use crate::conditions::{parse_conditions, SuppliedCondition};
use crate::duration::{duration_error, parse_duration};
use crate::pacer::DEFAULT_DRAIN_BUFFER;

use models::constants::{DEFAULT_EVENT_REPORTER, METRICS_INTERNAL_PORT};
use models::node::drain::DrainOptions;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

const DRAIN_BUFFER_ENV_VAR: &str = "DRAIN_BUFFER";
const NODE_LABELS_ENV_VAR: &str = "NODE_LABELS";
const NODE_CONDITIONS_ENV_VAR: &str = "NODE_CONDITIONS";
const DRY_RUN_ENV_VAR: &str = "DRY_RUN";
const EVICT_DAEMONSET_PODS_ENV_VAR: &str = "EVICT_DAEMONSET_PODS";
const EVENT_REPORTER_NAME_ENV_VAR: &str = "EVENT_REPORTER_NAME";
const METRICS_PORT_ENV_VAR: &str = "METRICS_PORT";

// Condition specifications contain commas, so a list of them is split on semicolons.
const CONDITION_SEPARATOR: char = ';';

/// The module-wide result type.
type Result<T> = std::result::Result<T, config_error::Error>;

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Minimum time between consecutive drains.
    pub drain_buffer: Duration,
    /// Labels a node must carry, with exactly these values, to be considered.
    pub node_labels: BTreeMap<String, String>,
    pub node_conditions: Vec<SuppliedCondition>,
    /// Log cordons and drains instead of performing them.
    pub dry_run: bool,
    pub drain_options: DrainOptions,
    pub event_reporter_name: String,
    pub metrics_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            drain_buffer: DEFAULT_DRAIN_BUFFER,
            node_labels: BTreeMap::new(),
            node_conditions: Vec::new(),
            dry_run: false,
            drain_options: DrainOptions::default(),
            event_reporter_name: DEFAULT_EVENT_REPORTER.to_string(),
            metrics_port: METRICS_INTERNAL_PORT,
        }
    }
}

impl ControllerConfig {
    pub fn from_environment() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from a variable lookup. Unset or empty variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = ControllerConfig::default();

        if let Some(value) = lookup(DRAIN_BUFFER_ENV_VAR) {
            config.drain_buffer =
                parse_duration(&value).context(config_error::DrainBufferSnafu { value })?;
        }
        if let Some(value) = lookup(NODE_LABELS_ENV_VAR) {
            config.node_labels = parse_node_labels(&value)?;
        }
        if let Some(value) = lookup(NODE_CONDITIONS_ENV_VAR) {
            let specs: Vec<&str> = value
                .split(CONDITION_SEPARATOR)
                .map(str::trim)
                .filter(|spec| !spec.is_empty())
                .collect();
            config.node_conditions = parse_conditions(&specs);
        }
        if let Some(value) = lookup(DRY_RUN_ENV_VAR) {
            config.dry_run = parse_bool(DRY_RUN_ENV_VAR, &value)?;
        }
        if let Some(value) = lookup(EVICT_DAEMONSET_PODS_ENV_VAR) {
            config.drain_options.evict_daemonset_pods =
                parse_bool(EVICT_DAEMONSET_PODS_ENV_VAR, &value)?;
        }
        if let Some(value) = lookup(EVENT_REPORTER_NAME_ENV_VAR) {
            config.event_reporter_name = value.trim().to_string();
        }
        if let Some(value) = lookup(METRICS_PORT_ENV_VAR) {
            config.metrics_port = value
                .trim()
                .parse()
                .context(config_error::MetricsPortSnafu { value })?;
        }

        Ok(config)
    }
}

/// Parses required node labels written as `KEY=VALUE` pairs separated by commas.
pub fn parse_node_labels<S: AsRef<str>>(labels: S) -> Result<BTreeMap<String, String>> {
    labels
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> Result<(String, String)> {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| config_error::Error::NodeLabel {
                    label: pair.to_string(),
                })?;
            ensure!(
                !key.trim().is_empty(),
                config_error::NodeLabelSnafu { label: pair }
            );
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool> {
    value
        .trim()
        .to_ascii_lowercase()
        .parse()
        .context(config_error::BoolSnafu { variable, value })
}

pub mod config_error {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Invalid drain buffer '{}': {}", value, source))]
        DrainBuffer {
            value: String,
            source: duration_error::Error,
        },

        #[snafu(display("Invalid node label '{}': expected KEY=VALUE", label))]
        NodeLabel { label: String },

        #[snafu(display("Invalid value '{}' for {}: {}", value, variable, source))]
        Bool {
            variable: String,
            value: String,
            source: std::str::ParseBoolError,
        },

        #[snafu(display("Invalid metrics port '{}': {}", value, source))]
        MetricsPort {
            value: String,
            source: std::num::ParseIntError,
        },
    }
}

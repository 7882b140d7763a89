//! Topic codec
//!
//! Every bus topic has the layout
//!
//! ```text
//! <namespace>/v<version>/<house_id>/<from scope>/<from name>/<to scope>/<to name>/<command>/<args...>
//! ```
//!
//! Module names are `scope/name`, so `from` and `to` each take two levels.
//! `args` may span several levels; empty args are encoded as [`EMPTY_ARGS`].

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Topic level separator
pub const SEPARATOR: char = '/';

/// Placeholder written in place of empty args
pub const EMPTY_ARGS: &str = "null";

/// Single-level wildcard
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Levels before args: namespace, version, house, from (2), to (2), command
const FIXED_LEVELS: usize = 8;

/// Builds topics for one namespace and protocol version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCodec {
    namespace: String,
    version: u32,
}

impl TopicCodec {
    /// Create a codec for the given namespace and protocol version
    pub fn new(namespace: impl Into<String>, version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            version,
        }
    }

    /// Topic namespace (first level)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Protocol version (second level, rendered `v<n>`)
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Build a topic or subscription pattern
    pub fn build(&self, house_id: &str, from: &str, to: &str, command: &str, args: &str) -> String {
        let args = if args.is_empty() { EMPTY_ARGS } else { args };
        format!(
            "{}/v{}/{}/{}/{}/{}/{}",
            self.namespace, self.version, house_id, from, to, command, args
        )
    }
}

/// A concrete topic split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub namespace: String,
    pub version: u32,
    pub house_id: String,
    pub sender: String,
    pub recipient: String,
    pub command: String,
    /// Empty when the topic carried the [`EMPTY_ARGS`] placeholder
    pub args: String,
}

impl TopicParts {
    /// Split a concrete topic
    pub fn parse(topic: &str) -> Result<Self> {
        let levels: Vec<&str> = topic.splitn(FIXED_LEVELS + 1, SEPARATOR).collect();
        if levels.len() <= FIXED_LEVELS {
            return Err(Error::invalid_topic(format!(
                "expected at least {} levels in '{}'",
                FIXED_LEVELS + 1,
                topic
            )));
        }

        let version = levels[1]
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::invalid_topic(format!("invalid version level '{}' in '{}'", levels[1], topic))
            })?;

        if levels[2].is_empty() || levels[7].is_empty() {
            return Err(Error::invalid_topic(format!(
                "empty house or command in '{}'",
                topic
            )));
        }

        let args = match levels[8] {
            EMPTY_ARGS => String::new(),
            args => args.to_string(),
        };

        Ok(Self {
            namespace: levels[0].to_string(),
            version,
            house_id: levels[2].to_string(),
            sender: format!("{}/{}", levels[3], levels[4]),
            recipient: format!("{}/{}", levels[5], levels[6]),
            command: levels[7].to_string(),
            args,
        })
    }
}

/// Check whether `topic` matches the subscription `pattern`
///
/// MQTT rules: `+` matches exactly one level, `#` matches the remaining
/// levels including none. Topics starting with `$` are not matched by a
/// leading wildcard.
pub fn matches(pattern: &str, topic: &str) -> bool {
    if topic.starts_with('$')
        && (pattern.starts_with(SINGLE_LEVEL_WILDCARD) || pattern.starts_with(MULTI_LEVEL_WILDCARD))
    {
        return false;
    }

    let mut pattern_levels = pattern.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Normalize a configuration wait pattern
///
/// Configuration is published either to everybody (`*/*`) or directly to a
/// module, so a `*` `*` level pair is widened to `+` `+` before matching.
pub fn normalize_wait_pattern(pattern: &str) -> Cow<'_, str> {
    if !pattern.contains("*/*") {
        return Cow::Borrowed(pattern);
    }

    let mut levels: Vec<&str> = pattern.split(SEPARATOR).collect();
    let mut i = 0;
    while i + 1 < levels.len() {
        if levels[i] == "*" && levels[i + 1] == "*" {
            levels[i] = SINGLE_LEVEL_WILDCARD;
            levels[i + 1] = SINGLE_LEVEL_WILDCARD;
            i += 2;
        } else {
            i += 1;
        }
    }

    Cow::Owned(levels.join("/"))
}

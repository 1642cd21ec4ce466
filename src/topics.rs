//! Topic naming for the group/participant scheme
//!
//! Topics are composed as `group/participant/suffix`, where the suffix list
//! comes from a static per-group catalog. Resolution is pure; the result is
//! handed to the subscription registry as opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A fully-qualified topic. Equality is exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, used for compact listings
    pub fn display_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// True if the last segment equals `suffix`
    pub fn has_suffix(&self, suffix: &str) -> bool {
        self.0
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('/'))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic(name.to_string())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic(name)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("group must not be empty")]
    EmptyGroup,

    #[error("participant name must not be empty")]
    EmptyParticipant,

    #[error("group {0} not found")]
    UnknownGroup(String),

    /// `/`, `+` and `#` would alter the hierarchy or act as wildcards
    #[error("{0:?} contains a reserved character")]
    ReservedCharacter(String),
}

/// One catalog entry: a group and the topic suffixes its participants publish
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupTopics {
    pub group: String,
    pub topics: Vec<String>,
}

/// Maps `(group, participant, suffixes)` to fully-qualified topics.
pub fn resolve_topics<S: AsRef<str>>(group: &str, participant: &str, suffixes: &[S]) -> Vec<Topic> {
    suffixes
        .iter()
        .map(|suffix| Topic(format!("{}/{}/{}", group, participant, suffix.as_ref())))
        .collect()
}

fn check_segment(segment: &str, empty: TopicError) -> Result<(), TopicError> {
    if segment.trim().is_empty() {
        return Err(empty);
    }
    if segment.contains(['/', '+', '#']) {
        return Err(TopicError::ReservedCharacter(segment.to_string()));
    }
    Ok(())
}

/// The externally supplied group catalog
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupCatalog {
    groups: Vec<GroupTopics>,
}

impl GroupCatalog {
    pub fn new(groups: Vec<GroupTopics>) -> Self {
        Self { groups }
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.group.as_str())
    }

    pub fn find(&self, group: &str) -> Option<&GroupTopics> {
        self.groups.iter().find(|g| g.group == group)
    }

    /// Validated resolution for an operator-entered group and participant
    pub fn topics_for(&self, group: &str, participant: &str) -> Result<Vec<Topic>, TopicError> {
        check_segment(group, TopicError::EmptyGroup)?;
        check_segment(participant, TopicError::EmptyParticipant)?;
        let entry = self
            .find(group)
            .ok_or_else(|| TopicError::UnknownGroup(group.to_string()))?;
        Ok(resolve_topics(group, participant.trim(), &entry.topics))
    }
}

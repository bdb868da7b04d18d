//! The fixed vocabulary of lifecycle categories that drive sound and
//! notification choice.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "task.acknowledge")]
    TaskAcknowledge,
    #[serde(rename = "task.complete")]
    TaskComplete,
    #[serde(rename = "task.error")]
    TaskError,
    #[serde(rename = "input.required")]
    InputRequired,
    #[serde(rename = "resource.limit")]
    ResourceLimit,
    #[serde(rename = "user.spam")]
    UserSpam,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::SessionStart,
        Category::TaskAcknowledge,
        Category::TaskComplete,
        Category::TaskError,
        Category::InputRequired,
        Category::ResourceLimit,
        Category::UserSpam,
    ];

    /// Wire name used in config keys, manifests and the relay query string.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::SessionStart => "session.start",
            Category::TaskAcknowledge => "task.acknowledge",
            Category::TaskComplete => "task.complete",
            Category::TaskError => "task.error",
            Category::InputRequired => "input.required",
            Category::ResourceLimit => "resource.limit",
            Category::UserSpam => "user.spam",
        }
    }

    /// Human-readable label for `status` output.
    pub fn label(self) -> &'static str {
        match self {
            Category::SessionStart => "Session start",
            Category::TaskAcknowledge => "Task acknowledge",
            Category::TaskComplete => "Task complete",
            Category::TaskError => "Task error",
            Category::InputRequired => "Input required",
            Category::ResourceLimit => "Resource limit",
            Category::UserSpam => "Rapid prompt spam",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown category '{}'", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_parses_from_its_wire_name() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = "task.done".parse::<Category>().unwrap_err();
        assert_eq!(err.to_string(), "unknown category 'task.done'");
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Category::UserSpam).unwrap();
        assert_eq!(json, "\"user.spam\"");
        let parsed: Category = serde_json::from_str("\"input.required\"").unwrap();
        assert_eq!(parsed, Category::InputRequired);
    }

    #[test]
    fn labels_are_distinct() {
        let mut labels: Vec<_> = Category::ALL.iter().map(|c| c.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), Category::ALL.len());
    }
}

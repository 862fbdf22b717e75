use serde::{Deserialize, Serialize};

/// Project tag used for metrics when the caller does not name one.
pub const DEFAULT_PROJECT: &str = "no-project";

/// What happens to a healing's earlier results when a new attempt is saved against it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultRetention {
    /// Keep every earlier result; ranking picks the best instance per locator.
    #[default]
    Append,
    /// Mark earlier results superseded; they stay addressable for feedback only.
    Supersede,
}

impl ResultRetention {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Supersede => "supersede",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "append" => Some(Self::Append),
            "supersede" => Some(Self::Supersede),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HealingConfig {
    /// Include the page URL when deriving selector identifiers.
    pub url_for_key: bool,
    /// Push metrics on save and relocate them on feedback.
    pub collect_metrics: bool,
    pub default_project: String,
    pub result_retention: ResultRetention,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            url_for_key: false,
            collect_metrics: false,
            default_project: DEFAULT_PROJECT.to_string(),
            result_retention: ResultRetention::Append,
        }
    }
}

impl HealingConfig {
    #[must_use]
    pub fn project_or_default(&self, project: Option<&str>) -> String {
        match project {
            Some(project) if !project.is_empty() => project.to_string(),
            _ => self.default_project.clone(),
        }
    }
}

/// Pick the session key from the two header slots, primary first.
#[must_use]
pub fn resolve_session_key(primary: Option<&str>, secondary: Option<&str>) -> Option<String> {
    [primary, secondary]
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_session_key_wins_when_present() {
        assert_eq!(resolve_session_key(Some("v1"), Some("v2")), Some("v1".to_string()));
        assert_eq!(resolve_session_key(Some("v1"), Some("")), Some("v1".to_string()));
    }

    #[test]
    fn empty_primary_falls_back_to_secondary() {
        assert_eq!(resolve_session_key(Some(""), Some("v2")), Some("v2".to_string()));
        assert_eq!(resolve_session_key(None, Some("v2")), Some("v2".to_string()));
        assert_eq!(resolve_session_key(Some(""), Some("")), None);
        assert_eq!(resolve_session_key(None, None), None);
    }

    #[test]
    fn missing_project_uses_configured_default() {
        let config = HealingConfig::default();
        assert_eq!(config.project_or_default(None), DEFAULT_PROJECT);
        assert_eq!(config.project_or_default(Some("")), DEFAULT_PROJECT);
        assert_eq!(config.project_or_default(Some("checkout")), "checkout");

        let custom = HealingConfig { default_project: "sandbox".to_string(), ..config };
        assert_eq!(custom.project_or_default(None), "sandbox");
    }

    #[test]
    fn retention_round_trips_through_names() {
        for retention in [ResultRetention::Append, ResultRetention::Supersede] {
            assert_eq!(ResultRetention::parse(retention.as_str()), Some(retention));
        }
        assert_eq!(ResultRetention::parse("replace"), None);
    }
}

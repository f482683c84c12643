use std::fmt;

use serde::{Deserialize, Serialize};

/// Which remediation agent prompt a failed run is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    E2e,
    Lint,
    Type,
    Build,
    Integration,
    Test,
    Api,
    General,
}

impl AgentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E2e => "e2e",
            Self::Lint => "lint",
            Self::Type => "type",
            Self::Build => "build",
            Self::Integration => "integration",
            Self::Test => "test",
            Self::Api => "api",
            Self::General => "general",
        }
    }
}

impl fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered (needles, category) rules. A run name matches a rule when it
/// contains any needle, case-insensitively; the first matching rule wins.
///
/// Order is a defined tie-break: "API Integration Tests" is `integration`
/// because integration is checked before api, and "E2E Lint Check" is `e2e`.
pub const RULES: &[(&[&str], AgentCategory)] = &[
    (&["e2e"], AgentCategory::E2e),
    (&["lint"], AgentCategory::Lint),
    (&["type"], AgentCategory::Type),
    (&["build"], AgentCategory::Build),
    (&["integration"], AgentCategory::Integration),
    (&["test", "unit"], AgentCategory::Test),
    (&["api", "compatibility"], AgentCategory::Api),
];

pub fn classify(run_name: &str) -> AgentCategory {
    classify_with(RULES, run_name)
}

pub fn classify_with(rules: &[(&[&str], AgentCategory)], run_name: &str) -> AgentCategory {
    let name = run_name.to_lowercase();
    rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| name.contains(n)))
        .map(|(_, category)| *category)
        .unwrap_or(AgentCategory::General)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_wins_over_api() {
        assert_eq!(classify("Integration API Suite"), AgentCategory::Integration);
        assert_eq!(classify("API Integration Tests"), AgentCategory::Integration);
    }

    #[test]
    fn e2e_wins_over_lint() {
        assert_eq!(classify("E2E Lint Check"), AgentCategory::E2e);
    }

    #[test]
    fn each_category_matches_case_insensitively() {
        assert_eq!(classify("ESLint"), AgentCategory::Lint);
        assert_eq!(classify("TypeCheck"), AgentCategory::Type);
        assert_eq!(classify("Docker BUILD"), AgentCategory::Build);
        assert_eq!(classify("Unit"), AgentCategory::Test);
        assert_eq!(classify("run tests"), AgentCategory::Test);
        assert_eq!(classify("Backwards Compatibility"), AgentCategory::Api);
        assert_eq!(classify("OpenAPI schema"), AgentCategory::Api);
    }

    #[test]
    fn unmatched_name_is_general() {
        assert_eq!(classify("Deploy Preview"), AgentCategory::General);
        assert_eq!(classify(""), AgentCategory::General);
    }

    #[test]
    fn rule_order_is_data_driven() {
        let reversed: Vec<(&[&str], AgentCategory)> = RULES.iter().rev().copied().collect();
        assert_eq!(classify_with(&reversed, "API Integration Tests"), AgentCategory::Api);
        assert_eq!(classify_with(&[], "lint"), AgentCategory::General);
    }

    #[test]
    fn test_rule_precedes_api_rule() {
        // "api tests" hits the test rule before the api rule
        assert_eq!(classify("api tests"), AgentCategory::Test);
    }
}

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    None,
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    trigger: String,
    action: FilterAction,
}

impl FilterRule {
    pub fn new(trigger: impl Into<String>, action: FilterAction) -> Self {
        Self {
            trigger: trigger.into(),
            action,
        }
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn action(&self) -> FilterAction {
        self.action
    }
}

/// Ordered output filters. The first rule whose trigger occurs in a line
/// decides, so a `None` rule hides every rule after it.
#[derive(Debug, Clone, Default)]
pub struct OutputFilters {
    rules: Vec<FilterRule>,
}

impl OutputFilters {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, line: &str) -> Option<&FilterRule> {
        self.rules
            .iter()
            .find(|rule| line.contains(rule.trigger.as_str()))
            .filter(|rule| rule.action != FilterAction::None)
    }
}

use serde::{Deserialize, Serialize};

/// Place where a sample is recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Location {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub comment: String,
}

fn default_name() -> String {
    "setting".to_string()
}

/// Test scenario or feedback session a sample belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<Location>,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: String::new(),
            location: None,
        }
    }
}

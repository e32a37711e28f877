use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Person whose signals are recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(deserialize_with = "identity_from_json")]
    pub identity: String,
    #[serde(default, deserialize_with = "lowercase")]
    gender: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub comment: String,
}

fn identity_from_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(identity) => Ok(identity),
        Value::Number(identity) => Ok(identity.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "subject identity must be a string or number, got {}",
            other
        ))),
    }
}

fn lowercase<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(|gender| gender.to_lowercase()))
}

impl Subject {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            gender: None,
            age: None,
            comment: String::new(),
        }
    }

    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.set_gender(Some(gender.into()));
        self
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    pub fn gender(&self) -> Option<&str> {
        self.gender.as_deref()
    }

    /// Stored lowercase
    pub fn set_gender(&mut self, gender: Option<String>) {
        self.gender = gender.map(|gender| gender.to_lowercase());
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Subject: {}>", self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_is_lowercased() {
        let subject = Subject::new("S01").with_gender("Female");
        assert_eq!(subject.gender(), Some("female"));

        let parsed: Subject = serde_json::from_value(serde_json::json!({"identity": 7, "gender": "MALE"})).unwrap();
        assert_eq!(parsed.identity, "7");
        assert_eq!(parsed.gender(), Some("male"));
    }
}

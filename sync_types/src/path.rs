use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::identifier::check_valid_path_component;

/// The path to a query, mutation, or action function, as named in a
/// `subscribe`/`mutation`/`action` message (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryPath(String);

impl QueryPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for QueryPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_valid_path_component(s)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for QueryPath {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        check_valid_path_component(&s)?;
        Ok(Self(s))
    }
}

impl fmt::Display for QueryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for QueryPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::QueryPath;

    #[test]
    fn parses_and_displays() {
        let p = QueryPath::from_str("messages:list").unwrap();
        assert_eq!(p.as_str(), "messages:list");
        assert_eq!(p.to_string(), "messages:list");
    }

    #[test]
    fn rejects_invalid() {
        assert!(QueryPath::from_str("").is_err());
    }
}

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two collections the workflow writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Users,
    Accounts,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Accounts => "accounts",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: u32,
    pub name: String,
    pub email: String,
}

/// An account refers to its owner by id only; it never embeds the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "_id")]
    pub id: u32,
    #[serde(rename = "userId")]
    pub user_id: u32,
    pub balance: Decimal,
}

/// Selects documents by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Ids(Vec<u32>),
}

impl Filter {
    pub fn id(id: u32) -> Self {
        Filter::Ids(vec![id])
    }

    pub fn matches(&self, id: u32) -> bool {
        match self {
            Filter::All => true,
            Filter::Ids(ids) => ids.contains(&id),
        }
    }
}

/// One line of the machine readable run summary.
#[derive(Debug, Serialize, PartialEq)]
pub struct ReportRow {
    pub attempt: u32,
    pub outcome: &'static str,
    pub users: Option<u64>,
    pub accounts: Option<u64>,
    pub final_balance: Option<Decimal>,
    pub consistent: bool,
    pub diagnostic: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        assert!(Filter::All.matches(42));
        assert!(Filter::id(1).matches(1));
        assert!(!Filter::id(1).matches(2));
        assert!(Filter::Ids(vec![1, 3]).matches(3));
        assert!(!Filter::Ids(vec![]).matches(1));
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::Users.to_string(), "users");
        assert_eq!(Collection::Accounts.name(), "accounts");
    }
}

//! The identities and amounts one workflow run writes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::dto::{Account, Collection, Filter, User};

/// How much of a collection the setup step clears and verification counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupScope {
    /// Only documents sharing the fixture identities.
    Scoped,
    /// Every document in the collection.
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub user: User,
    /// The account as inserted, holding the starting balance.
    pub account: Account,
    pub adjustment: Decimal,
    pub cleanup: CleanupScope,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            user: User {
                id: 1,
                name: "Alice".to_owned(),
                email: "alice@example.com".to_owned(),
            },
            account: Account {
                id: 1,
                user_id: 1,
                balance: Decimal::from(1000),
            },
            adjustment: Decimal::from(-100),
            cleanup: CleanupScope::Scoped,
        }
    }
}

impl Fixture {
    pub fn expected_balance(&self) -> Decimal {
        self.account.balance + self.adjustment
    }

    pub fn scope(&self, collection: Collection) -> Filter {
        match (self.cleanup, collection) {
            (CleanupScope::All, _) => Filter::All,
            (CleanupScope::Scoped, Collection::Users) => Filter::id(self.user.id),
            (CleanupScope::Scoped, Collection::Accounts) => Filter::id(self.account.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_expects_900() {
        let fixture = Fixture::default();
        assert_eq!(fixture.account.balance, dec!(1000));
        assert_eq!(fixture.expected_balance(), dec!(900));
        assert_eq!(fixture.account.user_id, fixture.user.id);
    }

    #[test]
    fn test_scope_follows_cleanup_mode() {
        let mut fixture = Fixture::default();
        fixture.account.id = 7;
        assert_eq!(fixture.scope(Collection::Accounts), Filter::id(7));
        assert_eq!(fixture.scope(Collection::Users), Filter::id(1));

        fixture.cleanup = CleanupScope::All;
        assert_eq!(fixture.scope(Collection::Accounts), Filter::All);
    }
}

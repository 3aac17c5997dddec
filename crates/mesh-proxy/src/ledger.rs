//! User ledger: credentials, credit balances and login state.
//!
//! Loaded once at startup from the credential store; balances then live in
//! memory only. A user is bound to at most one session at a time, and a
//! session to at most one user.

use crate::session::SessionId;
use dashmap::DashMap;
use tracing::{debug, info};

/// Outcome of a login attempt, in the order the checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    UnknownUser,
    WrongPassword,
    AlreadyLoggedIn,
}

/// One account known to the proxy.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub password: String,
    pub credits: i64,
    pub logged_in: bool,
    /// Session currently bound to this account, if any.
    pub owner_session: Option<SessionId>,
}

/// Ledger of user accounts, keyed by name.
pub struct UserLedger {
    users: DashMap<String, UserRecord>,
}

impl UserLedger {
    /// Build the ledger from `(name, password, credits)` rows.
    pub fn new(accounts: Vec<(String, String, i64)>) -> Self {
        let users = DashMap::new();
        for (name, password, credits) in accounts {
            users.insert(
                name.clone(),
                UserRecord {
                    name,
                    password,
                    credits,
                    logged_in: false,
                    owner_session: None,
                },
            );
        }
        Self { users }
    }

    /// Try to log `name` in on `session`.
    ///
    /// Checks run in order: session not already bound, account exists,
    /// password matches, account not already bound elsewhere. A failed
    /// attempt changes nothing.
    pub fn login(&self, name: &str, password: &str, session: SessionId) -> LoginOutcome {
        // The scan runs before the record guard is taken; iterating while
        // holding a shard guard on the same map can deadlock.
        if self.find_by_session(session).is_some() {
            return LoginOutcome::AlreadyLoggedIn;
        }
        let Some(mut user) = self.users.get_mut(name) else {
            return LoginOutcome::UnknownUser;
        };
        if user.password != password {
            return LoginOutcome::WrongPassword;
        }
        if user.logged_in {
            return LoginOutcome::AlreadyLoggedIn;
        }
        user.logged_in = true;
        user.owner_session = Some(session);
        info!(user = %name, session, "user logged in");
        LoginOutcome::Success
    }

    /// Log off whichever account is bound to `session`, if any, and return
    /// its name. Clears every matching record.
    pub fn logout(&self, session: SessionId) -> Option<String> {
        let mut freed = None;
        for mut entry in self.users.iter_mut() {
            if entry.owner_session == Some(session) {
                entry.logged_in = false;
                entry.owner_session = None;
                info!(user = %entry.name, session, "user logged out");
                freed = Some(entry.name.clone());
            }
        }
        freed
    }

    /// Account currently bound to `session`.
    pub fn find_by_session(&self, session: SessionId) -> Option<UserRecord> {
        self.users
            .iter()
            .find(|entry| entry.owner_session == Some(session))
            .map(|entry| entry.value().clone())
    }

    /// Add `amount` to an account's balance and return the new balance.
    pub fn add_credits(&self, name: &str, amount: i64) -> Option<i64> {
        let mut user = self.users.get_mut(name)?;
        user.credits += amount;
        debug!(user = %name, credits = user.credits, "credits added");
        Some(user.credits)
    }

    /// Subtract `amount` from an account's balance and return the new
    /// balance. Callers check affordability first; the ledger does not.
    pub fn remove_credits(&self, name: &str, amount: i64) -> Option<i64> {
        let mut user = self.users.get_mut(name)?;
        user.credits -= amount;
        debug!(user = %name, credits = user.credits, "credits removed");
        Some(user.credits)
    }

    /// Current balance of an account.
    pub fn credits(&self, name: &str) -> Option<i64> {
        self.users.get(name).map(|user| user.credits)
    }

    /// Snapshot of every account in name order, for the console dump.
    pub fn snapshot(&self) -> Vec<UserRecord> {
        let mut records: Vec<UserRecord> =
            self.users.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Number of accounts.
    pub fn count(&self) -> usize {
        self.users.len()
    }

    /// Force an account's binding, for tests that need a preset state.
    #[cfg(test)]
    pub fn bind(&self, name: &str, session: SessionId) {
        if let Some(mut user) = self.users.get_mut(name) {
            user.logged_in = true;
            user.owner_session = Some(session);
        }
    }
}

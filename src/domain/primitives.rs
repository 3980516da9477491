//! Domain primitives: TimeMs, AccountId, ReferralCode, PlanId, EntryId, Currency.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Milliseconds in one day.
pub const DAY_MS: i64 = 86_400_000;

/// Time in milliseconds since Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeMs(pub i64);

impl TimeMs {
    /// Create a TimeMs from milliseconds.
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }

    /// Get the underlying milliseconds value.
    pub fn as_ms(&self) -> i64 {
        self.0
    }

    /// This instant shifted forward by whole days.
    pub fn plus_days(&self, days: u32) -> Self {
        TimeMs(self.0.saturating_add(i64::from(days).saturating_mul(DAY_MS)))
    }
}

impl std::fmt::Display for TimeMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Member account identifier, assigned by the registration flow.
    AccountId
);
string_id!(
    /// Public code a member shares to recruit new members.
    ReferralCode
);
string_id!(
    /// Identifier of a fixed-term plan or matrix board in the catalog.
    PlanId
);
string_id!(
    /// Ledger entry identifier.
    EntryId
);
string_id!(
    /// ISO-4217 style currency code.
    Currency
);

impl EntryId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        EntryId(uuid::Uuid::new_v4().to_string())
    }
}

impl ReferralCode {
    /// Derive a referral code from an account id.
    ///
    /// `attempt` salts the hash so callers can retry on the (unlikely) event of a
    /// collision with an existing code.
    pub fn derive(account: &AccountId, attempt: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((account.as_str().len() as u32).to_le_bytes());
        hasher.update(account.as_str().as_bytes());
        hasher.update(attempt.to_le_bytes());
        let hash = hasher.finalize();
        ReferralCode(hex::encode(&hash[..5]).to_uppercase())
    }

    /// Codes are case-insensitive on input.
    pub fn normalized(&self) -> Self {
        ReferralCode(self.0.trim().to_uppercase())
    }
}

/// Member status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "inactive" => Some(AccountStatus::Inactive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referral_code_is_deterministic_and_salted() {
        let account = AccountId::new("alice");
        let a = ReferralCode::derive(&account, 0);
        let b = ReferralCode::derive(&account, 0);
        let c = ReferralCode::derive(&account, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 10);
        assert_eq!(a.as_str(), a.as_str().to_uppercase());
    }

    #[test]
    fn test_referral_code_normalized() {
        let code = ReferralCode::new(" ab12cd ");
        assert_eq!(code.normalized().as_str(), "AB12CD");
    }

    #[test]
    fn test_plus_days() {
        let start = TimeMs::new(1_000);
        assert_eq!(start.plus_days(2).as_ms(), 1_000 + 2 * DAY_MS);
    }

    #[test]
    fn test_account_status_roundtrip() {
        for status in [AccountStatus::Active, AccountStatus::Inactive] {
            assert_eq!(AccountStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AccountStatus::parse("banned"), None);
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = AccountId::new("bob");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"bob\"");
    }
}

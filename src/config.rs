use crate::domain::{CommissionSchedule, Currency, Decimal, PlanCatalog};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub currency: Currency,
    pub minor_units: u32,
    pub deposit_commission: CommissionSchedule,
    pub inactive_ancestor_policy: InactiveAncestorPolicy,
    pub reentry_funding: ReentryFunding,
    pub require_active_referrer: bool,
    pub sweep_interval_secs: u64,
    pub auto_close_matured: bool,
    pub plans: PlanCatalog,
}

/// What happens to a commission level whose ancestor is inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactiveAncestorPolicy {
    /// The level goes unpaid; slots stay fixed to hop distance.
    Forfeit,
    /// Later active ancestors (within the five visited) move up into the slot.
    Compress,
}

/// Where the matrix re-entry debit is funded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReentryFunding {
    /// Net settlement: the debit is covered by the payout posted with it.
    Payout,
    /// The debit must be covered by the balance held before the payout.
    Balance,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let currency = env_map
            .get("CURRENCY")
            .map(|s| s.trim().to_uppercase())
            .unwrap_or_else(|| "USD".to_string());
        if currency.is_empty() {
            return Err(ConfigError::InvalidValue(
                "CURRENCY".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let minor_units = env_map
            .get("CURRENCY_MINOR_UNITS")
            .map(|s| s.as_str())
            .unwrap_or("2")
            .parse::<u32>()
            .ok()
            .filter(|units| *units <= 8)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "CURRENCY_MINOR_UNITS".to_string(),
                    "must be an integer between 0 and 8".to_string(),
                )
            })?;

        let deposit_commission = parse_rates(
            env_map
                .get("DEPOSIT_COMMISSION_RATES")
                .map(|s| s.as_str())
                .unwrap_or("10,5,3,2,1"),
        )?;

        let inactive_ancestor_policy = match env_map
            .get("INACTIVE_ANCESTOR_POLICY")
            .map(|s| s.as_str())
            .unwrap_or("forfeit")
        {
            "forfeit" => InactiveAncestorPolicy::Forfeit,
            "compress" => InactiveAncestorPolicy::Compress,
            other => {
                return Err(ConfigError::InvalidValue(
                    "INACTIVE_ANCESTOR_POLICY".to_string(),
                    format!("must be forfeit or compress, got {}", other),
                ))
            }
        };

        let reentry_funding = match env_map
            .get("MATRIX_REENTRY_FUNDING")
            .map(|s| s.as_str())
            .unwrap_or("payout")
        {
            "payout" => ReentryFunding::Payout,
            "balance" => ReentryFunding::Balance,
            other => {
                return Err(ConfigError::InvalidValue(
                    "MATRIX_REENTRY_FUNDING".to_string(),
                    format!("must be payout or balance, got {}", other),
                ))
            }
        };

        let require_active_referrer = parse_bool(&env_map, "REQUIRE_ACTIVE_REFERRER", true)?;
        let auto_close_matured = parse_bool(&env_map, "AUTO_CLOSE_MATURED", false)?;

        let sweep_interval_secs = env_map
            .get("SWEEP_INTERVAL_SECS")
            .map(|s| s.as_str())
            .unwrap_or("60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "SWEEP_INTERVAL_SECS".to_string(),
                    "must be a valid u64".to_string(),
                )
            })?;

        let plans = match env_map.get("PLANS_FILE") {
            Some(path) => PlanCatalog::from_file(path)
                .map_err(|e| ConfigError::InvalidValue("PLANS_FILE".to_string(), e.to_string()))?,
            None => PlanCatalog::builtin(),
        };
        plans.validate_scale(minor_units).map_err(|e| {
            ConfigError::InvalidValue("PLANS_FILE".to_string(), e.to_string())
        })?;

        Ok(Config {
            port,
            database_path,
            currency: Currency::new(currency),
            minor_units,
            deposit_commission,
            inactive_ancestor_policy,
            reentry_funding,
            require_active_referrer,
            sweep_interval_secs,
            auto_close_matured,
            plans,
        })
    }

    /// Defaults suitable for tests and local runs against `database_path`.
    pub fn for_database(database_path: impl Into<String>) -> Self {
        let d = |v: i64| Decimal::from_i64(v);
        Config {
            port: 0,
            database_path: database_path.into(),
            currency: Currency::new("USD"),
            minor_units: 2,
            deposit_commission: CommissionSchedule::new(vec![d(10), d(5), d(3), d(2), d(1)]),
            inactive_ancestor_policy: InactiveAncestorPolicy::Forfeit,
            reentry_funding: ReentryFunding::Payout,
            require_active_referrer: true,
            sweep_interval_secs: 0,
            auto_close_matured: false,
            plans: PlanCatalog::builtin(),
        }
    }
}

fn parse_rates(raw: &str) -> Result<CommissionSchedule, ConfigError> {
    let invalid = |msg: String| ConfigError::InvalidValue("DEPOSIT_COMMISSION_RATES".to_string(), msg);

    let rates = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| Decimal::from_str(s).map_err(|_| invalid(format!("{} is not a number", s))))
        .collect::<Result<Vec<_>, _>>()?;

    let schedule = CommissionSchedule::new(rates);
    schedule.validate("deposit").map_err(|e| invalid(e.to_string()))?;
    Ok(schedule)
}

fn parse_bool(
    env_map: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match env_map.get(key).map(|s| s.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(v) if v == "false" || v == "0" => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("must be true or false, got {}", v),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.currency.as_str(), "USD");
        assert_eq!(config.minor_units, 2);
        assert_eq!(config.deposit_commission.levels(), 5);
        assert_eq!(
            config.deposit_commission.rate_for(1),
            Some(Decimal::from_i64(10))
        );
        assert_eq!(config.inactive_ancestor_policy, InactiveAncestorPolicy::Forfeit);
        assert_eq!(config.reentry_funding, ReentryFunding::Payout);
        assert!(config.require_active_referrer);
        assert!(!config.auto_close_matured);
        assert_eq!(config.plans, PlanCatalog::builtin());
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PORT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_invalid_commission_rates() {
        let mut env_map = setup_required_env();
        env_map.insert(
            "DEPOSIT_COMMISSION_RATES".to_string(),
            "10,5,3,2,1,1".to_string(),
        );
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "DEPOSIT_COMMISSION_RATES"),
            _ => panic!("Expected InvalidValue error"),
        }

        let mut env_map = setup_required_env();
        env_map.insert("DEPOSIT_COMMISSION_RATES".to_string(), "ten".to_string());
        assert!(Config::from_env_map(env_map).is_err());
    }

    #[test]
    fn test_empty_rates_disable_deposit_commission() {
        let mut env_map = setup_required_env();
        env_map.insert("DEPOSIT_COMMISSION_RATES".to_string(), "".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.deposit_commission.levels(), 0);
    }

    #[test]
    fn test_invalid_policy() {
        let mut env_map = setup_required_env();
        env_map.insert("INACTIVE_ANCESTOR_POLICY".to_string(), "roll".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "INACTIVE_ANCESTOR_POLICY"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_compress_and_balance_funding() {
        let mut env_map = setup_required_env();
        env_map.insert("INACTIVE_ANCESTOR_POLICY".to_string(), "compress".to_string());
        env_map.insert("MATRIX_REENTRY_FUNDING".to_string(), "balance".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.inactive_ancestor_policy, InactiveAncestorPolicy::Compress);
        assert_eq!(config.reentry_funding, ReentryFunding::Balance);
    }

    #[test]
    fn test_invalid_bool() {
        let mut env_map = setup_required_env();
        env_map.insert("AUTO_CLOSE_MATURED".to_string(), "sometimes".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "AUTO_CLOSE_MATURED"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_missing_plans_file() {
        let mut env_map = setup_required_env();
        env_map.insert(
            "PLANS_FILE".to_string(),
            "/nonexistent/plans.json".to_string(),
        );
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PLANS_FILE"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_plans_file_amounts_must_fit_minor_units() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("plans.json");
        std::fs::write(
            &path,
            r#"{
                "fixedTerm": [],
                "matrix": [{
                    "id": "b1", "name": "B1", "price": "25.001", "requiredReferrals": 3,
                    "totalIncome": "60", "reEntryAmount": "0", "totalIncomeAfterReEntry": "60",
                    "commission": {"ratesPct": []}
                }]
            }"#,
        )
        .unwrap();

        let mut env_map = setup_required_env();
        env_map.insert("PLANS_FILE".to_string(), path.to_string_lossy().to_string());
        match Config::from_env_map(env_map.clone()) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PLANS_FILE"),
            other => panic!("Expected InvalidValue error, got {:?}", other.map(|_| ())),
        }

        env_map.insert("CURRENCY_MINOR_UNITS".to_string(), "3".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.plans.matrix[0].price.to_canonical_string(), "25.001");
    }

    #[test]
    fn test_builtin_plans_fit_zero_minor_units() {
        let mut env_map = setup_required_env();
        env_map.insert("CURRENCY_MINOR_UNITS".to_string(), "0".to_string());
        assert_eq!(Config::from_env_map(env_map).unwrap().minor_units, 0);
    }

    #[test]
    fn test_for_database() {
        let config = Config::for_database("/tmp/x.db");
        assert_eq!(config.database_path, "/tmp/x.db");
        assert_eq!(config.sweep_interval_secs, 0);
    }
}

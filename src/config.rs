use std::{collections::HashMap, env, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub cors_origins: Vec<String>,
    pub stripe: StripeConfig,
    pub checkout: CheckoutConfig,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub webhook_tolerance: Duration,
}

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub default_currency: String,
    /// Tax rate in basis points (1000 = 10%).
    pub tax_rate_bps: i64,
    pub shipping_rates: HashMap<String, i64>,
    pub discount_codes: HashMap<String, i64>,
    pub payment_timeout: Duration,
    pub reservation_ttl: chrono::Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            tax_rate_bps: 1000,
            shipping_rates: HashMap::from([("standard".to_string(), 0)]),
            discount_codes: HashMap::new(),
            payment_timeout: Duration::from_secs(10),
            reservation_ttl: chrono::Duration::minutes(15),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from `lookup`. Present but malformed values
    /// are errors, absent ones take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |key: &str| lookup(key).with_context(|| format!("{key} is not set"));
        let database_url = required("DATABASE_URL")?;
        let host = lookup("APP_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_or(&lookup, "APP_PORT", 3000)?;
        let jwt_secret = required("JWT_SECRET")?;
        let jwt_ttl_hours: i64 = parse_or(&lookup, "JWT_TTL_HOURS", 24)?;
        anyhow::ensure!(jwt_ttl_hours > 0, "JWT_TTL_HOURS must be positive");
        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let stripe = StripeConfig {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            api_base: lookup("STRIPE_API_BASE")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            webhook_tolerance: Duration::from_secs(parse_or(
                &lookup,
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                300,
            )?),
        };

        let defaults = CheckoutConfig::default();
        let shipping_rates = match lookup("SHIPPING_RATES") {
            Some(raw) => parse_amount_table(&raw).context("invalid SHIPPING_RATES")?,
            None => defaults.shipping_rates,
        };
        let discount_codes = match lookup("DISCOUNT_CODES") {
            Some(raw) => parse_amount_table(&raw).context("invalid DISCOUNT_CODES")?,
            None => defaults.discount_codes,
        };

        let tax_rate_bps = parse_or(&lookup, "TAX_RATE_BPS", defaults.tax_rate_bps)?;
        anyhow::ensure!(tax_rate_bps >= 0, "TAX_RATE_BPS must not be negative");
        let payment_timeout_secs: u64 = parse_or(&lookup, "PAYMENT_TIMEOUT_SECS", 10)?;
        anyhow::ensure!(payment_timeout_secs > 0, "PAYMENT_TIMEOUT_SECS must be positive");
        let reservation_ttl_minutes: i64 = parse_or(&lookup, "RESERVATION_TTL_MINUTES", 15)?;
        anyhow::ensure!(
            reservation_ttl_minutes > 0,
            "RESERVATION_TTL_MINUTES must be positive"
        );

        let checkout = CheckoutConfig {
            default_currency: lookup("DEFAULT_CURRENCY")
                .map(|c| c.trim().to_uppercase())
                .unwrap_or(defaults.default_currency),
            tax_rate_bps,
            shipping_rates,
            discount_codes,
            payment_timeout: Duration::from_secs(payment_timeout_secs),
            reservation_ttl: chrono::Duration::minutes(reservation_ttl_minutes),
        };

        Ok(Self {
            port,
            database_url,
            host,
            jwt_secret,
            jwt_ttl_hours,
            cors_origins,
            stripe,
            checkout,
        })
    }
}

fn parse_or<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {key}: `{raw}`")),
        None => Ok(default),
    }
}

/// Parses `name=amount,name=amount` into a lookup table of minor-unit amounts.
pub fn parse_amount_table(raw: &str) -> anyhow::Result<HashMap<String, i64>> {
    let mut table = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, amount) = entry
            .split_once('=')
            .with_context(|| format!("expected name=amount, got `{entry}`"))?;
        let amount: i64 = amount
            .trim()
            .parse()
            .with_context(|| format!("invalid amount in `{entry}`"))?;
        anyhow::ensure!(amount >= 0, "negative amount in `{entry}`");
        table.insert(name.trim().to_string(), amount);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut vars: HashMap<String, String> = HashMap::from([
            ("DATABASE_URL".to_string(), "postgres://localhost/shop".to_string()),
            ("JWT_SECRET".to_string(), "secret".to_string()),
            ("STRIPE_SECRET_KEY".to_string(), "sk_test".to_string()),
            ("STRIPE_WEBHOOK_SECRET".to_string(), "whsec".to_string()),
        ]);
        for (key, value) in pairs {
            vars.insert(key.to_string(), value.to_string());
        }
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_optional_values_are_absent() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.checkout.tax_rate_bps, 1000);
        assert_eq!(config.checkout.payment_timeout, Duration::from_secs(10));
        assert_eq!(config.checkout.reservation_ttl, chrono::Duration::minutes(15));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("TAX_RATE_BPS", "ten")])).unwrap_err();
        assert!(err.to_string().contains("TAX_RATE_BPS"));

        let err =
            AppConfig::from_lookup(lookup_from(&[("PAYMENT_TIMEOUT_SECS", "5s")])).unwrap_err();
        assert!(err.to_string().contains("PAYMENT_TIMEOUT_SECS"));
    }

    #[test]
    fn negative_tax_rate_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("TAX_RATE_BPS", "-100")])).unwrap_err();
        assert!(err.to_string().contains("TAX_RATE_BPS"));
    }

    #[test]
    fn missing_required_value_is_reported() {
        let lookup = lookup_from(&[]);
        let err = AppConfig::from_lookup(|key| (key != "JWT_SECRET").then(|| lookup(key)).flatten())
            .unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }
}

//! Authority policy configuration.

use time::Duration;

use crate::error::CaError;

/// Policy of one certificate authority.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Common name of the authority's CA certificates.
    pub ca_common_name: String,
    /// Lifetime of issued certificates.
    pub crt_life_time: Duration,
    /// CA certificate lifetime, in multiples of `crt_life_time`.
    pub ca_life_period: u32,
    /// Validity of a generated CRL.
    pub crl_life_time: Duration,
    /// Amount of CSRs approved without operator action.
    pub auto_sign_csr_amount: u64,
    /// Persist `auto_sign_csr_amount` permanently on first start.
    pub lock_auto_sign_csr_amount: bool,
    /// CRL distribution point embedded in issued certificates.
    pub crl_url: Option<String>,
}

impl AuthorityConfig {
    /// Creates a config with default policy: no auto-signing, CA certificates
    /// living four certificate lifetimes, CRLs valid for a day.
    pub fn new(ca_common_name: impl Into<String>, crt_life_time: Duration) -> Self {
        Self {
            ca_common_name: ca_common_name.into(),
            crt_life_time,
            ca_life_period: 4,
            crl_life_time: Duration::days(1),
            auto_sign_csr_amount: 0,
            lock_auto_sign_csr_amount: false,
            crl_url: None,
        }
    }

    /// Sets the amount of automatically approved CSRs.
    pub fn with_auto_sign_csr_amount(mut self, amount: u64) -> Self {
        self.auto_sign_csr_amount = amount;
        self
    }

    /// Locks the auto-sign amount on first start.
    pub fn with_locked_auto_sign(mut self, lock: bool) -> Self {
        self.lock_auto_sign_csr_amount = lock;
        self
    }

    /// Sets the CRL distribution point URL.
    pub fn with_crl_url(mut self, url: impl Into<String>) -> Self {
        self.crl_url = Some(url.into());
        self
    }

    /// Validates the config.
    pub fn validate(&self) -> Result<(), CaError> {
        if self.ca_common_name.is_empty() {
            return Err(CaError::InvalidConfig(
                "CA common name cannot be empty".into(),
            ));
        }
        if self.crt_life_time <= Duration::ZERO {
            return Err(CaError::InvalidConfig(
                "certificate lifetime must be positive".into(),
            ));
        }
        // The CA is renewed when it has less than two certificate lifetimes
        // left, so it must live longer than that.
        if self.ca_life_period < 3 {
            return Err(CaError::InvalidConfig("ca_life_period must be at least 3".into()));
        }
        if self.crl_life_time <= Duration::ZERO {
            return Err(CaError::InvalidConfig("CRL lifetime must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AuthorityConfig::new("Caucase CAS", Duration::days(93))
            .validate()
            .unwrap();
    }

    #[test]
    fn test_short_ca_life_rejected() {
        let mut config = AuthorityConfig::new("Caucase CAS", Duration::days(93));
        config.ca_life_period = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lifetime_rejected() {
        assert!(AuthorityConfig::new("Caucase CAS", Duration::ZERO)
            .validate()
            .is_err());
    }
}

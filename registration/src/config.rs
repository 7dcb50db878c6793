use std::time::Duration;

use anyhow::bail;

pub struct RegistrationConfig {
    /// how often the provider re-broadcasts everything it owns
    pub refresh_interval: Duration,

    /// A remote entity that has not been re-announced for this long is
    ///  considered gone. Must leave room for several refresh cycles so a
    ///  few lost datagrams do not flap the view.
    pub registration_timeout: Duration,

    /// whether samples originating from this very process are applied to
    ///  the local view as well
    pub loopback: bool,
}

impl RegistrationConfig {
    pub fn default_local() -> RegistrationConfig {
        RegistrationConfig {
            refresh_interval: Duration::from_millis(1000),
            registration_timeout: Duration::from_millis(60 * 1000),
            loopback: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_interval.is_zero() {
            bail!("a refresh interval of zero would busy-loop");
        }
        if self.registration_timeout <= self.refresh_interval {
            bail!(
                "registration timeout {:?} must exceed the refresh interval {:?}, otherwise entries expire between refreshes",
                self.registration_timeout, self.refresh_interval
            );
        }
        Ok(())
    }
}


/// Identity of the local process, stamped into every descriptor this
///  process broadcasts and used to recognize looped-back samples.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessIdentity {
    pub host_name: String,
    pub pid: i32,
    pub process_name: String,
    pub unit_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(RegistrationConfig::default_local(), true)]
    #[case::zero_refresh(RegistrationConfig { refresh_interval: Duration::ZERO, ..RegistrationConfig::default_local() }, false)]
    #[case::timeout_below_refresh(RegistrationConfig {
        refresh_interval: Duration::from_secs(2),
        registration_timeout: Duration::from_secs(1),
        ..RegistrationConfig::default_local()
    }, false)]
    fn test_validate(#[case] config: RegistrationConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}

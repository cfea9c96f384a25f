use crate::*;
use std::env::var;
use std::time::Duration;

/// Runtime configuration, built once and handed to each component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Relay endpoints (`ws://` or `wss://`)
    pub relays: Vec<String>,

    /// The election commission's public identity on the relay network
    pub ec_public_key: String,

    /// How long to wait for the commission's blind signature
    pub signature_timeout: Duration,

    /// How often the election list is reconciled against the relay
    pub reconcile_interval: Duration,

    /// How long each reconciliation pass listens for stored events
    pub reconcile_window: Duration,

    /// How long to wait for the first election before reporting none
    pub initial_grace: Duration,

    /// Elections that ended longer ago than this are hidden
    pub retention: Duration,
}

impl Config {
    pub fn new(relays: Vec<String>, ec_public_key: &str) -> Self {
        Config {
            relays,
            ec_public_key: ec_public_key.to_owned(),
            signature_timeout: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(30),
            reconcile_window: Duration::from_secs(5),
            initial_grace: Duration::from_secs(1),
            retention: Duration::from_secs(12 * 60 * 60),
        }
    }

    /// Load configuration from `BLINDVOTE_*` environment variables
    pub fn from_env() -> Result<Self, Error> {
        let relays = match var("BLINDVOTE_RELAYS") {
            Ok(val) => parse_relays(&val),
            Err(_e) => {
                return Err(Error::Configuration(
                    "BLINDVOTE_RELAYS environment variable must be set".to_owned(),
                ))
            }
        };

        let ec_public_key = match var("BLINDVOTE_EC_PUBLIC_KEY") {
            Ok(val) => val,
            Err(_e) => {
                return Err(Error::Configuration(
                    "BLINDVOTE_EC_PUBLIC_KEY environment variable must be set".to_owned(),
                ))
            }
        };

        let mut config = Config::new(relays, ec_public_key.trim());

        if let Ok(val) = var("BLINDVOTE_SIGNATURE_TIMEOUT_SECS") {
            let secs: u64 = val.trim().parse().map_err(|_| {
                Error::Configuration(format!("invalid BLINDVOTE_SIGNATURE_TIMEOUT_SECS: {}", val))
            })?;
            config.signature_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.relays.is_empty() {
            return Err(Error::Configuration("no relays configured".to_owned()));
        }
        for relay in &self.relays {
            if !(relay.starts_with("ws://") || relay.starts_with("wss://")) {
                return Err(Error::Configuration(format!(
                    "relay {} is not a ws:// or wss:// URL",
                    relay
                )));
            }
        }
        if self.ec_public_key.trim().is_empty() {
            return Err(Error::Configuration(
                "election commission public key is empty".to_owned(),
            ));
        }

        let durations = [
            ("signature_timeout", self.signature_timeout),
            ("reconcile_interval", self.reconcile_interval),
            ("reconcile_window", self.reconcile_window),
            ("initial_grace", self.initial_grace),
            ("retention", self.retention),
        ];
        for (name, duration) in durations.iter() {
            if duration.as_nanos() == 0 {
                return Err(Error::Configuration(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::hours(12))
    }
}

/// Split a comma-separated relay list, as in `BLINDVOTE_RELAYS`
pub fn parse_relays(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new(vec!["wss://relay.example".into()], "ec");
        config.validate().unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.initial_grace, Duration::from_secs(1));
        assert_eq!(config.retention_window(), chrono::Duration::hours(12));
    }

    #[test]
    fn invalid_configs() {
        assert!(matches!(
            Config::new(vec![], "ec").validate(),
            Err(Error::Configuration(_))
        ));
        assert!(Config::new(vec!["http://relay".into()], "ec").validate().is_err());
        assert!(Config::new(vec!["wss://relay".into()], " ").validate().is_err());

        let mut config = Config::new(vec!["wss://relay".into()], "ec");
        config.signature_timeout = Duration::from_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn relay_lists() {
        assert_eq!(
            parse_relays(" wss://a.example,,wss://b.example , "),
            vec!["wss://a.example", "wss://b.example"]
        );
        assert!(parse_relays(" , ").is_empty());
    }

    #[test]
    fn from_env() {
        // Only this test touches these variables
        std::env::remove_var("BLINDVOTE_RELAYS");
        assert!(matches!(Config::from_env(), Err(Error::Configuration(_))));

        std::env::set_var("BLINDVOTE_RELAYS", "wss://a.example, wss://b.example");
        std::env::set_var("BLINDVOTE_EC_PUBLIC_KEY", "ec-key");
        std::env::set_var("BLINDVOTE_SIGNATURE_TIMEOUT_SECS", "5");
        let config = Config::from_env().unwrap();
        assert_eq!(config.relays, vec!["wss://a.example", "wss://b.example"]);
        assert_eq!(config.ec_public_key, "ec-key");
        assert_eq!(config.signature_timeout, Duration::from_secs(5));

        std::env::set_var("BLINDVOTE_SIGNATURE_TIMEOUT_SECS", "soon");
        assert!(Config::from_env().is_err());
        std::env::remove_var("BLINDVOTE_SIGNATURE_TIMEOUT_SECS");
    }
}

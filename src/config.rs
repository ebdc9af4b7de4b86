use std::time::Duration;

use anyhow::bail;

/// Settings for a [`crate::session::Session`], fixed at construction time.
pub struct SessionConfig {
    /// Server hostname the control connection is opened to.
    pub host: String,

    /// Control port.
    pub port: u16,

    /// Username for the implicit login chain.
    pub user: String,

    /// Password for the implicit login chain. FTP servers traditionally
    ///  expect an email-shaped password for anonymous access, hence the
    ///  default of `@anonymous`.
    pub pass: String,

    /// Skip the `STAT` probe in `ls` and always go through `LIST`. Some
    ///  servers answer `STAT` with listings in non-standard shapes (or not
    ///  at all); setting this avoids the first failed round trip.
    pub use_list: bool,

    /// Idle timeout applied to reads on the control connection and to all
    ///  traffic on passive data connections. An idle control connection is
    ///  only reported (via [`crate::events::SessionEvent::Timeout`]); an
    ///  idle data connection is closed and its transfer failed.
    pub timeout: Duration,

    /// Default period for the `NOOP` keep-alive timer when
    ///  [`crate::session::Session::keep_alive`] is called without one.
    pub keep_alive_interval: Duration,

    /// Bound of the session event queue. Events are dropped (and logged)
    ///  rather than blocking protocol progress when listeners fall behind.
    pub event_queue_size: usize,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>) -> SessionConfig {
        SessionConfig {
            host: host.into(),
            port: 21,
            user: "anonymous".to_string(),
            pass: "@anonymous".to_string(),
            use_list: false,
            timeout: Duration::from_secs(600),
            keep_alive_interval: Duration::from_secs(30),
            event_queue_size: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.timeout.is_zero() {
            bail!("idle timeout must not be zero");
        }
        if self.event_queue_size == 0 {
            bail!("event queue size must not be 0");
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new("localhost")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 21);
        assert_eq!(config.user, "anonymous");
        assert_eq!(config.pass, "@anonymous");
        assert!(!config.use_list);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        let mut config = SessionConfig::new("");
        assert!(config.validate().is_err());

        config = SessionConfig::new("ftp.example.org");
        config.port = 0;
        assert!(config.validate().is_err());

        config = SessionConfig::new("ftp.example.org");
        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = SessionConfig::new("ftp.example.org");
        config.event_queue_size = 0;
        assert!(config.validate().is_err());
    }
}

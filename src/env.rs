//! Runtime environment detection.
//!
//! Single source of truth for test/development/production switches, driven
//! by the `SHUFFLEBOX_ENV` environment variable. Test mode redirects the
//! config directory to a throwaway location so test runs never touch a real
//! installation.

/// Runtime environment for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - throwaway config dir, no real installation touched.
    Test,
}

impl Environment {
    /// Detect the current environment from `SHUFFLEBOX_ENV`.
    #[must_use]
    pub fn current() -> Self {
        match std::env::var("SHUFFLEBOX_ENV").as_deref() {
            Ok("test") => Self::Test,
            Ok("development") | Ok("dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the production environment.
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience check for test mode.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

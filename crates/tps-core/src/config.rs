//! Domain configuration.
//!
//! Two environment variables are honored by [`TpsConfig::from_env`]:
//! - `TPS_FAULT_REPORTING`: `report` (aliases `on`, `1`, `true`, `segv`)
//!   installs the protection-violation observer on `init`; anything else,
//!   including unset, leaves faults to the host's default handling.
//! - `TPS_MAX_PAGES`: upper bound on simultaneously reserved regions. Unset
//!   or unparsable means unbounded.

/// Whether `init` installs the protection-violation observer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultReporting {
    /// Faults keep the host's default behavior.
    #[default]
    Off,
    /// Faults on private storage pages print a diagnostic before the process dies.
    Report,
}

impl FaultReporting {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" | "on" | "1" | "true" | "yes" | "segv" => Self::Report,
            _ => Self::Off,
        }
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        matches!(self, Self::Report)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Report => "report",
        }
    }
}

/// Per-domain settings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TpsConfig {
    /// Reporting mode used by [`crate::TpsDomain::init_from_config`].
    pub fault_reporting: FaultReporting,
    /// Maximum number of regions the domain may hold at once.
    pub max_pages: Option<usize>,
}

impl TpsConfig {
    /// Environment variable selecting [`FaultReporting`].
    pub const FAULT_REPORTING_ENV: &'static str = "TPS_FAULT_REPORTING";
    /// Environment variable bounding reserved regions.
    pub const MAX_PAGES_ENV: &'static str = "TPS_MAX_PAGES";

    /// Resolve configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fault_reporting = lookup(Self::FAULT_REPORTING_ENV)
            .map(|v| FaultReporting::from_str_loose(&v))
            .unwrap_or_default();
        let max_pages = lookup(Self::MAX_PAGES_ENV).and_then(|v| parse_page_budget(&v));
        Self {
            fault_reporting,
            max_pages,
        }
    }

    #[must_use]
    pub fn with_fault_reporting(mut self, mode: FaultReporting) -> Self {
        self.fault_reporting = mode;
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}

fn parse_page_budget(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("unlimited") {
        return None;
    }
    raw.replace('_', "").parse().ok()
}

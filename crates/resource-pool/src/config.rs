//! Pool configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Environment variable read by [`PoolConfig::default`] for the declared size.
pub const POOL_SIZE_ENV: &str = "RESOURCE_POOL_SIZE";

const DEFAULT_POOL_NAME: &str = "default";

/// Declared capacity of a pool, or an availability reading.
///
/// Serializes as an integer, or `null` when unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<usize>", into = "Option<usize>")]
pub enum Capacity {
    Bounded(usize),
    #[default]
    Unbounded,
}

impl Capacity {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Self::Unbounded)
    }

    /// The bounded value, if any.
    pub fn get(&self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(*n),
            Self::Unbounded => None,
        }
    }

    /// Whether `units` fit in this much room.
    pub fn fits(&self, units: usize) -> bool {
        match self {
            Self::Bounded(n) => units <= *n,
            Self::Unbounded => true,
        }
    }

    /// Room left once `usage` units are taken, floored at zero.
    pub(crate) fn remaining_after(&self, usage: usize) -> Self {
        match self {
            Self::Bounded(n) => Self::Bounded(n.saturating_sub(usage)),
            Self::Unbounded => Self::Unbounded,
        }
    }
}

impl From<usize> for Capacity {
    fn from(n: usize) -> Self {
        Self::Bounded(n)
    }
}

impl From<Option<usize>> for Capacity {
    fn from(n: Option<usize>) -> Self {
        n.map_or(Self::Unbounded, Self::Bounded)
    }
}

impl From<Capacity> for Option<usize> {
    fn from(capacity: Capacity) -> Self {
        capacity.get()
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{n}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Name attached to every log event emitted by the pool.
    #[serde(default = "default_name")]
    pub name: String,
    /// Declared capacity.
    #[serde(default)]
    pub size: Capacity,
}

fn default_name() -> String {
    DEFAULT_POOL_NAME.to_string()
}

impl Default for PoolConfig {
    /// Unbounded unless `RESOURCE_POOL_SIZE` holds a unit count.
    fn default() -> Self {
        Self {
            name: default_name(),
            size: Self::size_from_env_value(std::env::var(POOL_SIZE_ENV).ok().as_deref()),
        }
    }
}

impl PoolConfig {
    pub fn new(size: Capacity) -> Self {
        Self {
            name: default_name(),
            size,
        }
    }

    pub fn bounded(size: usize) -> Self {
        Self::new(Capacity::Bounded(size))
    }

    pub fn unbounded() -> Self {
        Self::new(Capacity::Unbounded)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parse a size as found in `RESOURCE_POOL_SIZE`.
    ///
    /// Missing, empty and `unbounded` mean unbounded. Anything else that is not
    /// a unit count is logged and treated as unbounded.
    pub fn size_from_env_value(value: Option<&str>) -> Capacity {
        let Some(value) = value.map(str::trim) else {
            return Capacity::Unbounded;
        };
        if value.is_empty() || value.eq_ignore_ascii_case("unbounded") {
            return Capacity::Unbounded;
        }
        match value.parse::<usize>() {
            Ok(n) => Capacity::Bounded(n),
            Err(e) => {
                tracing::warn!(value, error = %e, "Invalid {POOL_SIZE_ENV}, using unbounded pool");
                Capacity::Unbounded
            }
        }
    }
}

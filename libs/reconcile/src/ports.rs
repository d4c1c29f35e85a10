//! Finite pool of worker ports.

use std::collections::BTreeSet;
use std::str::FromStr;

use thiserror::Error;

/// Port pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the range is held.
    #[error("port pool exhausted: {0}")]
    PoolExhausted(PortRange),

    /// Released port does not belong to the pool's range.
    #[error("port {port} is outside {range}")]
    OutOfRange { port: u16, range: PortRange },

    /// Released port was not held.
    #[error("port {0} is not allocated")]
    NotAllocated(u16),

    /// Range string could not be parsed.
    #[error("invalid port range: {0}")]
    InvalidRange(String),
}

/// Inclusive port range. Bounds are normalised so that `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    /// Create a range from two bounds given in either order.
    pub const fn new(a: u16, b: u16) -> Self {
        if a <= b {
            Self { min: a, max: b }
        } else {
            Self { min: b, max: a }
        }
    }

    /// Lowest port in the range.
    pub const fn min(&self) -> u16 {
        self.min
    }

    /// Highest port in the range.
    pub const fn max(&self) -> u16 {
        self.max
    }

    /// Number of ports in the range.
    pub const fn len(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    /// A range always holds at least one port.
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if the port lies inside the range.
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    /// Parse `"min-max"`; reversed bounds are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((a, b)) = s.split_once('-') else {
            return Err(PortError::InvalidRange(format!("missing '-' in {s:?}")));
        };

        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| PortError::InvalidRange(format!("{part:?}: {e}")))
        };

        Ok(Self::new(parse(a)?, parse(b)?))
    }
}

/// Pool of available ports drawn from one contiguous range.
///
/// Holders must hand their port back through [`PortPool::release`]; a port
/// that is never released stays unavailable for the lifetime of the pool.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    available: BTreeSet<u16>,
}

impl PortPool {
    /// Create a pool holding every port of the range.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            available: (range.min..=range.max).collect(),
        }
    }

    /// Take the lowest free port.
    pub fn allocate(&mut self) -> Result<u16, PortError> {
        self.available
            .pop_first()
            .ok_or(PortError::PoolExhausted(self.range))
    }

    /// Return a port to the pool.
    pub fn release(&mut self, port: u16) -> Result<(), PortError> {
        if !self.range.contains(port) {
            return Err(PortError::OutOfRange {
                port,
                range: self.range,
            });
        }

        if !self.available.insert(port) {
            return Err(PortError::NotAllocated(port));
        }

        Ok(())
    }

    /// Returns true if the port is currently handed out.
    pub fn is_allocated(&self, port: u16) -> bool {
        self.range.contains(port) && !self.available.contains(&port)
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Total number of ports managed by the pool.
    pub fn capacity(&self) -> usize {
        self.range.len()
    }

    /// Number of ports currently handed out.
    pub fn allocated(&self) -> usize {
        self.capacity() - self.available()
    }
}

//! Human-readable byte sizes for the config file ("500MB", "1.5 GB", 1024).

use anyhow::{anyhow, bail, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size in bytes. Zero means "no limit" wherever a limit is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const B: u64 = 1;
    pub const KB: u64 = 1024;
    pub const MB: u64 = 1024 * Self::KB;
    pub const GB: u64 = 1024 * Self::MB;
    pub const TB: u64 = 1024 * Self::GB;

    pub const fn gb(n: u64) -> Self {
        Self(n * Self::GB)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

// Longest suffix first so "GB" is not read as a bare "B".
const UNITS: [(&str, u64); 5] = [
    ("TB", ByteSize::TB),
    ("GB", ByteSize::GB),
    ("MB", ByteSize::MB),
    ("KB", ByteSize::KB),
    ("B", ByteSize::B),
];

impl FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self(0));
        }
        if let Ok(bytes) = s.parse::<u64>() {
            return Ok(Self(bytes));
        }

        let upper = s.to_ascii_uppercase();
        let (suffix, multiplier) = UNITS
            .iter()
            .find(|(suffix, _)| upper.ends_with(*suffix))
            .ok_or_else(|| anyhow!("Invalid size {:?}, expected a unit of B, KB, MB, GB or TB", s))?;

        let number = s[..s.len() - suffix.len()].trim();
        let value: f64 = number
            .parse()
            .map_err(|_| anyhow!("Invalid size {:?}", s))?;
        if !value.is_finite() || value < 0.0 {
            bail!("Invalid size {:?}", s);
        }

        let bytes = value * *multiplier as f64;
        if bytes >= u64::MAX as f64 {
            bail!("Size {:?} is out of range", s);
        }
        Ok(Self(bytes as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes < Self::KB {
            return write!(f, "{}", bytes);
        }

        let (suffix, multiplier) = UNITS
            .iter()
            .find(|(_, multiplier)| bytes >= *multiplier)
            .copied()
            .unwrap_or(("B", Self::B));
        if bytes % multiplier == 0 {
            write!(f, "{}{}", bytes / multiplier, suffix)
        } else {
            write!(f, "{:.2}{}", bytes as f64 / multiplier as f64, suffix)
        }
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl<'v> Visitor<'v> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a size such as \"500MB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

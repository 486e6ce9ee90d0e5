//! Byte sizes with binary suffixes and sector arithmetic.

use serde::de::{self, Deserializer, Visitor};
use std::fmt;

use crate::error::ConfigError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Parse `512`, `8K`, `50M`, `50MiB`, `4G`, `1T` into bytes.
///
/// Suffixes are binary multiples; a trailing `B`/`iB` is accepted.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let suffix = suffix.trim();
    let stripped = suffix
        .strip_suffix("iB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(suffix);
    let multiplier = match stripped.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => KIB,
        "M" => MIB,
        "G" => GIB,
        "T" => GIB * 1024,
        _ => return Err(invalid()),
    };

    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Round `value` up to a multiple of `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// [`align_up`] that reports overflow instead of wrapping.
pub fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    value.div_ceil(align).checked_mul(align)
}

pub fn is_aligned(value: u64, align: u64) -> bool {
    align != 0 && value % align == 0
}

/// Human-readable size for log lines.
pub fn human(bytes: u64) -> String {
    if bytes >= GIB && bytes % MIB == 0 {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Deserialize an optional size given either as an integer or a suffixed string.
pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct SizeVisitor;

    impl<'de> Visitor<'de> for SizeVisitor {
        type Value = Option<u64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a byte count or a size string such as \"50M\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("negative size {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_size(v).map(Some).map_err(E::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
            d.deserialize_any(SizeVisitor)
        }
    }

    deserializer.deserialize_option(SizeVisitor)
}

/// Deserialize a mandatory size given either as an integer or a suffixed string.
pub fn deserialize_required<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_opt(deserializer)?
        .ok_or_else(|| <D::Error as de::Error>::custom("size must not be null"))
}

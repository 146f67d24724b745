//! Composite identifiers: a type code and a scoped sequence in one value

use crate::error::{NetcfgError, NetcfgResult};
use std::fmt;
use std::str::FromStr;

/// `0x{type:04x}{value:04x}`, e.g. `0x00010000` for type 1, value 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeId {
    pub type_code: u16,
    pub value: u16,
}

impl CompositeId {
    pub fn new(type_code: u64, value: u64) -> NetcfgResult<Self> {
        let type_code = u16::try_from(type_code).map_err(|_| {
            NetcfgError::validation("type_code", format!("{} does not fit 16 bits", type_code))
        })?;
        let value = u16::try_from(value).map_err(|_| {
            NetcfgError::validation("value", format!("{} does not fit 16 bits", value))
        })?;
        Ok(Self { type_code, value })
    }

    /// Type code rendered the way it is stored on the type resource
    pub fn type_code_hex(&self) -> String {
        format_type_code(self.type_code)
    }

    pub fn as_u32(&self) -> u32 {
        ((self.type_code as u32) << 16) | self.value as u32
    }
}

pub fn format_type_code(type_code: u16) -> String {
    format!("0x{:04x}", type_code)
}

/// Parse `0x`-prefixed hex or plain decimal
pub fn parse_int(text: &str) -> NetcfgResult<u64> {
    let trimmed = text.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|e| NetcfgError::validation("id", format!("'{}': {}", text, e)))
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}{:04x}", self.type_code, self.value)
    }
}

impl FromStr for CompositeId {
    type Err = NetcfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = parse_int(s)?;
        if raw > u32::MAX as u64 {
            return Err(NetcfgError::validation("id", format!("'{}' exceeds 32 bits", s)));
        }
        Self::new(raw >> 16, raw & 0xffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let id = CompositeId::new(1, 0).unwrap();
        assert_eq!(id.to_string(), "0x00010000");
        assert_eq!(id.type_code_hex(), "0x0001");
        assert_eq!(CompositeId::new(0x1ff, 0xab).unwrap().to_string(), "0x01ff00ab");
    }

    #[test]
    fn test_parse() {
        let id: CompositeId = "0x01ff00ab".parse().unwrap();
        assert_eq!(id.type_code, 0x1ff);
        assert_eq!(id.value, 0xab);
        assert_eq!(id.as_u32(), 0x01ff00ab);
        assert!("0x1ffff00ab".parse::<CompositeId>().is_err());
        assert!("zz".parse::<CompositeId>().is_err());
    }

    #[test]
    fn test_out_of_range_parts() {
        assert!(CompositeId::new(0x10000, 0).is_err());
        assert!(CompositeId::new(0, 0x10000).is_err());
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("0x0005").unwrap(), 5);
        assert_eq!(parse_int("17").unwrap(), 17);
    }
}

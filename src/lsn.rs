//! PostgreSQL log sequence numbers.

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A PostgreSQL LSN (Log Sequence Number), a byte offset into the
/// write-ahead log. Displayed and parsed in the server's `X/Y` hex form.
#[derive(Debug, Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Lsn(pub u64);

/// We tried to parse an LSN from a string, but failed.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("invalid LSN: {0:?}")]
pub struct LsnParseError(pub String);

impl Lsn {
    /// The zero LSN, used as "not yet set" in cursors and the sentinel.
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parse from a 16-digit hex filename, the form used for segment files.
    pub fn from_filename(stem: &str) -> Result<Self, LsnParseError> {
        u64::from_str_radix(stem, 16)
            .map(Lsn)
            .map_err(|_| LsnParseError(stem.to_string()))
    }

    /// Render as a 16-digit hex filename stem.
    pub fn filename(self) -> String {
        format!("{:016X}", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parse an LSN in the server's `XXXXXXXX/YYYYYYYY` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(hi), Some(lo), None) if hi.len() <= 8 && lo.len() <= 8 => {
                let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
                let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
                Ok(Lsn((hi as u64) << 32 | lo as u64))
            }
            _ => Err(LsnParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, other: u64) -> Self::Output {
        Lsn(self.0.checked_add(other).expect("LSN overflow"))
    }
}

// LSNs persist in the catalog and in JSON artifacts as their display form,
// which keeps the files greppable against server logs.
impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_round_trip() {
        assert_eq!("0/1949850".parse(), Ok(Lsn(0x1949850)));
        assert_eq!("16/B374D848".parse(), Ok(Lsn(0x16B374D848)));
        assert_eq!("0/0".parse(), Ok(Lsn::INVALID));
        assert_eq!(format!("{}", Lsn(0x16B374D848)), "16/B374D848");
        assert_eq!(format!("{}", Lsn(0x1_0000_000A)), "1/A");

        "0".parse::<Lsn>().unwrap_err();
        "1/2/3".parse::<Lsn>().unwrap_err();
        "xyz/123".parse::<Lsn>().unwrap_err();
        "123456789/0".parse::<Lsn>().unwrap_err();
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn(0x100) < Lsn(0x200));
        assert!("0/FF".parse::<Lsn>().unwrap() < "1/0".parse::<Lsn>().unwrap());
        assert_eq!(Lsn(0x100) + 0x10, Lsn(0x110));
    }

    #[test]
    fn test_lsn_filename() {
        let lsn = Lsn(0x16B374D848);
        assert_eq!(lsn.filename(), "00000016B374D848");
        assert_eq!(Lsn::from_filename(&lsn.filename()), Ok(lsn));
        Lsn::from_filename("not-hex").unwrap_err();
    }

    #[test]
    fn test_lsn_serde() {
        let lsn = Lsn(0x1949850);
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"0/1949850\"");
        assert_eq!(serde_json::from_str::<Lsn>(&json).unwrap(), lsn);
    }
}

use std::{fmt, ops::RangeInclusive, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

const ROOM_CODE_RANGE: RangeInclusive<u32> = 100_000..=999_999;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

impl From<RoomCode> for PeerId {
    fn from(code: RoomCode) -> Self {
        PeerId(code.0)
    }
}

/// Six decimal digits, also used as the host's peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.0.clone())
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = s.len() == 6
            && s.bytes().all(|b| b.is_ascii_digit())
            && s.parse::<u32>().is_ok_and(|n| ROOM_CODE_RANGE.contains(&n));
        if !valid {
            return Err(Error::InvalidRoomCode(s.to_string()));
        }
        Ok(RoomCode(s.to_string()))
    }
}

// no collision check, the provider rejects an id that is already live
pub fn generate() -> RoomCode {
    let code = rand::rng().random_range(ROOM_CODE_RANGE);
    RoomCode(code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_six_digits_in_range() {
        for _ in 0..10_000 {
            let code = generate();
            let s = code.as_str();
            assert_eq!(s.len(), 6, "{s}");
            assert!(s.bytes().all(|b| b.is_ascii_digit()), "{s}");
            let n: u32 = s.parse().unwrap();
            assert!((100_000..=999_999).contains(&n), "{s}");
            assert_eq!(s.parse::<RoomCode>().unwrap(), code);
        }
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        for input in ["", "12345", "1234567", "012345", "12a456", "-12345"] {
            assert!(input.parse::<RoomCode>().is_err(), "{input:?} accepted");
        }
        assert_eq!(" 482913\n".parse::<RoomCode>().unwrap().as_str(), "482913");
    }

    #[test]
    fn room_code_is_host_peer_id() {
        let code: RoomCode = "482913".parse().unwrap();
        assert_eq!(code.peer_id(), PeerId::from("482913"));
        assert_eq!(PeerId::from(code).to_string(), "482913");
    }
}

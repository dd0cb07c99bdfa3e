//! Bluetooth device addresses.

use core::fmt;
use std::{fmt::Write, str::FromStr};

/// A 6-Byte Bluetooth device address.
///
/// Addresses are displayed and parsed in the usual colon-separated hex
/// notation (`AA:BB:CC:11:22:33`), which is also how BlueZ reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 6]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(':')?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Parses an [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == bytes.len() || part.len() != 2 {
                return Err(ParseAddressError(()));
            }
            bytes[count] = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(()))?;
            count += 1;
        }

        if count == bytes.len() {
            Ok(Address(bytes))
        } else {
            Err(ParseAddressError(()))
        }
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Address`].
#[derive(Debug)]
pub struct ParseAddressError(());

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid device address")
    }
}

impl std::error::Error for ParseAddressError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let s = "AA:BB:CC:11:22:33";
        let addr = Address::from_str(s).unwrap();
        assert_eq!(addr.to_string(), s);
    }

    #[test]
    fn parse_lowercase() {
        let addr = Address::from_str("aa:bb:cc:11:22:33").unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:11:22:33");
    }

    #[test]
    fn invalid() {
        Address::from_str("").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:3").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:333").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:44").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33 ").unwrap_err();
        Address::from_str("za:bb:cc:11:22:33").unwrap_err();
    }
}

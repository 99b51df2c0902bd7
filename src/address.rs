//! Address Parsing
//!
//! Both supported chains use 20-byte account addresses. Ethereum renders them
//! as `0x`-prefixed hex, IoTeX as bech32 with the `io` human-readable part.
//! Configuration may use either form, so parsing accepts both.

use bech32::{FromBase32, ToBase32, Variant};
use ethereum_types::Address;

use crate::error::{WitnessError, WitnessResult};

const IOTEX_HRP: &str = "io";

/// Parses a `0x` hex address or an `io1...` bech32 address.
pub fn parse_address(value: &str) -> WitnessResult<Address> {
    let value = value.trim();
    if value.starts_with("io1") {
        return parse_io_address(value);
    }
    parse_hex_address(value)
}

/// Parses a 20-byte hex address, with or without the `0x` prefix.
pub fn parse_hex_address(value: &str) -> WitnessResult<Address> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(stripped)
        .map_err(|e| WitnessError::Configuration(format!("invalid hex address '{}': {}", value, e)))?;
    if bytes.len() != 20 {
        return Err(WitnessError::Configuration(format!(
            "invalid address '{}': expected 20 bytes, got {}",
            value,
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

/// Parses a bech32 IoTeX address into its 20-byte payload.
pub fn parse_io_address(value: &str) -> WitnessResult<Address> {
    let (hrp, data, _variant) = bech32::decode(value)
        .map_err(|e| WitnessError::Configuration(format!("invalid io address '{}': {}", value, e)))?;
    if hrp != IOTEX_HRP {
        return Err(WitnessError::Configuration(format!(
            "invalid io address '{}': unexpected prefix '{}'",
            value, hrp
        )));
    }
    let bytes = Vec::<u8>::from_base32(&data)
        .map_err(|e| WitnessError::Configuration(format!("invalid io address '{}': {}", value, e)))?;
    if bytes.len() != 20 {
        return Err(WitnessError::Configuration(format!(
            "invalid io address '{}': expected 20 bytes, got {}",
            value,
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

/// Renders an address in IoTeX bech32 form.
pub fn to_io_address(address: &Address) -> WitnessResult<String> {
    bech32::encode(IOTEX_HRP, address.as_bytes().to_base32(), Variant::Bech32)
        .map_err(|e| WitnessError::Configuration(format!("cannot encode io address: {}", e)))
}

/// Renders an address as lowercase `0x` hex.
pub fn to_hex_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_io_forms_agree() {
        let hex_form = "0x3a9e8d9f7b2c4e5a6b7c8d9e0f1a2b3c4d5e6f70";
        let address = parse_address(hex_form).unwrap();
        let io_form = to_io_address(&address).unwrap();
        assert!(io_form.starts_with("io1"));
        assert_eq!(parse_address(&io_form).unwrap(), address);
        assert_eq!(to_hex_address(&address), hex_form);
    }

    #[test]
    fn rejects_short_hex() {
        assert!(parse_address("0x1234").is_err());
    }

    #[test]
    fn rejects_foreign_bech32_prefix() {
        let address = Address::repeat_byte(7);
        let other = bech32::encode("bc", address.as_bytes().to_base32(), Variant::Bech32).unwrap();
        assert!(parse_io_address(&other).is_err());
    }
}

use crate::errors::Error;
use std::fmt::Write;

pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::new();
    for byte in bytes {
        write!(&mut s, "{:02x}", byte).expect("Unable to write");
    }
    s
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, Error> {
    let s = s.trim_start_matches("0x");
    if s.len() % 2 != 0 {
        return Err(Error::General(format!("odd hex length {}", s.len())));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| Error::General(format!("invalid hex: {}", e)))
        })
        .collect()
}

/// Parses the `0x`-prefixed hex quantities the account-model node returns.
pub fn hex_to_u128(s: &str) -> Result<u128, Error> {
    let trimmed = s.trim_start_matches("0x");
    if trimmed.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(trimmed, 16)
        .map_err(|e| Error::General(format!("invalid hex quantity {}: {}", s, e)))
}

pub fn u128_to_hex(v: u128) -> String {
    format!("{:#x}", v)
}

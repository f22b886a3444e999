//! Request validation for the HTTP boundary

use crate::error::{Error, Result};
use crate::registry::normalize_address;

/// Subscribing to this address removes the device's subscription instead
pub const UNSUBSCRIBE_ALL_ADDRESS: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

const MAX_ADDRESS_DIGITS: usize = 64;

/// Check an address is `0x` followed by 1 to 64 hex digits
pub fn validate_address(address: &str) -> Result<()> {
    let normalized = normalize_address(address);
    let digits = normalized.strip_prefix("0x").unwrap_or("");
    if digits.is_empty()
        || digits.len() > MAX_ADDRESS_DIGITS
        || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(Error::validation(
            "invalid_address",
            format!("'{}' is not a valid address", address),
        ));
    }
    Ok(())
}

/// Check a push token has the `ExponentPushToken[...]` shape
pub fn validate_push_token(token: &str) -> Result<()> {
    let inner = token
        .strip_prefix("ExponentPushToken[")
        .or_else(|| token.strip_prefix("ExpoPushToken["))
        .and_then(|rest| rest.strip_suffix(']'));
    match inner {
        Some(inner) if !inner.is_empty() => Ok(()),
        _ => Err(Error::validation(
            "invalid_push_token",
            "push token must look like ExponentPushToken[...]",
        )),
    }
}

pub fn is_unsubscribe_sentinel(address: &str) -> bool {
    normalize_address(address) == UNSUBSCRIBE_ALL_ADDRESS
}

//! Philippine mobile number normalization. The provider expects the
//! canonical `63` + 10 digit form; everything else is refused before
//! any transport attempt.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported phone number format: {0}")]
pub struct PhoneFormatError(pub String);

fn non_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\D").expect("static regex"))
}

/// Normalize to `63xxxxxxxxxx`.
///
/// Accepted inputs: `09xxxxxxxxx` (11 digits), `9xxxxxxxxx` (10 digits),
/// `639xxxxxxxxx` (12 digits), `+639xxxxxxxxx`.
pub fn normalize(phone: &str) -> Result<String, PhoneFormatError> {
    let digits = non_digits().replace_all(phone.trim(), "").into_owned();

    match digits.len() {
        11 if digits.starts_with("09") => Ok(format!("63{}", &digits[1..])),
        10 if digits.starts_with('9') => Ok(format!("63{digits}")),
        12 if digits.starts_with("639") => Ok(digits),
        _ => Err(PhoneFormatError(phone.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eleven_digit_local_form() {
        assert_eq!(normalize("09171234567").unwrap(), "639171234567");
    }

    #[test]
    fn ten_digit_form() {
        assert_eq!(normalize("9171234567").unwrap(), "639171234567");
    }

    #[test]
    fn twelve_digit_international_form() {
        assert_eq!(normalize("639171234567").unwrap(), "639171234567");
    }

    #[test]
    fn plus_prefixed_form() {
        assert_eq!(normalize("+639171234567").unwrap(), "639171234567");
    }

    #[test]
    fn separators_are_ignored() {
        assert_eq!(normalize("0917-123-4567").unwrap(), "639171234567");
        assert_eq!(normalize(" 0917 123 4567 ").unwrap(), "639171234567");
    }

    #[test]
    fn unsupported_formats_rejected() {
        for bad in ["", "12345", "08171234567", "63917123456", "1-800-000-0000"] {
            assert!(normalize(bad).is_err(), "expected rejection for {bad:?}");
        }
    }
}

//! Locale-style quantity parsing and formatting.
//!
//! Meter counters are entered as liters with exactly three fractional digits
//! and money with two. Both use `.` as the thousands separator and `,` as the
//! decimal separator. Every function here is pure and total: malformed input
//! is sanitized to a best-effort value (or the empty string), never rejected
//! with an error.

use rust_decimal::prelude::*;

/// Fractional digits of a canonical meter reading.
pub const LITER_PLACES: u32 = 3;

/// Fractional digits of a canonical money amount.
pub const CURRENCY_PLACES: u32 = 2;

const CURRENCY_PREFIX: &str = "R$";

/// Most integer digits a meter reading or money cell may carry. Sums and
/// products of values in this range stay far inside `Decimal`.
pub const MAX_INTEGER_DIGITS: usize = 15;

// ---------------------------------------------------------------------------
// Meter readings
// ---------------------------------------------------------------------------

/// Format a meter reading while the operator is still typing.
///
/// Keeps digits and at most one decimal separator, groups the integer part
/// with thousands separators and never invents a decimal separator the user
/// did not type: `"1718359"` becomes `"1.718.359"`.
pub fn format_live(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    if cleaned.is_empty() {
        return String::new();
    }

    match cleaned.split_once(',') {
        Some((int_part, rest)) => {
            // Any further separators typed after the first one are dropped.
            let decimals: String = rest.chars().filter(char::is_ascii_digit).collect();
            format!(
                "{},{}",
                group_thousands(strip_leading_zeros(int_part)),
                decimals
            )
        }
        None => group_thousands(strip_leading_zeros(&cleaned)),
    }
}

/// Canonicalize a meter reading when the input loses focus.
///
/// All separators are stripped. Values of up to three digits are read as the
/// fractional part (`"5"` becomes `"0,005"`); otherwise the last three digits
/// are always the fraction, wherever a separator was typed
/// (`"1718359"` becomes `"1.718,359"`). Empty or digit-free input yields `""`.
pub fn format_canonical(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    if digits.len() <= LITER_PLACES as usize {
        return format!("0,{digits:0>3}");
    }

    let (int_part, fraction) = digits.split_at(digits.len() - LITER_PLACES as usize);
    format!(
        "{},{}",
        group_thousands(strip_leading_zeros(int_part)),
        fraction
    )
}

/// Parse a formatted meter value into a fixed-point number.
///
/// With a decimal comma the dots are thousands separators. Without one, the
/// last-three-digits rule of [`format_canonical`] applies, so this is the
/// inverse of that function. Anything unparsable is zero.
pub fn parse_decimal(formatted: &str) -> Decimal {
    let cleaned = strip_currency_noise(formatted);
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }

    if cleaned.contains(',') {
        let normalized: String = cleaned
            .replace('.', "")
            .replace(',', ".")
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        return Decimal::from_str(&normalized).unwrap_or(Decimal::ZERO);
    }

    let digits: String = cleaned.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Decimal::ZERO;
    }
    match Decimal::from_str(&digits) {
        Ok(mut value) => {
            if value.set_scale(LITER_PLACES).is_err() {
                return Decimal::ZERO;
            }
            if cleaned.starts_with('-') {
                value.set_sign_negative(true);
            }
            value
        }
        Err(_) => Decimal::ZERO,
    }
}

/// True when a meter cell holds more than [`MAX_INTEGER_DIGITS`] integer
/// digits, read the way [`parse_decimal`] reads it.
pub fn reading_exceeds_range(formatted: &str) -> bool {
    let cleaned = strip_currency_noise(formatted);
    match cleaned.split_once(',') {
        Some((int_part, _)) => significant_digits(int_part) > MAX_INTEGER_DIGITS,
        None => {
            let digits = significant_digits(&cleaned);
            digits.saturating_sub(LITER_PLACES as usize) > MAX_INTEGER_DIGITS
        }
    }
}

/// Format a number of liters in canonical display form (`"1.050,500"`).
pub fn format_liters(value: Decimal) -> String {
    format_decimal(value, LITER_PLACES)
}

// ---------------------------------------------------------------------------
// Generic number display
// ---------------------------------------------------------------------------

/// Format `value` with exactly `places` fractional digits, grouping the
/// integer part with `.` and using `,` as the decimal separator.
///
/// Midpoints round away from zero.
pub fn format_decimal(value: Decimal, places: u32) -> String {
    let mut rounded = value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(places);

    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = rounded.abs().to_string();
    let (int_part, fraction) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (text.clone(), String::new()),
    };

    let mut out = String::with_capacity(text.len() + 4);
    if negative {
        out.push('-');
    }
    out.push_str(&group_thousands(&int_part));
    if places > 0 {
        out.push(',');
        out.push_str(&fraction);
    }
    out
}

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Format a money amount for display: `"R$ 1.234,56"`, `"-R$ 1,00"`.
pub fn format_currency(value: Decimal) -> String {
    let formatted = format_decimal(value.abs(), CURRENCY_PLACES);
    let rounded = value.round_dp_with_strategy(CURRENCY_PLACES, RoundingStrategy::MidpointAwayFromZero);
    if rounded.is_sign_negative() && !rounded.is_zero() {
        format!("-{CURRENCY_PREFIX} {formatted}")
    } else {
        format!("{CURRENCY_PREFIX} {formatted}")
    }
}

/// Format a money cell while typing. Keeps at most two decimals and never
/// adds a comma on its own.
pub fn format_currency_live(raw: &str) -> String {
    let cleaned: String = strip_currency_noise(raw)
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    if cleaned.is_empty() {
        return String::new();
    }

    match cleaned.split_once(',') {
        Some((int_part, rest)) => {
            let decimals: String = rest
                .chars()
                .filter(char::is_ascii_digit)
                .take(CURRENCY_PLACES as usize)
                .collect();
            format!(
                "{CURRENCY_PREFIX} {},{}",
                group_thousands(strip_leading_zeros(int_part)),
                decimals
            )
        }
        None => format!(
            "{CURRENCY_PREFIX} {}",
            group_thousands(strip_leading_zeros(&cleaned))
        ),
    }
}

/// Canonicalize a money cell on blur (`"150"` becomes `"R$ 150,00"`).
pub fn format_currency_blur(raw: &str) -> String {
    if strip_currency_noise(raw).is_empty() {
        return String::new();
    }
    format_currency(parse_currency(raw))
}

/// Filter a keystroke in a declared-amount cell. Returns `None` when the
/// result would carry more than one decimal separator.
pub fn sanitize_money_keystroke(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    if cleaned.matches(',').count() > 1 {
        return None;
    }
    Some(cleaned)
}

/// Parse a money cell. Dots are always thousands separators; a comma, when
/// present, is the decimal separator. Unparsable input is zero.
pub fn parse_currency(text: &str) -> Decimal {
    let cleaned = strip_currency_noise(text);
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    let negative = cleaned.starts_with('-');

    let normalized: String = cleaned
        .replace('.', "")
        .replace(',', ".")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    match Decimal::from_str(&normalized) {
        Ok(value) if negative => -value,
        Ok(value) => value,
        Err(_) => Decimal::ZERO,
    }
}

/// True when an already parsed value has more than [`MAX_INTEGER_DIGITS`]
/// integer digits.
pub fn value_exceeds_range(value: Decimal) -> bool {
    value.abs().trunc().to_string().len() > MAX_INTEGER_DIGITS
}

/// True when a money cell holds more than [`MAX_INTEGER_DIGITS`] integer
/// digits, read the way [`parse_currency`] reads it.
pub fn money_exceeds_range(text: &str) -> bool {
    let cleaned = strip_currency_noise(text);
    let int_part = cleaned.split_once(',').map_or(cleaned.as_str(), |(i, _)| i);
    significant_digits(int_part) > MAX_INTEGER_DIGITS
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Digits in `text` once leading zeros are dropped.
fn significant_digits(text: &str) -> usize {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.trim_start_matches('0').len()
}

fn strip_currency_noise(raw: &str) -> String {
    raw.replace(CURRENCY_PREFIX, "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn strip_leading_zeros(digits: &str) -> &str {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_format_live_groups_without_inventing_decimals() {
        assert_eq!(format_live("1718359"), "1.718.359");
        assert_eq!(format_live("1.718.359"), "1.718.359");
        assert_eq!(format_live("001234"), "1.234");
        assert_eq!(format_live("1234,5"), "1.234,5");
        assert_eq!(format_live("12,3,4"), "12,34");
        assert_eq!(format_live("abc"), "");
        assert_eq!(format_live(""), "");
    }

    #[test]
    fn test_format_canonical_last_three_digits_rule() {
        assert_eq!(format_canonical("1718359"), "1.718,359");
        assert_eq!(format_canonical("5"), "0,005");
        assert_eq!(format_canonical(""), "");
        assert_eq!(format_canonical("xyz"), "");
        assert_eq!(format_canonical("1000000"), "1.000,000");
        // The typed separator position is ignored.
        assert_eq!(format_canonical("1050,5"), "10,505");
        assert_eq!(format_canonical("0001050500"), "1.050,500");
    }

    #[test]
    fn test_parse_decimal_inverts_canonical() {
        assert_eq!(parse_decimal("1.718,359"), dec("1718.359"));
        assert_eq!(parse_decimal("0,005"), dec("0.005"));
        assert_eq!(parse_decimal("1718359"), dec("1718.359"));
        assert_eq!(parse_decimal("1.718.359"), dec("1718.359"));
        assert_eq!(parse_decimal("R$ 5,89"), dec("5.89"));
        assert_eq!(parse_decimal(""), Decimal::ZERO);
        assert_eq!(parse_decimal("garbage"), Decimal::ZERO);
    }

    #[test]
    fn test_format_decimal_rounding_and_sign() {
        assert_eq!(format_decimal(dec("1234.5"), 2), "1.234,50");
        assert_eq!(format_decimal(dec("297.245"), 2), "297,25");
        assert_eq!(format_decimal(dec("-1234.5"), 2), "-1.234,50");
        assert_eq!(format_decimal(dec("-0.001"), 2), "0,00");
        assert_eq!(format_decimal(dec("1234567"), 0), "1.234.567");
        assert_eq!(format_liters(dec("50.5")), "50,500");
    }

    #[test]
    fn test_currency_formatting() {
        assert_eq!(format_currency(dec("1234.56")), "R$ 1.234,56");
        assert_eq!(format_currency(dec("-1")), "-R$ 1,00");
        assert_eq!(format_currency(Decimal::ZERO), "R$ 0,00");
        assert_eq!(format_currency_live("150"), "R$ 150");
        assert_eq!(format_currency_live("1500,555"), "R$ 1.500,55");
        assert_eq!(format_currency_live(""), "");
        assert_eq!(format_currency_blur("150"), "R$ 150,00");
        assert_eq!(format_currency_blur("R$ 47,2"), "R$ 47,20");
        assert_eq!(format_currency_blur("  "), "");
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("R$ 1.234,56"), dec("1234.56"));
        assert_eq!(parse_currency("150"), dec("150"));
        assert_eq!(parse_currency("R$ 1.500"), dec("1500"));
        assert_eq!(parse_currency("47,25"), dec("47.25"));
        assert_eq!(parse_currency("-R$ 3,10"), dec("-3.10"));
        assert_eq!(parse_currency("nope"), Decimal::ZERO);
    }

    #[test]
    fn test_range_checks_count_integer_digits() {
        assert!(!money_exceeds_range(""));
        assert!(!money_exceeds_range("R$ 999.999.999.999.999,99"));
        assert!(money_exceeds_range("R$ 1.000.000.000.000.000,00"));
        assert!(money_exceeds_range("70000000000000000000000000000"));
        assert!(!money_exceeds_range("000000000000000000001,00"));

        assert!(!reading_exceeds_range("1.718,359"));
        assert!(!reading_exceeds_range("999999999999999999"));
        assert!(reading_exceeds_range("9999999999999999999"));
        assert!(reading_exceeds_range("1.000.000.000.000.000,000"));

        assert!(!value_exceeds_range(dec("-999999999999999.99")));
        assert!(value_exceeds_range(dec("1000000000000000")));
    }

    #[test]
    fn test_sanitize_money_keystroke_rejects_second_comma() {
        assert_eq!(sanitize_money_keystroke("12a,5"), Some("12,5".to_string()));
        assert_eq!(sanitize_money_keystroke("1,2,3"), None);
        assert_eq!(sanitize_money_keystroke(""), Some(String::new()));
    }

    proptest! {
        #[test]
        fn canonical_form_is_idempotent(raw in "[0-9.,]{0,24}") {
            let once = format_canonical(&raw);
            prop_assert_eq!(format_canonical(&once), once);
        }

        #[test]
        fn canonical_form_parses_back_to_same_value(raw in "[1-9][0-9]{0,14}") {
            let canonical = format_canonical(&raw);
            let parsed = parse_decimal(&canonical);
            prop_assert_eq!(format_liters(parsed), canonical);
        }
    }
}

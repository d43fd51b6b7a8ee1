//! Lenient numeric parsing for parameter values stored as text.
//!
//! Stored values come from form posts and flash files, so parsing never
//! fails: the longest numeric prefix wins and anything unparsable is zero.

/// Parse the leading decimal integer of `text`. Saturates on overflow.
pub fn parse_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return 0;
    }
    trimmed[..end].parse::<i64>().unwrap_or(if bytes[0] == b'-' {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Parse the leading decimal float of `text`. Non-finite results become zero.
pub fn parse_float(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        end = frac_end;
    }
    if digits == 0 {
        return 0.0;
    }

    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    trimmed[..end]
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// Render a float as a JSON numeric literal (shortest round-trip form).
pub fn format_float(value: f64) -> String {
    if value.is_finite() {
        format!("{value}")
    } else {
        "0".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_takes_leading_digits() {
        assert_eq!(parse_int("1883"), 1883);
        assert_eq!(parse_int("  -42abc"), -42);
        assert_eq!(parse_int("+7"), 7);
        assert_eq!(parse_int("abc"), 0);
        assert_eq!(parse_int(""), 0);
        assert_eq!(parse_int("-"), 0);
    }

    #[test]
    fn int_saturates() {
        assert_eq!(parse_int("99999999999999999999"), i64::MAX);
        assert_eq!(parse_int("-99999999999999999999"), i64::MIN);
    }

    #[test]
    fn float_takes_leading_number() {
        assert_eq!(parse_float("6.28"), 6.28);
        assert_eq!(parse_float("-.5x"), -0.5);
        assert_eq!(parse_float("3."), 3.0);
        assert_eq!(parse_float("1e3"), 1000.0);
        assert_eq!(parse_float("2e"), 2.0);
        assert_eq!(parse_float("."), 0.0);
        assert_eq!(parse_float("nan"), 0.0);
        assert_eq!(parse_float("1e999"), 0.0);
    }

    #[test]
    fn float_literal_reparses_to_same_text() {
        for value in [0.0, 6.28, -1.5, 1883.0, 0.1] {
            let rendered = format_float(value);
            assert_eq!(format_float(parse_float(&rendered)), rendered);
        }
    }
}

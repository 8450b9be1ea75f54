//! Number arithmetic, formatting and string coercion

/// Binary arithmetic operators shared by the compiler's folder and the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
}

impl ArithOp {
    /// Metamethod consulted when an operand is not a number
    #[must_use]
    pub const fn metamethod(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::IDiv => "__idiv",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
        }
    }
}

/// Apply an arithmetic operator to two numbers.
///
/// `%` and `//` floor toward negative infinity, so `-5 % 3 == 1`.
#[must_use]
pub fn arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => a - (a / b).floor() * b,
        ArithOp::Pow => a.powf(b),
    }
}

/// Format a number the way `tostring` does.
///
/// Uses the shortest digits that round-trip, in fixed notation for decimal
/// exponents in `-5..16` and scientific notation (`1e+16`) otherwise, so
/// every integer up to 2^53 still prints without an exponent.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:e}", n.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();

    let mut out = String::with_capacity(digits.len() + 8);
    if n < 0.0 {
        out.push('-');
    }

    if (-5..16).contains(&exponent) {
        if exponent < 0 {
            out.push_str("0.");
            for _ in 0..(-exponent - 1) {
                out.push('0');
            }
            out.push_str(&digits);
        } else {
            let int_len = exponent as usize + 1;
            if digits.len() <= int_len {
                out.push_str(&digits);
                for _ in digits.len()..int_len {
                    out.push('0');
                }
            } else {
                out.push_str(&digits[..int_len]);
                out.push('.');
                out.push_str(&digits[int_len..]);
            }
        }
    } else {
        out.push_str(mantissa);
        out.push('e');
        out.push(if exponent < 0 { '-' } else { '+' });
        let magnitude = exponent.unsigned_abs();
        if magnitude < 10 {
            out.push('0');
        }
        out.push_str(&magnitude.to_string());
    }
    out
}

/// Parse a string as a number using script coercion rules.
///
/// Accepts surrounding whitespace, an optional sign, decimal numbers with
/// fraction and exponent, and `0x`/`0b` integer literals. Rejects `inf`,
/// `nan` and anything with trailing garbage.
#[must_use]
pub fn str_to_number(bytes: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    let (negative, unsigned) = match text.as_bytes()[0] {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };

    let radix_body = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
        .map(|body| (16, body))
        .or_else(|| {
            unsigned
                .strip_prefix("0b")
                .or_else(|| unsigned.strip_prefix("0B"))
                .map(|body| (2, body))
        });

    let magnitude = if let Some((radix, body)) = radix_body {
        if body.is_empty() {
            return None;
        }
        let mut value = 0.0f64;
        for c in body.chars() {
            value = value * f64::from(radix) + f64::from(c.to_digit(radix)?);
        }
        value
    } else {
        let valid = !unsigned.is_empty()
            && unsigned
                .bytes()
                .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
            && unsigned.bytes().any(|b| b.is_ascii_digit());
        if !valid || unsigned.starts_with(['+', '-']) {
            return None;
        }
        unsigned.parse::<f64>().ok()?
    };

    Some(if negative { -magnitude } else { magnitude })
}

/// Convert a float to an `i64` when it holds an exact integer
#[must_use]
pub fn as_exact_integer(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_floors() {
        assert_eq!(arith(ArithOp::Mod, -5.0, 3.0), 1.0);
        assert_eq!(arith(ArithOp::Mod, 5.5, 2.0), 1.5);
        assert_eq!(arith(ArithOp::IDiv, 7.0, 2.0), 3.0);
        assert_eq!(arith(ArithOp::IDiv, -7.0, 2.0), -4.0);
        assert_eq!(arith(ArithOp::Pow, 2.0, 10.0), 1024.0);
        assert!(arith(ArithOp::Div, 1.0, 0.0).is_infinite());
    }

    #[test]
    fn formats_integers_without_fraction() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(30.0), "30");
        assert_eq!(format_number(-42.0), "-42");
        assert_eq!(format_number(1e15), "1000000000000000");
        assert_eq!(format_number(9_007_199_254_740_992.0), "9007199254740992");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(-0.0), "-0");
    }

    #[test]
    fn formats_fractions_and_exponents() {
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(3.25), "3.25");
        assert_eq!(format_number(1.0 / 3.0), "0.3333333333333333");
        assert_eq!(format_number(0.00001), "0.00001");
        assert_eq!(format_number(1.5e-7), "1.5e-07");
        assert_eq!(format_number(1e16), "1e+16");
        assert_eq!(format_number(-1e16), "-1e+16");
        assert_eq!(format_number(1.25e20), "1.25e+20");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(-2.5e300), "-2.5e+300");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NAN), "nan");
    }

    #[test]
    fn parses_numeric_strings() {
        assert_eq!(str_to_number(b"42"), Some(42.0));
        assert_eq!(str_to_number(b"  -3.5  "), Some(-3.5));
        assert_eq!(str_to_number(b"1e3"), Some(1000.0));
        assert_eq!(str_to_number(b".5"), Some(0.5));
        assert_eq!(str_to_number(b"0x1F"), Some(31.0));
        assert_eq!(str_to_number(b"-0x10"), Some(-16.0));
        assert_eq!(str_to_number(b"0b101"), Some(5.0));
    }

    #[test]
    fn rejects_non_numbers() {
        assert_eq!(str_to_number(b""), None);
        assert_eq!(str_to_number(b"abc"), None);
        assert_eq!(str_to_number(b"12abc"), None);
        assert_eq!(str_to_number(b"inf"), None);
        assert_eq!(str_to_number(b"nan"), None);
        assert_eq!(str_to_number(b"0x"), None);
        assert_eq!(str_to_number(b"--1"), None);
        assert_eq!(str_to_number(b"1_000"), None);
    }

    #[test]
    fn exact_integers() {
        assert_eq!(as_exact_integer(3.0), Some(3));
        assert_eq!(as_exact_integer(3.5), None);
        assert_eq!(as_exact_integer(f64::NAN), None);
    }
}

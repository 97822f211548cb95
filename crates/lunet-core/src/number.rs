//! Numeric semantics shared by the compiler's constant folder and the VM.

/// Lua modulo: floored division semantics, `a - floor(a/b)*b`.
pub fn lua_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    // The truncated remainder has the wrong sign when the operands differ.
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// Lua exponentiation. The integer part of the exponent is handled by
/// repeated squaring; a negative base with a fractional exponent has no
/// real result and yields NaN. Negative exponents invert.
pub fn lua_pow(a: f64, b: f64) -> f64 {
    let invert = b < 0.0;
    let mut b = if invert { -b } else { b };
    if a == 0.0 {
        return if invert { f64::NAN } else { a };
    }
    let mut result = 1.0;
    let mut ipow = b as i64;
    b -= ipow as f64;
    let mut t = a;
    while ipow > 0 {
        if ipow & 1 != 0 {
            result *= t;
        }
        ipow >>= 1;
        t *= t;
    }
    if b != 0.0 {
        if a < 0.0 {
            return f64::NAN;
        }
        let mut t = a.sqrt();
        let mut half = 0.5;
        while b > 0.0 {
            if b >= half {
                result *= t;
                b -= half;
            }
            half *= 0.5;
            t = t.sqrt();
        }
    }
    if invert {
        result = 1.0 / result;
    }
    result
}

/// Parse a byte string as a Lua number: decimal (with fraction and
/// exponent) or `0x` hexadecimal, surrounding whitespace allowed.
pub fn str_to_number(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|i| i as f64);
    }
    s.parse::<f64>().ok()
}

/// Format a number the way `tostring` does (the %.14g format).
pub fn number_to_display(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == n.floor() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    let mut s = format!("{:.14e}", n);
    // %.14g trims the exponent form when it is not needed.
    if let Some(plain) = format_plain(n) {
        s = plain;
    }
    s
}

fn format_plain(n: f64) -> Option<String> {
    let abs = n.abs();
    if !(1e-4..1e15).contains(&abs) && abs != 0.0 {
        return None;
    }
    // 14 significant digits, trailing zeros trimmed.
    let mut s = format!("{:.*}", significant_decimals(abs), n);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    Some(s)
}

fn significant_decimals(abs: f64) -> usize {
    if abs == 0.0 {
        return 0;
    }
    let int_digits = abs.log10().floor() as i32 + 1;
    (14 - int_digits).max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mod_floored() {
        assert_eq!(lua_mod(5.0, 3.0), 2.0);
        assert_eq!(lua_mod(-5.0, 3.0), 1.0);
        assert_eq!(lua_mod(5.0, -3.0), -1.0);
        assert_eq!(lua_mod(-5.0, -3.0), -2.0);
    }

    #[test]
    fn test_mod_fractional() {
        assert!((lua_mod(5.5, 2.0) - 1.5).abs() < 1e-12);
        assert!((lua_mod(-5.5, 2.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mod_by_zero_is_nan() {
        assert!(lua_mod(1.0, 0.0).is_nan());
    }

    #[test]
    fn test_pow_integer_exponents() {
        assert_eq!(lua_pow(2.0, 10.0), 1024.0);
        assert_eq!(lua_pow(-2.0, 3.0), -8.0);
        assert_eq!(lua_pow(-2.0, 2.0), 4.0);
        assert_eq!(lua_pow(7.0, 0.0), 1.0);
    }

    #[test]
    fn test_pow_negative_exponent() {
        assert_eq!(lua_pow(2.0, -2.0), 0.25);
    }

    #[test]
    fn test_pow_fractional_exponent() {
        assert!((lua_pow(4.0, 0.5) - 2.0).abs() < 1e-9);
        assert!((lua_pow(8.0, 1.0 / 3.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_pow_negative_base_fractional_exponent_is_nan() {
        assert!(lua_pow(-4.0, 0.5).is_nan());
    }

    #[test]
    fn test_pow_zero_base() {
        assert_eq!(lua_pow(0.0, 2.0), 0.0);
        assert!(lua_pow(0.0, -1.0).is_nan());
    }

    #[test]
    fn test_display_integers() {
        assert_eq!(number_to_display(42.0), "42");
        assert_eq!(number_to_display(-7.0), "-7");
        assert_eq!(number_to_display(0.0), "0");
    }

    #[test]
    fn test_display_fractions() {
        assert_eq!(number_to_display(1.5), "1.5");
        assert_eq!(number_to_display(0.25), "0.25");
    }

    #[test]
    fn test_display_specials() {
        assert_eq!(number_to_display(f64::NAN), "nan");
        assert_eq!(number_to_display(f64::INFINITY), "inf");
        assert_eq!(number_to_display(f64::NEG_INFINITY), "-inf");
    }
}

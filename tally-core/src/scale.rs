//! Fixed-point scaling between logical decimal values and cached integers.
//!
//! Every cached numeric field is stored as `round(value * 1000)`, giving three
//! decimal digits of precision. Descaling always divides by the same factor.

/// Scaling factor applied to every cached numeric value.
pub const SCALE_FACTOR: i64 = 1000;

/// Scale a logical value into its cached integer form.
pub fn scale(value: f64) -> i64 {
    (value * SCALE_FACTOR as f64).round() as i64
}

/// Convert a cached integer back into its logical value.
pub fn descale(scaled: i64) -> f64 {
    scaled as f64 / SCALE_FACTOR as f64
}

/// Descale and round to two decimal places for display.
pub fn descale_display(scaled: i64) -> f64 {
    (descale(scaled) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_rounds_to_three_digits() {
        assert_eq!(scale(10.0), 10_000);
        assert_eq!(scale(2.5), 2_500);
        assert_eq!(scale(0.0015), 2);
        assert_eq!(scale(-1.2344), -1_234);
    }

    #[test]
    fn test_descale_display_two_digits() {
        assert_eq!(descale(12_500), 12.5);
        assert_eq!(descale_display(12_500), 12.5);
        assert_eq!(descale_display(1_006), 1.01);
        assert_eq!(descale_display(-333), -0.33);
    }
}

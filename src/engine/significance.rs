//! Change-significance filter for counter-like quantities.
//!
//! Statistics drift on every run. A counter claim is only rewritten when
//! the new value is a different order of magnitude from the stored one.

/// Minimum |log10(new) - log10(old)|, roughly a 3x relative change.
pub const DEFAULT_SIGNIFICANCE_THRESHOLD: f64 = 0.5;

/// Whether moving from `old` to `new` is worth a write.
///
/// Equal values never are. A zero (or negative) on either side always is,
/// since the logarithm is undefined there.
pub fn is_significant_change(old: f64, new: f64, threshold: f64) -> bool {
    if old == new {
        return false;
    }
    if old <= 0.0 || new <= 0.0 {
        return true;
    }
    (new.log10() - old.log10()).abs() >= threshold
}

/// Compare against the currently stored amount, if any. With nothing
/// stored, any value is worth writing.
pub fn needs_update(stored: Option<f64>, new: f64, threshold: f64) -> bool {
    match stored {
        Some(old) => is_significant_change(old, new, threshold),
        None => true,
    }
}

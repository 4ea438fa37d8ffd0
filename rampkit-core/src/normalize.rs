//! Filename normalization for archive entries.
//!
//! The consuming archive tool chokes on spaces and on names with more than one
//! period, so staged names replace spaces with `+` and turn every period except
//! the last into `#`. The last period survives so the extension is kept.

/// Replacement for a space.
pub const SPACE_FILLER: char = '+';
/// Replacement for every period but the last.
pub const PERIOD_MARKER: char = '#';

/// Applies the built-in rules to a bare file name.
pub fn normalize_filename(file_name: &str) -> String {
    let last_period = file_name.rfind('.');
    file_name
        .char_indices()
        .map(|(i, c)| match c {
            ' ' => SPACE_FILLER,
            '.' if Some(i) != last_period => PERIOD_MARKER,
            other => other,
        })
        .collect()
}

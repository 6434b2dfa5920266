//! Utility functions

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

pub fn is_pow2(value: u64) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// log2 of a power of two
pub fn log2_exact(value: u64) -> u32 {
    debug_assert!(is_pow2(value));
    value.trailing_zeros()
}

/// Number of significant bits, i.e. one past the index of the highest set bit
pub fn bit_width(value: u64) -> u32 {
    64 - value.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_pow2_helpers() {
        assert!(is_pow2(1));
        assert!(is_pow2(4096));
        assert!(!is_pow2(0));
        assert!(!is_pow2(48));
        assert_eq!(log2_exact(512), 9);
        assert_eq!(bit_width(0), 0);
        assert_eq!(bit_width(1), 1);
        assert_eq!(bit_width(255), 8);
        assert_eq!(bit_width(256), 9);
    }
}

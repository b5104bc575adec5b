//! Dotted numeric version comparison.
//!
//! Versions are plain dotted numeric sequences ("1.2.0"). Comparison is
//! component-wise with missing trailing components treated as zero, so
//! "1.2" and "1.2.0" are equal.

use std::cmp::Ordering;

/// Parse a dotted numeric version string into its components.
///
/// Returns `None` when any component is empty or non-numeric.
pub fn parse(version: &str) -> Option<Vec<u64>> {
    if version.is_empty() {
        return None;
    }

    version.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Compare two dotted numeric version strings component-wise.
///
/// Unparseable versions compare as all-zero; the caller is expected to have
/// validated manifests before relying on ordering.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = parse(a).unwrap_or_default();
    let b = parse(b).unwrap_or_default();

    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    Ordering::Equal
}

/// Check whether an installed version satisfies a requirement.
///
/// A candidate is compatible when it is greater than or equal to the
/// required version at the first differing component.
pub fn satisfies(installed: &str, required: &str) -> bool {
    compare(installed, required) != Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        assert_eq!(parse("1.2.0"), Some(vec![1, 2, 0]));
        assert_eq!(parse("0.1"), Some(vec![0, 1]));
        assert_eq!(parse("10"), Some(vec![10]));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("1.x.0"), None);
        assert_eq!(parse("1..0"), None);
        assert_eq!(parse("v1.0"), None);
    }

    #[test]
    fn test_compare_equal_with_missing_components() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare("1", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_compare_orders_numerically() {
        assert_eq!(compare("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare("0.9", "1.0"), Ordering::Less);
        assert_eq!(compare("2.0.1", "2.0.0"), Ordering::Greater);
    }

    #[test]
    fn test_satisfies() {
        assert!(satisfies("1.2.0", "1.0.0"));
        assert!(satisfies("1.0.0", "1.0.0"));
        assert!(satisfies("1.0", "1.0.0"));
        assert!(!satisfies("0.9.9", "1.0.0"));
        assert!(!satisfies("1.0.0", "1.0.1"));
    }
}

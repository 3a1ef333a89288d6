//! Page alignment math used by the tracking engine.
//!
//! All functions are pure. `alignment` must be a non-zero power of two,
//! the result is unspecified otherwise.

/// Returns the largest `alignment`-aligned address that is `<= addr`.
#[inline]
#[must_use]
pub fn align_down(addr: usize, alignment: usize) -> usize {
    addr & !(alignment - 1)
}

/// Rounds `size` up to the next multiple of `alignment`.
///
/// Returns `None` if the rounded size does not fit in a `usize`.
#[inline]
#[must_use]
pub fn align_up(size: usize, alignment: usize) -> Option<usize> {
    Some(size.checked_add(alignment - 1)? & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::{align_down, align_up};

    const PAGE: usize = 4096;

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, PAGE), 0);
        assert_eq!(align_down(1, PAGE), 0);
        assert_eq!(align_down(PAGE - 1, PAGE), 0);
        assert_eq!(align_down(PAGE, PAGE), PAGE);
        assert_eq!(align_down(PAGE + 1, PAGE), PAGE);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE), Some(0));
        assert_eq!(align_up(1, PAGE), Some(PAGE));
        assert_eq!(align_up(PAGE, PAGE), Some(PAGE));
        assert_eq!(align_up(PAGE + 1, PAGE), Some(2 * PAGE));
        assert_eq!(align_up(usize::MAX - PAGE, PAGE), None);
    }
}

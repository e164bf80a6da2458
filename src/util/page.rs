//! Page-size detection and alignment helpers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// System page size (cached)
static SYSTEM_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get system page size dynamically
///
/// Returns the actual system page size from the OS, cached after the
/// first query.
pub fn page_size() -> usize {
    let cached = SYSTEM_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let size = page_size::get();
    SYSTEM_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Align size to page boundary (round up)
pub fn align_up(size: usize) -> usize {
    let ps = page_size();
    (size + ps - 1) & !(ps - 1)
}

/// Check if address is page-aligned
pub fn is_page_aligned(addr: usize) -> bool {
    addr & (page_size() - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_align_up() {
        let ps = page_size();
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), ps);
        assert_eq!(align_up(ps), ps);
        assert_eq!(align_up(ps + 1), 2 * ps);
    }

    #[test]
    fn test_is_page_aligned() {
        let ps = page_size();
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(ps * 3));
        assert!(!is_page_aligned(ps + 8));
    }
}

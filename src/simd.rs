//! The cache-assisted diff copy.
//!
//! When a written page is drained, its content has to be propagated into
//! the device-visible memory. Copying the whole page would write far more
//! than was actually modified, so the copy is assisted by a private cache
//! snapshot of the page: only words that differ from the cache are
//! touched, and for those the delta is XORed into both the destination and
//! the cache. After the call the cache equals the source, and the
//! destination received exactly the changed words.

/// Copies the words of `src[..len]` that differ from `cache[..len]` into
/// `dest`, updating `cache` to match `src`.
///
/// Equal words leave `dest` bit-identical. `dest` may be unaligned; on
/// `x86_64` the comparison runs over 16-byte lanes, elsewhere over `u64`
/// words, with a byte tail for the remainder.
///
/// # Safety
///
/// `dest`, `src` and `cache` must each be valid for `len` bytes and must
/// not overlap.
pub unsafe fn copy_with_cache(dest: *mut u8, src: *const u8, cache: *mut u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        copy_with_cache_sse2(dest, src, cache, len);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        copy_with_cache_scalar(dest, src, cache, len);
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn copy_with_cache_sse2(dest: *mut u8, src: *const u8, cache: *mut u8, len: usize) {
    use core::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_storeu_si128,
        _mm_xor_si128,
    };

    const LANE: usize = core::mem::size_of::<__m128i>();

    let lanes = len / LANE;
    for i in 0..lanes {
        let offset = i * LANE;
        let s = _mm_loadu_si128(src.add(offset) as *const __m128i);
        let c = _mm_loadu_si128(cache.add(offset) as *const __m128i);
        if _mm_movemask_epi8(_mm_cmpeq_epi8(s, c)) != 0xFFFF {
            let delta = _mm_xor_si128(s, c);
            _mm_storeu_si128(cache.add(offset) as *mut __m128i, s);

            let mut lane = [0_u64; 2];
            _mm_storeu_si128(lane.as_mut_ptr() as *mut __m128i, delta);
            let d = dest.add(offset) as *mut u64;
            d.write_unaligned(d.read_unaligned() ^ lane[0]);
            let d = d.add(1);
            d.write_unaligned(d.read_unaligned() ^ lane[1]);
        }
    }
    copy_with_cache_scalar(
        dest.add(lanes * LANE),
        src.add(lanes * LANE),
        cache.add(lanes * LANE),
        len % LANE,
    );
}

unsafe fn copy_with_cache_scalar(dest: *mut u8, src: *const u8, cache: *mut u8, len: usize) {
    const WORD: usize = core::mem::size_of::<u64>();

    let words = len / WORD;
    for i in 0..words {
        let offset = i * WORD;
        let s = (src.add(offset) as *const u64).read_unaligned();
        let c = (cache.add(offset) as *const u64).read_unaligned();
        if s != c {
            (cache.add(offset) as *mut u64).write_unaligned(s);
            let d = dest.add(offset) as *mut u64;
            d.write_unaligned(d.read_unaligned() ^ (s ^ c));
        }
    }
    for offset in words * WORD..len {
        let s = *src.add(offset);
        let c = *cache.add(offset);
        if s != c {
            *cache.add(offset) = s;
            *dest.add(offset) ^= s ^ c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::copy_with_cache;

    #[test]
    fn test_identical_buffers_touch_nothing() {
        let mut dest = vec![0xa5_u8; 4096];
        let src = vec![0x5a_u8; 4096];
        let mut cache = vec![0x5a_u8; 4096];

        // src == cache everywhere; dest keeps its (divergent) content.
        unsafe { copy_with_cache(dest.as_mut_ptr(), src.as_ptr(), cache.as_mut_ptr(), 4096) };
        assert!(dest.iter().all(|&b| b == 0xa5));
        assert_eq!(cache, src);
    }

    #[test]
    fn test_single_word_diff_propagates_only_that_word() {
        let mut dest = vec![0_u8; 4096];
        let mut src = vec![0_u8; 4096];
        let mut cache = vec![0_u8; 4096];

        // One 16-byte-aligned word modified in the source only.
        src[512..528].copy_from_slice(&[0xff; 16]);

        unsafe { copy_with_cache(dest.as_mut_ptr(), src.as_ptr(), cache.as_mut_ptr(), 4096) };

        assert_eq!(&dest[512..528], &[0xff; 16]);
        assert!(dest[..512].iter().all(|&b| b == 0));
        assert!(dest[528..].iter().all(|&b| b == 0));
        assert_eq!(cache, src);
    }

    #[test]
    fn test_dest_converges_when_dest_equals_cache() {
        // The tracker's invariant: dest and cache agree before the copy, so
        // XORing the delta in makes dest equal to src.
        let mut dest: Vec<u8> = (0..=255).cycle().take(8192).collect();
        let mut cache = dest.clone();
        let mut src = dest.clone();
        src[0] = !src[0];
        src[4095] ^= 0x40;
        src[7000] ^= 0x01;

        unsafe { copy_with_cache(dest.as_mut_ptr(), src.as_ptr(), cache.as_mut_ptr(), 8192) };
        assert_eq!(dest, src);
        assert_eq!(cache, src);
    }

    #[test]
    fn test_unaligned_length_tail() {
        let mut dest = vec![0_u8; 37];
        let mut src = vec![0_u8; 37];
        let mut cache = vec![0_u8; 37];
        src[36] = 0x7f;
        src[3] = 0x11;

        unsafe { copy_with_cache(dest.as_mut_ptr(), src.as_ptr(), cache.as_mut_ptr(), 37) };
        assert_eq!(dest, src);
        assert_eq!(cache, src);
    }
}

use rand::Rng;

use crate::set::table::RawSet;

/// Candidates gathered per sample before picking. Large enough that the
/// pool dwarfs any probe chain (chains stay under ten buckets, seventy
/// elements, with overwhelming probability), so elements inside a dense
/// chain are picked no more often than anyone else.
const SAMPLE_TARGET: usize = 256;

impl<E> RawSet<E> {
    /// Picks an element uniformly at random. Bucket occupancy is uneven, so
    /// picking a random bucket and then a random slot would skew towards
    /// elements in sparse buckets; instead, consecutive buckets starting at
    /// a random index are gathered until the candidate pool is large enough,
    /// and one candidate is picked uniformly.
    pub(crate) fn fair_random_element(&self, rng: &mut impl Rng) -> Option<&E> {
        if self.len() == 0 {
            return None;
        }
        let (large, small) = if self.num_buckets(1) > self.num_buckets(0) {
            (1, 0)
        } else {
            (0, 1)
        };
        let large_n = self.num_buckets(large);
        let small_n = self.num_buckets(small);
        let mask = large_n - 1;
        let mut candidates: Vec<&E> = Vec::with_capacity(SAMPLE_TARGET);
        let start = rng.gen_range(0, large_n);
        for step in 0..large_n {
            if candidates.len() >= SAMPLE_TARGET {
                break;
            }
            let idx = (start + step) & mask;
            self.bucket(large, idx).each_filled(|e| candidates.push(e));
            // While rehashing, the smaller table rides along for the indices
            // it shares with the larger one; every bucket of both tables is
            // then covered by the same number of sample windows.
            if idx < small_n {
                self.bucket(small, idx).each_filled(|e| candidates.push(e));
            }
        }
        let pick = rng.gen_range(0, candidates.len());
        Some(candidates[pick])
    }
}

//! Cross-channel request coordination for `send`/`recv`/`alt` (§4.F).
//!
//! The channel buffer/queue mechanics themselves live in
//! [`crate::heap::channel`]; this module supplies the two pieces that sit
//! above a single channel: the request-mutex shared across every channel a
//! thread is simultaneously offering in an `alt`, and the permutation used
//! to visit those channels fairly.

use parking_lot::Mutex;

/// A boolean-guarded lock owned by the requesting thread, gating "is this
/// request still live?" Shared across every channel a thread offers
/// concurrently via `alt`, so that once any one of them services the
/// request, every other channel's attempt on it can be recognised as stale
/// and discarded (§4.F).
pub struct RequestMutex {
    alive: Mutex<bool>,
}

impl RequestMutex {
    /// A fresh, live request-mutex.
    pub fn new() -> RequestMutex {
        RequestMutex { alive: Mutex::new(true) }
    }

    /// Attempts to claim the request: if still alive, marks it dead and
    /// returns `true`. Idempotent — only the first claim succeeds.
    pub fn try_claim(&self) -> bool {
        let mut alive = self.alive.lock();
        if *alive {
            *alive = false;
            true
        } else {
            false
        }
    }

    /// Re-arms a request-mutex for reuse (e.g. a fresh `alt` call reusing
    /// the thread's mutex across a new set of channels).
    pub fn reset(&self) {
        *self.alive.lock() = true;
    }

    /// Whether the request is still live, without claiming it.
    pub fn is_alive(&self) -> bool {
        *self.alive.lock()
    }
}

impl Default for RequestMutex {
    fn default() -> RequestMutex {
        RequestMutex::new()
    }
}

/// A minimal 32-bit linear-congruential generator, seeded once at VM start,
/// used to pick a fair visiting order for `alt`'s channel set. Per §4.F /
/// §9 the fairness contract is non-starvation, not unpredictability, so a
/// small LCG (no original-source equivalent exists to mirror; these are the
/// classic Numerical Recipes constants) is sufficient.
pub struct Lcg {
    state: u32,
}

impl Lcg {
    const MULTIPLIER: u32 = 1_664_525;
    const INCREMENT: u32 = 1_013_904_223;

    /// A generator seeded with `seed`.
    pub fn new(seed: u32) -> Lcg {
        Lcg { state: seed }
    }

    /// The next raw 32-bit value in the sequence.
    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(Self::MULTIPLIER).wrapping_add(Self::INCREMENT);
        self.state
    }

    /// A uniform-ish permutation of `0..n`, used to decide the order `alt`
    /// visits its candidate channels. `n == 0` yields an empty vector.
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..n).collect();
        // Fisher-Yates, driven by the LCG instead of a general-purpose RNG.
        for i in (1..n).rev() {
            let j = (self.next_u32() as usize) % (i + 1);
            indices.swap(i, j);
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_mutex_claims_exactly_once() {
        let rm = RequestMutex::new();
        assert!(rm.try_claim());
        assert!(!rm.try_claim());
        rm.reset();
        assert!(rm.try_claim());
    }

    #[test]
    fn lcg_is_deterministic_for_a_given_seed() {
        let mut a = Lcg::new(42);
        let mut b = Lcg::new(42);
        assert_eq!(a.next_u32(), b.next_u32());
        assert_eq!(a.next_u32(), b.next_u32());
    }

    #[test]
    fn permutation_is_a_bijection_of_its_range() {
        let mut lcg = Lcg::new(7);
        let mut perm = lcg.permutation(6);
        perm.sort_unstable();
        assert_eq!(perm, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn permutation_of_zero_is_empty() {
        let mut lcg = Lcg::new(7);
        assert!(lcg.permutation(0).is_empty());
    }
}

//! Correlated-randomness pool.
//!
//! Every subset of parties shares one deterministic ChaCha20 stream whose
//! seed is derived from a global setup seed and the canonical encoding of
//! the subset, so parties reproduce shared randomness without talking. A
//! party's pool holds exactly the streams of the subsets it belongs to:
//! its own stream, the all-parties stream, one pairwise stream per peer
//! and one complement stream (all parties except one) per other peer. The
//! complement of the holder's own identity resolves to the all-parties
//! stream, which is what lets a value dealer and its observers draw a
//! dealer-excluded summand from the same stream.

use rand_chacha::{ChaCha20Rng, rand_core::SeedableRng};

/// Derives the seed of the stream shared by `subset` from the global seed.
fn stream_seed(seed: &[u8; 32], subset: &[usize]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(seed);
    hasher.update(&[subset.len() as u8]);
    for &p in subset {
        hasher.update(&[p as u8]);
    }
    *hasher.finalize().as_bytes()
}

/// The streams one party may legitimately draw from.
#[derive(Debug, Clone)]
pub struct RandPool {
    id: usize,
    n: usize,
    pairwise: Vec<ChaCha20Rng>,
    complements: Vec<ChaCha20Rng>,
}

impl RandPool {
    /// Builds party `id`'s pool for `n` parties from the global seed.
    pub fn new(id: usize, n: usize, seed: &[u8; 32]) -> Self {
        let pairwise = (0..n)
            .map(|j| {
                let pair = if j == id { vec![id] } else { vec![id.min(j), id.max(j)] };
                ChaCha20Rng::from_seed(stream_seed(seed, &pair))
            })
            .collect();
        let complements = (0..n)
            .map(|j| {
                let subset: Vec<usize> = (0..n).filter(|&p| p != j || j == id).collect();
                ChaCha20Rng::from_seed(stream_seed(seed, &subset))
            })
            .collect();
        Self {
            id,
            n,
            pairwise,
            complements,
        }
    }

    /// This party's identity.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of parties.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Randomness known only to this party.
    pub fn own(&mut self) -> &mut ChaCha20Rng {
        let id = self.id;
        &mut self.pairwise[id]
    }

    /// Randomness known to every party.
    pub fn all(&mut self) -> &mut ChaCha20Rng {
        let id = self.id;
        &mut self.complements[id]
    }

    /// Randomness shared pairwise with `peer` (own stream for `peer == id`).
    pub fn shared_with(&mut self, peer: usize) -> &mut ChaCha20Rng {
        &mut self.pairwise[peer]
    }

    /// Pairwise stream addressed by a cyclic offset from this party.
    pub fn shared_with_relative(&mut self, offset: isize) -> &mut ChaCha20Rng {
        let peer = self.relative(offset);
        self.shared_with(peer)
    }

    /// Randomness known to every party except `peer` (the all-parties
    /// stream for `peer == id`).
    pub fn complement(&mut self, peer: usize) -> &mut ChaCha20Rng {
        &mut self.complements[peer]
    }

    /// Complement stream addressed by a cyclic offset from this party.
    pub fn complement_relative(&mut self, offset: isize) -> &mut ChaCha20Rng {
        let peer = self.relative(offset);
        self.complement(peer)
    }

    /// The proper complement stream of `peer`, or `None` for the party
    /// itself, which does not hold its own complement.
    pub fn complement_proper(&mut self, peer: usize) -> Option<&mut ChaCha20Rng> {
        if peer == self.id {
            None
        } else {
            Some(&mut self.complements[peer])
        }
    }

    fn relative(&self, offset: isize) -> usize {
        let n = self.n as isize;
        (((self.id as isize + offset) % n + n) % n) as usize
    }
}

/// Every stream of the pool, as the assumed correlated-randomness dealer
/// sees it.
///
/// The offline evaluator advances a replica of this view in lockstep with
/// its party pool; the replica supplies the trusted-setup correlations
/// (comparison blinds, sign-bit decompositions) and never communicates.
#[derive(Debug, Clone)]
pub struct DealerPool {
    all: ChaCha20Rng,
    complements: Vec<ChaCha20Rng>,
}

impl DealerPool {
    /// Builds the full view for `n` parties from the global seed.
    pub fn new(n: usize, seed: &[u8; 32]) -> Self {
        let everyone: Vec<usize> = (0..n).collect();
        let complements = (0..n)
            .map(|j| {
                let subset: Vec<usize> = (0..n).filter(|&p| p != j).collect();
                ChaCha20Rng::from_seed(stream_seed(seed, &subset))
            })
            .collect();
        Self {
            all: ChaCha20Rng::from_seed(stream_seed(seed, &everyone)),
            complements,
        }
    }

    /// The all-parties stream.
    pub fn all(&mut self) -> &mut ChaCha20Rng {
        &mut self.all
    }

    /// The proper complement stream of `peer`.
    pub fn complement(&mut self, peer: usize) -> &mut ChaCha20Rng {
        &mut self.complements[peer]
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;

    const SEED: [u8; 32] = [42; 32];

    #[test]
    fn pairwise_streams_agree_between_holders() {
        for n in [5, 7] {
            for a in 0..n {
                for b in 0..n {
                    if a == b {
                        continue;
                    }
                    let mut pa = RandPool::new(a, n, &SEED);
                    let mut pb = RandPool::new(b, n, &SEED);
                    assert_eq!(
                        pa.shared_with(b).next_u64(),
                        pb.shared_with(a).next_u64()
                    );
                }
            }
        }
    }

    #[test]
    fn complement_streams_agree_between_holders() {
        let n = 5;
        for excluded in 0..n {
            let draws: Vec<u64> = (0..n)
                .filter(|&p| p != excluded)
                .map(|p| RandPool::new(p, n, &SEED).complement(excluded).next_u64())
                .collect();
            assert!(draws.windows(2).all(|w| w[0] == w[1]));
            // The dealer view sees the same stream.
            assert_eq!(
                DealerPool::new(n, &SEED).complement(excluded).next_u64(),
                draws[0]
            );
            // The excluded party's pool maps this index to the all stream.
            let mut excluded_pool = RandPool::new(excluded, n, &SEED);
            assert_ne!(excluded_pool.complement(excluded).next_u64(), draws[0]);
        }
    }

    #[test]
    fn all_stream_is_common() {
        let n = 7;
        let draws: Vec<u64> = (0..n)
            .map(|p| RandPool::new(p, n, &SEED).all().next_u64())
            .collect();
        assert!(draws.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(DealerPool::new(n, &SEED).all().next_u64(), draws[0]);
    }

    #[test]
    fn own_stream_is_distinct_and_relative_addressing_wraps() {
        let n = 5;
        let mut pool = RandPool::new(0, n, &SEED);
        let own = pool.own().next_u64();
        let mut other = RandPool::new(1, n, &SEED);
        assert_ne!(own, other.own().next_u64());

        let mut pool = RandPool::new(0, n, &SEED);
        let mut again = RandPool::new(0, n, &SEED);
        assert_eq!(
            pool.shared_with_relative(-1).next_u64(),
            again.shared_with(n - 1).next_u64()
        );
        assert!(pool.complement_proper(0).is_none());
        assert!(pool.complement_proper(3).is_some());
    }

    #[test]
    fn streams_differ_per_seed() {
        let mut a = RandPool::new(2, 5, &SEED);
        let mut b = RandPool::new(2, 5, &[7; 32]);
        assert_ne!(a.all().next_u64(), b.all().next_u64());
    }
}

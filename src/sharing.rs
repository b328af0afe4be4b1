//! Generalized replicated secret sharing.
//!
//! A secret is split into one summand per k-subset of the `n` parties; the
//! summand indexed by subset `S` is known to every party *not* in `S` and
//! to nobody in `S`. [`Scheme`] owns the combinatorics of this layout: the
//! colexicographic subset enumeration, the per-receiver assignment of
//! missing summands to sender triples during reconstruction, and the
//! grouping of mask cross-terms by the triples that can compute them.
//! [`RepShare`] is one party's view of a shared value, [`DummyShare`] is
//! the full summand vector only a trusted dealer may hold.

use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ring::RingElem;

/// Raised for party/subset configurations the protocol cannot support.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidScheme {
    /// Fewer parties than reconstruction triples require (`n >= 3k + 1`).
    #[error("{n} parties cannot serve {k} disjoint sender triples per receiver")]
    TooFewForReconstruction {
        /// Configured party count.
        n: usize,
        /// Configured excluded-subset size.
        k: usize,
    },
    /// Fewer parties than the cross-term protocol requires (`n >= 2k + 3`).
    #[error("{n} parties leave no sender triple outside two excluded {k}-subsets")]
    TooFewForCrossTerms {
        /// Configured party count.
        n: usize,
        /// Configured excluded-subset size.
        k: usize,
    },
    /// `k` must be at least 1.
    #[error("excluded subsets must be nonempty")]
    EmptyExclusion,
}

/// Binomial coefficient over the small ranges the schemes use.
pub(crate) fn binomial(n: usize, k: usize) -> usize {
    if k > n {
        return 0;
    }
    let mut res = 1usize;
    for i in 0..k {
        res = res * (n - i) / (i + 1);
    }
    res
}

/// One cross-term group of the mask-product protocol.
///
/// All ordered summand pairs `(s1, s2)` whose union of excluded subsets
/// avoids `triple` are assigned to it; the triple's members aggregate the
/// products and re-share the total, writing the balance into
/// `closing_slot` and Jump-delivering it to `receivers` (the holders of
/// that slot outside the triple).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossGroup {
    /// The three parties that jointly know every product in the group.
    pub triple: [usize; 3],
    /// Ordered summand index pairs assigned to this group.
    pub pairs: Vec<(usize, usize)>,
    /// Summand index receiving the re-share balance.
    pub closing_slot: usize,
    /// Parties outside the triple that hold `closing_slot`.
    pub receivers: Vec<usize>,
}

/// The `(n, k)` replicated-sharing access structure.
///
/// Subsets are enumerated colexicographically; the rank of a sorted subset
/// `{s_0 < s_1 < ...}` is the sum of `C(s_i, i + 1)`. For `k = 1` the rank
/// is the excluded party id itself, for `k = 2` the familiar
/// upper-triangular pair index.
#[derive(Debug, Clone)]
pub struct Scheme {
    n: usize,
    k: usize,
    subsets: Vec<Vec<usize>>,
    missing: Vec<Vec<usize>>,
    cross_groups: Vec<CrossGroup>,
}

impl Scheme {
    /// Builds the access structure for `n` parties and excluded subsets of
    /// size `k`.
    pub fn new(n: usize, k: usize) -> Result<Self, InvalidScheme> {
        if k == 0 {
            return Err(InvalidScheme::EmptyExclusion);
        }
        if n < 3 * k + 1 {
            return Err(InvalidScheme::TooFewForReconstruction { n, k });
        }
        if n < 2 * k + 3 {
            return Err(InvalidScheme::TooFewForCrossTerms { n, k });
        }
        let subsets = enumerate_subsets(n, k);
        let missing = (0..n)
            .map(|p| {
                subsets
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.contains(&p))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        let mut scheme = Self {
            n,
            k,
            subsets,
            missing,
            cross_groups: Vec::new(),
        };
        scheme.cross_groups = scheme.build_cross_groups();
        Ok(scheme)
    }

    /// Number of parties.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Excluded-subset size.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of summands per share, `C(n, k)`.
    pub fn num_slots(&self) -> usize {
        self.subsets.len()
    }

    /// The sorted excluded subset of a summand index.
    pub fn subset(&self, slot: usize) -> &[usize] {
        &self.subsets[slot]
    }

    /// Colexicographic rank of a sorted subset.
    pub fn rank(&self, subset: &[usize]) -> usize {
        subset
            .iter()
            .enumerate()
            .map(|(i, &s)| binomial(s, i + 1))
            .sum()
    }

    /// Whether `party` holds the summand at `slot`.
    pub fn holds(&self, party: usize, slot: usize) -> bool {
        !self.subsets[slot].contains(&party)
    }

    /// Summand indices excluded from `party`'s view, in colex order.
    pub fn missing_slots(&self, party: usize) -> &[usize] {
        &self.missing[party]
    }

    /// The `k` disjoint sender triples that serve `receiver` during
    /// reconstruction, in cyclic order starting after the receiver.
    pub fn recon_triples(&self, receiver: usize) -> Vec<[usize; 3]> {
        (0..self.k)
            .map(|m| {
                [
                    (receiver + 3 * m + 1) % self.n,
                    (receiver + 3 * m + 2) % self.n,
                    (receiver + 3 * m + 3) % self.n,
                ]
            })
            .collect()
    }

    /// Assigns each summand missing from `receiver` to the first of its
    /// [`Self::recon_triples`] disjoint from the summand's subset. Returns
    /// one slot list per triple.
    pub fn recon_assignment(&self, receiver: usize) -> Vec<Vec<usize>> {
        let triples = self.recon_triples(receiver);
        let mut out = vec![Vec::new(); triples.len()];
        for &slot in self.missing_slots(receiver) {
            let subset = self.subset(slot);
            let m = triples
                .iter()
                .position(|t| t.iter().all(|p| !subset.contains(p)))
                .unwrap_or_else(|| {
                    unreachable!("k disjoint triples always leave one free of a k-subset")
                });
            out[m].push(slot);
        }
        out
    }

    /// Cross-term groups in canonical (ascending triple) order.
    pub fn cross_groups(&self) -> &[CrossGroup] {
        &self.cross_groups
    }

    fn build_cross_groups(&self) -> Vec<CrossGroup> {
        let slots = self.num_slots();
        let mut groups: Vec<CrossGroup> = Vec::new();
        for s1 in 0..slots {
            for s2 in 0..slots {
                let mut union = self.subsets[s1].clone();
                for &p in &self.subsets[s2] {
                    if !union.contains(&p) {
                        union.push(p);
                    }
                }
                let known: Vec<usize> =
                    (0..self.n).filter(|p| !union.contains(p)).collect();
                let triple = [known[0], known[1], known[2]];
                match groups.iter_mut().find(|g| g.triple == triple) {
                    Some(g) => g.pairs.push((s1, s2)),
                    None => {
                        let outside: Vec<usize> =
                            (0..self.n).filter(|p| !triple.contains(p)).collect();
                        let closing: Vec<usize> =
                            outside[outside.len() - self.k..].to_vec();
                        let receivers = outside[..outside.len() - self.k].to_vec();
                        groups.push(CrossGroup {
                            triple,
                            pairs: vec![(s1, s2)],
                            closing_slot: self.rank(&closing),
                            receivers,
                        });
                    }
                }
            }
        }
        groups.sort_by_key(|g| g.triple);
        groups
    }
}

/// Colex-ordered enumeration of all k-subsets of `{0..n-1}`.
fn enumerate_subsets(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::with_capacity(binomial(n, k));
    let mut cur: Vec<usize> = (0..k).collect();
    loop {
        out.push(cur.clone());
        let mut i = 0;
        while i < k {
            let limit = if i + 1 < k { cur[i + 1] } else { n };
            if cur[i] + 1 < limit {
                break;
            }
            i += 1;
        }
        if i == k {
            return out;
        }
        cur[i] += 1;
        for (j, v) in cur.iter_mut().enumerate().take(i) {
            *v = j;
        }
    }
}

/// One party's replicated share: the full summand vector with zeros at the
/// subsets containing the party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepShare<T> {
    slots: Vec<T>,
}

impl<T: RingElem> RepShare<T> {
    /// The all-zero share over `num_slots` summands.
    pub fn zero(num_slots: usize) -> Self {
        Self {
            slots: vec![T::ZERO; num_slots],
        }
    }

    /// Wraps an explicit summand vector.
    pub fn from_slots(slots: Vec<T>) -> Self {
        Self { slots }
    }

    /// Number of summand slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// The summand at `slot` (zero where this view is excluded).
    pub fn slot(&self, slot: usize) -> T {
        self.slots[slot]
    }

    /// Adds `v` into the summand at `slot`.
    pub fn add_to_slot(&mut self, slot: usize, v: T) {
        self.slots[slot] += v;
    }

    /// Overwrites the summand at `slot`.
    pub fn set_slot(&mut self, slot: usize, v: T) {
        self.slots[slot] = v;
    }

    /// Sum of the locally known summands.
    pub fn local_sum(&self) -> T {
        self.slots.iter().copied().sum()
    }
}

impl<T: RingElem> Add for &RepShare<T> {
    type Output = RepShare<T>;

    fn add(self, rhs: Self) -> RepShare<T> {
        debug_assert_eq!(self.slots.len(), rhs.slots.len());
        RepShare {
            slots: self
                .slots
                .iter()
                .zip(&rhs.slots)
                .map(|(&a, &b)| a + b)
                .collect(),
        }
    }
}

impl<T: RingElem> Sub for &RepShare<T> {
    type Output = RepShare<T>;

    fn sub(self, rhs: Self) -> RepShare<T> {
        debug_assert_eq!(self.slots.len(), rhs.slots.len());
        RepShare {
            slots: self
                .slots
                .iter()
                .zip(&rhs.slots)
                .map(|(&a, &b)| a - b)
                .collect(),
        }
    }
}

impl<T: RingElem> Mul<T> for &RepShare<T> {
    type Output = RepShare<T>;

    fn mul(self, rhs: T) -> RepShare<T> {
        RepShare {
            slots: self.slots.iter().map(|&a| a * rhs).collect(),
        }
    }
}

impl<T: RingElem> Neg for &RepShare<T> {
    type Output = RepShare<T>;

    fn neg(self) -> RepShare<T> {
        RepShare {
            slots: self.slots.iter().map(|&a| -a).collect(),
        }
    }
}

impl<T: RingElem> AddAssign<&RepShare<T>> for RepShare<T> {
    fn add_assign(&mut self, rhs: &RepShare<T>) {
        debug_assert_eq!(self.slots.len(), rhs.slots.len());
        for (a, &b) in self.slots.iter_mut().zip(&rhs.slots) {
            *a += b;
        }
    }
}

impl<T: RingElem> SubAssign<&RepShare<T>> for RepShare<T> {
    fn sub_assign(&mut self, rhs: &RepShare<T>) {
        debug_assert_eq!(self.slots.len(), rhs.slots.len());
        for (a, &b) in self.slots.iter_mut().zip(&rhs.slots) {
            *a -= b;
        }
    }
}

/// The full summand vector of one shared value.
///
/// Holding this means knowing the secret; it exists only inside trusted
/// setup paths (the insecure preprocessing mode and the dealer replica).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyShare<T> {
    summands: Vec<T>,
}

impl<T: RingElem> DummyShare<T> {
    /// The all-zero sharing.
    pub fn zero(num_slots: usize) -> Self {
        Self {
            summands: vec![T::ZERO; num_slots],
        }
    }

    /// Uniformly random summands, sharing a uniformly random secret.
    pub fn random<R: Rng + ?Sized>(num_slots: usize, rng: &mut R) -> Self {
        Self {
            summands: (0..num_slots).map(|_| T::random(rng)).collect(),
        }
    }

    /// Shares `secret`: all but the last summand are random, the last
    /// balances the sum.
    pub fn share<R: Rng + ?Sized>(secret: T, num_slots: usize, rng: &mut R) -> Self {
        let mut summands: Vec<T> = (0..num_slots - 1).map(|_| T::random(rng)).collect();
        let partial: T = summands.iter().copied().sum();
        summands.push(secret - partial);
        Self { summands }
    }

    /// Wraps explicit summands.
    pub fn from_summands(summands: Vec<T>) -> Self {
        Self { summands }
    }

    /// The shared secret, the sum of all summands.
    pub fn secret(&self) -> T {
        self.summands.iter().copied().sum()
    }

    /// The summand at `slot`.
    pub fn summand(&self, slot: usize) -> T {
        self.summands[slot]
    }

    /// Adds `v` into the summand at `slot`.
    pub fn add_to_slot(&mut self, slot: usize, v: T) {
        self.summands[slot] += v;
    }

    /// The replicated view of `party`: summands whose excluded subset
    /// contains the party are zeroed.
    pub fn project(&self, scheme: &Scheme, party: usize) -> RepShare<T> {
        RepShare {
            slots: self
                .summands
                .iter()
                .enumerate()
                .map(|(slot, &v)| {
                    if scheme.holds(party, slot) {
                        v
                    } else {
                        T::ZERO
                    }
                })
                .collect(),
        }
    }
}

impl<T: RingElem> Add for &DummyShare<T> {
    type Output = DummyShare<T>;

    fn add(self, rhs: Self) -> DummyShare<T> {
        debug_assert_eq!(self.summands.len(), rhs.summands.len());
        DummyShare {
            summands: self
                .summands
                .iter()
                .zip(&rhs.summands)
                .map(|(&a, &b)| a + b)
                .collect(),
        }
    }
}

impl<T: RingElem> Sub for &DummyShare<T> {
    type Output = DummyShare<T>;

    fn sub(self, rhs: Self) -> DummyShare<T> {
        debug_assert_eq!(self.summands.len(), rhs.summands.len());
        DummyShare {
            summands: self
                .summands
                .iter()
                .zip(&rhs.summands)
                .map(|(&a, &b)| a - b)
                .collect(),
        }
    }
}

impl<T: RingElem> Mul<T> for &DummyShare<T> {
    type Output = DummyShare<T>;

    fn mul(self, rhs: T) -> DummyShare<T> {
        DummyShare {
            summands: self.summands.iter().map(|&a| a * rhs).collect(),
        }
    }
}

impl<T: RingElem> AddAssign<&DummyShare<T>> for DummyShare<T> {
    fn add_assign(&mut self, rhs: &DummyShare<T>) {
        debug_assert_eq!(self.summands.len(), rhs.summands.len());
        for (a, &b) in self.summands.iter_mut().zip(&rhs.summands) {
            *a += b;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::ring::Ring;

    fn schemes() -> Vec<Scheme> {
        vec![Scheme::new(5, 1).unwrap(), Scheme::new(7, 2).unwrap()]
    }

    #[test]
    fn rejects_unsupported_configs() {
        assert_eq!(Scheme::new(5, 0).unwrap_err(), InvalidScheme::EmptyExclusion);
        assert_eq!(
            Scheme::new(4, 1).unwrap_err(),
            InvalidScheme::TooFewForCrossTerms { n: 4, k: 1 }
        );
        assert_eq!(
            Scheme::new(6, 2).unwrap_err(),
            InvalidScheme::TooFewForReconstruction { n: 6, k: 2 }
        );
        assert!(Scheme::new(10, 3).is_ok());
    }

    #[test]
    fn colex_rank_matches_enumeration() {
        for scheme in schemes() {
            assert_eq!(scheme.num_slots(), binomial(scheme.n(), scheme.k()));
            for slot in 0..scheme.num_slots() {
                assert_eq!(scheme.rank(scheme.subset(slot)), slot);
            }
        }
        // The pair rank is the upper-triangular index.
        let scheme = Scheme::new(7, 2).unwrap();
        assert_eq!(scheme.rank(&[0, 1]), 0);
        assert_eq!(scheme.rank(&[2, 4]), 4 * 3 / 2 + 2);
        assert_eq!(scheme.rank(&[5, 6]), 20);
    }

    #[test]
    fn each_party_misses_the_right_slots() {
        for scheme in schemes() {
            let per_party = binomial(scheme.n() - 1, scheme.k() - 1);
            for p in 0..scheme.n() {
                let missing = scheme.missing_slots(p);
                assert_eq!(missing.len(), per_party);
                for &slot in missing {
                    assert!(!scheme.holds(p, slot));
                }
            }
        }
    }

    #[test]
    fn recon_assignment_covers_missing_slots() {
        for scheme in schemes() {
            for r in 0..scheme.n() {
                let triples = scheme.recon_triples(r);
                for t in &triples {
                    assert!(!t.contains(&r));
                }
                let assignment = scheme.recon_assignment(r);
                let assigned: usize = assignment.iter().map(Vec::len).sum();
                assert_eq!(assigned, scheme.missing_slots(r).len());
                for (m, slots) in assignment.iter().enumerate() {
                    for &slot in slots {
                        // Senders must hold what they deliver.
                        for &p in &triples[m] {
                            assert!(scheme.holds(p, slot));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn cross_groups_partition_all_pairs() {
        for scheme in schemes() {
            let groups = scheme.cross_groups();
            let total: usize = groups.iter().map(|g| g.pairs.len()).sum();
            assert_eq!(total, scheme.num_slots() * scheme.num_slots());
            for g in groups {
                for &(s1, s2) in &g.pairs {
                    for &p in &g.triple {
                        assert!(scheme.holds(p, s1) && scheme.holds(p, s2));
                    }
                }
                for &p in &g.triple {
                    assert!(scheme.holds(p, g.closing_slot));
                }
                for &r in &g.receivers {
                    assert!(!g.triple.contains(&r));
                    assert!(scheme.holds(r, g.closing_slot));
                }
                // Everyone outside the triple either receives the closing
                // summand or is excluded from its slot.
                for p in 0..scheme.n() {
                    if !g.triple.contains(&p) && !g.receivers.contains(&p) {
                        assert!(!scheme.holds(p, g.closing_slot));
                    }
                }
            }
        }
    }

    #[test]
    fn projections_are_consistent_and_complete() {
        let mut rng = StdRng::seed_from_u64(3);
        for scheme in schemes() {
            let dummy = DummyShare::<Ring>::share(Ring(12345), scheme.num_slots(), &mut rng);
            assert_eq!(dummy.secret(), Ring(12345));
            let views: Vec<_> = (0..scheme.n())
                .map(|p| dummy.project(&scheme, p))
                .collect();
            for slot in 0..scheme.num_slots() {
                for (p, view) in views.iter().enumerate() {
                    if scheme.holds(p, slot) {
                        assert_eq!(view.slot(slot), dummy.summand(slot));
                    } else {
                        assert_eq!(view.slot(slot), Ring::ZERO);
                    }
                }
            }
        }
    }

    #[test]
    fn share_arithmetic_is_elementwise() {
        let mut rng = StdRng::seed_from_u64(4);
        let scheme = Scheme::new(5, 1).unwrap();
        let a = DummyShare::<Ring>::share(Ring(100), scheme.num_slots(), &mut rng);
        let b = DummyShare::<Ring>::share(Ring(17), scheme.num_slots(), &mut rng);
        let pa = a.project(&scheme, 2);
        let pb = b.project(&scheme, 2);
        let sum = &pa + &pb;
        let diff = &pa - &pb;
        let scaled = &pa * Ring(3);
        for slot in 0..scheme.num_slots() {
            assert_eq!(sum.slot(slot), pa.slot(slot) + pb.slot(slot));
            assert_eq!(diff.slot(slot), pa.slot(slot) - pb.slot(slot));
            assert_eq!(scaled.slot(slot), pa.slot(slot) * Ring(3));
        }
        assert_eq!((&a + &b).secret(), Ring(117));
        assert_eq!((&a - &b).secret(), Ring(83));
        assert_eq!((&a * Ring(3)).secret(), Ring(300));
    }
}

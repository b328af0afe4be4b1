//! Offline evaluator: per-gate correlated randomness.
//!
//! Walks the leveled circuit once and produces a [`PreprocGate`] record
//! for every wire without learning any input. Plain wire masks come
//! straight out of the correlated-randomness pool: the slot indexed by
//! subset `S` is the sum of one draw from the complement stream of each
//! member of `S` (minus the dealer for input wires), so every party fills
//! exactly the slots it holds while all views advance in lockstep.
//! Products of masks are not pool-derivable; they go through the batched
//! cross-term protocol of [`product_round`], one Jump round per batch.
//!
//! Comparison blinds and the sign gates' bit decompositions are handed
//! out by a replica of the assumed correlated-randomness dealer
//! ([`DealerPool`]): a full-view pool advanced in lockstep with the
//! party's own pool that never communicates. This is a trusted-setup
//! assumption of the offline phase only.

use std::collections::HashMap;

use rand::Rng;
use rand_chacha::{ChaCha20Rng, rand_core::SeedableRng};
use thiserror::Error;

use crate::{
    channel::{self, Channel, MsgChannel},
    circuit::{Circuit, GateOp, LeveledCircuit, WireId},
    jump::{Jump, JumpError},
    pool::{DealerPool, RandPool},
    preproc::{PreprocCircuit, PreprocGate},
    ring::{BITS_BETA, BoolRing, FRACTION, Ring, RingElem},
    sharing::{DummyShare, RepShare, Scheme},
};

/// Errors of the preprocessing phase.
#[derive(Debug, Error)]
pub enum OfflineError {
    /// An input wire has no entry in the owner map.
    #[error("input wire {0} has no declared owner")]
    MissingInputOwner(WireId),
    /// An input wire's owner is not a valid party id.
    #[error("owner {owner} of input wire {wire} is not a party id below {n}")]
    InvalidInputOwner {
        /// The input wire.
        wire: WireId,
        /// The declared owner.
        owner: usize,
        /// Number of parties.
        n: usize,
    },
    /// A gate kind reached a dispatch that has no preprocessing for it.
    #[error("gate kind without preprocessing semantics at wire {0}")]
    UnsupportedGate(WireId),
    /// Failure of the triple-delivery primitive, including detected
    /// malicious behaviour.
    #[error(transparent)]
    Jump(#[from] JumpError),
    /// Transport failure.
    #[error("channel error during preprocessing: {0:?}")]
    Channel(#[from] channel::Error),
}

/// One batched mask-product instance: the terms are pointwise multiplied
/// and summed, so a multiplication gate contributes one pair and a
/// dot-product gate its whole vector.
type ProdJob<T> = Vec<(RepShare<T>, RepShare<T>)>;

/// The party's pool and the dealer replica, advanced in lockstep.
///
/// Every draw advances both views; the party side is `None` exactly when
/// the drawn stream is the complement of the party itself.
struct MaskGen {
    pool: RandPool,
    replica: DealerPool,
}

impl MaskGen {
    fn new(id: usize, n: usize, seed: &[u8; 32]) -> Self {
        Self {
            pool: RandPool::new(id, n, seed),
            replica: DealerPool::new(n, seed),
        }
    }

    fn id(&self) -> usize {
        self.pool.id()
    }

    /// Draws from the all-parties stream.
    fn draw_all<T: RingElem>(&mut self) -> T {
        let v = T::random(self.pool.all());
        let r = T::random(self.replica.all());
        debug_assert_eq!(v, r);
        v
    }

    /// Draws from the complement stream of `m`, returning the party view
    /// and the replica view.
    fn draw_compl<T: RingElem>(&mut self, m: usize) -> (Option<T>, T) {
        let replica = T::random(self.replica.complement(m));
        let party = self.pool.complement_proper(m).map(|rng| T::random(rng));
        (party, replica)
    }

    /// The value of one share slot: the sum of one complement draw per
    /// member, or an all-stream draw when `members` is empty. The party
    /// view is `None` when the party is one of the members.
    fn slot_value<T: RingElem>(&mut self, members: &[usize]) -> (Option<T>, T) {
        if members.is_empty() {
            let v = self.draw_all::<T>();
            return (Some(v), v);
        }
        let mut party = Some(T::ZERO);
        let mut replica = T::ZERO;
        for &m in members {
            let (p, r) = self.draw_compl::<T>(m);
            replica += r;
            party = match (party, p) {
                (Some(acc), Some(v)) => Some(acc + v),
                _ => None,
            };
        }
        (party, replica)
    }

    /// A fresh random mask: every slot filled by [`Self::slot_value`]
    /// over the slot's subset, minus the dealer where one is given.
    /// Returns the party's share and the plain mask total.
    fn fresh_mask<T: RingElem>(
        &mut self,
        scheme: &Scheme,
        dealer: Option<usize>,
    ) -> (RepShare<T>, T) {
        let mut share = RepShare::zero(scheme.num_slots());
        let mut total = T::ZERO;
        for slot in 0..scheme.num_slots() {
            let members: Vec<usize> = scheme
                .subset(slot)
                .iter()
                .copied()
                .filter(|&m| Some(m) != dealer)
                .collect();
            let (party, replica) = self.slot_value::<T>(&members);
            if scheme.holds(self.id(), slot) {
                let v = party.unwrap_or_else(|| {
                    unreachable!("a slot holder is outside the subset and holds every stream")
                });
                share.set_slot(slot, v);
            }
            total += replica;
        }
        (share, total)
    }

    /// A dealer-replica sharing of a uniformly random value: all summands
    /// drawn from the all-parties stream. Trusted-setup path.
    fn dealer_random<T: RingElem>(&mut self, scheme: &Scheme) -> (RepShare<T>, T) {
        let summands: Vec<T> = (0..scheme.num_slots()).map(|_| self.draw_all()).collect();
        let dummy = DummyShare::from_summands(summands);
        let secret = dummy.secret();
        (dummy.project(scheme, self.id()), secret)
    }

    /// A dealer-replica sharing of a specific value. Trusted-setup path.
    fn dealer_share_of<T: RingElem>(&mut self, scheme: &Scheme, value: T) -> RepShare<T> {
        let mut summands: Vec<T> = (1..scheme.num_slots()).map(|_| self.draw_all()).collect();
        let partial: T = summands.iter().copied().sum();
        summands.push(value - partial);
        DummyShare::from_summands(summands).project(scheme, self.id())
    }
}

/// Samples the comparison blinds from the all-parties stream:
/// `mu_1` uniform in `[1, 2^BITS_BETA)`, `mu_2` uniform in `[0, mu_1)`.
fn sample_blinds(mask_gen: &mut MaskGen) -> (Ring, Ring) {
    let mask = (1u64 << BITS_BETA) - 1;
    let mu1 = loop {
        let v = mask_gen.draw_all::<Ring>().val() & mask;
        if v != 0 {
            break v;
        }
    };
    let mu2 = loop {
        let v = mask_gen.draw_all::<Ring>().val() & mask;
        if v < mu1 {
            break v;
        }
    };
    (Ring(mu1), Ring(mu2))
}

/// The disjoint-by-construction k-subsets covering all parties used for
/// the truncation blind: consecutive chunks, with a final wrapped chunk
/// when `k` does not divide `n`, so every party is inside at least one
/// subset and no party can resolve the blind alone.
fn blind_partition(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut parts: Vec<Vec<usize>> = (0..n / k).map(|j| (j * k..j * k + k).collect()).collect();
    if n % k != 0 {
        parts.push((n - k..n).collect());
    }
    parts
}

/// Runs one batched cross-term round: for each job, turns the sum of
/// pointwise products of the paired shares into a single replicated share
/// with the standard excluded-subset structure.
///
/// Every ordered slot pair of a job's term is assigned to the canonical
/// triple of parties that holds both slots; triple members aggregate their
/// products, re-share the total with pool-derived slots and Jump-deliver
/// the balancing slot to the parties outside the triple that hold it.
async fn product_round<T: RingElem, C: Channel>(
    scheme: &Scheme,
    mask_gen: &mut MaskGen,
    jump: &mut Jump,
    chan: &mut MsgChannel<C>,
    jobs: &[ProdJob<T>],
) -> Result<Vec<RepShare<T>>, OfflineError> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let id = mask_gen.id();
    let mut out: Vec<RepShare<T>> = jobs
        .iter()
        .map(|_| RepShare::zero(scheme.num_slots()))
        .collect();
    tracing::debug!(id, jobs = jobs.len(), "cross-term round");
    for group in scheme.cross_groups() {
        let in_triple = group.triple.contains(&id);
        // Triple members start from their aggregated products and subtract
        // the re-share's other slots to close the balance.
        let mut closing: Vec<T> = if in_triple {
            jobs.iter()
                .map(|job| {
                    job.iter()
                        .map(|(x, y)| {
                            group
                                .pairs
                                .iter()
                                .map(|&(s1, s2)| x.slot(s1) * y.slot(s2))
                                .sum::<T>()
                        })
                        .sum::<T>()
                })
                .collect()
        } else {
            Vec::new()
        };
        for slot in 0..scheme.num_slots() {
            if slot == group.closing_slot {
                continue;
            }
            let members: Vec<usize> = scheme
                .subset(slot)
                .iter()
                .copied()
                .filter(|m| !group.triple.contains(m))
                .collect();
            let holds = scheme.holds(id, slot);
            for (j, outj) in out.iter_mut().enumerate() {
                let (party, _) = mask_gen.slot_value::<T>(&members);
                if holds {
                    let v = party.unwrap_or_else(|| {
                        unreachable!("a slot holder is outside the subset and holds every stream")
                    });
                    outj.add_to_slot(slot, v);
                }
                if in_triple {
                    let v = party.unwrap_or_else(|| {
                        unreachable!("triple members know every non-closing slot")
                    });
                    closing[j] -= v;
                }
            }
        }
        if in_triple {
            let bytes = T::encode_slice(&closing);
            for &r in &group.receivers {
                jump.accumulate(group.triple, r, &bytes)?;
            }
            for (outj, &v) in out.iter_mut().zip(&closing) {
                outj.add_to_slot(group.closing_slot, v);
            }
        } else if group.receivers.contains(&id) {
            jump.expect(group.triple, T::encoded_len(jobs.len()))?;
        }
    }
    jump.communicate(chan).await?;
    for group in scheme.cross_groups() {
        if group.receivers.contains(&id) {
            let vals =
                T::decode_slice(jump.values(group.triple), jobs.len()).map_err(|_| {
                    JumpError::Malicious {
                        senders: group.triple,
                        receiver: id,
                    }
                })?;
            for (outj, v) in out.iter_mut().zip(vals) {
                outj.add_to_slot(group.closing_slot, v);
            }
        }
    }
    jump.reset();
    Ok(out)
}

/// Wires whose records wait for this level's cross-term results.
enum Pending {
    Mul {
        wire: WireId,
        mask: RepShare<Ring>,
        job: usize,
    },
    Dotp {
        wire: WireId,
        mask: RepShare<Ring>,
        job: usize,
    },
    TrDotp {
        wire: WireId,
        dot_job: usize,
        /// Per bit position, the arithmetic shares of the blind's
        /// component bits, XOR-combined layer by layer.
        comps: Vec<Vec<RepShare<Ring>>>,
        /// The replica's view of the component bit values.
        vals: Vec<Vec<BoolRing>>,
    },
    Cmp {
        wire: WireId,
        mask: RepShare<Ring>,
        prev_mask: RepShare<Ring>,
        mask_mu1: RepShare<Ring>,
        beta_mu1: Ring,
        beta_mu2: Ring,
        job: usize,
    },
    Relu {
        wire: WireId,
        mask: RepShare<Ring>,
        cmp_mask: RepShare<Ring>,
        prev_mask: RepShare<Ring>,
        mask_mu1: RepShare<Ring>,
        beta_mu1: Ring,
        beta_mu2: Ring,
        job: usize,
        job2: usize,
    },
    Msb {
        wire: WireId,
        mask: RepShare<Ring>,
        mask_b: RepShare<Ring>,
        mask_w: RepShare<Ring>,
        bool_records: Vec<Option<PreprocGate<BoolRing>>>,
        /// Boolean mul wires still waiting for their product share.
        bool_muls: Vec<(WireId, RepShare<BoolRing>, usize)>,
    },
}

/// One party's preprocessing session.
pub struct OfflineEvaluator<C: Channel> {
    scheme: Scheme,
    security_param: usize,
    mask_gen: MaskGen,
    jump: Jump,
    chan: MsgChannel<C>,
    msb_circ: LeveledCircuit<BoolRing>,
}

impl<C: Channel> OfflineEvaluator<C> {
    /// Creates the session for one party from the shared setup seed.
    pub fn new(
        scheme: Scheme,
        id: usize,
        security_param: usize,
        seed: &[u8; 32],
        channel: C,
    ) -> Self {
        let n = scheme.n();
        Self {
            scheme,
            security_param,
            mask_gen: MaskGen::new(id, n, seed),
            jump: Jump::new(id, n),
            chan: MsgChannel(channel),
            msb_circ: Circuit::<BoolRing>::generate_ppa_msb().order_gates_by_level(),
        }
    }

    /// The configured statistical security parameter.
    pub fn security_param(&self) -> usize {
        self.security_param
    }

    /// Returns the underlying channel, consuming the session.
    pub fn into_channel(self) -> C {
        self.chan.0
    }

    /// Produces the preprocessing records for every wire of `circ`.
    pub async fn preprocess(
        &mut self,
        circ: &LeveledCircuit<Ring>,
        input_owners: &HashMap<WireId, usize>,
    ) -> Result<PreprocCircuit<Ring>, OfflineError> {
        let id = self.mask_gen.id();
        let slots = self.scheme.num_slots();
        let mut records: Vec<Option<PreprocGate<Ring>>> = vec![None; circ.num_gates()];
        let mut masks: Vec<RepShare<Ring>> = vec![RepShare::zero(slots); circ.num_gates()];
        let mut totals: Vec<Ring> = vec![Ring::ZERO; circ.num_gates()];
        tracing::debug!(id, gates = circ.num_gates(), "offline preprocessing start");

        for level in &circ.levels {
            let mut ring_jobs: Vec<ProdJob<Ring>> = Vec::new();
            let mut bool_jobs: Vec<ProdJob<BoolRing>> = Vec::new();
            let mut pending: Vec<Pending> = Vec::new();

            for &w in level {
                match &circ.gates[w] {
                    GateOp::Input => {
                        let owner = *input_owners
                            .get(&w)
                            .ok_or(OfflineError::MissingInputOwner(w))?;
                        if owner >= self.scheme.n() {
                            return Err(OfflineError::InvalidInputOwner {
                                wire: w,
                                owner,
                                n: self.scheme.n(),
                            });
                        }
                        let (mask, total) = self.mask_gen.fresh_mask(&self.scheme, Some(owner));
                        totals[w] = total;
                        masks[w] = mask.clone();
                        records[w] = Some(PreprocGate::Input {
                            mask,
                            owner,
                            mask_total: (owner == id).then_some(total),
                        });
                    }
                    GateOp::Add(a, b) => {
                        let mask = &masks[*a] + &masks[*b];
                        totals[w] = totals[*a] + totals[*b];
                        masks[w] = mask.clone();
                        records[w] = Some(PreprocGate::Linear { mask });
                    }
                    GateOp::Sub(a, b) => {
                        let mask = &masks[*a] - &masks[*b];
                        totals[w] = totals[*a] - totals[*b];
                        masks[w] = mask.clone();
                        records[w] = Some(PreprocGate::Linear { mask });
                    }
                    GateOp::ConstAdd(a, _) => {
                        // The constant shifts only the public masked value.
                        let mask = masks[*a].clone();
                        totals[w] = totals[*a];
                        masks[w] = mask.clone();
                        records[w] = Some(PreprocGate::Linear { mask });
                    }
                    GateOp::ConstMul(a, c) => {
                        let mask = &masks[*a] * *c;
                        totals[w] = totals[*a] * *c;
                        masks[w] = mask.clone();
                        records[w] = Some(PreprocGate::Linear { mask });
                    }
                    GateOp::Mul(a, b) => {
                        let (mask, total) = self.mask_gen.fresh_mask(&self.scheme, None);
                        totals[w] = total;
                        masks[w] = mask.clone();
                        ring_jobs.push(vec![(masks[*a].clone(), masks[*b].clone())]);
                        pending.push(Pending::Mul {
                            wire: w,
                            mask,
                            job: ring_jobs.len() - 1,
                        });
                    }
                    GateOp::Dotp(xs, ys) => {
                        let (mask, total) = self.mask_gen.fresh_mask(&self.scheme, None);
                        totals[w] = total;
                        masks[w] = mask.clone();
                        ring_jobs.push(
                            xs.iter()
                                .zip(ys)
                                .map(|(&x, &y)| (masks[x].clone(), masks[y].clone()))
                                .collect(),
                        );
                        pending.push(Pending::Dotp {
                            wire: w,
                            mask,
                            job: ring_jobs.len() - 1,
                        });
                    }
                    GateOp::TrDotp(xs, ys) => {
                        ring_jobs.push(
                            xs.iter()
                                .zip(ys)
                                .map(|(&x, &y)| (masks[x].clone(), masks[y].clone()))
                                .collect(),
                        );
                        let parts = blind_partition(self.scheme.n(), self.scheme.k());
                        let mut comps = Vec::with_capacity(64);
                        let mut vals = Vec::with_capacity(64);
                        for _bit in 0..64 {
                            let mut bit_comps = Vec::with_capacity(parts.len());
                            let mut bit_vals = Vec::with_capacity(parts.len());
                            for part in &parts {
                                let slot = self.scheme.rank(part);
                                let (party, replica) =
                                    self.mask_gen.slot_value::<BoolRing>(part);
                                let mut share = RepShare::zero(slots);
                                if let Some(bit) = party {
                                    share.set_slot(slot, Ring(bit.val() as u64));
                                }
                                bit_comps.push(share);
                                bit_vals.push(replica);
                            }
                            comps.push(bit_comps);
                            vals.push(bit_vals);
                        }
                        pending.push(Pending::TrDotp {
                            wire: w,
                            dot_job: ring_jobs.len() - 1,
                            comps,
                            vals,
                        });
                    }
                    GateOp::Cmp(x) => {
                        let (mask, prev_mask, mask_mu1, beta_mu1, beta_mu2, total) =
                            self.cmp_masks();
                        totals[w] = total;
                        masks[w] = mask.clone();
                        ring_jobs.push(vec![(masks[*x].clone(), mask_mu1.clone())]);
                        pending.push(Pending::Cmp {
                            wire: w,
                            mask,
                            prev_mask,
                            mask_mu1,
                            beta_mu1,
                            beta_mu2,
                            job: ring_jobs.len() - 1,
                        });
                    }
                    GateOp::Relu(x) => {
                        let (cmp_mask, prev_mask, mask_mu1, beta_mu1, beta_mu2, _) =
                            self.cmp_masks();
                        let (mask, total) = self.mask_gen.fresh_mask(&self.scheme, None);
                        totals[w] = total;
                        masks[w] = mask.clone();
                        ring_jobs.push(vec![(masks[*x].clone(), mask_mu1.clone())]);
                        let job = ring_jobs.len() - 1;
                        ring_jobs.push(vec![(cmp_mask.clone(), masks[*x].clone())]);
                        pending.push(Pending::Relu {
                            wire: w,
                            mask,
                            cmp_mask,
                            prev_mask,
                            mask_mu1,
                            beta_mu1,
                            beta_mu2,
                            job,
                            job2: ring_jobs.len() - 1,
                        });
                    }
                    GateOp::Msb(x) => {
                        let (p, total) = self.msb_masks(w, *x, &totals, &mut bool_jobs)?;
                        totals[w] = total;
                        if let Pending::Msb { mask, .. } = &p {
                            masks[w] = mask.clone();
                        }
                        pending.push(p);
                    }
                }
            }

            let ring_results = product_round(
                &self.scheme,
                &mut self.mask_gen,
                &mut self.jump,
                &mut self.chan,
                &ring_jobs,
            )
            .await?;
            let bool_results = product_round(
                &self.scheme,
                &mut self.mask_gen,
                &mut self.jump,
                &mut self.chan,
                &bool_jobs,
            )
            .await?;

            // XOR-combine the truncation blinds' component bits, one
            // cross-term round per combine layer across all gates and bits.
            loop {
                let mut layer_jobs: Vec<ProdJob<Ring>> = Vec::new();
                for p in &pending {
                    if let Pending::TrDotp { comps, .. } = p {
                        for bit_comps in comps {
                            for pair in bit_comps.chunks(2) {
                                if let [a, b] = pair {
                                    layer_jobs.push(vec![(a.clone(), b.clone())]);
                                }
                            }
                        }
                    }
                }
                if layer_jobs.is_empty() {
                    break;
                }
                let prods = product_round(
                    &self.scheme,
                    &mut self.mask_gen,
                    &mut self.jump,
                    &mut self.chan,
                    &layer_jobs,
                )
                .await?;
                let mut pi = 0;
                for p in &mut pending {
                    if let Pending::TrDotp { comps, vals, .. } = p {
                        for (bit_comps, bit_vals) in comps.iter_mut().zip(vals.iter_mut()) {
                            let old = std::mem::take(bit_comps);
                            let old_vals = std::mem::take(bit_vals);
                            for (pair, vpair) in old.chunks(2).zip(old_vals.chunks(2)) {
                                if let ([a, b], [va, vb]) = (pair, vpair) {
                                    // a XOR b as a + b - 2ab over the ring.
                                    let prod = &prods[pi];
                                    pi += 1;
                                    bit_comps.push(&(a + b) - &(prod * Ring(2)));
                                    bit_vals.push(*va + *vb);
                                } else {
                                    bit_comps.push(pair[0].clone());
                                    bit_vals.push(vpair[0]);
                                }
                            }
                        }
                    }
                }
            }

            for p in pending {
                match p {
                    Pending::Mul { wire, mask, job } => {
                        records[wire] = Some(PreprocGate::Mul {
                            mask,
                            mask_prod: ring_results[job].clone(),
                        });
                    }
                    Pending::Dotp { wire, mask, job } => {
                        records[wire] = Some(PreprocGate::Dotp {
                            mask,
                            mask_prod: ring_results[job].clone(),
                        });
                    }
                    Pending::TrDotp {
                        wire,
                        dot_job,
                        comps,
                        vals,
                    } => {
                        let mut mask = RepShare::zero(slots);
                        let mut mask_r = RepShare::zero(slots);
                        let mut r = 0u64;
                        for bit in 0..64 {
                            let share = &comps[bit][0];
                            mask_r += &(share * Ring(1u64 << bit));
                            if bit >= FRACTION as usize {
                                mask += &(share * Ring(1u64 << (bit - FRACTION as usize)));
                            }
                            r |= (vals[bit][0].val() as u64) << bit;
                        }
                        totals[wire] = Ring(r >> FRACTION);
                        masks[wire] = mask.clone();
                        records[wire] = Some(PreprocGate::TrDotp {
                            mask,
                            mask_dot: ring_results[dot_job].clone(),
                            mask_r,
                        });
                    }
                    Pending::Cmp {
                        wire,
                        mask,
                        prev_mask,
                        mask_mu1,
                        beta_mu1,
                        beta_mu2,
                        job,
                    } => {
                        records[wire] = Some(PreprocGate::Cmp {
                            mask,
                            prev_mask,
                            mask_prod: ring_results[job].clone(),
                            mask_mu1,
                            beta_mu1,
                            beta_mu2,
                        });
                    }
                    Pending::Relu {
                        wire,
                        mask,
                        cmp_mask,
                        prev_mask,
                        mask_mu1,
                        beta_mu1,
                        beta_mu2,
                        job,
                        job2,
                    } => {
                        records[wire] = Some(PreprocGate::Relu {
                            mask,
                            cmp_mask,
                            prev_mask,
                            mask_prod: ring_results[job].clone(),
                            mask_prod2: ring_results[job2].clone(),
                            mask_mu1,
                            beta_mu1,
                            beta_mu2,
                        });
                    }
                    Pending::Msb {
                        wire,
                        mask,
                        mask_b,
                        mask_w,
                        mut bool_records,
                        bool_muls,
                    } => {
                        for (bw, bmask, job) in bool_muls {
                            bool_records[bw] = Some(PreprocGate::Mul {
                                mask: bmask,
                                mask_prod: bool_results[job].clone(),
                            });
                        }
                        let bool_gates = bool_records
                            .into_iter()
                            .map(|r| r.unwrap_or_else(|| unreachable!("every boolean wire filled")))
                            .collect();
                        records[wire] = Some(PreprocGate::Msb {
                            mask,
                            bool_gates,
                            mask_b,
                            mask_w,
                        });
                    }
                }
            }
        }

        tracing::debug!(id, "offline preprocessing done");
        let gates = records
            .into_iter()
            .map(|r| r.unwrap_or_else(|| unreachable!("every wire visited by its level")))
            .collect();
        Ok(PreprocCircuit::new(gates))
    }

    /// Masks of the comparison stage shared by cmp and relu gates:
    /// `(out mask, [alpha_v], [alpha_mu1], beta_mu1, beta_mu2, out total)`.
    fn cmp_masks(
        &mut self,
    ) -> (RepShare<Ring>, RepShare<Ring>, RepShare<Ring>, Ring, Ring, Ring) {
        let (mu1, mu2) = sample_blinds(&mut self.mask_gen);
        let (mask_mu1, t1) = self.mask_gen.dealer_random::<Ring>(&self.scheme);
        let (mask_mu2, t2) = self.mask_gen.dealer_random::<Ring>(&self.scheme);
        let (prev_mask, tv) = self.mask_gen.fresh_mask::<Ring>(&self.scheme, None);
        let mask = &prev_mask + &mask_mu2;
        (mask, prev_mask, mask_mu1, mu1 + t1, mu2 + t2, tv + t2)
    }

    /// Boolean sub-circuit masks of one sign gate. The first 64 boolean
    /// inputs carry replica sharings of the bits of the negated input-wire
    /// mask total (their public masked value online is zero); the second
    /// 64 carry zero masks (their masked value online is the public bit of
    /// the input wire's beta).
    fn msb_masks(
        &mut self,
        wire: WireId,
        x: WireId,
        totals: &[Ring],
        bool_jobs: &mut Vec<ProdJob<BoolRing>>,
    ) -> Result<(Pending, Ring), OfflineError> {
        let slots = self.scheme.num_slots();
        let bits = (-totals[x]).bits();
        let num = self.msb_circ.num_gates();
        let mut bool_records: Vec<Option<PreprocGate<BoolRing>>> = vec![None; num];
        let mut bmasks: Vec<RepShare<BoolRing>> = vec![RepShare::zero(slots); num];
        let mut btotals: Vec<BoolRing> = vec![BoolRing::ZERO; num];
        let mut bool_muls = Vec::new();
        for (bw, op) in self.msb_circ.gates.iter().enumerate() {
            match op {
                GateOp::Input => {
                    if bw < 64 {
                        let mask = self.mask_gen.dealer_share_of(&self.scheme, bits[bw]);
                        bmasks[bw] = mask.clone();
                        btotals[bw] = bits[bw];
                        bool_records[bw] = Some(PreprocGate::Linear { mask });
                    } else {
                        bool_records[bw] = Some(PreprocGate::Linear {
                            mask: RepShare::zero(slots),
                        });
                    }
                }
                GateOp::Add(a, b) => {
                    let mask = &bmasks[*a] + &bmasks[*b];
                    btotals[bw] = btotals[*a] + btotals[*b];
                    bmasks[bw] = mask.clone();
                    bool_records[bw] = Some(PreprocGate::Linear { mask });
                }
                GateOp::Mul(a, b) => {
                    let (mask, total) = self.mask_gen.fresh_mask::<BoolRing>(&self.scheme, None);
                    btotals[bw] = total;
                    bmasks[bw] = mask.clone();
                    bool_jobs.push(vec![(bmasks[*a].clone(), bmasks[*b].clone())]);
                    bool_muls.push((bw, mask, bool_jobs.len() - 1));
                }
                _ => return Err(OfflineError::UnsupportedGate(wire)),
            }
        }
        let out_wire = self.msb_circ.outputs[0];
        let b_alpha = Ring(btotals[out_wire].val() as u64);
        let mask_b = self.mask_gen.dealer_share_of(&self.scheme, b_alpha);
        let (mask_w, tw) = self.mask_gen.fresh_mask::<Ring>(&self.scheme, None);
        let mask = &(-&mask_b) - &(&mask_w * Ring(2));
        let total = -b_alpha - (tw + tw);
        Ok((
            Pending::Msb {
                wire,
                mask,
                mask_b,
                mask_w,
                bool_records,
                bool_muls,
            },
            total,
        ))
    }
}

/// Insecure preprocessing from one common PRG, producing every party's
/// records at once. The trusted dealer of the test and benchmark setups.
pub fn insecure_preprocess(
    scheme: &Scheme,
    circ: &LeveledCircuit<Ring>,
    input_owners: &HashMap<WireId, usize>,
    seed: &[u8; 32],
) -> Result<Vec<PreprocCircuit<Ring>>, OfflineError> {
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let slots = scheme.num_slots();
    let n = scheme.n();
    let msb_circ = Circuit::<BoolRing>::generate_ppa_msb().order_gates_by_level();
    let mut masks: Vec<DummyShare<Ring>> = vec![DummyShare::zero(slots); circ.num_gates()];
    let mut per_party: Vec<Vec<PreprocGate<Ring>>> = vec![Vec::new(); n];

    let push_all = |recs: Vec<PreprocGate<Ring>>, per_party: &mut Vec<Vec<PreprocGate<Ring>>>| {
        for (p, rec) in recs.into_iter().enumerate() {
            per_party[p].push(rec);
        }
    };

    for (w, op) in circ.gates.iter().enumerate() {
        let recs: Vec<PreprocGate<Ring>> = match op {
            GateOp::Input => {
                let owner = *input_owners
                    .get(&w)
                    .ok_or(OfflineError::MissingInputOwner(w))?;
                if owner >= n {
                    return Err(OfflineError::InvalidInputOwner { wire: w, owner, n });
                }
                let mask = DummyShare::<Ring>::random(slots, &mut rng);
                let total = mask.secret();
                masks[w] = mask.clone();
                (0..n)
                    .map(|p| PreprocGate::Input {
                        mask: mask.project(scheme, p),
                        owner,
                        mask_total: (p == owner).then_some(total),
                    })
                    .collect()
            }
            GateOp::Add(a, b) => {
                masks[w] = &masks[*a] + &masks[*b];
                linear_records(scheme, n, &masks[w])
            }
            GateOp::Sub(a, b) => {
                masks[w] = &masks[*a] - &masks[*b];
                linear_records(scheme, n, &masks[w])
            }
            GateOp::ConstAdd(a, _) => {
                masks[w] = masks[*a].clone();
                linear_records(scheme, n, &masks[w])
            }
            GateOp::ConstMul(a, c) => {
                masks[w] = &masks[*a] * *c;
                linear_records(scheme, n, &masks[w])
            }
            GateOp::Mul(a, b) => {
                let mask = DummyShare::<Ring>::random(slots, &mut rng);
                let prod =
                    DummyShare::share(masks[*a].secret() * masks[*b].secret(), slots, &mut rng);
                masks[w] = mask.clone();
                (0..n)
                    .map(|p| PreprocGate::Mul {
                        mask: mask.project(scheme, p),
                        mask_prod: prod.project(scheme, p),
                    })
                    .collect()
            }
            GateOp::Dotp(xs, ys) => {
                let mask = DummyShare::<Ring>::random(slots, &mut rng);
                let dot: Ring = xs
                    .iter()
                    .zip(ys)
                    .map(|(&x, &y)| masks[x].secret() * masks[y].secret())
                    .sum();
                let prod = DummyShare::share(dot, slots, &mut rng);
                masks[w] = mask.clone();
                (0..n)
                    .map(|p| PreprocGate::Dotp {
                        mask: mask.project(scheme, p),
                        mask_prod: prod.project(scheme, p),
                    })
                    .collect()
            }
            GateOp::TrDotp(xs, ys) => {
                let r = Ring::random(&mut rng);
                let dot: Ring = xs
                    .iter()
                    .zip(ys)
                    .map(|(&x, &y)| masks[x].secret() * masks[y].secret())
                    .sum();
                let mask = DummyShare::share(r.shr(FRACTION), slots, &mut rng);
                let mask_dot = DummyShare::share(dot, slots, &mut rng);
                let mask_r = DummyShare::share(r, slots, &mut rng);
                masks[w] = mask.clone();
                (0..n)
                    .map(|p| PreprocGate::TrDotp {
                        mask: mask.project(scheme, p),
                        mask_dot: mask_dot.project(scheme, p),
                        mask_r: mask_r.project(scheme, p),
                    })
                    .collect()
            }
            GateOp::Cmp(x) => {
                let d = dummy_cmp(scheme, &mut rng, &masks[*x]);
                masks[w] = d.mask.clone();
                (0..n)
                    .map(|p| PreprocGate::Cmp {
                        mask: d.mask.project(scheme, p),
                        prev_mask: d.prev_mask.project(scheme, p),
                        mask_prod: d.mask_prod.project(scheme, p),
                        mask_mu1: d.mask_mu1.project(scheme, p),
                        beta_mu1: d.beta_mu1,
                        beta_mu2: d.beta_mu2,
                    })
                    .collect()
            }
            GateOp::Relu(x) => {
                let d = dummy_cmp(scheme, &mut rng, &masks[*x]);
                let mask = DummyShare::<Ring>::random(slots, &mut rng);
                let prod2 =
                    DummyShare::share(d.mask.secret() * masks[*x].secret(), slots, &mut rng);
                masks[w] = mask.clone();
                (0..n)
                    .map(|p| PreprocGate::Relu {
                        mask: mask.project(scheme, p),
                        cmp_mask: d.mask.project(scheme, p),
                        prev_mask: d.prev_mask.project(scheme, p),
                        mask_prod: d.mask_prod.project(scheme, p),
                        mask_prod2: prod2.project(scheme, p),
                        mask_mu1: d.mask_mu1.project(scheme, p),
                        beta_mu1: d.beta_mu1,
                        beta_mu2: d.beta_mu2,
                    })
                    .collect()
            }
            GateOp::Msb(x) => {
                let bits = (-masks[*x].secret()).bits();
                let num = msb_circ.num_gates();
                let mut bmasks: Vec<DummyShare<BoolRing>> =
                    vec![DummyShare::zero(slots); num];
                let mut bool_recs: Vec<Vec<PreprocGate<BoolRing>>> =
                    vec![Vec::new(); n];
                for (bw, bop) in msb_circ.gates.iter().enumerate() {
                    match bop {
                        GateOp::Input => {
                            if bw < 64 {
                                bmasks[bw] = DummyShare::share(bits[bw], slots, &mut rng);
                            }
                        }
                        GateOp::Add(a, b) => bmasks[bw] = &bmasks[*a] + &bmasks[*b],
                        GateOp::Mul(a, b) => {
                            let mask = DummyShare::<BoolRing>::random(slots, &mut rng);
                            let prod = DummyShare::share(
                                bmasks[*a].secret() * bmasks[*b].secret(),
                                slots,
                                &mut rng,
                            );
                            bmasks[bw] = mask.clone();
                            for (p, recs) in bool_recs.iter_mut().enumerate() {
                                recs.push(PreprocGate::Mul {
                                    mask: mask.project(scheme, p),
                                    mask_prod: prod.project(scheme, p),
                                });
                            }
                            continue;
                        }
                        _ => return Err(OfflineError::UnsupportedGate(w)),
                    }
                    for (p, recs) in bool_recs.iter_mut().enumerate() {
                        recs.push(PreprocGate::Linear {
                            mask: bmasks[bw].project(scheme, p),
                        });
                    }
                }
                let out_wire = msb_circ.outputs[0];
                let b_alpha = Ring(bmasks[out_wire].secret().val() as u64);
                let mask_b = DummyShare::share(b_alpha, slots, &mut rng);
                let mask_w = DummyShare::<Ring>::random(slots, &mut rng);
                let mask = &(&DummyShare::zero(slots) - &mask_b) - &(&mask_w * Ring(2));
                masks[w] = mask.clone();
                bool_recs
                    .into_iter()
                    .enumerate()
                    .map(|(p, bool_gates)| PreprocGate::Msb {
                        mask: mask.project(scheme, p),
                        bool_gates,
                        mask_b: mask_b.project(scheme, p),
                        mask_w: mask_w.project(scheme, p),
                    })
                    .collect()
            }
        };
        push_all(recs, &mut per_party);
    }
    Ok(per_party.into_iter().map(PreprocCircuit::new).collect())
}

fn linear_records(scheme: &Scheme, n: usize, mask: &DummyShare<Ring>) -> Vec<PreprocGate<Ring>> {
    (0..n)
        .map(|p| PreprocGate::Linear {
            mask: mask.project(scheme, p),
        })
        .collect()
}

struct DummyCmp {
    mask: DummyShare<Ring>,
    prev_mask: DummyShare<Ring>,
    mask_prod: DummyShare<Ring>,
    mask_mu1: DummyShare<Ring>,
    beta_mu1: Ring,
    beta_mu2: Ring,
}

fn dummy_cmp<R: Rng>(scheme: &Scheme, rng: &mut R, mask_in: &DummyShare<Ring>) -> DummyCmp {
    let slots = scheme.num_slots();
    let limit = (1u64 << BITS_BETA) - 1;
    let mu1 = loop {
        let v = rng.next_u64() & limit;
        if v != 0 {
            break v;
        }
    };
    let mu2 = loop {
        let v = rng.next_u64() & limit;
        if v < mu1 {
            break v;
        }
    };
    let mask_mu1 = DummyShare::<Ring>::random(slots, rng);
    let mask_mu2 = DummyShare::<Ring>::random(slots, rng);
    let prev_mask = DummyShare::<Ring>::random(slots, rng);
    let mask_prod = DummyShare::share(mask_in.secret() * mask_mu1.secret(), slots, rng);
    DummyCmp {
        mask: &prev_mask + &mask_mu2,
        prev_mask,
        mask_prod,
        beta_mu1: Ring(mu1) + mask_mu1.secret(),
        beta_mu2: Ring(mu2) + mask_mu2.secret(),
        mask_mu1,
    }
}

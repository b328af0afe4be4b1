//! Online evaluator: masked circuit evaluation over preprocessed records.
//!
//! Every wire carries a public masked value `beta = x + alpha`, where
//! `alpha` is the wire's preprocessed replicated mask. Linear gates are
//! local. Every non-linear gate contributes one residual share per round
//! to a level-wide batch that is opened in a single reconstruction, so
//! the number of network rounds per level does not depend on the number
//! of gates: one main round, one blinded-sign round for all comparison
//! and ReLU gates, one more for the ReLU products, and the boolean
//! sub-circuit rounds shared by all sign gates of the level.

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    channel::{self, Channel, MsgChannel},
    circuit::{Circuit, GateOp, LeveledCircuit, WireId},
    jump::{Jump, JumpError},
    preproc::{PreprocCircuit, PreprocGate},
    ring::{BITS_BETA, BITS_GAMMA, BoolRing, FRACTION, Ring, RingElem},
    sharing::{RepShare, Scheme},
};

/// Errors of the evaluation phase.
#[derive(Debug, Error)]
pub enum OnlineError {
    /// The caller owns an input wire but provided no value for it.
    #[error("no value provided for owned input wire {0}")]
    MissingInput(WireId),
    /// The caller provided a value for a wire it does not own.
    #[error("value provided for wire {0}, which is not an owned input")]
    UnexpectedInput(WireId),
    /// A preprocessing record does not match the gate at its wire.
    #[error("preprocessing record does not match the gate at wire {0}")]
    RecordMismatch(WireId),
    /// Failure of the triple-delivery primitive, including detected
    /// malicious behaviour.
    #[error(transparent)]
    Jump(#[from] JumpError),
    /// Transport failure.
    #[error("channel error during evaluation: {0:?}")]
    Channel(#[from] channel::Error),
}

/// Opens a batch of replicated shares in one Jump round.
///
/// Each party is served by its `k` cyclic sender triples; every triple
/// delivers the elementwise sums of the slots assigned to it, and the
/// opened value is the receiver's local sum plus the delivered sums.
/// An empty batch skips the round entirely.
async fn reconstruct_batch<T: RingElem, C: Channel>(
    scheme: &Scheme,
    id: usize,
    jump: &mut Jump,
    chan: &mut MsgChannel<C>,
    shares: &[RepShare<T>],
) -> Result<Vec<T>, OnlineError> {
    if shares.is_empty() {
        return Ok(Vec::new());
    }
    for r in 0..scheme.n() {
        let triples = scheme.recon_triples(r);
        let assign = scheme.recon_assignment(r);
        for (t, slots) in triples.iter().zip(&assign) {
            if slots.is_empty() {
                continue;
            }
            if t.contains(&id) {
                let sums: Vec<T> = shares
                    .iter()
                    .map(|s| slots.iter().map(|&slot| s.slot(slot)).sum())
                    .collect();
                jump.accumulate(*t, r, &T::encode_slice(&sums))?;
            } else if r == id {
                jump.expect(*t, T::encoded_len(shares.len()))?;
            }
        }
    }
    jump.communicate(chan).await?;
    let mut out: Vec<T> = shares.iter().map(|s| s.local_sum()).collect();
    for (t, slots) in scheme
        .recon_triples(id)
        .iter()
        .zip(&scheme.recon_assignment(id))
    {
        if slots.is_empty() {
            continue;
        }
        let sums = T::decode_slice(jump.values(*t), shares.len()).map_err(|_| {
            JumpError::Malicious {
                senders: *t,
                receiver: id,
            }
        })?;
        for (o, v) in out.iter_mut().zip(sums) {
            *o += v;
        }
    }
    jump.reset();
    Ok(out)
}

/// Runs the boolean sign-extraction sub-circuit for every sign gate of
/// one level in lockstep, batching each boolean level's residuals of all
/// instances into one packed reconstruction. Returns the bit-to-
/// arithmetic conversion residual and the masked output bit per gate.
#[allow(clippy::too_many_arguments)]
async fn msb_evaluate<C: Channel>(
    scheme: &Scheme,
    id: usize,
    jump: &mut Jump,
    chan: &mut MsgChannel<C>,
    msb_circ: &LeveledCircuit<BoolRing>,
    circ: &LeveledCircuit<Ring>,
    preproc: &PreprocCircuit<Ring>,
    wires: &[Ring],
    msb_wires: &[WireId],
) -> Result<Vec<(RepShare<Ring>, BoolRing)>, OnlineError> {
    let records: Vec<&Vec<PreprocGate<BoolRing>>> = msb_wires
        .iter()
        .map(|&w| match &preproc.gates[w] {
            PreprocGate::Msb { bool_gates, .. } => Ok(bool_gates),
            _ => Err(OnlineError::RecordMismatch(w)),
        })
        .collect::<Result<_, _>>()?;

    // The first 64 boolean inputs hold shares of the bits of the negated
    // input mask and evaluate to beta zero; the second 64 are unmasked
    // and carry the public bits of the input wire's beta.
    let mut vwires: Vec<Vec<BoolRing>> =
        vec![vec![BoolRing::ZERO; msb_circ.num_gates()]; msb_wires.len()];
    for (i, &w) in msb_wires.iter().enumerate() {
        let GateOp::Msb(x) = &circ.gates[w] else {
            return Err(OnlineError::RecordMismatch(w));
        };
        let bits = wires[*x].bits();
        for bw in msb_circ.input_wires() {
            if bw >= 64 {
                vwires[i][bw] = bits[bw - 64];
            }
        }
    }

    for level in &msb_circ.levels {
        let mut recon: Vec<RepShare<BoolRing>> = Vec::new();
        for (i, recs) in records.iter().enumerate() {
            for &bw in level {
                if let GateOp::Mul(a, b) = &msb_circ.gates[bw] {
                    let PreprocGate::Mul { mask, mask_prod } = &recs[bw] else {
                        return Err(OnlineError::RecordMismatch(msb_wires[i]));
                    };
                    let mut r = mask + mask_prod;
                    r -= &(recs[*a].mask() * vwires[i][*b]);
                    r -= &(recs[*b].mask() * vwires[i][*a]);
                    recon.push(r);
                }
            }
        }
        let vres = reconstruct_batch(scheme, id, jump, chan, &recon).await?;
        let mut idx = 0;
        for (i, _) in records.iter().enumerate() {
            for &bw in level {
                match &msb_circ.gates[bw] {
                    GateOp::Add(a, b) => vwires[i][bw] = vwires[i][*a] + vwires[i][*b],
                    GateOp::Mul(a, b) => {
                        vwires[i][bw] = vres[idx] + vwires[i][*a] * vwires[i][*b];
                        idx += 1;
                    }
                    _ => {}
                }
            }
        }
    }

    // Bit-to-arithmetic: with masked output bit b_beta and mask bit
    // b_alpha, the sign bit is b_beta XOR b_alpha, so the residual
    // -2([w] + [b_alpha] * b_beta) opens to beta_out - b_beta.
    let out_wire = msb_circ.outputs[0];
    let mut out = Vec::with_capacity(msb_wires.len());
    for (i, &w) in msb_wires.iter().enumerate() {
        let PreprocGate::Msb { mask_b, mask_w, .. } = &preproc.gates[w] else {
            return Err(OnlineError::RecordMismatch(w));
        };
        let b_beta = vwires[i][out_wire];
        let mut r = mask_w.clone();
        if b_beta.val() {
            r += mask_b;
        }
        out.push((&r * -Ring(2), b_beta));
    }
    Ok(out)
}

/// One party's evaluation session over a preprocessed circuit.
pub struct OnlineEvaluator<C: Channel> {
    scheme: Scheme,
    id: usize,
    chan: MsgChannel<C>,
    jump: Jump,
    preproc: PreprocCircuit<Ring>,
    circ: LeveledCircuit<Ring>,
    wires: Vec<Ring>,
    msb_circ: LeveledCircuit<BoolRing>,
}

impl<C: Channel> OnlineEvaluator<C> {
    /// Creates the session from one party's preprocessing output.
    pub fn new(
        scheme: Scheme,
        id: usize,
        preproc: PreprocCircuit<Ring>,
        circ: LeveledCircuit<Ring>,
        channel: C,
    ) -> Self {
        let n = scheme.n();
        let num_gates = circ.num_gates();
        Self {
            scheme,
            id,
            chan: MsgChannel(channel),
            jump: Jump::new(id, n),
            preproc,
            circ,
            wires: vec![Ring::ZERO; num_gates],
            msb_circ: Circuit::<BoolRing>::generate_ppa_msb().order_gates_by_level(),
        }
    }

    /// Returns the underlying channel, consuming the session.
    pub fn into_channel(self) -> C {
        self.chan.0
    }

    /// Exchanges the masked input values: each owner sends the betas of
    /// its input wires to everyone, in wire order.
    pub async fn set_inputs(&mut self, inputs: &HashMap<WireId, Ring>) -> Result<(), OnlineError> {
        let n = self.scheme.n();
        for &w in inputs.keys() {
            match &self.preproc.gates[w] {
                PreprocGate::Input { owner, .. } if *owner == self.id => {}
                _ => return Err(OnlineError::UnexpectedInput(w)),
            }
        }
        let mut counts = vec![0usize; n];
        let mut my_betas = Vec::new();
        for &w in &self.circ.levels[0] {
            if let PreprocGate::Input {
                owner, mask_total, ..
            } = &self.preproc.gates[w]
            {
                counts[*owner] += 1;
                if *owner == self.id {
                    let x = inputs.get(&w).ok_or(OnlineError::MissingInput(w))?;
                    let total = mask_total.unwrap_or_else(|| {
                        unreachable!("owners learn their input masks during preprocessing")
                    });
                    my_betas.push(total + *x);
                }
            }
        }
        for p in 0..n {
            if p != self.id && !my_betas.is_empty() {
                self.chan.send_to(p, "inputs", &my_betas).await?;
            }
        }
        let mut received: Vec<Vec<Ring>> = vec![Vec::new(); n];
        for (p, recv) in received.iter_mut().enumerate() {
            if p != self.id && counts[p] > 0 {
                *recv = self.chan.recv_vec_from(p, "inputs", counts[p]).await?;
            }
        }
        received[self.id] = my_betas;
        let mut next = vec![0usize; n];
        for &w in &self.circ.levels[0] {
            if let PreprocGate::Input { owner, .. } = &self.preproc.gates[w] {
                self.wires[w] = received[*owner][next[*owner]];
                next[*owner] += 1;
            }
        }
        Ok(())
    }

    /// Evaluates all gates of one level, running the level's batched
    /// reconstruction rounds.
    pub async fn evaluate_gates_at_depth(&mut self, depth: usize) -> Result<(), OnlineError> {
        let id = self.id;
        let Self {
            scheme,
            chan,
            jump,
            preproc,
            circ,
            wires,
            msb_circ,
            ..
        } = self;
        let level = &circ.levels[depth];
        tracing::trace!(id, depth, gates = level.len(), "evaluating level");

        let mut recon: Vec<RepShare<Ring>> = Vec::new();
        let mut msbs: Vec<WireId> = Vec::new();
        for &w in level {
            match &circ.gates[w] {
                GateOp::Mul(a, b) => {
                    let PreprocGate::Mul { mask, mask_prod } = &preproc.gates[w] else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    let mut r = mask + mask_prod;
                    r -= &(preproc.mask(*a) * wires[*b]);
                    r -= &(preproc.mask(*b) * wires[*a]);
                    recon.push(r);
                }
                GateOp::Dotp(xs, ys) => {
                    let PreprocGate::Dotp { mask, mask_prod } = &preproc.gates[w] else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    let mut r = mask + mask_prod;
                    for (&x, &y) in xs.iter().zip(ys) {
                        r -= &(preproc.mask(x) * wires[y]);
                        r -= &(preproc.mask(y) * wires[x]);
                    }
                    recon.push(r);
                }
                GateOp::TrDotp(xs, ys) => {
                    let PreprocGate::TrDotp { mask_dot, mask_r, .. } = &preproc.gates[w] else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    let mut r = mask_dot + mask_r;
                    for (&x, &y) in xs.iter().zip(ys) {
                        r -= &(preproc.mask(x) * wires[y]);
                        r -= &(preproc.mask(y) * wires[x]);
                    }
                    recon.push(r);
                }
                GateOp::Cmp(x) => {
                    let PreprocGate::Cmp {
                        prev_mask,
                        mask_prod,
                        mask_mu1,
                        beta_mu1,
                        ..
                    } = &preproc.gates[w]
                    else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    let mut r = prev_mask + mask_prod;
                    r -= &(preproc.mask(*x) * *beta_mu1);
                    r -= &(mask_mu1 * wires[*x]);
                    recon.push(r);
                }
                GateOp::Relu(x) => {
                    let PreprocGate::Relu {
                        prev_mask,
                        mask_prod,
                        mask_mu1,
                        beta_mu1,
                        ..
                    } = &preproc.gates[w]
                    else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    let mut r = prev_mask + mask_prod;
                    r -= &(preproc.mask(*x) * *beta_mu1);
                    r -= &(mask_mu1 * wires[*x]);
                    recon.push(r);
                }
                GateOp::Msb(_) => msbs.push(w),
                _ => {}
            }
        }

        let non_msb = recon.len();
        let mut msb_betas = Vec::new();
        if !msbs.is_empty() {
            let residuals =
                msb_evaluate(scheme, id, jump, chan, msb_circ, circ, preproc, wires, &msbs)
                    .await?;
            for (r, b_beta) in residuals {
                recon.push(r);
                msb_betas.push(b_beta);
            }
        }
        let vres = reconstruct_batch(scheme, id, jump, chan, &recon).await?;

        // Finalize betas; cmp and relu first write the blinded comparison
        // intermediate and are adjusted by the sign round below.
        let mut idx = 0;
        let mut msb_idx = 0;
        let mut sign_shares: Vec<RepShare<Ring>> = Vec::new();
        let mut sign_wires: Vec<WireId> = Vec::new();
        for &w in level {
            match &circ.gates[w] {
                GateOp::Input => {}
                GateOp::Add(a, b) => wires[w] = wires[*a] + wires[*b],
                GateOp::Sub(a, b) => wires[w] = wires[*a] - wires[*b],
                GateOp::ConstAdd(a, c) => wires[w] = wires[*a] + *c,
                GateOp::ConstMul(a, c) => wires[w] = wires[*a] * *c,
                GateOp::Mul(a, b) => {
                    wires[w] = vres[idx] + wires[*a] * wires[*b];
                    idx += 1;
                }
                GateOp::Dotp(xs, ys) => {
                    let sum: Ring = xs.iter().zip(ys).map(|(&x, &y)| wires[x] * wires[y]).sum();
                    wires[w] = vres[idx] + sum;
                    idx += 1;
                }
                GateOp::TrDotp(xs, ys) => {
                    let sum: Ring = xs.iter().zip(ys).map(|(&x, &y)| wires[x] * wires[y]).sum();
                    wires[w] = (vres[idx] + sum).shr(FRACTION);
                    idx += 1;
                }
                GateOp::Cmp(x) => {
                    let PreprocGate::Cmp {
                        mask,
                        beta_mu1,
                        beta_mu2,
                        ..
                    } = &preproc.gates[w]
                    else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    wires[w] = vres[idx] + wires[*x] * *beta_mu1 + *beta_mu2;
                    idx += 1;
                    sign_shares.push(mask.clone());
                    sign_wires.push(w);
                }
                GateOp::Relu(x) => {
                    let PreprocGate::Relu {
                        cmp_mask,
                        beta_mu1,
                        beta_mu2,
                        ..
                    } = &preproc.gates[w]
                    else {
                        return Err(OnlineError::RecordMismatch(w));
                    };
                    wires[w] = vres[idx] + wires[*x] * *beta_mu1 + *beta_mu2;
                    idx += 1;
                    sign_shares.push(cmp_mask.clone());
                    sign_wires.push(w);
                }
                GateOp::Msb(_) => {
                    let b_beta = Ring(msb_betas[msb_idx].val() as u64);
                    wires[w] = vres[non_msb + msb_idx] + b_beta;
                    msb_idx += 1;
                }
            }
        }

        // Sign round: open the comparison masks, strip the blind and map
        // the sign of z = x * mu_1 + mu_2 to the comparison bit.
        let sums = reconstruct_batch(scheme, id, jump, chan, &sign_shares).await?;
        let mut relu_recon: Vec<RepShare<Ring>> = Vec::new();
        let mut relu_args: Vec<(WireId, WireId, Ring)> = Vec::new();
        for (&w, sum) in sign_wires.iter().zip(sums) {
            let z = wires[w] - sum;
            let negative = (z.val() >> (BITS_GAMMA + BITS_BETA - 1)) & 1 == 1;
            wires[w] = sum + if negative { Ring::ZERO } else { Ring::ONE };
            if let GateOp::Relu(x) = &circ.gates[w] {
                let x = *x;
                let PreprocGate::Relu {
                    mask,
                    cmp_mask,
                    mask_prod2,
                    ..
                } = &preproc.gates[w]
                else {
                    return Err(OnlineError::RecordMismatch(w));
                };
                let mut r = mask + mask_prod2;
                r -= &(preproc.mask(x) * wires[w]);
                r -= &(cmp_mask * wires[x]);
                relu_recon.push(r);
                relu_args.push((w, x, wires[w]));
            }
        }

        // ReLU product round: multiply the comparison bit back onto the
        // input.
        let vres2 = reconstruct_batch(scheme, id, jump, chan, &relu_recon).await?;
        for ((w, x, beta_c), v) in relu_args.into_iter().zip(vres2) {
            wires[w] = v + beta_c * wires[x];
        }
        Ok(())
    }

    /// Opens the output wires: one reconstruction of their mask sums,
    /// then `x = beta - sum(alpha)`.
    pub async fn get_outputs(&mut self) -> Result<Vec<Ring>, OnlineError> {
        if self.circ.outputs.is_empty() {
            return Ok(Vec::new());
        }
        let shares: Vec<RepShare<Ring>> = self
            .circ
            .outputs
            .iter()
            .map(|&w| self.preproc.gates[w].mask().clone())
            .collect();
        let sums = reconstruct_batch(
            &self.scheme,
            self.id,
            &mut self.jump,
            &mut self.chan,
            &shares,
        )
        .await?;
        Ok(self
            .circ
            .outputs
            .iter()
            .zip(sums)
            .map(|(&w, sum)| self.wires[w] - sum)
            .collect())
    }

    /// Runs the whole online phase: inputs, every level, outputs.
    pub async fn evaluate_circuit(
        &mut self,
        inputs: &HashMap<WireId, Ring>,
    ) -> Result<Vec<Ring>, OnlineError> {
        self.set_inputs(inputs).await?;
        for depth in 1..self.circ.levels.len() {
            self.evaluate_gates_at_depth(depth).await?;
        }
        self.get_outputs().await
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};
    use tokio::task::JoinSet;

    use super::*;
    use crate::{channel::SimpleChannel, sharing::DummyShare};

    #[tokio::test]
    async fn reconstruction_opens_share_sums() {
        for (n, k) in [(5, 1), (7, 2)] {
            let scheme = Scheme::new(n, k).unwrap();
            let mut rng = StdRng::seed_from_u64(11);
            let secrets: Vec<DummyShare<Ring>> = (0..5)
                .map(|_| DummyShare::random(scheme.num_slots(), &mut rng))
                .collect();
            let expected: Vec<Ring> = secrets.iter().map(|s| s.secret()).collect();
            let mut join = JoinSet::new();
            for (id, channel) in SimpleChannel::channels(n).into_iter().enumerate() {
                let scheme = scheme.clone();
                let shares: Vec<RepShare<Ring>> =
                    secrets.iter().map(|s| s.project(&scheme, id)).collect();
                join.spawn(async move {
                    let mut chan = MsgChannel(channel);
                    let mut jump = Jump::new(id, n);
                    reconstruct_batch(&scheme, id, &mut jump, &mut chan, &shares)
                        .await
                        .unwrap()
                });
            }
            while let Some(res) = join.join_next().await {
                assert_eq!(res.unwrap(), expected);
            }
        }
    }

    #[tokio::test]
    async fn packed_boolean_reconstruction() {
        let n = 5;
        let scheme = Scheme::new(n, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        let secrets: Vec<DummyShare<BoolRing>> = (0..13)
            .map(|_| DummyShare::random(scheme.num_slots(), &mut rng))
            .collect();
        let expected: Vec<BoolRing> = secrets.iter().map(|s| s.secret()).collect();
        let mut join = JoinSet::new();
        for (id, channel) in SimpleChannel::channels(n).into_iter().enumerate() {
            let scheme = scheme.clone();
            let shares: Vec<RepShare<BoolRing>> =
                secrets.iter().map(|s| s.project(&scheme, id)).collect();
            join.spawn(async move {
                let mut chan = MsgChannel(channel);
                let mut jump = Jump::new(id, n);
                reconstruct_batch(&scheme, id, &mut jump, &mut chan, &shares)
                    .await
                    .unwrap()
            });
        }
        while let Some(res) = join.join_next().await {
            assert_eq!(res.unwrap(), expected);
        }
    }
}

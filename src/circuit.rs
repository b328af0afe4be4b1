//! Arithmetic circuit model.
//!
//! A circuit is a DAG of gates over one ring; each gate owns its output
//! wire, whose id is the gate's index. [`Circuit`] is the append-only
//! builder, [`LeveledCircuit`] the evaluation form with gates grouped by
//! topological depth (inputs at level 0), which is the scheduling unit of
//! both protocol phases. [`Circuit::evaluate`] is the plaintext reference
//! the protocol is tested against, and [`Circuit::generate_ppa_msb`] emits
//! the boolean sign-extraction sub-circuit used by MSB gates.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::ring::{BoolRing, FRACTION, Ring};

/// Identifier of a wire; equal to the index of the gate driving it.
pub type WireId = usize;

/// A gate, identified by its operation and operand wires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOp<T> {
    /// Circuit input owned by some party.
    Input,
    /// Wire sum.
    Add(WireId, WireId),
    /// Wire difference.
    Sub(WireId, WireId),
    /// Adds a public constant.
    ConstAdd(WireId, T),
    /// Multiplies by a public constant.
    ConstMul(WireId, T),
    /// Wire product.
    Mul(WireId, WireId),
    /// Inner product of two equal-length wire vectors.
    Dotp(Vec<WireId>, Vec<WireId>),
    /// Inner product right-shifted by [`FRACTION`] bits (fixed point).
    TrDotp(Vec<WireId>, Vec<WireId>),
    /// Sign classification: 1 if the operand is non-negative, else 0.
    Cmp(WireId),
    /// Rectified linear unit: operand if non-negative, else 0.
    Relu(WireId),
    /// Most significant bit of the operand.
    Msb(WireId),
}

impl<T> GateOp<T> {
    /// Wires this gate reads.
    pub fn operands(&self) -> Vec<WireId> {
        match self {
            GateOp::Input => Vec::new(),
            GateOp::Add(a, b) | GateOp::Sub(a, b) | GateOp::Mul(a, b) => vec![*a, *b],
            GateOp::ConstAdd(a, _) | GateOp::ConstMul(a, _) => vec![*a],
            GateOp::Dotp(xs, ys) | GateOp::TrDotp(xs, ys) => {
                xs.iter().chain(ys).copied().collect()
            }
            GateOp::Cmp(a) | GateOp::Relu(a) | GateOp::Msb(a) => vec![*a],
        }
    }
}

/// Append-only circuit builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Circuit<T> {
    gates: Vec<GateOp<T>>,
    outputs: Vec<WireId>,
}

impl<T: Clone> Circuit<T> {
    /// The empty circuit.
    pub fn new() -> Self {
        Self {
            gates: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds an input gate, returning its wire.
    pub fn new_input_wire(&mut self) -> WireId {
        self.push(GateOp::Input)
    }

    /// Adds `op`, returning its output wire.
    ///
    /// # Panics
    /// If an operand wire does not exist yet, or a SIMD gate's vectors are
    /// empty or of different lengths.
    pub fn add_gate(&mut self, op: GateOp<T>) -> WireId {
        for w in op.operands() {
            assert!(w < self.gates.len(), "operand wire {w} does not exist");
        }
        if let GateOp::Dotp(xs, ys) | GateOp::TrDotp(xs, ys) = &op {
            assert!(!xs.is_empty(), "SIMD gate with empty operand vectors");
            assert_eq!(xs.len(), ys.len(), "SIMD gate operand lengths differ");
        }
        self.push(op)
    }

    /// Marks `wire` as a circuit output.
    ///
    /// # Panics
    /// If the wire does not exist.
    pub fn set_as_output(&mut self, wire: WireId) {
        assert!(wire < self.gates.len(), "output wire {wire} does not exist");
        self.outputs.push(wire);
    }

    /// Gates by wire id.
    pub fn gates(&self) -> &[GateOp<T>] {
        &self.gates
    }

    /// Declared output wires, in declaration order.
    pub fn outputs(&self) -> &[WireId] {
        &self.outputs
    }

    /// Groups gates by topological depth.
    pub fn order_gates_by_level(&self) -> LeveledCircuit<T> {
        let mut level = vec![0usize; self.gates.len()];
        let mut depth = 0;
        for (w, op) in self.gates.iter().enumerate() {
            let l = op
                .operands()
                .iter()
                .map(|&o| level[o] + 1)
                .max()
                .unwrap_or(0);
            level[w] = l;
            depth = depth.max(l);
        }
        let mut levels = vec![Vec::new(); depth + 1];
        for (w, &l) in level.iter().enumerate() {
            levels[l].push(w);
        }
        let mut counts = GateCounts::default();
        for op in &self.gates {
            counts.record(op);
        }
        counts.depth = depth;
        LeveledCircuit {
            gates: self.gates.clone(),
            levels,
            outputs: self.outputs.clone(),
            counts,
        }
    }

    fn push(&mut self, op: GateOp<T>) -> WireId {
        self.gates.push(op);
        self.gates.len() - 1
    }
}

impl Circuit<Ring> {
    /// Plaintext reference evaluation.
    ///
    /// # Panics
    /// If `inputs` misses an input wire.
    pub fn evaluate(&self, inputs: &HashMap<WireId, Ring>) -> Vec<Ring> {
        let mut wires = vec![Ring::ZERO; self.gates.len()];
        for (w, op) in self.gates.iter().enumerate() {
            wires[w] = match op {
                GateOp::Input => *inputs
                    .get(&w)
                    .unwrap_or_else(|| panic!("no value for input wire {w}")),
                GateOp::Add(a, b) => wires[*a] + wires[*b],
                GateOp::Sub(a, b) => wires[*a] - wires[*b],
                GateOp::ConstAdd(a, c) => wires[*a] + *c,
                GateOp::ConstMul(a, c) => wires[*a] * *c,
                GateOp::Mul(a, b) => wires[*a] * wires[*b],
                GateOp::Dotp(xs, ys) => dot(&wires, xs, ys),
                GateOp::TrDotp(xs, ys) => dot(&wires, xs, ys).shr(FRACTION),
                GateOp::Cmp(a) => {
                    if (wires[*a].val() as i64) < 0 {
                        Ring::ZERO
                    } else {
                        Ring::ONE
                    }
                }
                GateOp::Relu(a) => {
                    if (wires[*a].val() as i64) < 0 {
                        Ring::ZERO
                    } else {
                        wires[*a]
                    }
                }
                GateOp::Msb(a) => Ring(wires[*a].val() >> 63),
            };
        }
        self.outputs.iter().map(|&w| wires[w]).collect()
    }
}

impl Circuit<BoolRing> {
    /// Plaintext reference evaluation of a boolean circuit. Only linear
    /// gates and products occur in generated sub-circuits.
    ///
    /// # Panics
    /// If `inputs` misses an input wire or the circuit contains a gate
    /// kind without boolean semantics.
    pub fn evaluate(&self, inputs: &HashMap<WireId, BoolRing>) -> Vec<BoolRing> {
        let mut wires = vec![BoolRing::ZERO; self.gates.len()];
        for (w, op) in self.gates.iter().enumerate() {
            wires[w] = match op {
                GateOp::Input => *inputs
                    .get(&w)
                    .unwrap_or_else(|| panic!("no value for input wire {w}")),
                GateOp::Add(a, b) => wires[*a] + wires[*b],
                GateOp::Sub(a, b) => wires[*a] - wires[*b],
                GateOp::ConstAdd(a, c) => wires[*a] + *c,
                GateOp::ConstMul(a, c) => wires[*a] * *c,
                GateOp::Mul(a, b) => wires[*a] * wires[*b],
                _ => panic!("gate without boolean semantics"),
            };
        }
        self.outputs.iter().map(|&w| wires[w]).collect()
    }

    /// Builds the sign-extraction circuit: 128 inputs (the 64 bits of `a`,
    /// then the 64 bits of `b`, LSB first), one output, bit 63 of `a + b`.
    ///
    /// The carry into bit 63 comes from a Sklansky parallel-prefix tree
    /// over the generate/propagate pairs of the low 63 bit positions, so
    /// the product depth stays logarithmic.
    pub fn generate_ppa_msb() -> Self {
        let mut circ = Circuit::new();
        let a: Vec<WireId> = (0..64).map(|_| circ.new_input_wire()).collect();
        let b: Vec<WireId> = (0..64).map(|_| circ.new_input_wire()).collect();

        let mut g = Vec::with_capacity(63);
        let mut p = Vec::with_capacity(63);
        for i in 0..63 {
            g.push(circ.add_gate(GateOp::Mul(a[i], b[i])));
            p.push(circ.add_gate(GateOp::Add(a[i], b[i])));
        }
        let mut dist = 1;
        while dist < 63 {
            for i in 0..63 {
                if (i / dist) % 2 == 1 {
                    let j = (i / dist) * dist - 1;
                    let pg = circ.add_gate(GateOp::Mul(p[i], g[j]));
                    g[i] = circ.add_gate(GateOp::Add(g[i], pg));
                    p[i] = circ.add_gate(GateOp::Mul(p[i], p[j]));
                }
            }
            dist *= 2;
        }
        let half_sum = circ.add_gate(GateOp::Add(a[63], b[63]));
        let msb = circ.add_gate(GateOp::Add(half_sum, g[62]));
        circ.set_as_output(msb);
        circ
    }
}

fn dot(wires: &[Ring], xs: &[WireId], ys: &[WireId]) -> Ring {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| wires[x] * wires[y])
        .sum()
}

/// Evaluation form of a circuit: gates grouped by topological depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeveledCircuit<T> {
    /// Gates by wire id.
    pub gates: Vec<GateOp<T>>,
    /// Wire ids per depth level; level 0 holds exactly the inputs.
    pub levels: Vec<Vec<WireId>>,
    /// Declared output wires.
    pub outputs: Vec<WireId>,
    /// Summary statistics.
    pub counts: GateCounts,
}

impl<T> LeveledCircuit<T> {
    /// Total number of gates (and wires).
    pub fn num_gates(&self) -> usize {
        self.gates.len()
    }

    /// Input wires in id order.
    pub fn input_wires(&self) -> impl Iterator<Item = WireId> + '_ {
        self.levels[0].iter().copied()
    }
}

/// Per-kind gate counts and circuit depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GateCounts {
    pub inputs: usize,
    pub add: usize,
    pub sub: usize,
    pub const_add: usize,
    pub const_mul: usize,
    pub mul: usize,
    pub dotp: usize,
    pub trdotp: usize,
    pub cmp: usize,
    pub relu: usize,
    pub msb: usize,
    pub depth: usize,
}

impl GateCounts {
    fn record<T>(&mut self, op: &GateOp<T>) {
        match op {
            GateOp::Input => self.inputs += 1,
            GateOp::Add(..) => self.add += 1,
            GateOp::Sub(..) => self.sub += 1,
            GateOp::ConstAdd(..) => self.const_add += 1,
            GateOp::ConstMul(..) => self.const_mul += 1,
            GateOp::Mul(..) => self.mul += 1,
            GateOp::Dotp(..) => self.dotp += 1,
            GateOp::TrDotp(..) => self.trdotp += 1,
            GateOp::Cmp(..) => self.cmp += 1,
            GateOp::Relu(..) => self.relu += 1,
            GateOp::Msb(..) => self.msb += 1,
        }
    }

    /// Total gate count.
    pub fn total(&self) -> usize {
        self.inputs
            + self.add
            + self.sub
            + self.const_add
            + self.const_mul
            + self.mul
            + self.dotp
            + self.trdotp
            + self.cmp
            + self.relu
            + self.msb
    }
}

impl fmt::Display for GateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gates at depth {} (in={} add={} sub={} cadd={} cmul={} mul={} dotp={} trdotp={} cmp={} relu={} msb={})",
            self.total(),
            self.depth,
            self.inputs,
            self.add,
            self.sub,
            self.const_add,
            self.const_mul,
            self.mul,
            self.dotp,
            self.trdotp,
            self.cmp,
            self.relu,
            self.msb,
        )
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn levels_follow_operand_depth() {
        let mut circ = Circuit::<Ring>::new();
        let a = circ.new_input_wire();
        let b = circ.new_input_wire();
        let sum = circ.add_gate(GateOp::Add(a, b));
        let prod = circ.add_gate(GateOp::Mul(sum, b));
        let deep = circ.add_gate(GateOp::Mul(prod, sum));
        circ.set_as_output(deep);
        let leveled = circ.order_gates_by_level();
        assert_eq!(leveled.levels.len(), 4);
        assert_eq!(leveled.levels[0], vec![a, b]);
        assert_eq!(leveled.levels[1], vec![sum]);
        assert_eq!(leveled.levels[2], vec![prod]);
        assert_eq!(leveled.levels[3], vec![deep]);
        assert_eq!(leveled.counts.depth, 3);
        assert_eq!(leveled.counts.total(), 5);
        assert_eq!(leveled.counts.mul, 2);
    }

    #[test]
    fn plaintext_semantics() {
        let mut circ = Circuit::<Ring>::new();
        let a = circ.new_input_wire();
        let b = circ.new_input_wire();
        let sum = circ.add_gate(GateOp::Add(a, b));
        let scaled = circ.add_gate(GateOp::ConstMul(sum, Ring(3)));
        let relu = circ.add_gate(GateOp::Relu(scaled));
        let cmp = circ.add_gate(GateOp::Cmp(scaled));
        let msb = circ.add_gate(GateOp::Msb(scaled));
        for w in [relu, cmp, msb] {
            circ.set_as_output(w);
        }
        let eval = |x: i64, y: i64| {
            circ.evaluate(&HashMap::from([
                (a, Ring(x as u64)),
                (b, Ring(y as u64)),
            ]))
        };
        assert_eq!(eval(5, 2), vec![Ring(21), Ring(1), Ring(0)]);
        assert_eq!(eval(-5, 2), vec![Ring::ZERO, Ring::ZERO, Ring(1)]);
    }

    #[test]
    fn truncated_dot_product_shifts() {
        let mut circ = Circuit::<Ring>::new();
        let xs: Vec<_> = (0..3).map(|_| circ.new_input_wire()).collect();
        let ys: Vec<_> = (0..3).map(|_| circ.new_input_wire()).collect();
        let out = circ.add_gate(GateOp::TrDotp(xs.clone(), ys.clone()));
        circ.set_as_output(out);
        let mut inputs = HashMap::new();
        for (i, &w) in xs.iter().enumerate() {
            inputs.insert(w, Ring((i as u64 + 1) << FRACTION));
        }
        for &w in &ys {
            inputs.insert(w, Ring(1 << FRACTION));
        }
        // (1 + 2 + 3) << FRACTION after rescaling.
        assert_eq!(circ.evaluate(&inputs), vec![Ring(6 << FRACTION)]);
    }

    #[test]
    #[should_panic(expected = "operand wire")]
    fn rejects_dangling_operand() {
        let mut circ = Circuit::<Ring>::new();
        let a = circ.new_input_wire();
        circ.add_gate(GateOp::Add(a, 7));
    }

    #[test]
    #[should_panic(expected = "operand lengths differ")]
    fn rejects_mismatched_simd_vectors() {
        let mut circ = Circuit::<Ring>::new();
        let a = circ.new_input_wire();
        let b = circ.new_input_wire();
        circ.add_gate(GateOp::Dotp(vec![a], vec![a, b]));
    }

    proptest! {
        #[test]
        fn ppa_extracts_the_sum_msb(a: u64, b: u64) {
            let circ = Circuit::<BoolRing>::generate_ppa_msb();
            let mut inputs = HashMap::new();
            for (i, bit) in Ring(a).bits().into_iter().enumerate() {
                inputs.insert(i, bit);
            }
            for (i, bit) in Ring(b).bits().into_iter().enumerate() {
                inputs.insert(64 + i, bit);
            }
            let out = circ.evaluate(&inputs);
            let expected = a.wrapping_add(b) >> 63 == 1;
            prop_assert_eq!(out, vec![BoolRing(expected)]);
        }
    }
}

//! Per-gate preprocessing records.
//!
//! The offline phase produces one [`PreprocGate`] per wire, carrying
//! exactly the replicated masks and pre-shared cross products that wire's
//! online step consumes. Sign gates nest a full record vector for the
//! boolean sign-extraction sub-circuit.

use serde::{Deserialize, Serialize};

use crate::{
    ring::{BoolRing, RingElem},
    sharing::RepShare,
};

/// Preprocessing record of one gate, keyed by the gate kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreprocGate<T> {
    /// Input wire: fresh mask; the owner additionally knows the plain mask
    /// total so it can publish its masked input.
    Input {
        /// The wire's replicated mask.
        mask: RepShare<T>,
        /// Party owning the input.
        owner: usize,
        /// Plain sum of the mask's summands, present only on the owner.
        mask_total: Option<T>,
    },
    /// Add, sub and constant gates: a linear combination of input masks.
    Linear {
        /// The wire's replicated mask.
        mask: RepShare<T>,
    },
    /// Multiplication: fresh output mask plus the pre-shared input-mask
    /// product.
    Mul {
        /// The wire's replicated mask.
        mask: RepShare<T>,
        /// Sharing of the product of the two input-wire masks.
        mask_prod: RepShare<T>,
    },
    /// Dot product: fresh output mask plus the pre-shared sum of pointwise
    /// input-mask products.
    Dotp {
        /// The wire's replicated mask.
        mask: RepShare<T>,
        /// Sharing of the inner product of the input-wire mask vectors.
        mask_prod: RepShare<T>,
    },
    /// Truncated dot product: the output mask is the truncation of a
    /// random blind whose untruncated sharing joins the residual.
    TrDotp {
        /// The wire's replicated mask, a sharing of `r >> FRACTION`.
        mask: RepShare<T>,
        /// Sharing of the inner product of the input-wire mask vectors.
        mask_dot: RepShare<T>,
        /// Sharing of the untruncated blind `r`.
        mask_r: RepShare<T>,
    },
    /// Comparison: blinded sign extraction via two small public-offset
    /// blinds.
    Cmp {
        /// The wire's replicated mask, `[alpha_v] + [alpha_mu2]`.
        mask: RepShare<T>,
        /// The fresh `[alpha_v]` component alone, used in the residual.
        prev_mask: RepShare<T>,
        /// Sharing of the product of the input mask and `mu_1`'s mask.
        mask_prod: RepShare<T>,
        /// `mu_1`'s mask.
        mask_mu1: RepShare<T>,
        /// Public masked value of `mu_1`.
        beta_mu1: T,
        /// Public masked value of `mu_2`.
        beta_mu2: T,
    },
    /// ReLU: a comparison stage followed by a multiplication of the sign
    /// bit with the input.
    Relu {
        /// The wire's replicated mask, fresh for the final product.
        mask: RepShare<T>,
        /// The comparison intermediate's mask, `[alpha_v] + [alpha_mu2]`.
        cmp_mask: RepShare<T>,
        /// The fresh `[alpha_v]` component alone.
        prev_mask: RepShare<T>,
        /// Sharing of the product of the input mask and `mu_1`'s mask.
        mask_prod: RepShare<T>,
        /// Sharing of the product of the comparison mask and the input
        /// mask, for the final multiplication.
        mask_prod2: RepShare<T>,
        /// `mu_1`'s mask.
        mask_mu1: RepShare<T>,
        /// Public masked value of `mu_1`.
        beta_mu1: T,
        /// Public masked value of `mu_2`.
        beta_mu2: T,
    },
    /// Sign extraction via the boolean sub-circuit, with an
    /// arithmetic-from-boolean conversion of the masked output bit.
    Msb {
        /// The wire's replicated mask, `-[b_alpha] - 2[w]`.
        mask: RepShare<T>,
        /// Records of the boolean sign-extraction circuit, by boolean
        /// wire id.
        bool_gates: Vec<PreprocGate<BoolRing>>,
        /// Arithmetic sharing of the boolean output wire's mask bit.
        mask_b: RepShare<T>,
        /// Fresh random share entering the conversion residual.
        mask_w: RepShare<T>,
    },
}

impl<T: RingElem> PreprocGate<T> {
    /// The output-wire mask of this gate.
    pub fn mask(&self) -> &RepShare<T> {
        match self {
            PreprocGate::Input { mask, .. }
            | PreprocGate::Linear { mask }
            | PreprocGate::Mul { mask, .. }
            | PreprocGate::Dotp { mask, .. }
            | PreprocGate::TrDotp { mask, .. }
            | PreprocGate::Cmp { mask, .. }
            | PreprocGate::Relu { mask, .. }
            | PreprocGate::Msb { mask, .. } => mask,
        }
    }
}

/// The preprocessing output for a whole circuit: one record per wire, in
/// wire-id order. Produced once per secure-evaluation session and consumed
/// by exactly one online evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocCircuit<T> {
    /// Records by wire id.
    pub gates: Vec<PreprocGate<T>>,
}

impl<T: RingElem> PreprocCircuit<T> {
    /// Wraps per-wire records.
    pub fn new(gates: Vec<PreprocGate<T>>) -> Self {
        Self { gates }
    }

    /// The output-wire mask of `wire`.
    pub fn mask(&self, wire: usize) -> &RepShare<T> {
        self.gates[wire].mask()
    }
}

//! Honest-majority secure multi-party computation (MPC) over the ring of
//! 64-bit integers, using generalized replicated secret sharing for
//! `n = 3k + 2` parties tolerating `k` corruptions.
//!
//! Every wire of an arithmetic circuit carries a public masked value
//! `beta = x + alpha`, where the mask `alpha` is secret-shared as a sum of
//! summands indexed by the excluded k-subsets of parties. The protocol
//! runs in two phases: an input-independent offline phase derives per-gate
//! correlated randomness from a pool of shared PRG streams, and a fast
//! online phase evaluates the circuit with one batched reconstruction
//! round per level. All cross-party deliveries go through a three-sender
//! primitive that detects tampering by any single corrupted party.
//!
//! ## Main Components
//!
//! * [`circuit`]: The arithmetic circuit builder and its level-ordered
//!   evaluation form, including fixed-point and comparison gates.
//! * [`protocol`]: The [`protocol::mpc`] function which executes both
//!   phases for a single party, and [`protocol::simulate`] for local
//!   multi-party runs.
//! * [`channel`]: Communication abstractions for exchanging data between
//!   parties.
//! * [`sharing`], [`pool`], [`jump`]: The replicated sharing scheme, the
//!   correlated-randomness pool and the reliable delivery primitive.
//!
//! ## Basic Usage
//!
//! Each participating party sets up a [`channel::Channel`] to its peers,
//! agrees with them on the circuit, the input-owner map and the setup
//! seed, and calls [`protocol::mpc`] with its own input values. For
//! testing and development, [`protocol::simulate`] runs all parties in
//! one process.
//!
//! ## Example
//!
//! ```
//! use std::collections::HashMap;
//!
//! use polyshare::{
//!     circuit::{Circuit, GateOp},
//!     protocol::simulate,
//!     ring::Ring,
//! };
//!
//! let mut circ = Circuit::new();
//! let x = circ.new_input_wire();
//! let y = circ.new_input_wire();
//! let z = circ.add_gate(GateOp::Mul(x, y));
//! circ.set_as_output(z);
//!
//! // Five parties tolerating one corruption; parties 0 and 1 provide
//! // the inputs.
//! let mut inputs = vec![HashMap::new(); 5];
//! inputs[0].insert(x, Ring(3));
//! inputs[1].insert(y, Ring(7));
//!
//! let outputs = simulate(&circ, 1, &inputs).unwrap();
//! assert_eq!(outputs, vec![Ring(21)]);
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod circuit;
pub mod jump;
pub mod offline;
pub mod online;
pub mod pool;
pub mod preproc;
pub mod protocol;
pub mod ring;
pub mod sharing;

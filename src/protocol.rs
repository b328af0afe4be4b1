//! Two-phase protocol drivers and a local simulation harness.

use std::collections::HashMap;

use futures::future::try_join_all;
use rand::random;
use thiserror::Error;
use tokio::{runtime::Runtime, task};

use crate::{
    channel::{self, Channel, SimpleChannel},
    circuit::{Circuit, WireId},
    offline::{OfflineError, OfflineEvaluator, insecure_preprocess},
    online::{OnlineError, OnlineEvaluator},
    ring::Ring,
    sharing::{InvalidScheme, Scheme},
};

/// Default statistical security parameter.
pub const DEFAULT_SECURITY: usize = 40;

/// Top-level protocol errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested party counts do not form a valid scheme.
    #[error(transparent)]
    InvalidScheme(#[from] InvalidScheme),
    /// The preprocessing phase failed.
    #[error(transparent)]
    Offline(#[from] OfflineError),
    /// The evaluation phase failed.
    #[error(transparent)]
    Online(#[from] OnlineError),
    /// A message could not be sent or received.
    #[error("channel error: {0:?}")]
    Channel(#[from] channel::Error),
}

/// Executes both protocol phases for one party and returns the opened
/// circuit outputs.
///
/// All parties must agree on the circuit, the input-owner map, the
/// scheme parameters and the setup seed; `inputs` holds the caller's
/// values for the wires it owns.
#[allow(clippy::too_many_arguments)]
pub async fn mpc<C: Channel>(
    channel: C,
    circ: &Circuit<Ring>,
    input_owners: &HashMap<WireId, usize>,
    inputs: &HashMap<WireId, Ring>,
    n: usize,
    k: usize,
    party_id: usize,
    security_param: usize,
    seed: [u8; 32],
) -> Result<Vec<Ring>, Error> {
    let scheme = Scheme::new(n, k)?;
    let leveled = circ.order_gates_by_level();
    let mut offline =
        OfflineEvaluator::new(scheme.clone(), party_id, security_param, &seed, channel);
    let preproc = offline.preprocess(&leveled, input_owners).await?;
    let channel = offline.into_channel();
    let mut online = OnlineEvaluator::new(scheme, party_id, preproc, leveled, channel);
    Ok(online.evaluate_circuit(inputs).await?)
}

/// Derives the input-owner map from per-party input maps.
fn owners_of(inputs: &[HashMap<WireId, Ring>]) -> HashMap<WireId, usize> {
    let mut owners = HashMap::new();
    for (p, map) in inputs.iter().enumerate() {
        for &w in map.keys() {
            owners.insert(w, p);
        }
    }
    owners
}

/// Simulates the full protocol locally, one task per party, and returns
/// party 0's outputs. The number of parties is `inputs.len()`.
pub fn simulate(
    circ: &Circuit<Ring>,
    k: usize,
    inputs: &[HashMap<WireId, Ring>],
) -> Result<Vec<Ring>, Error> {
    let n = inputs.len();
    let input_owners = owners_of(inputs);
    let seed: [u8; 32] = random();
    let tokio = Runtime::new().expect("could not start tokio runtime");
    tokio.block_on(async {
        let mut parties = Vec::new();
        for (id, channel) in SimpleChannel::channels(n).into_iter().enumerate() {
            let circ = circ.clone();
            let input_owners = input_owners.clone();
            let inputs = inputs[id].clone();
            parties.push(task::spawn(async move {
                mpc(
                    channel,
                    &circ,
                    &input_owners,
                    &inputs,
                    n,
                    k,
                    id,
                    DEFAULT_SECURITY,
                    seed,
                )
                .await
            }));
        }
        let mut results = Vec::new();
        for party in try_join_all(parties).await.expect("party tasks panicked") {
            results.push(party?);
        }
        Ok(results.swap_remove(0))
    })
}

/// Simulates the online phase over insecurely dealt preprocessing, one
/// task per party, and returns party 0's outputs. Useful for testing and
/// benchmarking the evaluation phase in isolation.
pub fn simulate_insecure(
    circ: &Circuit<Ring>,
    k: usize,
    inputs: &[HashMap<WireId, Ring>],
) -> Result<Vec<Ring>, Error> {
    let n = inputs.len();
    let scheme = Scheme::new(n, k)?;
    let leveled = circ.order_gates_by_level();
    let input_owners = owners_of(inputs);
    let seed: [u8; 32] = random();
    let preps = insecure_preprocess(&scheme, &leveled, &input_owners, &seed)?;
    let tokio = Runtime::new().expect("could not start tokio runtime");
    tokio.block_on(async {
        let mut parties = Vec::new();
        let channels = SimpleChannel::channels(n);
        for (id, (channel, preproc)) in channels.into_iter().zip(preps).enumerate() {
            let scheme = scheme.clone();
            let leveled = leveled.clone();
            let inputs = inputs[id].clone();
            parties.push(task::spawn(async move {
                let mut online = OnlineEvaluator::new(scheme, id, preproc, leveled, channel);
                online.evaluate_circuit(&inputs).await
            }));
        }
        let mut results = Vec::new();
        for party in try_join_all(parties).await.expect("party tasks panicked") {
            results.push(party?);
        }
        Ok(results.swap_remove(0))
    })
}

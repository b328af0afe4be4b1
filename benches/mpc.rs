use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use criterion::Criterion;
use futures::future::try_join_all;
use polyshare::{
    channel::SimpleChannel,
    circuit::{Circuit, GateOp, WireId},
    protocol::{DEFAULT_SECURITY, mpc, simulate_insecure},
    ring::Ring,
};
use tokio::runtime::Runtime;

pub fn mpc_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    bench_mul_chain(c, &rt);
    bench_online_relu_layer(c);
}

/// A chain of multiplications, one gate per level.
fn mul_chain(len: usize) -> (Circuit<Ring>, Vec<HashMap<WireId, Ring>>) {
    let mut circ = Circuit::new();
    let x = circ.new_input_wire();
    let y = circ.new_input_wire();
    let mut w = circ.add_gate(GateOp::Mul(x, y));
    for _ in 1..len {
        w = circ.add_gate(GateOp::Mul(w, y));
    }
    circ.set_as_output(w);
    let mut inputs = vec![HashMap::new(); 5];
    inputs[0].insert(x, Ring(1));
    inputs[1].insert(y, Ring(1));
    (circ, inputs)
}

/// Benchmark both protocol phases over a long chain of multiplications.
fn bench_mul_chain(c: &mut Criterion, rt: &Runtime) {
    let len = 100;

    let mut g = c.benchmark_group("mpc");
    g.throughput(criterion::Throughput::Elements(len as u64));

    g.bench_function(format!("{len} chained muls, 5 parties"), |b| {
        b.to_async(rt).iter_custom(|iters| {
            let (circ, inputs) = mul_chain(len);
            let mut owners = HashMap::new();
            for (p, map) in inputs.iter().enumerate() {
                for &w in map.keys() {
                    owners.insert(w, p);
                }
            }

            async move {
                let mut elapsed = Duration::default();
                for _ in 0..iters {
                    let seed: [u8; 32] = rand::random();
                    // Spawn the parties on the runtime so the evaluation
                    // actually uses multiple threads; the futures must be
                    // 'static, hence the clones.
                    let parties: Vec<_> = SimpleChannel::channels(5)
                        .into_iter()
                        .enumerate()
                        .map(|(id, channel)| {
                            let circ = circ.clone();
                            let owners = owners.clone();
                            let inputs = inputs[id].clone();
                            (id, channel, circ, owners, inputs)
                        })
                        .collect();

                    let now = Instant::now();
                    let handles: Vec<_> = parties
                        .into_iter()
                        .map(|(id, channel, circ, owners, inputs)| {
                            tokio::spawn(async move {
                                mpc(
                                    channel,
                                    &circ,
                                    &owners,
                                    &inputs,
                                    5,
                                    1,
                                    id,
                                    DEFAULT_SECURITY,
                                    seed,
                                )
                                .await
                            })
                        })
                        .collect();
                    for res in try_join_all(handles).await.expect("join failed") {
                        let out = res.expect("mul chain eval failed");
                        assert_eq!(out, vec![Ring(1)]);
                    }
                    elapsed += now.elapsed();
                }
                elapsed
            }
        });
    });
    g.finish();
}

/// Benchmark the online phase alone over a wide ReLU layer, with the
/// preprocessing dealt insecurely up front.
fn bench_online_relu_layer(c: &mut Criterion) {
    let width = 32;
    let mut circ = Circuit::new();
    let mut inputs = vec![HashMap::new(); 5];
    for i in 0..width {
        let x = circ.new_input_wire();
        let r = circ.add_gate(GateOp::Relu(x));
        circ.set_as_output(r);
        inputs[0].insert(x, Ring(i as u64) - Ring(width as u64 / 2));
    }

    let mut g = c.benchmark_group("online");
    g.throughput(criterion::Throughput::Elements(width as u64));
    g.bench_function(format!("relu layer of {width}, 5 parties"), |b| {
        b.iter(|| simulate_insecure(&circ, 1, &inputs).expect("relu layer eval failed"));
    });
    g.finish();
}

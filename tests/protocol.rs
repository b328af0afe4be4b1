use std::collections::HashMap;

use polyshare::{
    channel::{MsgChannel, SimpleChannel},
    circuit::{Circuit, GateOp, WireId},
    jump::{Jump, SenderTriple},
    protocol::{Error, simulate, simulate_insecure},
    ring::{FRACTION, Ring},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Builds per-party input maps for `n` parties, assigning each `(party,
/// wire, value)` entry to its owner.
fn inputs_for(n: usize, vals: &[(usize, WireId, Ring)]) -> Vec<HashMap<WireId, Ring>> {
    let mut inputs = vec![HashMap::new(); n];
    for &(p, w, v) in vals {
        inputs[p].insert(w, v);
    }
    inputs
}

fn fixed(x: i64) -> Ring {
    Ring((x << FRACTION) as u64)
}

#[test]
fn linear_gates_evaluate_exactly() -> Result<(), Error> {
    for (n, k) in [(5, 1), (7, 2)] {
        let mut circ = Circuit::new();
        let x = circ.new_input_wire();
        let y = circ.new_input_wire();
        let z = circ.new_input_wire();
        let s = circ.add_gate(GateOp::Add(x, y));
        let d = circ.add_gate(GateOp::Sub(s, z));
        let c = circ.add_gate(GateOp::ConstMul(d, Ring(3)));
        let out = circ.add_gate(GateOp::ConstAdd(c, Ring(10)));
        circ.set_as_output(out);

        let vals = [(0, x, Ring(1000)), (1, y, Ring(234)), (2, z, Ring(9999))];
        let inputs = inputs_for(n, &vals);
        let expected = circ.evaluate(&HashMap::from_iter(vals.map(|(_, w, v)| (w, v))));
        assert_eq!(simulate(&circ, k, &inputs)?, expected, "n = {n}");
    }
    Ok(())
}

#[test]
fn multiplications_across_levels() -> Result<(), Error> {
    for (n, k) in [(5, 1), (7, 2)] {
        let mut circ = Circuit::new();
        let x = circ.new_input_wire();
        let y = circ.new_input_wire();
        let z = circ.new_input_wire();
        let xy = circ.add_gate(GateOp::Mul(x, y));
        let xyz = circ.add_gate(GateOp::Mul(xy, z));
        circ.set_as_output(xy);
        circ.set_as_output(xyz);

        let vals = [(0, x, Ring(17)), (1, y, Ring(923)), (2, z, Ring(481))];
        let inputs = inputs_for(n, &vals);
        let out = simulate(&circ, k, &inputs)?;
        assert_eq!(out, vec![Ring(17 * 923), Ring(17 * 923 * 481)], "n = {n}");
    }
    Ok(())
}

#[test]
fn dot_product_of_vectors() -> Result<(), Error> {
    let mut circ = Circuit::new();
    let xs: Vec<WireId> = (0..3).map(|_| circ.new_input_wire()).collect();
    let ys: Vec<WireId> = (0..3).map(|_| circ.new_input_wire()).collect();
    let d = circ.add_gate(GateOp::Dotp(xs.clone(), ys.clone()));
    circ.set_as_output(d);

    let mut vals = Vec::new();
    for (i, &w) in xs.iter().enumerate() {
        vals.push((0, w, Ring(i as u64 + 1)));
    }
    for (i, &w) in ys.iter().enumerate() {
        vals.push((1, w, Ring(10 * (i as u64 + 1))));
    }
    let inputs = inputs_for(5, &vals);
    // 1*10 + 2*20 + 3*30
    assert_eq!(simulate(&circ, 1, &inputs)?, vec![Ring(140)]);
    Ok(())
}

#[test]
fn truncated_dot_product_within_one_ulp() -> Result<(), Error> {
    for (a, b) in [(5i64, 3i64), (-2, 3), (7, -4)] {
        let mut circ = Circuit::new();
        let x = circ.new_input_wire();
        let y = circ.new_input_wire();
        let t = circ.add_gate(GateOp::TrDotp(vec![x], vec![y]));
        circ.set_as_output(t);

        let inputs = inputs_for(5, &[(0, x, fixed(a)), (1, y, fixed(b))]);
        let got = simulate(&circ, 1, &inputs)?[0].val() as i64;
        let expected = (a * b) << FRACTION;
        assert!(
            (got - expected).abs() <= 1,
            "{a} * {b}: got {got}, expected {expected}"
        );
    }
    Ok(())
}

#[test]
fn comparison_classifies_signs() -> Result<(), Error> {
    for (val, expected) in [
        (Ring(100), Ring::ONE),
        (-Ring(100), Ring::ZERO),
        (Ring::ZERO, Ring::ONE),
        (Ring(250_000), Ring::ONE),
        (-Ring(250_000), Ring::ZERO),
    ] {
        let mut circ = Circuit::new();
        let x = circ.new_input_wire();
        let c = circ.add_gate(GateOp::Cmp(x));
        circ.set_as_output(c);

        let inputs = inputs_for(5, &[(0, x, val)]);
        assert_eq!(simulate(&circ, 1, &inputs)?, vec![expected], "x = {val:?}");
    }
    Ok(())
}

#[test]
fn relu_zeroes_negative_inputs() -> Result<(), Error> {
    for (n, k) in [(5, 1), (7, 2)] {
        for (val, expected) in [
            (Ring(4321), Ring(4321)),
            (-Ring(4321), Ring::ZERO),
            (Ring::ZERO, Ring::ZERO),
        ] {
            let mut circ = Circuit::new();
            let x = circ.new_input_wire();
            let r = circ.add_gate(GateOp::Relu(x));
            circ.set_as_output(r);

            let inputs = inputs_for(n, &[(0, x, val)]);
            assert_eq!(
                simulate(&circ, k, &inputs)?,
                vec![expected],
                "n = {n}, x = {val:?}"
            );
        }
    }
    Ok(())
}

#[test]
fn msb_extracts_the_sign_bit() -> Result<(), Error> {
    for (val, expected) in [
        (Ring(1), Ring::ZERO),
        (-Ring(1), Ring::ONE),
        (Ring(1 << 62), Ring::ZERO),
        (Ring(u64::MAX / 2 + 1), Ring::ONE),
        (Ring::ZERO, Ring::ZERO),
    ] {
        let mut circ = Circuit::new();
        let x = circ.new_input_wire();
        let m = circ.add_gate(GateOp::Msb(x));
        circ.set_as_output(m);

        let inputs = inputs_for(5, &[(0, x, val)]);
        assert_eq!(simulate(&circ, 1, &inputs)?, vec![expected], "x = {val:?}");
    }
    Ok(())
}

#[test]
fn mixed_depth_circuit_matches_reference() -> Result<(), Error> {
    let mut circ = Circuit::<Ring>::new();
    let x = circ.new_input_wire();
    let y = circ.new_input_wire();
    let z = circ.new_input_wire();
    let xy = circ.add_gate(GateOp::Mul(x, y));
    let diff = circ.add_gate(GateOp::Sub(xy, z));
    let r = circ.add_gate(GateOp::Relu(diff));
    let c = circ.add_gate(GateOp::Cmp(diff));
    let d = circ.add_gate(GateOp::Dotp(vec![r, c], vec![z, z]));
    circ.set_as_output(r);
    circ.set_as_output(c);
    circ.set_as_output(d);

    for z_val in [Ring(50), Ring(50_000)] {
        let vals = [(0, x, Ring(12)), (1, y, Ring(34)), (2, z, z_val)];
        let inputs = inputs_for(5, &vals);
        let expected = circ.evaluate(&HashMap::from_iter(vals.map(|(_, w, v)| (w, v))));
        assert_eq!(simulate(&circ, 1, &inputs)?, expected, "z = {z_val:?}");
    }
    Ok(())
}

#[test]
fn insecure_preprocessing_evaluates_like_the_full_protocol() -> Result<(), Error> {
    for (n, k) in [(5, 1), (7, 2)] {
        let mut circ = Circuit::<Ring>::new();
        let x = circ.new_input_wire();
        let y = circ.new_input_wire();
        let xy = circ.add_gate(GateOp::Mul(x, y));
        let r = circ.add_gate(GateOp::Relu(xy));
        let m = circ.add_gate(GateOp::Msb(xy));
        circ.set_as_output(r);
        circ.set_as_output(m);

        let vals = [(0, x, -Ring(3)), (1, y, Ring(111))];
        let inputs = inputs_for(n, &vals);
        let expected = circ.evaluate(&HashMap::from_iter(vals.map(|(_, w, v)| (w, v))));
        assert_eq!(simulate_insecure(&circ, k, &inputs)?, expected, "n = {n}");
    }
    Ok(())
}

#[test]
fn seven_party_end_to_end() -> Result<(), Error> {
    let mut circ = Circuit::new();
    let x = circ.new_input_wire();
    let y = circ.new_input_wire();
    let xy = circ.add_gate(GateOp::Mul(x, y));
    let c = circ.add_gate(GateOp::Cmp(xy));
    circ.set_as_output(xy);
    circ.set_as_output(c);

    let vals = [(3, x, -Ring(21)), (6, y, Ring(2))];
    let inputs = inputs_for(7, &vals);
    assert_eq!(
        simulate(&circ, 2, &inputs)?,
        vec![-Ring(42), Ring::ZERO]
    );
    Ok(())
}

#[test]
fn random_products_match_plain_evaluation() -> Result<(), Error> {
    let mut rng = StdRng::seed_from_u64(77);
    for (n, k) in [(5, 1), (7, 2)] {
        let mut circ = Circuit::<Ring>::new();
        let x = circ.new_input_wire();
        let y = circ.new_input_wire();
        let xy = circ.add_gate(GateOp::Mul(x, y));
        circ.set_as_output(xy);

        for _ in 0..3 {
            let vals = [(0, x, Ring(rng.random())), (n - 1, y, Ring(rng.random()))];
            let inputs = inputs_for(n, &vals);
            let expected = circ.evaluate(&HashMap::from_iter(vals.map(|(_, w, v)| (w, v))));
            assert_eq!(simulate(&circ, k, &inputs)?, expected, "n = {n}");
        }
    }
    Ok(())
}

#[test]
fn seven_party_truncation_and_sign() -> Result<(), Error> {
    let mut circ = Circuit::<Ring>::new();
    let x = circ.new_input_wire();
    let y = circ.new_input_wire();
    let t = circ.add_gate(GateOp::TrDotp(vec![x], vec![y]));
    let m = circ.add_gate(GateOp::Msb(t));
    circ.set_as_output(t);
    circ.set_as_output(m);

    for (a, b, sign) in [(3i64, 5i64, Ring::ZERO), (-3, 5, Ring::ONE)] {
        let inputs = inputs_for(7, &[(2, x, fixed(a)), (5, y, fixed(b))]);
        let out = simulate(&circ, 2, &inputs)?;
        let got = out[0].val() as i64;
        let expected = (a * b) << FRACTION;
        assert!(
            (got - expected).abs() <= 1,
            "{a} * {b}: got {got}, expected {expected}"
        );
        assert_eq!(out[1], sign, "sign of {a} * {b}");
    }
    Ok(())
}

#[tokio::test]
async fn jump_delivers_over_the_public_channel_api() {
    let n = 5;
    let senders: SenderTriple = [0, 1, 2];
    let receiver = 4;
    let payload = b"A test string.".to_vec();

    let mut tasks = tokio::task::JoinSet::new();
    for (id, channel) in SimpleChannel::channels(n).into_iter().enumerate() {
        let payload = payload.clone();
        tasks.spawn(async move {
            let mut chan = MsgChannel(channel);
            let mut jump = Jump::new(id, n);
            if senders.contains(&id) {
                jump.accumulate(senders, receiver, &payload).unwrap();
            }
            if id == receiver {
                jump.expect(senders, payload.len()).unwrap();
            }
            jump.communicate(&mut chan).await.unwrap();
            (id == receiver).then(|| jump.values(senders).to_vec())
        });
    }
    let mut delivered = None;
    while let Some(res) = tasks.join_next().await {
        if let Some(v) = res.unwrap() {
            delivered = Some(v);
        }
    }
    assert_eq!(delivered, Some(payload));
}

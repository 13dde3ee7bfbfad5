use approx::assert_relative_eq;
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};
use tensorust_recurrent::{
    config::LstmConfig,
    nn::{Layer, Lstm, WeightInit},
    Tensor, TensorustError,
};

const IN: usize = 2;
const OUT: usize = 3;

#[derive(Clone)]
struct Weights {
    upward: Vec<f64>,
    lateral: Vec<f64>,
    bias: Vec<f64>,
}

impl Weights {
    fn random(rng: &mut StdRng) -> Self {
        Self {
            upward: random_vec(rng, 4 * OUT * IN),
            lateral: random_vec(rng, 4 * OUT * OUT),
            bias: random_vec(rng, 4 * OUT),
        }
    }

    fn build(&self) -> Lstm<f64> {
        Lstm::from_weights(
            IN,
            OUT,
            self.upward.clone(),
            self.lateral.clone(),
            Some(self.bias.clone()),
        )
        .unwrap()
    }
}

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f64> {
    let dist = Uniform::new(-0.8, 0.8);
    (0..len).map(|_| rng.sample(dist)).collect()
}

/// One sequence with an explicit initial state and a linear readout
/// `loss = sum_t <w_t, h_t>`.
#[derive(Clone)]
struct Problem {
    h0: Vec<f64>,
    h0_batch: usize,
    c0: Vec<f64>,
    c0_batch: usize,
    xs: Vec<Vec<f64>>,
    batch: usize,
    readout: Vec<Vec<f64>>,
}

impl Problem {
    fn random(rng: &mut StdRng, steps: usize, batch: usize, h0_batch: usize, c0_batch: usize) -> Self {
        Self {
            h0: random_vec(rng, OUT * h0_batch),
            h0_batch,
            c0: random_vec(rng, OUT * c0_batch),
            c0_batch,
            xs: (0..steps).map(|_| random_vec(rng, IN * batch)).collect(),
            batch,
            readout: (0..steps).map(|_| random_vec(rng, OUT * batch)).collect(),
        }
    }

    fn prepare(&self, lstm: &mut Lstm<f64>) {
        lstm.set_hidden_state(Some(Tensor::new(self.h0.clone(), vec![OUT], self.h0_batch).unwrap()))
            .unwrap();
        lstm.set_cell_state(Some(Tensor::new(self.c0.clone(), vec![OUT], self.c0_batch).unwrap()))
            .unwrap();
    }

    fn input(&self, t: usize) -> Tensor<f64> {
        Tensor::new(self.xs[t].clone(), vec![IN], self.batch).unwrap()
    }

    fn loss(&self, weights: &Weights) -> f64 {
        let mut lstm = weights.build();
        self.prepare(&mut lstm);
        (0..self.xs.len())
            .map(|t| {
                let h = lstm.predict(&self.input(t)).unwrap();
                h.data().iter().zip(&self.readout[t]).map(|(a, b)| a * b).sum::<f64>()
            })
            .sum()
    }

    /// Runs forward over every step, then backward in reverse.
    ///
    /// Returns the layer and the input gradient of every step.
    fn analytic(&self, weights: &Weights) -> (Lstm<f64>, Vec<Vec<f64>>) {
        let mut lstm = weights.build();
        self.prepare(&mut lstm);
        let outputs: Vec<_> = (0..self.xs.len())
            .map(|t| lstm.forward(&self.input(t)).unwrap())
            .collect();
        let mut dxs = vec![Vec::new(); self.xs.len()];
        for t in (0..self.xs.len()).rev() {
            let mut h = outputs[t].clone();
            h.set_grad(self.readout[t].clone()).unwrap();
            dxs[t] = lstm.backward(&h).unwrap();
        }
        assert_eq!(lstm.pending_depth(), 0);
        (lstm, dxs)
    }
}

const EPS: f64 = 1e-6;

fn numeric(f: impl Fn(f64) -> f64) -> f64 {
    (f(EPS) - f(-EPS)) / (2.0 * EPS)
}

fn check_all(problem: &Problem, weights: &Weights) {
    let (lstm, dxs) = problem.analytic(weights);

    for k in 0..weights.upward.len() {
        let num = numeric(|d| {
            let mut w = weights.clone();
            w.upward[k] += d;
            problem.loss(&w)
        });
        assert_relative_eq!(lstm.upward().weights().grad()[k], num, epsilon = 1e-7, max_relative = 1e-5);
    }
    for k in 0..weights.lateral.len() {
        let num = numeric(|d| {
            let mut w = weights.clone();
            w.lateral[k] += d;
            problem.loss(&w)
        });
        assert_relative_eq!(lstm.lateral().weights().grad()[k], num, epsilon = 1e-7, max_relative = 1e-5);
    }
    for k in 0..weights.bias.len() {
        let num = numeric(|d| {
            let mut w = weights.clone();
            w.bias[k] += d;
            problem.loss(&w)
        });
        assert_relative_eq!(lstm.upward().bias().unwrap().grad()[k], num, epsilon = 1e-7, max_relative = 1e-5);
    }

    let grads = lstm.state_gradients();
    let dh0 = grads.hidden().unwrap();
    assert_eq!(dh0.len(), problem.h0.len());
    for k in 0..problem.h0.len() {
        let num = numeric(|d| {
            let mut p = problem.clone();
            p.h0[k] += d;
            p.loss(weights)
        });
        assert_relative_eq!(dh0[k], num, epsilon = 1e-7, max_relative = 1e-5);
    }
    let dc0 = grads.cell().unwrap();
    assert_eq!(dc0.len(), problem.c0.len());
    for k in 0..problem.c0.len() {
        let num = numeric(|d| {
            let mut p = problem.clone();
            p.c0[k] += d;
            p.loss(weights)
        });
        assert_relative_eq!(dc0[k], num, epsilon = 1e-7, max_relative = 1e-5);
    }

    for (t, dx) in dxs.iter().enumerate() {
        for k in 0..dx.len() {
            let num = numeric(|d| {
                let mut p = problem.clone();
                p.xs[t][k] += d;
                p.loss(weights)
            });
            assert_relative_eq!(dx[k], num, epsilon = 1e-7, max_relative = 1e-5);
        }
    }
}

#[test]
fn test_gradients_match_finite_differences_over_sequence() {
    let mut rng = StdRng::seed_from_u64(11);
    let weights = Weights::random(&mut rng);
    let problem = Problem::random(&mut rng, 4, 1, 1, 1);
    check_all(&problem, &weights);
}

#[test]
fn test_gradients_through_batched_sequence() {
    let mut rng = StdRng::seed_from_u64(12);
    let weights = Weights::random(&mut rng);
    let problem = Problem::random(&mut rng, 3, 2, 2, 2);
    check_all(&problem, &weights);
}

#[test]
fn test_gradients_fold_through_broadcast_and_tiling() {
    let mut rng = StdRng::seed_from_u64(13);
    let weights = Weights::random(&mut rng);
    // hidden broadcast 1 -> 3, cell tiled 1 -> 3
    let problem = Problem::random(&mut rng, 3, 3, 1, 1);
    check_all(&problem, &weights);
}

#[test]
fn test_gradients_fold_through_reduction_and_truncation() {
    let mut rng = StdRng::seed_from_u64(14);
    let weights = Weights::random(&mut rng);
    // hidden reduced 3 -> last slot, cell cut to its tail
    let problem = Problem::random(&mut rng, 2, 1, 3, 3);
    check_all(&problem, &weights);
}

#[test]
fn test_window_boundary_truncates_gradient() {
    let mut rng = StdRng::seed_from_u64(21);
    let weights = Weights::random(&mut rng);
    let xs: Vec<_> = (0..4).map(|_| Tensor::from_slice(&random_vec(&mut rng, IN))).collect();
    let readout: Vec<_> = (0..4).map(|_| random_vec(&mut rng, OUT)).collect();

    let run_window = |lstm: &mut Lstm<f64>, range: std::ops::Range<usize>| {
        let outputs: Vec<_> = range.clone().map(|t| lstm.forward(&xs[t]).unwrap()).collect();
        for (t, out) in range.zip(outputs).rev() {
            let out = out.with_grad(readout[t].clone()).unwrap();
            lstm.backward(&out).unwrap();
        }
    };

    let mut continued = weights.build();
    run_window(&mut continued, 0..2);
    let h = continued.hidden_state().unwrap().detach();
    let c = continued.cell_state().unwrap().unwrap().detach();
    continued.zero_grad();
    run_window(&mut continued, 2..4);

    let mut fresh = weights.build();
    fresh.set_hidden_state(Some(h)).unwrap();
    fresh.set_cell_state(Some(c)).unwrap();
    run_window(&mut fresh, 2..4);

    for (a, b) in continued.parameters().iter().zip(fresh.parameters()) {
        for (ga, gb) in a.grad().iter().zip(b.grad()) {
            assert_relative_eq!(*ga, *gb, epsilon = 1e-12);
        }
    }
    let (ca, fa) = (continued.state_gradients(), fresh.state_gradients());
    for (ga, gb) in ca.hidden().unwrap().iter().zip(fa.hidden().unwrap()) {
        assert_relative_eq!(*ga, *gb, epsilon = 1e-12);
    }
    for (ga, gb) in ca.cell().unwrap().iter().zip(fa.cell().unwrap()) {
        assert_relative_eq!(*ga, *gb, epsilon = 1e-12);
    }
}

#[test]
fn test_cache_pool_bounded_over_cycles() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut lstm = Weights::random(&mut rng).build();
    for _ in 0..10 {
        let outputs: Vec<_> = (0..5)
            .map(|_| lstm.forward(&Tensor::from_slice(&random_vec(&mut rng, IN))).unwrap())
            .collect();
        assert_eq!(lstm.pending_depth(), 5);
        for out in outputs.into_iter().rev() {
            let out = out.with_grad(vec![1.0; OUT]).unwrap();
            lstm.backward(&out).unwrap();
        }
        assert_eq!(lstm.pending_depth(), 0);
        assert_eq!(lstm.upward().pending_depth(), 0);
        assert_eq!(lstm.lateral().pending_depth(), 0);
    }
    assert_eq!(lstm.cache_capacity(), 5);
}

#[test]
fn test_unmatched_backward_is_an_error() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut lstm = Weights::random(&mut rng).build();
    let out = lstm
        .forward(&Tensor::from_slice(&[0.1, 0.2]))
        .unwrap()
        .with_grad(vec![1.0; OUT])
        .unwrap();
    lstm.backward(&out).unwrap();
    assert!(matches!(
        lstm.backward(&out),
        Err(TensorustError::NoPendingForward { .. })
    ));
}

#[test]
fn test_batch_change_broadcasts_hidden_state() {
    let mut rng = StdRng::seed_from_u64(5);
    let weights = Weights::random(&mut rng);
    let x0 = random_vec(&mut rng, IN);
    let x1 = random_vec(&mut rng, IN);

    let mut batched = weights.build();
    batched.forward(&Tensor::from_slice(&x0)).unwrap();
    let rows: Vec<f64> = x1.iter().copied().cycle().take(3 * IN).collect();
    let y = batched.forward(&Tensor::new(rows, vec![IN], 3).unwrap()).unwrap();
    assert_eq!(y.batch_count(), 3);

    let mut single = weights.build();
    single.forward(&Tensor::from_slice(&x0)).unwrap();
    let reference = single.forward(&Tensor::from_slice(&x1)).unwrap();
    for b in 0..3 {
        for (p, q) in y.sample(b).unwrap().iter().zip(reference.data()) {
            assert_relative_eq!(*p, *q, epsilon = 1e-12);
        }
    }
    assert_eq!(batched.cell_state().unwrap().unwrap().batch_count(), 3);

    let err = batched
        .forward(&Tensor::new(vec![0.0; 2 * IN], vec![IN], 2).unwrap())
        .unwrap_err();
    assert!(matches!(
        err,
        TensorustError::BatchMismatch { previous: 3, requested: 2 }
    ));
    assert_eq!(batched.pending_depth(), 2);
    assert_eq!(batched.hidden_state().unwrap().batch_count(), 3);
}

#[test]
fn test_batch_one_after_batch_keeps_last_slot() {
    let mut rng = StdRng::seed_from_u64(6);
    let weights = Weights::random(&mut rng);
    let rows = random_vec(&mut rng, 3 * IN);
    let x = random_vec(&mut rng, IN);

    let mut batched = weights.build();
    batched.forward(&Tensor::new(rows.clone(), vec![IN], 3).unwrap()).unwrap();
    let y = batched.forward(&Tensor::from_slice(&x)).unwrap();

    let mut single = weights.build();
    single.forward(&Tensor::from_slice(&rows[2 * IN..])).unwrap();
    let reference = single.forward(&Tensor::from_slice(&x)).unwrap();
    for (p, q) in y.data().iter().zip(reference.data()) {
        assert_relative_eq!(*p, *q, epsilon = 1e-12);
    }
}

#[test]
fn test_cell_state_tiled_to_larger_batch() {
    // zero weights: a = 0 and i = f = o = 0.5, so c = c_prev / 2
    let mut lstm = Lstm::<f64>::new(&LstmConfig::new(1, 2).with_init(WeightInit::Constant(0.0))).unwrap();
    lstm.set_cell_state(Some(Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2], 2).unwrap()))
        .unwrap();
    lstm.forward(&Tensor::new(vec![0.0; 4], vec![1], 4).unwrap()).unwrap();

    let c = lstm.cell_state().unwrap().unwrap();
    assert_eq!(c.batch_count(), 4);
    assert_eq!(c.data(), &[0.5, 1.0, 1.5, 2.0, 0.5, 1.0, 1.5, 2.0]);
}

#[test]
fn test_reset_matches_fresh_layer() {
    let mut rng = StdRng::seed_from_u64(7);
    let weights = Weights::random(&mut rng);
    let x = random_vec(&mut rng, IN);

    let mut used = weights.build();
    for _ in 0..3 {
        used.forward(&Tensor::from_slice(&random_vec(&mut rng, IN))).unwrap();
    }
    used.reset_state();
    assert_eq!(used.pending_depth(), 0);
    assert!(used.hidden_state().is_none());

    let y = used.forward(&Tensor::from_slice(&x)).unwrap();
    let reference = weights.build().forward(&Tensor::from_slice(&x)).unwrap();
    assert_eq!(y.data(), reference.data());
}

#[test]
fn test_clearing_state_drops_pending_steps() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut lstm = Weights::random(&mut rng).build();
    lstm.forward(&Tensor::from_slice(&[1.0, 1.0])).unwrap();
    lstm.forward(&Tensor::from_slice(&[1.0, 1.0])).unwrap();

    lstm.set_hidden_state(None).unwrap();
    assert_eq!(lstm.pending_depth(), 0);
    assert_eq!(lstm.upward().pending_depth(), 0);
    assert!(lstm.hidden_state().is_none());
    assert!(lstm.cell_state().unwrap().is_some());

    lstm.set_cell_state(None).unwrap();
    assert!(lstm.cell_state().unwrap().is_none());
}

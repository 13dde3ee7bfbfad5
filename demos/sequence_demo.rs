//! Trains a small LSTM to predict the next value of a sine wave.
//!
//! Run with `RUST_LOG=debug` to see per-update losses.

use tensorust_recurrent::{
    config::{DenseConfig, LstmConfig, TrainerConfig},
    nn::{Adam, DenseLayer, IncrementalTrainer, Layer, Lstm, MSELoss, Sequential},
    Result, Tensor,
};

const STEPS: usize = 12;

fn window(start: usize) -> (Vec<Tensor<f32>>, Vec<Tensor<f32>>) {
    let value = |t: usize| (0.3 * t as f32).sin();
    let inputs = (start..start + STEPS).map(|t| Tensor::from_slice(&[value(t)])).collect();
    let targets = (start + 1..=start + STEPS)
        .map(|t| Tensor::from_slice(&[value(t)]))
        .collect();
    (inputs, targets)
}

fn main() -> Result<()> {
    env_logger::init();

    let model = Sequential::new()
        .add(Lstm::new(&LstmConfig::new(1, 16).with_forget_bias(1.0).with_seed(42))?)
        .add(DenseLayer::new(&DenseConfig::new(16, 1).with_seed(43))?);
    let mut trainer = IncrementalTrainer::new(model, Adam::<f32>::new(0.01), MSELoss::mean())
        .with_config(TrainerConfig::default().with_grad_clip(1.0))?;

    for epoch in 0..400 {
        let (inputs, targets) = window(epoch % 21);
        trainer.model_mut().reset_state();
        let loss = trainer.update_incremental(&inputs, &targets)?;
        if epoch % 50 == 0 {
            println!("epoch {epoch:>3}  loss {loss:.5}");
        }
    }

    let (inputs, targets) = window(5);
    trainer.model_mut().reset_state();
    let predictions = trainer.predict(&inputs)?;
    for (p, t) in predictions.iter().zip(&targets) {
        println!("predicted {:+.3}  expected {:+.3}", p.data()[0], t.data()[0]);
    }
    Ok(())
}

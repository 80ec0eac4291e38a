use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use probe_cv::{
    Dataset, EvalConfig, InnerKFoldClassifier, KFoldClassifier, MlpConfig, SplitClassifier,
};

/// Three noisy blobs in 8 dimensions, standing in for sentence embeddings.
fn blobs(n_per_class: usize, rng: &mut StdRng) -> probe_cv::Result<Dataset> {
    let dim = 8;
    let mut xs: Vec<Vec<f32>> = Vec::with_capacity(3 * n_per_class);
    let mut ys = Vec::with_capacity(3 * n_per_class);
    for class in 0..3 {
        for _ in 0..n_per_class {
            let row: Vec<f32> = (0..dim)
                .map(|d| {
                    let center = if d % 3 == class { 1.0_f32 } else { 0.0 };
                    center + rng.gen_range(-0.6..0.6)
                })
                .collect();
            xs.push(row);
            ys.push(class);
        }
    }
    Dataset::from_rows(&xs, &ys)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG=probe_cv=debug shows per-candidate scores.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let mut rng = StdRng::seed_from_u64(0);
    let train = blobs(80, &mut rng)?;
    let valid = blobs(20, &mut rng)?;
    let test = blobs(40, &mut rng)?;

    let mlp = EvalConfig {
        nclasses: 3,
        classifier: MlpConfig {
            nhid: 16,
            optim: "rmsprop".to_owned(),
            dropout: 0.1,
            max_epoch: 40,
            ..MlpConfig::default()
        },
        ..EvalConfig::default()
    };
    let logreg = EvalConfig {
        usepytorch: false,
        ..mlp.clone()
    };

    let nested = InnerKFoldClassifier::new(&train, mlp.clone())?.run()?;
    println!(
        "nested k-fold  [{}]: dev {:.2} test {:.2}",
        mlp.classifier_name(),
        nested.dev_accuracy,
        nested.test_accuracy
    );

    let kfold = KFoldClassifier::new(&train, &test, logreg.clone())?.run()?;
    println!(
        "k-fold         [{}]: dev {:.2} test {:.2} ({} predictions)",
        logreg.classifier_name(),
        kfold.dev_accuracy,
        kfold.test_accuracy,
        kfold.predictions.len()
    );

    let split = SplitClassifier::new(&train, &valid, &test, mlp.clone())?.run()?;
    println!(
        "fixed split    [{}]: dev {:.2} test {:.2}",
        mlp.classifier_name(),
        split.dev_accuracy,
        split.test_accuracy
    );

    Ok(())
}

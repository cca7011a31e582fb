use rand::SeedableRng;
use rand::rngs::StdRng;
use wavernn::model::expected_parameters;
use wavernn::{GenerateOptions, MelSpectrogram, ModelBundle, NoProgress, WeightProvider};

/// Optional integration test.
///
/// Run locally with:
/// `WAVERNN_MODEL_DIR=/path/to/model cargo test -p wavernn --test e2e_model_env -- --nocapture`
#[test]
fn model_dir_env_smoke() {
    let Some(model_dir) = std::env::var_os("WAVERNN_MODEL_DIR") else {
        eprintln!("skipping: WAVERNN_MODEL_DIR is not set");
        return;
    };

    let bundle = ModelBundle::load_from_dir(&model_dir).expect("load bundle");
    let hp = bundle.hparams.clone();
    for (name, _) in expected_parameters(&hp) {
        assert!(
            bundle.weights.contains(&name).expect("contains"),
            "missing tensor {name}"
        );
    }

    let model = bundle.model().expect("build model");
    let n_frames = hp.min_frames() + 1;
    let mel = MelSpectrogram::zeros(n_frames, hp.feat_dims);
    let wav = model
        .generate(
            &mel,
            &mut StdRng::seed_from_u64(0),
            &GenerateOptions::default(),
            &mut NoProgress,
        )
        .expect("generate");
    assert_eq!(wav.len(), hp.total_scale() * 2);
    assert!(wav.iter().all(|v| (-1.0..=1.0).contains(v)));
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use wavernn::audio::{TextFile, WavFile, WaveformSink};
use wavernn::export::export_dir;
use wavernn::model::{check_parameters, decoder_parameters};
use wavernn::{
    CancelToken, Conditioning, GenerateOptions, LogProgress, MelSpectrogram, ModelBundle,
};

#[derive(Debug, Parser)]
#[command(name = "wavernn")]
#[command(about = "WaveRNN vocoder: mel-spectrogram to waveform", long_about = None)]
struct Cli {
    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Synthesize a waveform from a mel-spectrogram.
    Generate {
        /// Directory with params.json and weights.safetensors.
        #[arg(long)]
        model_dir: PathBuf,

        /// Mel input (.npy, .safetensors or whitespace text).
        #[arg(long)]
        mel: PathBuf,

        #[arg(short, long, default_value = "output.wav")]
        output: PathBuf,

        /// Sampling seed; random when omitted.
        #[arg(long)]
        seed: Option<u64>,

        /// Also write samples as text, one per line.
        #[arg(long)]
        text: Option<PathBuf>,

        /// Write samples unscaled instead of peak-normalizing.
        #[arg(long, default_value_t = false)]
        no_normalize: bool,

        #[arg(long, default_value_t = wavernn::constants::PROGRESS_INTERVAL)]
        progress_every: usize,
    },
    /// Run only the conditioning network and dump its output as text.
    Condition {
        #[arg(long)]
        model_dir: PathBuf,

        #[arg(long)]
        mel: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Decode from a conditioning directory written by `condition`.
    Decode {
        /// Directory with params.json and either weights.safetensors or params/.
        #[arg(long)]
        model_dir: PathBuf,

        #[arg(long)]
        conditioning: PathBuf,

        #[arg(short, long, default_value = "output.wav")]
        output: PathBuf,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        text: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        no_normalize: bool,

        #[arg(long, default_value_t = wavernn::constants::PROGRESS_INTERVAL)]
        progress_every: usize,
    },
    /// Dump decoder parameters as C array literals.
    ExportParams {
        #[arg(long)]
        model_dir: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Validate params.json and weights without generating.
    Inspect {
        #[arg(long)]
        model_dir: PathBuf,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("set tracing subscriber")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Command::Generate {
            model_dir,
            mel,
            output,
            seed,
            text,
            no_normalize,
            progress_every,
        } => {
            let bundle = ModelBundle::load_from_dir(&model_dir).context("load model dir")?;
            let model = bundle.model()?;
            let mel = load_mel(&mel, model.hparams().feat_dims)?;
            info!(frames = mel.n_frames(), "mel loaded");

            let opts = generate_options(progress_every)?;
            let mut rng = seeded_rng(seed);
            let wav = model.generate(&mel, &mut rng, &opts, &mut LogProgress)?;
            write_outputs(&wav, model.hparams().sample_rate, &output, text.as_deref(), !no_normalize)
        }
        Command::Condition {
            model_dir,
            mel,
            out_dir,
        } => {
            let bundle = ModelBundle::load_from_dir(&model_dir).context("load model dir")?;
            let model = bundle.model()?;
            let mel = load_mel(&mel, model.hparams().feat_dims)?;
            let cond = model.condition(&mel)?;
            cond.save_text_dir(&out_dir)
                .with_context(|| format!("write conditioning to {}", out_dir.display()))?;
            info!(samples = cond.len(), dir = %out_dir.display(), "conditioning written");
            Ok(())
        }
        Command::Decode {
            model_dir,
            conditioning,
            output,
            seed,
            text,
            no_normalize,
            progress_every,
        } => {
            let bundle = ModelBundle::load_from_dir(&model_dir).context("load model dir")?;
            let decoder = bundle.decoder()?;
            let cond = Conditioning::load_text_dir(&conditioning)
                .with_context(|| format!("read conditioning from {}", conditioning.display()))?;
            info!(samples = cond.len(), "conditioning loaded");

            let opts = generate_options(progress_every)?;
            let mut rng = seeded_rng(seed);
            let wav = decoder.generate(&cond, &mut rng, &opts, &mut LogProgress)?;
            write_outputs(&wav, bundle.hparams.sample_rate, &output, text.as_deref(), !no_normalize)
        }
        Command::ExportParams { model_dir, out_dir } => {
            let bundle = ModelBundle::load_from_dir(&model_dir).context("load model dir")?;
            let params = decoder_parameters(&bundle.hparams);
            check_parameters(&bundle.weights, &params)?;
            let names: Vec<String> = params.into_iter().map(|(name, _)| name).collect();
            let written = export_dir(&bundle.weights, &names, &out_dir)
                .with_context(|| format!("export to {}", out_dir.display()))?;
            info!(files = written, dir = %out_dir.display(), "parameters exported");
            Ok(())
        }
        Command::Inspect { model_dir } => inspect_model(&model_dir),
    }
}

fn inspect_model(model_dir: &Path) -> Result<()> {
    let bundle = ModelBundle::load_from_dir(model_dir).context("load model dir")?;
    let hp = &bundle.hparams;
    eprintln!(
        "params ok: rnn_dims={} fc_dims={} bits={} factors={:?} pad={} feat_dims={} res_blocks={} sample_rate={}",
        hp.rnn_dims,
        hp.fc_dims,
        hp.bits,
        hp.upsample_factors,
        hp.pad,
        hp.feat_dims,
        hp.res_blocks,
        hp.sample_rate
    );
    match &bundle.weights {
        wavernn::model::WeightSource::SafeTensors(_) => {
            let model = bundle.model()?;
            eprintln!("weights ok: parameters={}", model.param_count());
        }
        wavernn::model::WeightSource::Text(_) => {
            let decoder = bundle.decoder()?;
            eprintln!("decoder weights ok: parameters={}", decoder.param_count());
        }
    }
    Ok(())
}

fn load_mel(path: &Path, feat_dims: usize) -> Result<MelSpectrogram> {
    MelSpectrogram::from_path(path)
        .with_context(|| format!("load mel {}", path.display()))?
        .with_feat_dims(feat_dims)
}

fn generate_options(progress_every: usize) -> Result<GenerateOptions> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.cancel();
        })
        .context("failed to set Ctrl+C handler")?;
    }
    Ok(GenerateOptions {
        progress_interval: progress_every,
        cancel: Some(cancel),
    })
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    let seed = seed.unwrap_or_else(rand::random);
    info!(seed, "sampling seed");
    StdRng::seed_from_u64(seed)
}

fn write_outputs(
    wav: &[f32],
    sample_rate_hz: u32,
    output: &Path,
    text: Option<&Path>,
    normalize: bool,
) -> Result<()> {
    if wav.is_empty() {
        warn!("generated waveform is empty");
    }
    let mut sink = WavFile {
        path: output.to_path_buf(),
        normalize,
    };
    sink.write(wav, sample_rate_hz)?;
    info!(samples = wav.len(), path = %output.display(), "wav written");

    if let Some(path) = text {
        TextFile::new(path).write(wav, sample_rate_hz)?;
        info!(path = %path.display(), "text written");
    }
    Ok(())
}

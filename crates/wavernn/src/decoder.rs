//! Autoregressive sample decoder.
//!
//! One iteration per output sample, strictly sequential:
//!
//! ```text
//! x   = I([prev, mel_i, aux0_i])
//! h1  = gru1(x, h1);             x = x + h1
//! h2  = gru2([x, aux1_i], h2);   x = x + h2
//! y   = relu(fc1([x, aux2_i]))
//! y   = relu(fc2([y, aux3_i]))
//! c   ~ softmax(fc3(y));         prev = 2c / (n - 1) - 1
//! ```
//!
//! All concatenations are written into fixed buffers owned by the session,
//! so a step performs no allocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use crate::conditioning::Conditioning;
use crate::constants::PROGRESS_INTERVAL;
use crate::error::{Result, VocoderError, ensure_config};
use crate::gru::{GruCell, GruScratch};
use crate::math::{first_non_finite, relu_inplace, softmax_inplace};
use crate::ops::{add_inplace, linear_into};
use crate::params::Hparams;
use crate::sampler::{class_to_amplitude, sample_categorical};
use crate::stats::TensorStats;
use crate::weights::WeightProvider;

/// Fully-connected layer, row-major `[out_dims, in_dims]` weight.
#[derive(Debug, Clone)]
pub struct Linear {
    pub in_dims: usize,
    pub out_dims: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Linear {
    pub fn load(
        provider: &dyn WeightProvider,
        prefix: &str,
        in_dims: usize,
        out_dims: usize,
    ) -> Result<Self> {
        let weight = provider
            .tensor_shaped(&format!("{prefix}.weight"), &[out_dims, in_dims])?
            .data;
        let bias = provider
            .tensor_shaped(&format!("{prefix}.bias"), &[out_dims])?
            .data;
        Ok(Self {
            in_dims,
            out_dims,
            weight,
            bias,
        })
    }

    #[must_use]
    pub fn zeros(in_dims: usize, out_dims: usize) -> Self {
        Self {
            in_dims,
            out_dims,
            weight: vec![0.0; in_dims * out_dims],
            bias: vec![0.0; out_dims],
        }
    }

    #[inline]
    pub fn forward_into(&self, out: &mut [f32], x: &[f32]) {
        linear_into(out, x, &self.weight, Some(&self.bias));
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Decoder layers: input projection, two GRUs and three dense layers.
#[derive(Debug, Clone)]
pub struct DecoderWeights {
    pub feat_dims: usize,
    pub aux_dims: usize,
    pub rnn_dims: usize,
    pub fc_dims: usize,
    pub n_classes: usize,
    pub input: Linear,
    pub rnn1: GruCell,
    pub rnn2: GruCell,
    pub fc1: Linear,
    pub fc2: Linear,
    pub fc3: Linear,
}

impl DecoderWeights {
    pub fn load(hp: &Hparams, provider: &dyn WeightProvider) -> Result<Self> {
        let (rnn, fc, aux) = (hp.rnn_dims, hp.fc_dims, hp.aux_dims());
        Ok(Self {
            feat_dims: hp.feat_dims,
            aux_dims: aux,
            rnn_dims: rnn,
            fc_dims: fc,
            n_classes: hp.n_classes(),
            input: Linear::load(provider, "I", hp.input_dims(), rnn)?,
            rnn1: GruCell::load(provider, "rnn1", rnn, rnn)?,
            rnn2: GruCell::load(provider, "rnn2", rnn + aux, rnn)?,
            fc1: Linear::load(provider, "fc1", rnn + aux, fc)?,
            fc2: Linear::load(provider, "fc2", fc + aux, fc)?,
            fc3: Linear::load(provider, "fc3", fc, hp.n_classes())?,
        })
    }

    /// All-zero layers with the shapes declared by `hp`.
    #[must_use]
    pub fn zeros(hp: &Hparams) -> Self {
        let (rnn, fc, aux) = (hp.rnn_dims, hp.fc_dims, hp.aux_dims());
        Self {
            feat_dims: hp.feat_dims,
            aux_dims: aux,
            rnn_dims: rnn,
            fc_dims: fc,
            n_classes: hp.n_classes(),
            input: Linear::zeros(hp.input_dims(), rnn),
            rnn1: GruCell::zeros(rnn, rnn),
            rnn2: GruCell::zeros(rnn + aux, rnn),
            fc1: Linear::zeros(rnn + aux, fc),
            fc2: Linear::zeros(fc + aux, fc),
            fc3: Linear::zeros(fc, hp.n_classes()),
        }
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.input.param_count()
            + self.rnn1.param_count()
            + self.rnn2.param_count()
            + self.fc1.param_count()
            + self.fc2.param_count()
            + self.fc3.param_count()
    }

    /// Generate one sample per conditioning row.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        cond: &Conditioning,
        rng: &mut R,
        opts: &GenerateOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<f32>> {
        let mut session = DecodeSession::new(self, cond)?;
        let total = cond.len();
        let interval = opts.progress_interval.max(1);
        let mut output = Vec::with_capacity(total);

        info!(samples = total, "generating waveform");
        let started = Instant::now();
        let mut window_start = started;
        for i in 0..total {
            if opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(VocoderError::Cancelled { samples_done: i });
            }

            let Some(sample) = session.step(rng)? else {
                break;
            };
            output.push(sample);

            if (i + 1) % interval == 0 {
                let now = Instant::now();
                let elapsed = now - window_start;
                progress.report(&ProgressReport {
                    samples_done: i + 1,
                    samples_total: total,
                    samples_per_sec: rate(interval, elapsed),
                    elapsed: now - started,
                });
                window_start = now;
            }
        }

        let elapsed = started.elapsed();
        info!(
            samples = total,
            secs = elapsed.as_secs_f32(),
            samples_per_sec = rate(total, elapsed) as u64,
            "generation finished"
        );
        debug!(output = %TensorStats::of(&output), "waveform stats");
        Ok(output)
    }
}

fn rate(samples: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        samples as f64 / secs
    } else {
        f64::INFINITY
    }
}

/// Recurrent memory carried from one sample to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    pub h1: Vec<f32>,
    pub h2: Vec<f32>,
    pub prev_sample: f32,
}

impl RecurrentState {
    #[must_use]
    pub fn new(rnn_dims: usize) -> Self {
        Self {
            h1: vec![0.0; rnn_dims],
            h2: vec![0.0; rnn_dims],
            prev_sample: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.h1.fill(0.0);
        self.h2.fill(0.0);
        self.prev_sample = 0.0;
    }
}

#[derive(Debug, Clone)]
struct StepBuffers {
    input: Vec<f32>,    // [1 + feat + aux]
    rnn_in: Vec<f32>,   // [rnn + aux]; head holds the residual stream
    fc1_in: Vec<f32>,   // [rnn + aux]
    fc2_in: Vec<f32>,   // [fc + aux]
    fc2_out: Vec<f32>,  // [fc]
    logits: Vec<f32>,   // [n_classes]
    gru1: GruScratch,
    gru2: GruScratch,
}

/// Decode loop state for one utterance: borrowed weights and conditioning,
/// owned recurrent state and scratch buffers.
#[derive(Debug)]
pub struct DecodeSession<'a> {
    weights: &'a DecoderWeights,
    cond: &'a Conditioning,
    state: RecurrentState,
    buf: StepBuffers,
    next: usize,
}

impl<'a> DecodeSession<'a> {
    pub fn new(weights: &'a DecoderWeights, cond: &'a Conditioning) -> Result<Self> {
        ensure_config!(
            cond.feat_dims() == weights.feat_dims,
            "conditioning has {} mel channels, decoder expects {}",
            cond.feat_dims(),
            weights.feat_dims
        );
        ensure_config!(
            cond.aux_dims() == weights.aux_dims,
            "conditioning has aux slices of width {}, decoder expects {}",
            cond.aux_dims(),
            weights.aux_dims
        );
        ensure_config!(
            weights.n_classes >= 2,
            "need at least 2 output classes, got {}",
            weights.n_classes
        );

        let (rnn, fc, aux) = (weights.rnn_dims, weights.fc_dims, weights.aux_dims);
        Ok(Self {
            weights,
            cond,
            state: RecurrentState::new(rnn),
            next: 0,
            buf: StepBuffers {
                input: vec![0.0; 1 + weights.feat_dims + aux],
                rnn_in: vec![0.0; rnn + aux],
                fc1_in: vec![0.0; rnn + aux],
                fc2_in: vec![0.0; fc + aux],
                fc2_out: vec![0.0; fc],
                logits: vec![0.0; weights.n_classes],
                gru1: GruScratch::new(rnn),
                gru2: GruScratch::new(rnn),
            },
        })
    }

    #[must_use]
    pub fn state(&self) -> &RecurrentState {
        &self.state
    }

    /// Index of the next sample to generate.
    #[must_use]
    pub fn position(&self) -> usize {
        self.next
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.next >= self.cond.len()
    }

    /// Probabilities of the most recent step.
    #[must_use]
    pub fn probabilities(&self) -> &[f32] {
        &self.buf.logits
    }

    /// Generate the next sample, or `None` once every conditioning row is used.
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Option<f32>> {
        let w = self.weights;
        let cond = self.cond;
        let i = self.next;
        if i >= cond.len() {
            return Ok(None);
        }
        let (rnn, fc) = (w.rnn_dims, w.fc_dims);
        let Self { state, buf, .. } = self;

        buf.input[0] = state.prev_sample;
        buf.input[1..1 + w.feat_dims].copy_from_slice(cond.mel_at(i));
        buf.input[1 + w.feat_dims..].copy_from_slice(cond.aux_at(0, i));

        let (x, aux1) = buf.rnn_in.split_at_mut(rnn);
        w.input.forward_into(x, &buf.input);
        w.rnn1.step(x, &mut state.h1, &mut buf.gru1);
        add_inplace(x, &state.h1);
        aux1.copy_from_slice(cond.aux_at(1, i));
        w.rnn2.step(&buf.rnn_in, &mut state.h2, &mut buf.gru2);

        let (y, aux2) = buf.fc1_in.split_at_mut(rnn);
        y.copy_from_slice(&buf.rnn_in[..rnn]);
        add_inplace(y, &state.h2);
        aux2.copy_from_slice(cond.aux_at(2, i));

        let (z, aux3) = buf.fc2_in.split_at_mut(fc);
        w.fc1.forward_into(z, &buf.fc1_in);
        relu_inplace(z);
        aux3.copy_from_slice(cond.aux_at(3, i));

        w.fc2.forward_into(&mut buf.fc2_out, &buf.fc2_in);
        relu_inplace(&mut buf.fc2_out);
        w.fc3.forward_into(&mut buf.logits, &buf.fc2_out);

        if let Some(bad) = first_non_finite(&buf.logits) {
            return Err(VocoderError::NumericInstability {
                step: i,
                detail: format!("logit {bad} is {}", buf.logits[bad]),
            });
        }
        let mass = softmax_inplace(&mut buf.logits);
        if !mass.is_finite() || mass <= 0.0 {
            return Err(VocoderError::NumericInstability {
                step: i,
                detail: format!("softmax mass {mass}"),
            });
        }
        let class = sample_categorical(&buf.logits, rng).ok_or_else(|| {
            VocoderError::NumericInstability {
                step: i,
                detail: "distribution has no positive mass".to_string(),
            }
        })?;

        let sample = class_to_amplitude(class, w.n_classes);
        state.prev_sample = sample;
        self.next = i + 1;
        Ok(Some(sample))
    }
}

/// Periodic throughput report. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub samples_done: usize,
    pub samples_total: usize,
    pub samples_per_sec: f64,
    pub elapsed: Duration,
}

pub trait ProgressSink {
    fn report(&mut self, report: &ProgressReport);
}

impl<F: FnMut(&ProgressReport)> ProgressSink for F {
    fn report(&mut self, report: &ProgressReport) {
        self(report);
    }
}

/// Logs `done/total -- Speed: n samples/sec` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&mut self, r: &ProgressReport) {
        info!(
            "{}/{} -- Speed: {} samples/sec",
            r.samples_done, r.samples_total, r.samples_per_sec as u64
        );
    }
}

/// Discards reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _: &ProgressReport) {}
}

/// Shared flag checked once per generated sample.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Samples between progress reports.
    pub progress_interval: usize,
    pub cancel: Option<CancelToken>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            progress_interval: PROGRESS_INTERVAL,
            cancel: None,
        }
    }
}

mod dataset;
mod generate;
mod model;
mod tokenizer;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};
use tch::{nn, Device};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Clap app entry point.
#[derive(Debug, Parser)]
pub struct App {
    /// Subcommand.
    #[clap(subcommand)]
    command: Command,
}

/// Clap app commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Build a character vocabulary from a text file,
    /// and write train/validation token files next to it.
    Prepare {
        /// Plain text corpus.
        #[arg(long)]
        input_file: PathBuf,

        /// Directory to write `train.bin`, `val.bin`, and `meta.ron` into.
        #[arg(long)]
        output_directory: PathBuf,
    },

    /// Use a model to generate text.
    Generate {
        /// Directory produced by the `prepare` command.
        #[arg(long)]
        data_directory: PathBuf,

        /// Custom model configuration.
        #[arg(long)]
        model_config_file: Option<PathBuf>,

        /// Safetensors to load, the model is freshly initialized otherwise.
        #[arg(long)]
        safetensors: Option<PathBuf>,

        /// Input to supply context from.
        #[arg(long)]
        input: String,

        /// Number of tokens to generate.
        #[arg(long)]
        token_count: usize,

        /// Divides the logits before sampling.
        #[arg(long, default_value_t = 1.0)]
        temperature: f64,

        /// Seed for sampling.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Compute a model's loss on random contexts from one split of a dataset.
    Evaluate {
        /// Directory produced by the `prepare` command.
        #[arg(long)]
        data_directory: PathBuf,

        /// Custom model configuration.
        #[arg(long)]
        model_config_file: Option<PathBuf>,

        /// Safetensors to load, the model is freshly initialized otherwise.
        #[arg(long)]
        safetensors: Option<PathBuf>,

        /// Split to evaluate on.
        #[arg(long, value_enum, default_value_t = Split::Val)]
        split: Split,

        /// Number of batches to average the loss over.
        #[arg(long, default_value_t = 20)]
        batches: usize,

        /// Number of contexts computed at the same time in a single batch.
        #[arg(long, default_value_t = 12)]
        contexts_per_batch: usize,

        /// Seed for batch selection.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Split {
    Train,
    Val,
}

impl Split {
    fn file_name(self) -> &'static str {
        match self {
            Split::Train => dataset::TRAIN_FILE_NAME,
            Split::Val => dataset::VAL_FILE_NAME,
        }
    }
}

/// Load the model configuration, sized to `vocabulary`,
/// create the model, and load safetensors if provided.
fn load_model(
    var_store: &mut nn::VarStore,
    model_config_file: Option<&Path>,
    safetensors: Option<&Path>,
    vocabulary: &tokenizer::Vocabulary,
) -> anyhow::Result<model::Gpt> {
    let mut config: model::GptConfig = match model_config_file {
        Some(path) => ron::from_str(fs::read_to_string(path)?.as_str())?,
        None => model::GptConfig::default(),
    };
    config.vocab_size = u32::try_from(vocabulary.vocab_size())?;

    let gpt = model::Gpt::new(&(var_store.root() / "gpt"), &config)?;

    if let Some(safetensors) = safetensors {
        var_store
            .load(safetensors)
            .with_context(|| format!("Failed to load {}.", safetensors.display()))?;
        info!("Loaded weights from {}.", safetensors.display());
    }

    Ok(gpt)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let command = App::parse().command;
    let device = Device::cuda_if_available();

    match command {
        // Tokenize a text file and write the dataset.
        Command::Prepare {
            input_file,
            output_directory,
        } => {
            let prepared = dataset::prepare(&input_file, &output_directory)?;
            info!(
                "Wrote a {} token vocabulary, {} training and {} validation tokens to {}.",
                prepared.vocab_size,
                prepared.train_token_count,
                prepared.val_token_count,
                output_directory.display()
            );
        }

        // Generate text.
        Command::Generate {
            data_directory,
            model_config_file,
            safetensors,
            input,
            token_count,
            temperature,
            seed,
        } => {
            if let Some(seed) = seed {
                tch::manual_seed(seed as i64);
            }

            let vocabulary =
                tokenizer::Vocabulary::from_ron(data_directory.join(dataset::META_FILE_NAME))?;

            let mut var_store = nn::VarStore::new(device);
            let gpt = load_model(
                &mut var_store,
                model_config_file.as_deref(),
                safetensors.as_deref(),
                &vocabulary,
            )?;

            let result =
                generate::generate(&input, token_count, temperature, &vocabulary, device, &gpt)?;
            println!("{result}");
        }

        // Score a model.
        Command::Evaluate {
            data_directory,
            model_config_file,
            safetensors,
            split,
            batches,
            contexts_per_batch,
            seed,
        } => {
            let mut rng = match seed {
                Some(seed) => {
                    tch::manual_seed(seed as i64);
                    StdRng::seed_from_u64(seed)
                }
                None => StdRng::from_os_rng(),
            };

            let vocabulary =
                tokenizer::Vocabulary::from_ron(data_directory.join(dataset::META_FILE_NAME))?;
            let tokens =
                dataset::TokenDataset::from_file(data_directory.join(split.file_name()), device)?;

            let mut var_store = nn::VarStore::new(device);
            let gpt = load_model(
                &mut var_store,
                model_config_file.as_deref(),
                safetensors.as_deref(),
                &vocabulary,
            )?;

            // Average the loss over a number of batches.
            let mut total_loss = 0.0;
            for _ in 0..batches {
                let (inputs, targets) =
                    tokens.get_batch(&mut rng, contexts_per_batch, gpt.config().block_size)?;
                let (_, loss) = tch::no_grad(|| gpt.forward_t(&inputs, Some(&targets), false));
                let loss = loss.context("Forward with targets should produce a loss.")?;
                total_loss += f64::try_from(loss)?;
            }
            let loss = total_loss / batches.max(1) as f64;

            println!(
                "{split:?} loss: {loss:.4}, uniform baseline: {:.4}",
                (vocabulary.vocab_size() as f64).ln()
            );
        }
    }

    Ok(())
}

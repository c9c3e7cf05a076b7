//! GPT-style decoder-only transformer.
//!
//! Resources:
//! - Attention is All You Need (<https://arxiv.org/abs/1706.03762>).
//! - Language Models are Unsupervised Multitask Learners (GPT-2).
//! - On Layer Normalization in the Transformer Architecture (<https://arxiv.org/pdf/2002.04745>).
//! - Using the Output Embedding to Improve Language Models (<https://arxiv.org/abs/1608.05859>).
//! - Andrej Karpathy's Let's build GPT (<https://youtu.be/kCc8FmEb1nY>).
//! - The tch-rs min-gpt example (<https://github.com/LaurentMazare/tch-rs/tree/main/examples/min-gpt>).

use std::iter;

use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, Module, ModuleT},
    Kind, Tensor,
};
use thiserror::Error;
use tracing::info;

/// Standard deviation used to initialize weights.
const INIT_STD: f64 = 0.02;

/// Epsilon added to the variance in layer normalization.
const LAYER_NORM_EPS: f64 = 1e-5;

/// Configuration for a [`Gpt`].
///
/// Every field has a default, so a configuration file only needs to name
/// the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GptConfig {
    /// Context length, the longest sequence a single forward pass accepts.
    pub block_size: u32,

    /// Number of tokens.
    pub vocab_size: u32,

    /// Number of blocks.
    pub n_layer: u32,

    /// Number of attention heads per block.
    pub n_head: u32,

    /// Embedding size.
    pub n_embed: u32,

    /// Dropout to apply post-embedding, on attention weights,
    /// and at the end of every residual branch.
    pub dropout: f64,

    /// Whether linear and layer normalization layers carry a bias.
    pub bias: bool,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            vocab_size: 65,
            n_layer: 4,
            n_head: 4,
            n_embed: 64,
            dropout: 0.0,
            bias: false,
        }
    }
}

/// A [`GptConfig`] that no model can be built from.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("`{0}` must be positive")]
    NotPositive(&'static str),

    #[error("`n_embed` ({n_embed}) must be divisible by `n_head` ({n_head})")]
    HeadSizeMismatch { n_embed: u32, n_head: u32 },

    #[error("`dropout` must be in [0, 1), got {0}")]
    InvalidDropout(f64),
}

impl GptConfig {
    /// Check the invariants every layer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("block_size", self.block_size),
            ("vocab_size", self.vocab_size),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_embed", self.n_embed),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(ConfigError::NotPositive(*name));
        }

        if self.n_embed % self.n_head != 0 {
            return Err(ConfigError::HeadSizeMismatch {
                n_embed: self.n_embed,
                n_head: self.n_head,
            });
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::InvalidDropout(self.dropout));
        }

        Ok(())
    }
}

// We create our own linear layer instantiator so we control initialization.
// See the tch-rs min-gpt example.
/// Linear layer with `N(0, std)` weights, and a zeroed bias if `bias` is set.
fn linear(var_store: &nn::Path, in_dim: i64, out_dim: i64, bias: bool, std: f64) -> nn::Linear {
    nn::Linear {
        ws: var_store.randn("weight", &[out_dim, in_dim], 0.0, std),
        bs: bias.then(|| var_store.zeros("bias", &[out_dim])),
    }
}

/// Parameters of a linear layer, weight first.
fn linear_parameters(linear: &nn::Linear) -> impl Iterator<Item = &Tensor> {
    iter::once(&linear.ws).chain(linear.bs.as_ref())
}

/// Layer normalization over the last dimension, with an optional bias.
///
/// `tch`'s own layer norm always carries both a weight and a bias,
/// so the bias-free variant is built directly on [`Tensor::layer_norm`].
#[derive(Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Option<Tensor>,
    normalized_shape: Vec<i64>,
}

impl LayerNorm {
    pub fn new(var_store: &nn::Path, size: i64, bias: bool) -> Self {
        Self {
            weight: var_store.ones("weight", &[size]),
            bias: bias.then(|| var_store.zeros("bias", &[size])),
            normalized_shape: vec![size],
        }
    }

    fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        iter::once(&self.weight).chain(self.bias.as_ref())
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.layer_norm(
            self.normalized_shape.as_slice(),
            Some(&self.weight),
            self.bias.as_ref(),
            LAYER_NORM_EPS,
            true,
        )
    }
}

/// Mask used to ensure future tokens have no affect on past ones.
///
/// If `future_mask[query_index][key_index]` is true,
/// attention should omit the item.
/// ie.
/// ```text
///   0     1     2
/// 0 false true  true
/// 1 false false true
/// 2 false false false
/// ```
/// Implies token 1 cannot affect token 0,
/// but token 1 can affect token 2.
pub fn future_mask(block_size: i64, device: tch::Device) -> Tensor {
    Tensor::ones([block_size, block_size], (Kind::Bool, device)).triu(1)
}

/// Multi-head causal self-attention.
///
/// All heads are computed at once: a single linear layer produces the query,
/// key, and value vectors of every head, which are then split apart.
///
/// The input and output are of shape `(batch, context_length, n_embed)`.
#[derive(Debug)]
pub struct CausalSelfAttention {
    query_key_value: nn::Linear,
    projection: nn::Linear,
    future_mask: Tensor,
    head_count: i64,
    head_size: i64,
    dropout: f64,
}

impl CausalSelfAttention {
    /// Create the attention layer.
    ///
    /// `future_mask` must be at least `block_size` square, see [`future_mask`].
    /// Its storage is shared, never copied.
    ///
    /// # Panics
    ///
    /// If `n_embed` is not divisible by `n_head`.
    pub fn new(var_store: &nn::Path, config: &GptConfig, future_mask: &Tensor) -> Self {
        assert!(
            config.n_head > 0 && config.n_embed % config.n_head == 0,
            "n_embed ({}) must be divisible by n_head ({}).",
            config.n_embed,
            config.n_head
        );

        let embedding_size = config.n_embed as i64;
        let head_count = config.n_head as i64;

        Self {
            query_key_value: linear(
                &(var_store / "query_key_value"),
                embedding_size,
                3 * embedding_size,
                config.bias,
                INIT_STD,
            ),
            projection: linear(
                &(var_store / "projection"),
                embedding_size,
                embedding_size,
                config.bias,
                INIT_STD,
            ),
            future_mask: future_mask.shallow_clone(),
            head_count,
            head_size: embedding_size / head_count,
            dropout: config.dropout,
        }
    }

    fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        linear_parameters(&self.query_key_value).chain(linear_parameters(&self.projection))
    }
}

impl ModuleT for CausalSelfAttention {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let size = input.size();
        let (batch_size, context_length, embedding_size) = (size[0], size[1], size[2]);

        // Compute query, key, and value vectors for all heads,
        // then split them into `(batch, head_count, context_length, head_size)` tensors.
        let query_key_value = self.query_key_value.forward(input);
        let heads = query_key_value
            .split(embedding_size, -1)
            .into_iter()
            .map(|tensor| {
                tensor
                    .view([batch_size, context_length, self.head_count, self.head_size])
                    .transpose(1, 2)
            })
            .collect::<Vec<_>>();
        let (query, key, value) = (&heads[0], &heads[1], &heads[2]);

        // Dot product every query with every key.
        // At the end of this, "attention" is a `(..., context_length, context_length)` shape.
        // attention[...][query_index][key_index] tells you how much the key token is
        // "relevant" to the query token. Each value is from -inf to inf.
        let attention = query.matmul(&key.transpose(-2, -1));

        // Scale down every attention value by the square root of the head size.
        let attention = attention / (self.head_size as f64).sqrt();

        // Tokens should not be influenced by tokens ahead of them.
        let future_mask = self
            .future_mask
            .narrow(0, 0, context_length)
            .narrow(1, 0, context_length);
        let attention = attention.masked_fill(&future_mask, f64::NEG_INFINITY);

        // Softmax along each row, so attention[...][query_index] is a probability distribution.
        let attention = attention.softmax(-1, Kind::Float);
        let attention = attention.dropout(self.dropout, train);

        // `(..., context_length, context_length)` . `(..., context_length, head_size)`
        // -> `(..., context_length, head_size)`, then concatenate the heads back together.
        let result = attention
            .matmul(value)
            .transpose(1, 2)
            .contiguous()
            .view([batch_size, context_length, embedding_size]);

        // Mix information between heads.
        self.projection
            .forward(&result)
            .dropout(self.dropout, train)
    }
}

/// Feed forward layer.
///
/// Composed of:
/// - One hidden layer of size `4 * n_embed`.
/// - A GELU activation function on the hidden layer.
/// - A dropout layer at the end.
///
/// Acts on every position independently.
/// The input and output are of shape `(..., n_embed)`.
#[derive(Debug)]
pub struct FeedForward {
    input: nn::Linear,
    output: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(var_store: &nn::Path, config: &GptConfig) -> Self {
        let input_output_size = config.n_embed as i64;
        let hidden_size = 4 * input_output_size;

        // The output layer writes into the residual stream once per block,
        // so its initialization shrinks with depth (see GPT-2).
        let output_std = INIT_STD / (2.0 * config.n_layer as f64).sqrt();

        Self {
            input: linear(
                &(var_store / "input"),
                input_output_size,
                hidden_size,
                config.bias,
                INIT_STD,
            ),
            output: linear(
                &(var_store / "output"),
                hidden_size,
                input_output_size,
                config.bias,
                output_std,
            ),
            dropout: config.dropout,
        }
    }

    fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        linear_parameters(&self.input).chain(linear_parameters(&self.output))
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let hidden = self.input.forward(input).gelu("none");
        self.output.forward(&hidden).dropout(self.dropout, train)
    }
}

/// A single transformer block.
///
/// Composed of
/// - Causal self-attention.
/// - A feed-forward layer.
/// - Pre-LN Layernorm layers in front of both.
///     - See "On Layer Normalization in the Transformer Architecture"
///
/// The result of each sub-layer is summed with its input.
///
/// The input and output are of shape `(batch, context_length, n_embed)`.
#[derive(Debug)]
pub struct Block {
    attention_layer_norm: LayerNorm,
    attention: CausalSelfAttention,
    feed_forward_layer_norm: LayerNorm,
    feed_forward: FeedForward,
}

impl Block {
    pub fn new(var_store: &nn::Path, config: &GptConfig, future_mask: &Tensor) -> Self {
        let embedding_size = config.n_embed as i64;

        Self {
            attention_layer_norm: LayerNorm::new(
                &(var_store / "layer_norm_1"),
                embedding_size,
                config.bias,
            ),
            attention: CausalSelfAttention::new(&(var_store / "attention"), config, future_mask),
            feed_forward_layer_norm: LayerNorm::new(
                &(var_store / "layer_norm_2"),
                embedding_size,
                config.bias,
            ),
            feed_forward: FeedForward::new(&(var_store / "feed_forward"), config),
        }
    }

    fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.attention_layer_norm
            .parameters()
            .chain(self.attention.parameters())
            .chain(self.feed_forward_layer_norm.parameters())
            .chain(self.feed_forward.parameters())
    }
}

impl ModuleT for Block {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        // Apply attention with pre-layer-norm, and add the residual.
        let attention = self
            .attention
            .forward_t(&self.attention_layer_norm.forward(input), train);
        let result = input + attention;

        // Apply feed-forward with pre-layer-norm, and add the residual.
        let feed_forward = self
            .feed_forward
            .forward_t(&self.feed_forward_layer_norm.forward(&result), train);
        result + feed_forward
    }
}

/// Token embedding initialization, `N(0, 0.02)`.
fn embedding_config() -> nn::EmbeddingConfig {
    nn::EmbeddingConfig {
        ws_init: nn::Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
        ..Default::default()
    }
}

/// The final transformer.
///
/// Composed of:
/// - A token and positional embedding, summed together.
/// - A sequential series of blocks.
/// - A final layer normalization and linear layer, to convert from embedding to logits.
///
/// The linear head shares its weight with the token embedding,
/// so the weight is registered in the var store once.
#[derive(Debug)]
pub struct Gpt {
    config: GptConfig,
    token_embedding: nn::Embedding,
    position_embedding: nn::Embedding,
    blocks: Vec<Block>,
    layer_norm: LayerNorm,
    linear_head: nn::Linear,
}

impl Gpt {
    /// Build a freshly initialized model under `var_store`.
    pub fn new(var_store: &nn::Path, config: &GptConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let vocab_size = config.vocab_size as i64;
        let block_size = config.block_size as i64;
        let embedding_size = config.n_embed as i64;

        let token_embedding = nn::embedding(
            var_store / "token_embedding",
            vocab_size,
            embedding_size,
            embedding_config(),
        );

        // Create embedding for position to give positional context to gpt.
        let position_embedding = nn::embedding(
            var_store / "position_embedding",
            block_size,
            embedding_size,
            embedding_config(),
        );

        // One mask for every block.
        let future_mask = future_mask(block_size, var_store.device());
        let blocks_var_store = &(var_store / "blocks");
        let blocks = (0..config.n_layer)
            .map(|index| Block::new(&(blocks_var_store / index), config, &future_mask))
            .collect();

        let layer_norm = LayerNorm::new(&(var_store / "layer_norm"), embedding_size, config.bias);

        // Final conversion from embeddings to logits, tied to the token embedding.
        // No bias, since softmax is applied to logits to obtain probabilities,
        // and softmax is invariant to bias shifts.
        let linear_head = nn::Linear {
            ws: token_embedding.ws.shallow_clone(),
            bs: None,
        };

        let gpt = Self {
            config: config.clone(),
            token_embedding,
            position_embedding,
            blocks,
            layer_norm,
            linear_head,
        };

        info!(
            "number of parameters: {:.2}M",
            gpt.parameter_count(true) as f64 / 1e6
        );

        Ok(gpt)
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Every learnable tensor, with the tied embedding listed once.
    fn parameters(&self) -> Vec<&Tensor> {
        iter::once(&self.token_embedding.ws)
            .chain(iter::once(&self.position_embedding.ws))
            .chain(self.blocks.iter().flat_map(|block| block.parameters()))
            .chain(self.layer_norm.parameters())
            .collect()
    }

    /// Number of scalar parameters.
    ///
    /// With `exclude_embeddings`, the token and position embedding tables are not counted.
    /// The token embedding doubles as the linear head, so it drops out too.
    pub fn parameter_count(&self, exclude_embeddings: bool) -> usize {
        let total = self
            .parameters()
            .iter()
            .map(|parameter| parameter.numel())
            .sum::<usize>();

        if exclude_embeddings {
            total - self.token_embedding.ws.numel() - self.position_embedding.ws.numel()
        } else {
            total
        }
    }

    /// Forward a batch of token ids of shape `(batch, context_length)`.
    ///
    /// With `targets` (same shape as `input`), returns logits for every position,
    /// `(batch, context_length, vocab_size)`, and the cross-entropy loss.
    /// Without, only the last position is projected, `(batch, 1, vocab_size)`.
    ///
    /// `train` enables dropout.
    ///
    /// # Panics
    ///
    /// If `context_length` is longer than the configured `block_size`.
    pub fn forward_t(
        &self,
        input: &Tensor,
        targets: Option<&Tensor>,
        train: bool,
    ) -> (Tensor, Option<Tensor>) {
        let context_length = input.size()[1];
        assert!(
            context_length <= self.config.block_size as i64,
            "Cannot forward sequence of length {context_length}, block size is only {}.",
            self.config.block_size
        );

        // Get embedding.
        let positions = Tensor::arange(context_length, (Kind::Int64, input.device()));
        let token_embedding = self.token_embedding.forward(input);
        let position_embedding = self.position_embedding.forward(&positions);
        let embedding = (token_embedding + position_embedding).dropout(self.config.dropout, train);

        // Run through blocks, then run a layer normalization.
        let hidden = self
            .blocks
            .iter()
            .fold(embedding, |hidden, block| block.forward_t(&hidden, train));
        let hidden = self.layer_norm.forward(&hidden);

        match targets {
            Some(targets) => {
                let logits = self.linear_head.forward(&hidden);

                // Flatten logits and targets across batches, then compute loss with cross entropy.
                let loss = logits
                    .reshape([-1, self.config.vocab_size as i64])
                    .cross_entropy_for_logits(&targets.reshape([-1]));

                (logits, Some(loss))
            }
            None => {
                let last = hidden.narrow(1, context_length - 1, 1);
                (self.linear_head.forward(&last), None)
            }
        }
    }
}

//! Generate text.

use anyhow::bail;
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::{model::Gpt, tokenizer::Vocabulary};

/// Select the last `block_size` tokens of every sequence in `idx`,
/// a tensor of shape `(batch, length)`.
///
/// If fewer than `block_size` tokens are available, the whole input is used.
pub fn crop_context(idx: &Tensor, block_size: i64) -> Tensor {
    let length = idx.size()[1];
    if length <= block_size {
        idx.shallow_clone()
    } else {
        idx.narrow(1, length - block_size, block_size)
    }
}

impl Gpt {
    /// Sample `max_new_tokens` tokens one at a time, each conditioned on
    /// everything before it, and return `idx` with them appended.
    ///
    /// `idx` is of shape `(batch, length)`, the result `(batch, length + max_new_tokens)`.
    /// Dropout is disabled and no gradients are tracked.
    ///
    /// # Panics
    ///
    /// If `temperature` is not positive.
    pub fn generate(&self, idx: &Tensor, max_new_tokens: usize, temperature: f64) -> Tensor {
        assert!(
            temperature > 0.0,
            "Temperature must be positive, got {temperature}."
        );
        let block_size = self.config().block_size as i64;

        tch::no_grad(|| {
            let mut result = idx.shallow_clone();

            for index in 0..max_new_tokens {
                debug!("Generating token {index}.");

                // Forward the cropped context, and scale the logits of the last position.
                let context = crop_context(&result, block_size);
                let (logits, _) = self.forward_t(&context, None, false);
                let logits = logits.select(1, -1) / temperature;

                // Get probabilities, and sample the next token.
                let probabilities = logits.softmax(-1, Kind::Float);
                let next_token = probabilities.multinomial(1, false);

                result = Tensor::cat(&[&result, &next_token], 1);
            }

            result
        })
    }
}

/// Generate `tokens_to_generate` tokens, add them to `input`, and return the result.
pub fn generate(
    input: &str,
    tokens_to_generate: usize,
    temperature: f64,
    vocabulary: &Vocabulary,
    device: Device,
    gpt: &Gpt,
) -> anyhow::Result<String> {
    if input.is_empty() {
        bail!("Input must be non-empty.")
    }

    // Encode input.
    let ids = vocabulary
        .encode(input)?
        .into_iter()
        .map(i64::from)
        .collect::<Vec<_>>();
    let idx = Tensor::from_slice(ids.as_slice())
        .to_device(device)
        .view([1, -1]);

    let result = gpt.generate(&idx, tokens_to_generate, temperature);

    // Decode.
    let ids = Vec::<i64>::try_from(&result.view([-1]).to_device(Device::Cpu))?
        .into_iter()
        .map(u16::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(vocabulary.decode(&ids)?)
}

#[cfg(test)]
mod tests {
    use tch::nn;

    use super::*;
    use crate::model::GptConfig;

    fn tiny_config() -> GptConfig {
        GptConfig {
            block_size: 8,
            vocab_size: 4,
            n_layer: 1,
            n_head: 1,
            n_embed: 4,
            dropout: 0.0,
            bias: false,
        }
    }

    fn build(config: &GptConfig) -> (nn::VarStore, Gpt) {
        let var_store = nn::VarStore::new(Device::Cpu);
        let gpt = Gpt::new(&var_store.root(), config).unwrap();
        (var_store, gpt)
    }

    fn ids(tensor: &Tensor) -> Vec<i64> {
        Vec::<i64>::try_from(&tensor.view([-1])).unwrap()
    }

    #[test]
    fn generates_requested_number_of_tokens() {
        tch::manual_seed(0);
        let (_var_store, gpt) = build(&tiny_config());
        let seed = Tensor::from_slice(&[0i64, 1, 2]).view([1, 3]);

        let result = gpt.generate(&seed, 3, 1.0);
        assert_eq!(result.size(), vec![1, 6]);

        let result = ids(&result);
        assert_eq!(result[..3], [0, 1, 2]);
        assert!(result[3..].iter().all(|id| (0..4).contains(id)));
    }

    #[test]
    fn zero_new_tokens_returns_seed() {
        let (_var_store, gpt) = build(&tiny_config());
        let seed = Tensor::from_slice(&[3i64, 2, 1]).view([1, 3]);

        let result = gpt.generate(&seed, 0, 1.0);
        assert!(result.equal(&seed));
    }

    #[test]
    fn seeds_longer_than_block_size_are_cropped() {
        tch::manual_seed(0);
        let (_var_store, gpt) = build(&tiny_config());
        let seed = Tensor::randint(4, [2, 20], (Kind::Int64, Device::Cpu));

        let result = gpt.generate(&seed, 5, 0.8);
        assert_eq!(result.size(), vec![2, 25]);
        assert!(result.narrow(1, 0, 20).equal(&seed));
    }

    #[test]
    fn crop_context_keeps_last_block_size_tokens() {
        let idx = Tensor::arange(12, (Kind::Int64, Device::Cpu)).view([1, 12]);
        assert_eq!(ids(&crop_context(&idx, 8)), (4..12).collect::<Vec<i64>>());
        assert_eq!(ids(&crop_context(&idx, 12)), (0..12).collect::<Vec<i64>>());
        assert_eq!(ids(&crop_context(&idx, 20)), (0..12).collect::<Vec<i64>>());
    }

    #[test]
    #[should_panic(expected = "Temperature must be positive")]
    fn zero_temperature_is_rejected() {
        let (_var_store, gpt) = build(&tiny_config());
        let seed = Tensor::from_slice(&[0i64]).view([1, 1]);
        gpt.generate(&seed, 1, 0.0);
    }

    #[test]
    fn text_generation_extends_input() {
        tch::manual_seed(0);
        let vocabulary = Vocabulary::from_corpus("abcd").unwrap();
        let (_var_store, gpt) = build(&tiny_config());

        let text = generate("dcba", 10, 1.0, &vocabulary, Device::Cpu, &gpt).unwrap();
        assert!(text.starts_with("dcba"));
        assert_eq!(text.chars().count(), 14);
        assert!(text.chars().all(|c| "abcd".contains(c)));
    }

    #[test]
    fn empty_input_is_rejected() {
        let vocabulary = Vocabulary::from_corpus("abcd").unwrap();
        let (_var_store, gpt) = build(&tiny_config());
        assert!(generate("", 1, 1.0, &vocabulary, Device::Cpu, &gpt).is_err());
    }
}

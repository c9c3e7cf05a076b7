//! Prepare a text corpus for the model, and load it back.
//!
//! A prepared data directory holds:
//! - `train.bin` and `val.bin`, flat little-endian `u16` token ids.
//! - `meta.ron`, the [`Vocabulary`].

use std::{fs, path::Path};

use rand::Rng;
use tch::{Device, Kind, Tensor};
use thiserror::Error;
use tracing::info;

use crate::tokenizer::Vocabulary;

/// Share of the corpus, by character count, used for training.
pub const TRAINING_DATA_PERCENTAGE: f64 = 0.9;

pub const TRAIN_FILE_NAME: &str = "train.bin";
pub const VAL_FILE_NAME: &str = "val.bin";
pub const META_FILE_NAME: &str = "meta.ron";

#[derive(Debug, Error, PartialEq)]
pub enum DatasetError {
    #[error("token file is {0} bytes long, expected a whole number of u16 ids")]
    OddLength(usize),

    #[error("split has {available} tokens, but a context needs {required}")]
    TooShort { available: i64, required: i64 },
}

/// What [`prepare`] wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDataset {
    pub vocab_size: usize,
    pub train_token_count: usize,
    pub val_token_count: usize,
}

/// Split a corpus into training and validation text.
///
/// The split point is a character count, not a byte offset.
pub fn split_corpus(corpus: &str) -> (&str, &str) {
    let char_count = corpus.chars().count();
    let split = (char_count as f64 * TRAINING_DATA_PERCENTAGE) as usize;
    let byte_index = corpus
        .char_indices()
        .nth(split)
        .map_or(corpus.len(), |(index, _)| index);

    corpus.split_at(byte_index)
}

/// Build a vocabulary from `input_file`,
/// and write the encoded splits and vocabulary into `output_directory`.
pub fn prepare(
    input_file: impl AsRef<Path>,
    output_directory: impl AsRef<Path>,
) -> anyhow::Result<PreparedDataset> {
    let output_directory = output_directory.as_ref();

    let corpus = fs::read_to_string(input_file)?;
    info!("length of dataset in characters: {}", corpus.chars().count());

    let vocabulary = Vocabulary::from_corpus(&corpus)?;
    info!("all the unique characters: {:?}", vocabulary.alphabet());
    info!("vocab size: {}", vocabulary.vocab_size());

    let (train, val) = split_corpus(&corpus);
    let train_ids = vocabulary.encode(train)?;
    let val_ids = vocabulary.encode(val)?;
    info!("train has {} tokens", train_ids.len());
    info!("val has {} tokens", val_ids.len());

    fs::create_dir_all(output_directory)?;
    write_tokens(output_directory.join(TRAIN_FILE_NAME), &train_ids)?;
    write_tokens(output_directory.join(VAL_FILE_NAME), &val_ids)?;
    vocabulary.to_ron(output_directory.join(META_FILE_NAME))?;

    Ok(PreparedDataset {
        vocab_size: vocabulary.vocab_size(),
        train_token_count: train_ids.len(),
        val_token_count: val_ids.len(),
    })
}

/// Write token ids as little-endian `u16`s.
pub fn write_tokens(path: impl AsRef<Path>, ids: &[u16]) -> anyhow::Result<()> {
    let bytes = ids
        .iter()
        .flat_map(|id| id.to_le_bytes())
        .collect::<Vec<u8>>();
    fs::write(path, bytes)?;
    Ok(())
}

/// Read token ids written by [`write_tokens`].
pub fn read_tokens(path: impl AsRef<Path>) -> anyhow::Result<Vec<u16>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 2 != 0 {
        return Err(DatasetError::OddLength(bytes.len()).into());
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// One split of a prepared dataset, held as a 1d [`Kind::Int64`] tensor.
#[derive(Debug)]
pub struct TokenDataset {
    tokens: Tensor,
}

impl TokenDataset {
    pub fn new(ids: &[u16], device: Device) -> Self {
        let ids = ids.iter().map(|&id| i64::from(id)).collect::<Vec<_>>();
        Self {
            tokens: Tensor::from_slice(ids.as_slice())
                .to_kind(Kind::Int64)
                .to_device(device),
        }
    }

    /// Open a split from a token file.
    pub fn from_file(path: impl AsRef<Path>, device: Device) -> anyhow::Result<Self> {
        Ok(Self::new(&read_tokens(path)?, device))
    }

    /// Get the number of tokens in this split.
    pub fn token_count(&self) -> i64 {
        self.tokens.size()[0]
    }

    /// Get a random batch of contexts and their next-token targets,
    /// both of dimension `(contexts_per_batch, block_size)`.
    ///
    /// The targets are the inputs shifted one token to the right.
    pub fn get_batch(
        &self,
        rng: &mut impl Rng,
        contexts_per_batch: usize,
        block_size: u32,
    ) -> Result<(Tensor, Tensor), DatasetError> {
        let block_size = block_size as i64;
        let available = self.token_count();
        if available < block_size + 1 {
            return Err(DatasetError::TooShort {
                available,
                required: block_size + 1,
            });
        }

        let (inputs, targets): (Vec<_>, Vec<_>) = (0..contexts_per_batch)
            .map(|_| {
                let start = rng.random_range(0..=(available - block_size - 1));
                (
                    self.tokens.narrow(0, start, block_size),
                    self.tokens.narrow(0, start + 1, block_size),
                )
            })
            .unzip();

        Ok((
            Tensor::stack(inputs.as_slice(), 0),
            Tensor::stack(targets.as_slice(), 0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn scratch_directory(name: &str) -> PathBuf {
        let directory =
            std::env::temp_dir().join(format!("char-gpt-{name}-{}", std::process::id()));
        fs::create_dir_all(&directory).unwrap();
        directory
    }

    #[test]
    fn split_is_by_character_count() {
        let (train, val) = split_corpus("0123456789");
        assert_eq!((train, val), ("012345678", "9"));

        // Ten characters, twenty bytes.
        let (train, val) = split_corpus("ééééééééé→");
        assert_eq!(train.chars().count(), 9);
        assert_eq!(val, "→");

        assert_eq!(split_corpus(""), ("", ""));
    }

    #[test]
    fn token_file_round_trip() {
        let directory = scratch_directory("tokens");
        let path = directory.join("tokens.bin");

        let ids: [u16; 5] = [0, 1, 255, 256, 65535];
        write_tokens(&path, &ids).unwrap();
        assert_eq!(fs::read(&path).unwrap(), [0, 0, 1, 0, 255, 0, 0, 1, 255, 255]);
        assert_eq!(read_tokens(&path).unwrap(), ids);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn odd_length_token_file_is_rejected() {
        let directory = scratch_directory("odd");
        let path = directory.join("tokens.bin");
        fs::write(&path, [1u8, 0, 2]).unwrap();

        let error = read_tokens(&path).unwrap_err();
        assert_eq!(
            error.downcast_ref::<DatasetError>(),
            Some(&DatasetError::OddLength(3))
        );

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn prepare_writes_splits_and_vocabulary() {
        let directory = scratch_directory("prepare");
        let corpus = "To be, or not to be, that is the question:\nWhether 'tis nobler in the mind.\n";
        let input_file = directory.join("input.txt");
        fs::write(&input_file, corpus).unwrap();

        let output_directory = directory.join("prepared");
        let prepared = prepare(&input_file, &output_directory).unwrap();

        let vocabulary = Vocabulary::from_ron(output_directory.join(META_FILE_NAME)).unwrap();
        assert_eq!(prepared.vocab_size, vocabulary.vocab_size());
        assert_eq!(vocabulary, Vocabulary::from_corpus(corpus).unwrap());

        let train = read_tokens(output_directory.join(TRAIN_FILE_NAME)).unwrap();
        let val = read_tokens(output_directory.join(VAL_FILE_NAME)).unwrap();
        let char_count = corpus.chars().count();
        assert_eq!(train.len(), prepared.train_token_count);
        assert_eq!(val.len(), prepared.val_token_count);
        assert_eq!(train.len(), (char_count as f64 * 0.9) as usize);
        assert_eq!(train.len() + val.len(), char_count);

        let decoded = vocabulary.decode(&train).unwrap() + &vocabulary.decode(&val).unwrap();
        assert_eq!(decoded, corpus);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn batches_are_shifted_windows() {
        let ids = (0..100).collect::<Vec<u16>>();
        let dataset = TokenDataset::new(&ids, Device::Cpu);
        assert_eq!(dataset.token_count(), 100);

        let mut rng = StdRng::seed_from_u64(7);
        let (inputs, targets) = dataset.get_batch(&mut rng, 5, 16).unwrap();
        assert_eq!(inputs.size(), vec![5, 16]);
        assert_eq!(targets.size(), vec![5, 16]);
        assert_eq!(inputs.kind(), Kind::Int64);

        // Tokens are consecutive, so every target is its input plus one.
        assert!(targets.equal(&(&inputs + 1)));
        let largest = inputs.max().int64_value(&[]);
        assert!(largest <= 98);
    }

    #[test]
    fn whole_split_can_be_a_single_context() {
        let dataset = TokenDataset::new(&[3, 1, 4, 1, 5], Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let (inputs, targets) = dataset.get_batch(&mut rng, 2, 4).unwrap();
        assert_eq!(Vec::<i64>::try_from(&inputs.get(0)).unwrap(), [3, 1, 4, 1]);
        assert_eq!(Vec::<i64>::try_from(&targets.get(1)).unwrap(), [1, 4, 1, 5]);
    }

    #[test]
    fn short_split_is_rejected() {
        let dataset = TokenDataset::new(&[1, 2, 3], Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            dataset.get_batch(&mut rng, 1, 3).unwrap_err(),
            DatasetError::TooShort {
                available: 3,
                required: 4
            }
        );
    }
}

//! Character-level vocabulary.
//!
//! Every distinct character of a corpus becomes one token,
//! with ids assigned in sorted character order.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TokenizerError {
    #[error("character {0:?} is not in the vocabulary")]
    UnknownCharacter(char),

    #[error("token id {0} is not in the vocabulary")]
    UnknownId(u16),

    #[error("corpus has {0} distinct characters, token ids only fit 65536")]
    TooManyCharacters(usize),
}

/// A bijection between characters and token ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    /// Number of tokens.
    vocab_size: usize,

    /// Mapping from id to char.
    id_to_char: BTreeMap<u16, char>,

    /// Mapping from char to id.
    char_to_id: BTreeMap<char, u16>,
}

impl Vocabulary {
    /// Build a vocabulary from every distinct character in `corpus`.
    pub fn from_corpus(corpus: &str) -> Result<Self, TokenizerError> {
        let chars = corpus.chars().collect::<BTreeSet<char>>();
        let vocab_size = chars.len();

        // `BTreeSet` iterates in sorted order, which fixes the id assignment.
        let id_to_char = chars
            .into_iter()
            .enumerate()
            .map(|(id, c)| u16::try_from(id).map(|id| (id, c)))
            .collect::<Result<BTreeMap<u16, char>, _>>()
            .map_err(|_| TokenizerError::TooManyCharacters(vocab_size))?;

        let char_to_id = id_to_char.iter().map(|(&id, &c)| (c, id)).collect();

        Ok(Self {
            vocab_size,
            id_to_char,
            char_to_id,
        })
    }

    /// Open a vocabulary from a `.ron` file.
    pub fn from_ron(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(ron::from_str(fs::read_to_string(path)?.as_str())?)
    }

    /// Save to a `.ron` file.
    pub fn to_ron(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        fs::write(path, ron::ser::to_string_pretty(self, PrettyConfig::default())?)?;
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Every character of the vocabulary, in id order.
    pub fn alphabet(&self) -> String {
        self.id_to_char.values().collect()
    }

    /// Encode text char-by-char.
    pub fn encode(&self, text: &str) -> Result<Vec<u16>, TokenizerError> {
        text.chars()
            .map(|c| {
                self.char_to_id
                    .get(&c)
                    .copied()
                    .ok_or(TokenizerError::UnknownCharacter(c))
            })
            .collect()
    }

    /// Decode token ids back into a string.
    pub fn decode(&self, ids: &[u16]) -> Result<String, TokenizerError> {
        ids.iter()
            .map(|id| {
                self.id_to_char
                    .get(id)
                    .copied()
                    .ok_or(TokenizerError::UnknownId(*id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = "First Citizen:\nBefore we proceed any further, hear me speak.\n";

    #[test]
    fn ids_follow_sorted_character_order() {
        let vocabulary = Vocabulary::from_corpus("banana!").unwrap();
        assert_eq!(vocabulary.vocab_size(), 4);
        assert_eq!(vocabulary.alphabet(), "!abn");
        assert_eq!(vocabulary.encode("nab!"), Ok(vec![3, 1, 2, 0]));
    }

    #[test]
    fn decode_inverts_encode() {
        let vocabulary = Vocabulary::from_corpus(CORPUS).unwrap();
        for text in [CORPUS, "", "hear me", "\n\n", "speak, Citizen."] {
            let ids = vocabulary.encode(text).unwrap();
            assert_eq!(ids.len(), text.chars().count());
            assert_eq!(vocabulary.decode(&ids).unwrap(), text);
        }
    }

    #[test]
    fn multibyte_characters_are_single_tokens() {
        let vocabulary = Vocabulary::from_corpus("añb→").unwrap();
        assert_eq!(vocabulary.encode("→ñ"), Ok(vec![3, 2]));
        assert_eq!(vocabulary.decode(&[2, 3]), Ok("ñ→".to_string()));
    }

    #[test]
    fn unknown_symbols_are_errors() {
        let vocabulary = Vocabulary::from_corpus("abc").unwrap();
        assert_eq!(
            vocabulary.encode("abz"),
            Err(TokenizerError::UnknownCharacter('z'))
        );
        assert_eq!(vocabulary.decode(&[0, 3]), Err(TokenizerError::UnknownId(3)));
    }

    #[test]
    fn ron_round_trip() {
        let vocabulary = Vocabulary::from_corpus(CORPUS).unwrap();
        let path = std::env::temp_dir().join(format!(
            "char-gpt-vocabulary-{}.ron",
            std::process::id()
        ));

        vocabulary.to_ron(&path).unwrap();
        let loaded = Vocabulary::from_ron(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(loaded, vocabulary);
        assert_eq!(loaded.encode("hear"), vocabulary.encode("hear"));
    }
}

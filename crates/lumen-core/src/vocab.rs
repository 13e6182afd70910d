//! Token vocabulary embedded in GGUF metadata
//!
//! Decodes ids back to text and encodes text with the file's own BPE data:
//! ranked merges for byte-level (GPT-2 / Llama 3) vocabularies, token scores
//! for SentencePiece ones. Control tokens such as `<|eot_id|>` are matched
//! verbatim in the input before any merging.

use crate::error::{Error, Result};
use crate::formats::gguf::MetadataValue;
use crate::metadata::ModelMetadata;
use std::collections::{HashMap, HashSet};

/// GGUF `tokenizer.ggml.token_type` values matched verbatim in text
const TOKEN_TYPE_CONTROL: i64 = 3;
const TOKEN_TYPE_USER_DEFINED: i64 = 4;

/// How token strings encode raw text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStyle {
    /// GPT-2 byte-level BPE: each byte is mapped to a printable code point
    ByteLevel,
    /// SentencePiece: `▁` marks a space, `<0xNN>` carries a raw byte
    SentencePiece,
    /// Token strings are used verbatim
    Raw,
}

impl TokenStyle {
    fn from_model(model: Option<&str>) -> Self {
        match model {
            Some("gpt2") => TokenStyle::ByteLevel,
            Some("llama") | Some("replit") => TokenStyle::SentencePiece,
            other => {
                log::warn!("Unknown tokenizer model {:?}, decoding tokens verbatim", other);
                TokenStyle::Raw
            }
        }
    }
}

/// Special token ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    style: TokenStyle,
    special: SpecialTokens,
    token_to_id: HashMap<String, u32>,
    byte_decoder: HashMap<char, u8>,
    byte_encoder: Vec<char>,
    /// `(left, right)` -> `(rank, merged)`; lower ranks merge first
    merges: HashMap<(u32, u32), (u32, u32)>,
    scores: Vec<f32>,
    /// Tokens matched verbatim in text, and their distinct byte lengths, longest first
    control: HashSet<u32>,
    control_lens: Vec<usize>,
}

impl Vocabulary {
    /// Vocabulary without merges or scores
    ///
    /// Tokens shaped like `<|name|>` plus the BOS and EOS tokens are treated
    /// as control tokens until [`Vocabulary::with_token_types`] says otherwise.
    pub fn new(tokens: Vec<String>, style: TokenStyle, special: SpecialTokens) -> Self {
        let chars = byte_chars();
        let (byte_decoder, byte_encoder) = match style {
            TokenStyle::ByteLevel => {
                (chars.iter().enumerate().map(|(b, &c)| (c, b as u8)).collect(), chars.to_vec())
            }
            _ => (HashMap::new(), Vec::new()),
        };
        let token_to_id =
            tokens.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).rev().collect();
        let control = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.len() > 4 && t.starts_with("<|") && t.ends_with("|>"))
            .map(|(i, _)| i as u32)
            .chain(special.bos_token_id)
            .chain(special.eos_token_id)
            .filter(|&id| (id as usize) < tokens.len())
            .collect();

        let mut vocab = Self {
            tokens,
            style,
            special,
            token_to_id,
            byte_decoder,
            byte_encoder,
            merges: HashMap::new(),
            scores: Vec::new(),
            control,
            control_lens: Vec::new(),
        };
        vocab.index_control_lens();
        vocab
    }

    /// Add ranked `"left right"` merge rules; rules naming unknown tokens are skipped
    pub fn with_merges<S: AsRef<str>>(mut self, rules: &[S]) -> Self {
        let mut skipped = 0usize;
        for (rank, rule) in rules.iter().enumerate() {
            let rule = rule.as_ref();
            let resolved = rule.split_once(' ').and_then(|(left, right)| {
                let merged = self.token_to_id.get(&format!("{}{}", left, right))?;
                Some(((*self.token_to_id.get(left)?, *self.token_to_id.get(right)?), *merged))
            });
            match resolved {
                Some((pair, merged)) => {
                    self.merges.entry(pair).or_insert((rank as u32, merged));
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!("Skipped {} of {} merge rules", skipped, rules.len());
        }
        self
    }

    /// Per-token scores; SentencePiece merges prefer the higher scoring result
    pub fn with_scores(mut self, scores: Vec<f32>) -> Self {
        self.scores = scores;
        self
    }

    /// Replace the control token set with the tokens GGUF marks as control or user-defined
    pub fn with_token_types(mut self, types: &[i64]) -> Self {
        self.control = types
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t == TOKEN_TYPE_CONTROL || t == TOKEN_TYPE_USER_DEFINED)
            .map(|(i, _)| i as u32)
            .filter(|&id| (id as usize) < self.tokens.len())
            .collect();
        self.index_control_lens();
        self
    }

    fn index_control_lens(&mut self) {
        let mut lens: Vec<usize> =
            self.control.iter().map(|&id| self.tokens[id as usize].len()).collect();
        lens.sort_unstable_by(|a, b| b.cmp(a));
        lens.dedup();
        self.control_lens = lens;
    }

    /// Read `tokenizer.ggml.*` keys; `None` when the file carries no vocabulary
    pub fn from_metadata(meta: &ModelMetadata) -> Result<Option<Self>> {
        let Some(items) = meta.get_array("tokenizer.ggml.tokens")? else {
            log::warn!("Model has no embedded vocabulary");
            return Ok(None);
        };
        let tokens = string_items(items, "tokenizer.ggml.tokens")?;

        let id = |key: &str| -> Result<Option<u32>> {
            meta.get_u64(key)?
                .map(|v| {
                    u32::try_from(v).map_err(|_| Error::Format(format!("{} = {} too large", key, v)))
                })
                .transpose()
        };
        let special = SpecialTokens {
            bos_token_id: id("tokenizer.ggml.bos_token_id")?,
            eos_token_id: id("tokenizer.ggml.eos_token_id")?,
        };
        let style = TokenStyle::from_model(meta.get_str("tokenizer.ggml.model")?);
        let mut vocab = Self::new(tokens, style, special);

        if let Some(items) = meta.get_array("tokenizer.ggml.merges")? {
            vocab = vocab.with_merges(&string_items(items, "tokenizer.ggml.merges")?);
        }
        if let Some(items) = meta.get_array("tokenizer.ggml.scores")? {
            let scores = items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_f64().map(|s| s as f32).ok_or_else(|| {
                        Error::Format(format!("tokenizer.ggml.scores[{}] is not a number", i))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            vocab = vocab.with_scores(scores);
        }
        if let Some(items) = meta.get_array("tokenizer.ggml.token_type")? {
            let types = items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_i64().ok_or_else(|| {
                        Error::Format(format!("tokenizer.ggml.token_type[{}] is not an integer", i))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            vocab = vocab.with_token_types(&types);
        }

        log::debug!(
            "Vocabulary: {} tokens, {} merges, {} control tokens, {:?}",
            vocab.len(),
            vocab.merges.len(),
            vocab.control.len(),
            vocab.style
        );
        Ok(Some(vocab))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn style(&self) -> TokenStyle {
        self.style
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.special.eos_token_id
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Id of the token spelled exactly `token`
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn is_control(&self, id: u32) -> bool {
        self.control.contains(&id)
    }

    pub fn merge_count(&self) -> usize {
        self.merges.len()
    }

    /// Encode `text`; control tokens spelled out in the text map to their own id
    ///
    /// No BOS is added. Byte-level vocabularies split the text the way Llama 3
    /// does before merging; SentencePiece vocabularies replace spaces with `▁`
    /// and fall back to `<0xNN>` tokens for characters they lack.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            match self.find_control(rest) {
                Some((start, len, id)) => {
                    self.encode_ordinary(&rest[..start], &mut ids)?;
                    ids.push(id);
                    rest = &rest[start + len..];
                }
                None => {
                    self.encode_ordinary(rest, &mut ids)?;
                    break;
                }
            }
        }
        Ok(ids)
    }

    /// Leftmost, then longest, control token in `text` as `(start, len, id)`
    fn find_control(&self, text: &str) -> Option<(usize, usize, u32)> {
        if self.control_lens.is_empty() {
            return None;
        }
        text.char_indices().find_map(|(start, _)| {
            let tail = &text[start..];
            self.control_lens.iter().find_map(|&len| {
                let candidate = tail.get(..len)?;
                let id = *self.token_to_id.get(candidate)?;
                self.control.contains(&id).then_some((start, len, id))
            })
        })
    }

    fn encode_ordinary(&self, text: &str, ids: &mut Vec<u32>) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        match self.style {
            TokenStyle::ByteLevel => {
                for chunk in split_chunks(text) {
                    let symbols = chunk
                        .bytes()
                        .map(|b| {
                            let c = self.byte_encoder[b as usize];
                            self.token_id(c.encode_utf8(&mut [0u8; 4])).ok_or_else(|| {
                                Error::InvalidArgument(format!("No token for byte {:#04x}", b))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    ids.extend(self.merge(symbols));
                }
            }
            TokenStyle::SentencePiece => {
                let text = text.replace(' ', "\u{2581}");
                let mut symbols = Vec::with_capacity(text.len());
                for c in text.chars() {
                    let mut buf = [0u8; 4];
                    let s: &str = c.encode_utf8(&mut buf);
                    if let Some(id) = self.token_id(s) {
                        symbols.push(id);
                        continue;
                    }
                    for b in s.bytes() {
                        let id = self.token_id(&format!("<0x{:02X}>", b)).ok_or_else(|| {
                            Error::InvalidArgument(format!(
                                "No token for '{}' and no byte fallback for {:#04x}",
                                c, b
                            ))
                        })?;
                        symbols.push(id);
                    }
                }
                ids.extend(self.merge(symbols));
            }
            TokenStyle::Raw => {
                return Err(Error::InvalidArgument(
                    "Cannot encode with a vocabulary of unknown tokenizer model".into(),
                ));
            }
        }
        Ok(())
    }

    /// Cost of merging `left` and `right`, lower first, and the merged id
    fn merge_cost(&self, left: u32, right: u32) -> Option<(f32, u32)> {
        match self.style {
            TokenStyle::SentencePiece => {
                let merged = format!("{}{}", self.token(left)?, self.token(right)?);
                let id = self.token_id(&merged)?;
                let score = self.scores.get(id as usize).copied().unwrap_or(0.0);
                Some((-score, id))
            }
            _ => self.merges.get(&(left, right)).map(|&(rank, id)| (rank as f32, id)),
        }
    }

    /// Apply the cheapest merge everywhere it occurs until none applies
    fn merge(&self, mut ids: Vec<u32>) -> Vec<u32> {
        while ids.len() >= 2 {
            let best = ids
                .windows(2)
                .filter_map(|w| {
                    let (cost, merged) = self.merge_cost(w[0], w[1])?;
                    Some((cost, w[0], w[1], merged))
                })
                .min_by(|a, b| a.0.total_cmp(&b.0));
            let Some((_, left, right, merged)) = best else {
                break;
            };

            let mut next = Vec::with_capacity(ids.len());
            let mut i = 0;
            while i < ids.len() {
                if i + 1 < ids.len() && ids[i] == left && ids[i + 1] == right {
                    next.push(merged);
                    i += 2;
                } else {
                    next.push(ids[i]);
                    i += 1;
                }
            }
            ids = next;
        }
        ids
    }

    /// Decode ids into text; invalid UTF-8 sequences are replaced
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            let token = self
                .token(id)
                .ok_or_else(|| Error::InvalidArgument(format!("Token id {} out of range", id)))?;
            match self.style {
                TokenStyle::Raw => bytes.extend_from_slice(token.as_bytes()),
                TokenStyle::ByteLevel => {
                    for c in token.chars() {
                        match self.byte_decoder.get(&c) {
                            Some(&b) => bytes.push(b),
                            // special tokens such as <|eot_id|> are not byte-mapped
                            None => {
                                let mut buf = [0u8; 4];
                                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                            }
                        }
                    }
                }
                TokenStyle::SentencePiece => match parse_byte_token(token) {
                    Some(b) => bytes.push(b),
                    None => bytes.extend_from_slice(token.replace('\u{2581}', " ").as_bytes()),
                },
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn string_items(items: &[MetadataValue], key: &str) -> Result<Vec<String>> {
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::Format(format!("{}[{}] is not a string", key, i)))
        })
        .collect()
}

/// `<0x0A>` style byte fallback tokens
fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// GPT-2 byte-to-unicode table: printable bytes map to themselves, the rest to U+0100 onwards
pub(crate) fn byte_chars() -> [char; 256] {
    let mut chars = [char::REPLACEMENT_CHARACTER; 256];
    let mut extra = 0u32;
    for b in 0..=255u8 {
        let printable = matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
        chars[b as usize] = if printable {
            char::from(b)
        } else {
            let c = char::from_u32(256 + extra).unwrap_or(char::REPLACEMENT_CHARACTER);
            extra += 1;
            c
        };
    }
    chars
}

/// Split text into the chunks Llama 3 merges independently
///
/// Chunks are, in order of preference: an English contraction suffix, a
/// letter run with at most one leading non-letter, up to three digits, a
/// punctuation run with an optional leading space and trailing newlines, a
/// whitespace run ending in a newline, or a whitespace run that leaves its
/// last space to the word that follows.
pub fn split_chunks(text: &str) -> Vec<&str> {
    let chars: Vec<char> = text.chars().collect();
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offsets.push(text.len());

    let mut chunks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let len = chunk_len(&chars[i..]);
        chunks.push(&text[offsets[i]..offsets[i + len]]);
        i += len;
    }
    chunks
}

fn is_newline(c: char) -> bool {
    c == '\r' || c == '\n'
}

fn run(s: &[char], from: usize, pred: impl Fn(char) -> bool) -> usize {
    s.get(from..).map_or(0, |tail| tail.iter().take_while(|&&c| pred(c)).count())
}

/// Length in chars of the chunk starting at `s[0]`; at least 1 for non-empty `s`
fn chunk_len(s: &[char]) -> usize {
    if s[0] == '\'' {
        for suffix in ["s", "t", "re", "ve", "m", "ll", "d"] {
            let n = suffix.len();
            let matches = s.len() > n
                && s[1..=n].iter().zip(suffix.chars()).all(|(c, x)| c.to_ascii_lowercase() == x);
            if matches {
                return n + 1;
            }
        }
    }

    let lead = usize::from(!s[0].is_alphabetic() && !s[0].is_numeric() && !is_newline(s[0]));
    let letters = run(s, lead, char::is_alphabetic);
    if letters > 0 {
        return lead + letters;
    }

    let digits = run(s, 0, char::is_numeric);
    if digits > 0 {
        return digits.min(3);
    }

    let space = usize::from(s[0] == ' ');
    let punct = run(s, space, |c| !c.is_whitespace() && !c.is_alphabetic() && !c.is_numeric());
    if punct > 0 {
        return space + punct + run(s, space + punct, is_newline);
    }

    let ws = run(s, 0, char::is_whitespace).max(1);
    if let Some(last) = (0..ws).rev().find(|&k| is_newline(s[k])) {
        return last + 1;
    }
    if ws > 1 && ws < s.len() {
        return ws - 1;
    }
    ws
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> MetadataValue {
        MetadataValue::Array(items.iter().map(|s| MetadataValue::String(s.to_string())).collect())
    }

    /// Every byte token, then `extra` tokens, then a couple of control tokens
    fn byte_level(extra: &[&str], merges: &[&str]) -> Vocabulary {
        let mut tokens: Vec<String> = byte_chars().iter().map(|c| c.to_string()).collect();
        tokens.extend(extra.iter().map(|s| s.to_string()));
        tokens.push("<|begin_of_text|>".into());
        tokens.push("<|eot_id|>".into());
        Vocabulary::new(tokens, TokenStyle::ByteLevel, SpecialTokens::default()).with_merges(merges)
    }

    #[test]
    fn test_byte_level_decode() {
        // "Ġ" is the byte-level encoding of a space, "Ċ" of a newline
        let vocab = Vocabulary::new(
            vec!["Hello".into(), "Ġworld".into(), "Ċ".into()],
            TokenStyle::ByteLevel,
            SpecialTokens::default(),
        );
        assert_eq!(vocab.decode(&[0, 1, 2]).unwrap(), "Hello world\n");
    }

    #[test]
    fn test_sentencepiece_decode() {
        let vocab = Vocabulary::new(
            vec!["\u{2581}Hello".into(), "\u{2581}there".into(), "<0x21>".into()],
            TokenStyle::SentencePiece,
            SpecialTokens::default(),
        );
        assert_eq!(vocab.decode(&[0, 1, 2]).unwrap(), " Hello there!");
    }

    #[test]
    fn test_split_chunks() {
        assert_eq!(
            split_chunks("Hello world 12345!!\n\n  x"),
            vec!["Hello", " world", " ", "123", "45", "!!\n\n", " ", " x"]
        );
        assert_eq!(split_chunks("I'M don't"), vec!["I", "'M", " don", "'t"]);
        assert_eq!(split_chunks("a \n\tb"), vec!["a", " \n", "\tb"]);
        assert_eq!(split_chunks("end  "), vec!["end", "  "]);
        assert!(split_chunks("").is_empty());
    }

    #[test]
    fn test_byte_level_merges_apply_by_rank() {
        let extra = ["He", "ll", "Hell", "Hello", "Ġw", "or", "Ġwor", "ld", "Ġworld", "rl"];
        let merges = [
            "l l", "H e", "He ll", "Hell o", "Ġ w", "o r", "Ġw or", "l d", "Ġwor ld", "r l",
        ];
        let vocab = byte_level(&extra, &merges);
        assert_eq!(vocab.merge_count(), merges.len());

        // "o r" outranks "r l", so "rl" never forms inside "world"
        let ids = vocab.encode("Hello world").unwrap();
        let hello = vocab.token_id("Hello").unwrap();
        let world = vocab.token_id("Ġworld").unwrap();
        assert_eq!(ids, vec![hello, world]);
        assert_eq!(vocab.decode(&ids).unwrap(), "Hello world");

        // Without the "o r" rule the lower-ranked "r l" takes effect
        let vocab = byte_level(&extra, &["Ġ w", "r l", "l d"]);
        let ids = vocab.encode(" world").unwrap();
        let expected: Vec<u32> =
            ["Ġw", "o", "rl", "d"].iter().map(|t| vocab.token_id(t).unwrap()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_byte_level_round_trip() {
        let vocab = byte_level(&[], &[]);
        let text = "Tokens: 12345, \u{fc}n\u{ef}code \u{1F980}!\n\n  Done\t";
        let ids = vocab.encode(text).unwrap();
        assert_eq!(ids.len(), text.len());
        assert_eq!(vocab.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_control_tokens_match_verbatim() {
        let vocab = byte_level(&["Hi"], &["H i"]);
        let eot = vocab.token_id("<|eot_id|>").unwrap();
        let hi = vocab.token_id("Hi").unwrap();
        assert!(vocab.is_control(eot));
        assert!(!vocab.is_control(hi));
        assert_eq!(vocab.encode("Hi<|eot_id|>Hi").unwrap(), vec![hi, eot, hi]);

        // An unknown control-like string is ordinary text
        let ids = vocab.encode("<|nope|>").unwrap();
        assert_eq!(ids.len(), "<|nope|>".len());
    }

    #[test]
    fn test_sentencepiece_encode_prefers_higher_scores() {
        let tokens = ["<unk>", "\u{2581}", "H", "i", "\u{2581}H", "Hi", "\u{2581}Hi", "<0x21>"];
        let vocab = Vocabulary::new(
            tokens.iter().map(|s| s.to_string()).collect(),
            TokenStyle::SentencePiece,
            SpecialTokens::default(),
        )
        .with_scores(vec![0.0, 0.0, 0.0, 0.0, -1.0, -0.1, -0.5, 0.0]);

        // "Hi" scores above "▁H", then "▁" + "Hi" forms "▁Hi"; "!" falls back to a byte
        let ids = vocab.encode(" Hi!").unwrap();
        assert_eq!(ids, vec![6, 7]);
        assert_eq!(vocab.decode(&ids).unwrap(), " Hi!");

        assert!(matches!(vocab.encode("?"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_raw_vocabulary_cannot_encode() {
        let vocab = Vocabulary::new(vec!["a".into()], TokenStyle::Raw, SpecialTokens::default());
        assert!(matches!(vocab.encode("a"), Err(Error::InvalidArgument(_))));
        assert!(vocab.encode("").unwrap().is_empty());
    }

    #[test]
    fn test_from_metadata() {
        let meta = ModelMetadata::from_entries(vec![
            ("tokenizer.ggml.model".to_string(), MetadataValue::String("gpt2".into())),
            ("tokenizer.ggml.tokens".to_string(), strings(&["a", "b", "<|end|>", "ab"])),
            ("tokenizer.ggml.merges".to_string(), strings(&["a b", "b c"])),
            ("tokenizer.ggml.eos_token_id".to_string(), MetadataValue::U32(2)),
        ])
        .unwrap();
        let vocab = Vocabulary::from_metadata(&meta).unwrap().unwrap();
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.eos_token_id(), Some(2));
        assert_eq!(vocab.style(), TokenStyle::ByteLevel);
        // "b c" names a token the vocabulary lacks
        assert_eq!(vocab.merge_count(), 1);
        assert_eq!(vocab.decode(&[0, 1, 2]).unwrap(), "ab<|end|>");
        assert_eq!(vocab.encode("ab<|end|>").unwrap(), vec![3, 2]);
        assert!(matches!(vocab.decode(&[4]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_token_types_select_control_tokens() {
        let meta = ModelMetadata::from_entries(vec![
            ("tokenizer.ggml.model".to_string(), MetadataValue::String("llama".into())),
            (
                "tokenizer.ggml.tokens".to_string(),
                strings(&["<s>", "</s>", "\u{2581}a", "a", "\u{2581}"]),
            ),
            (
                "tokenizer.ggml.token_type".to_string(),
                MetadataValue::Array(vec![
                    MetadataValue::I32(3),
                    MetadataValue::I32(3),
                    MetadataValue::I32(1),
                    MetadataValue::I32(1),
                    MetadataValue::I32(1),
                ]),
            ),
        ])
        .unwrap();
        let vocab = Vocabulary::from_metadata(&meta).unwrap().unwrap();
        assert!(vocab.is_control(0) && vocab.is_control(1));
        assert!(!vocab.is_control(2));
        assert_eq!(vocab.encode("<s> a</s>").unwrap(), vec![0, 2, 1]);
    }

    #[test]
    fn test_missing_vocabulary() {
        assert!(Vocabulary::from_metadata(&ModelMetadata::default()).unwrap().is_none());
    }
}

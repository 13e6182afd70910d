//! Llama 3 instruct prompt layout
//!
//! ```text
//! <|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{content}<|eot_id|>
//! <|start_header_id|>user<|end_header_id|>\n\n{content}<|eot_id|>
//! <|start_header_id|>assistant<|end_header_id|>\n\n
//! ```

use crate::error::{Error, Result};
use crate::vocab::Vocabulary;
use serde::{Deserialize, Serialize};

pub const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
pub const END_OF_TEXT: &str = "<|end_of_text|>";
pub const START_HEADER: &str = "<|start_header_id|>";
pub const END_HEADER: &str = "<|end_header_id|>";
pub const END_OF_TURN: &str = "<|eot_id|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Turns a dialog into prompt tokens for a Llama 3 instruct vocabulary
#[derive(Debug, Clone)]
pub struct ChatFormat<'a> {
    vocab: &'a Vocabulary,
    begin_of_text: u32,
    start_header: u32,
    end_header: u32,
    end_of_turn: u32,
    end_of_text: Option<u32>,
}

impl<'a> ChatFormat<'a> {
    /// Look up the header and turn markers; fails if the vocabulary lacks one
    pub fn new(vocab: &'a Vocabulary) -> Result<Self> {
        let lookup = |name: &str| {
            vocab.token_id(name).ok_or_else(|| {
                Error::InvalidArgument(format!("Vocabulary has no '{}' token", name))
            })
        };
        Ok(Self {
            vocab,
            begin_of_text: lookup(BEGIN_OF_TEXT)?,
            start_header: lookup(START_HEADER)?,
            end_header: lookup(END_HEADER)?,
            end_of_turn: lookup(END_OF_TURN)?,
            end_of_text: vocab.token_id(END_OF_TEXT),
        })
    }

    /// Tokens that end an assistant turn
    pub fn stop_tokens(&self) -> Vec<u32> {
        let mut stop = vec![self.end_of_turn];
        stop.extend(self.end_of_text);
        stop
    }

    /// `<|start_header_id|>{role}<|end_header_id|>\n\n`
    pub fn encode_header(&self, role: Role) -> Result<Vec<u32>> {
        let mut tokens = vec![self.start_header];
        tokens.extend(self.vocab.encode(role.as_str())?);
        tokens.push(self.end_header);
        tokens.extend(self.vocab.encode("\n\n")?);
        Ok(tokens)
    }

    /// Header, trimmed content and end-of-turn marker
    pub fn encode_message(&self, message: &Message) -> Result<Vec<u32>> {
        let mut tokens = self.encode_header(message.role)?;
        tokens.extend(self.vocab.encode(message.content.trim())?);
        tokens.push(self.end_of_turn);
        Ok(tokens)
    }

    /// Every message, then an open assistant header for the model to complete
    pub fn encode_dialog_prompt(&self, dialog: &[Message]) -> Result<Vec<u32>> {
        let mut tokens = vec![self.begin_of_text];
        for message in dialog {
            tokens.extend(self.encode_message(message)?);
        }
        tokens.extend(self.encode_header(Role::Assistant)?);
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{byte_chars, SpecialTokens, TokenStyle};

    /// Byte tokens, a few merges, and Llama 3 markers at their real ids
    fn llama3_vocab() -> Vocabulary {
        let mut tokens: Vec<String> = byte_chars().iter().map(|c| c.to_string()).collect();
        tokens.extend(["us", "er", "user", "ĊĊ"].iter().map(|s| s.to_string()));
        while tokens.len() < 128_000 {
            tokens.push(format!("<|reserved_special_token_{}|>", tokens.len()));
        }
        tokens.extend(
            [
                BEGIN_OF_TEXT,
                END_OF_TEXT,
                "<|reserved_special_token_0|>",
                "<|reserved_special_token_1|>",
                "<|finetune_right_pad_id|>",
                "<|reserved_special_token_2|>",
                START_HEADER,
                END_HEADER,
                "<|eom_id|>",
                END_OF_TURN,
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        Vocabulary::new(tokens, TokenStyle::ByteLevel, SpecialTokens::default())
            .with_merges(&["u s", "e r", "us er", "Ċ Ċ"])
    }

    #[test]
    fn test_markers_resolve_to_llama3_ids() {
        let vocab = llama3_vocab();
        let chat = ChatFormat::new(&vocab).unwrap();
        assert_eq!(chat.begin_of_text, 128_000);
        assert_eq!(chat.start_header, 128_006);
        assert_eq!(chat.end_header, 128_007);
        assert_eq!(chat.end_of_turn, 128_009);
        assert_eq!(chat.stop_tokens(), vec![128_009, 128_001]);
    }

    #[test]
    fn test_dialog_token_layout() {
        let vocab = llama3_vocab();
        let chat = ChatFormat::new(&vocab).unwrap();
        let user = vocab.token_id("user").unwrap();
        let blank = vocab.token_id("ĊĊ").unwrap();

        let header = chat.encode_header(Role::User).unwrap();
        assert_eq!(header, vec![128_006, user, 128_007, blank]);

        let dialog = [Message::system("Be brief."), Message::user("  Hi  ")];
        let prompt = chat.encode_dialog_prompt(&dialog).unwrap();

        let mut expected = vec![128_000, 128_006];
        expected.extend(vocab.encode("system").unwrap());
        expected.extend([128_007, blank]);
        expected.extend(vocab.encode("Be brief.").unwrap());
        expected.extend([128_009, 128_006, user, 128_007, blank]);
        expected.extend(vocab.encode("Hi").unwrap());
        expected.extend([128_009, 128_006]);
        expected.extend(vocab.encode("assistant").unwrap());
        expected.extend([128_007, blank]);
        assert_eq!(prompt, expected);

        assert_eq!(
            vocab.decode(&prompt).unwrap(),
            "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\nBe brief.<|eot_id|>\
             <|start_header_id|>user<|end_header_id|>\n\nHi<|eot_id|>\
             <|start_header_id|>assistant<|end_header_id|>\n\n"
        );
    }

    #[test]
    fn test_markers_in_content_are_control_tokens() {
        let vocab = llama3_vocab();
        let chat = ChatFormat::new(&vocab).unwrap();
        let tokens = chat.encode_message(&Message::assistant("ok<|eot_id|>")).unwrap();
        assert_eq!(&tokens[tokens.len() - 2..], &[128_009, 128_009]);
    }

    #[test]
    fn test_missing_marker_is_rejected() {
        let vocab =
            Vocabulary::new(vec!["a".into()], TokenStyle::ByteLevel, SpecialTokens::default());
        assert!(matches!(ChatFormat::new(&vocab), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"x"}"#);
    }
}

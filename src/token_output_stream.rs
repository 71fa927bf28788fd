//! Incremental detokenization for streamed output.
//!
//! Byte-pair tokenizers may emit partial utf-8 sequences; text is only
//! surfaced once the decoded suffix grows by a printable amount, the rest is
//! held back until [`TokenOutputStream::decode_rest`].

use candle::Result;

pub struct TokenOutputStream {
    tokenizer: tokenizers::Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenOutputStream {
    pub fn new(tokenizer: tokenizers::Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        match self.tokenizer.decode(tokens, true) {
            Ok(text) => Ok(text),
            Err(err) => candle::bail!("cannot decode: {err}"),
        }
    }

    pub fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() && text.chars().last().is_some_and(char::is_alphanumeric) {
            let (_, new_text) = text.split_at(prev_text.len());
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(new_text.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn decode_rest(&self) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            let (_, rest) = text.split_at(prev_text.len());
            Ok(Some(rest.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn decode_all(&self) -> Result<String> {
        self.decode(&self.tokens)
    }

    pub fn tokenizer(&self) -> &tokenizers::Tokenizer {
        &self.tokenizer
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.prev_index = 0;
        self.current_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::test_tokenizer;

    #[test]
    fn streams_word_by_word() {
        let tokenizer = test_tokenizer();
        let hello = tokenizer.token_to_id("hello").unwrap();
        let mut stream = TokenOutputStream::new(tokenizer);

        assert_eq!(stream.next_token(hello).unwrap().as_deref(), Some("hello"));
        assert_eq!(
            stream.next_token(hello).unwrap().as_deref(),
            Some(" hello")
        );
        assert_eq!(stream.decode_rest().unwrap(), None);
        assert_eq!(stream.decode_all().unwrap(), "hello hello");

        stream.clear();
        assert_eq!(stream.decode_all().unwrap(), "");
    }
}

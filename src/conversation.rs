//! Conversation history and the prompt formatter.
//!
//! The formatter flattens the history into a single token-id sequence
//! following the ChatML-style convention Qwen2-backed llava checkpoints are
//! trained with: a system block, then per turn a role header, the turn text
//! tokenized verbatim and a terminator, with one image sentinel spliced in
//! per inline `<image>` marker.

use candle::Result;
use tokenizers::Tokenizer;

use crate::constants::{
    DEFAULT_IMAGE_TOKEN, DEFAULT_SYSTEM_MESSAGE, IGNORE_INDEX, IMAGE_TOKEN_INDEX, IM_END_TOKEN,
    IM_START_TOKEN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Human,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Append-only message history, cleared as a whole on reset.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_human(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Human,
            text: text.into(),
        });
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Assistant,
            text: text.into(),
        });
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

/// A named conversation template: system preamble, role headers and the
/// separator closing each turn. The separator doubles as the generation stop
/// string.
#[derive(Debug, Clone)]
pub struct ConvTemplate {
    pub name: &'static str,
    pub system: &'static str,
    pub roles: [&'static str; 2],
    pub sep: &'static str,
}

impl ConvTemplate {
    pub fn qwen_2() -> Self {
        ConvTemplate {
            name: "qwen-2",
            system: DEFAULT_SYSTEM_MESSAGE,
            roles: ["<|im_start|>user", "<|im_start|>assistant"],
            sep: IM_END_TOKEN,
        }
    }

    pub fn chatml() -> Self {
        ConvTemplate {
            name: "chatml",
            system: "Answer the questions.",
            roles: ["<|im_start|>user", "<|im_start|>assistant"],
            sep: IM_END_TOKEN,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "qwen-2" | "qwen_2" => Ok(Self::qwen_2()),
            "chatml" | "chatml_direct" => Ok(Self::chatml()),
            _ => candle::bail!("unknown conversation template `{name}`, expected qwen-2 or chatml"),
        }
    }

    pub fn stop_str(&self) -> &str {
        self.sep
    }

    /// Role echo some checkpoints emit before their reply once special tokens
    /// are dropped from the decode, e.g. `assistant\n`.
    pub fn role_echo(&self) -> String {
        format!("{}\n", self.roles[1].trim_start_matches(IM_START_TOKEN))
    }

    fn role(&self, role: Role) -> &str {
        match role {
            Role::Human => self.roles[0],
            Role::Assistant => self.roles[1],
        }
    }
}

/// Flat token encoding of a conversation plus the loss-mask placeholder kept
/// alongside it. The targets are unused at inference time.
#[derive(Debug, Clone)]
pub struct TokenizedPrompt {
    pub input_ids: Vec<i64>,
    pub targets: Vec<i64>,
}

fn encode(tokenizer: &Tokenizer, text: &str) -> Result<Vec<i64>> {
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|e| candle::Error::Msg(e.to_string()))?;
    Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
}

fn special_token_id(tokenizer: &Tokenizer, token: &str) -> Result<i64> {
    match tokenizer.token_to_id(token) {
        Some(id) => Ok(i64::from(id)),
        None => candle::bail!("tokenizer is missing the `{token}` special token"),
    }
}

/// Formats the whole conversation into one token sequence.
///
/// A turn containing `<image>` markers is split at each marker and one
/// [`IMAGE_TOKEN_INDEX`] sentinel is spliced per split point, but only when
/// `has_image` is set; otherwise the marker text is tokenized verbatim. A
/// turn referencing more markers than there are supplied images is not
/// caught here, the model call is the failure point for that.
pub fn preprocess(
    conversation: &Conversation,
    tokenizer: &Tokenizer,
    template: &ConvTemplate,
    has_image: bool,
    max_len: usize,
) -> Result<TokenizedPrompt> {
    let im_start = special_token_id(tokenizer, IM_START_TOKEN)?;
    let im_end = special_token_id(tokenizer, IM_END_TOKEN)?;
    let newline = encode(tokenizer, "\n")?;

    let mut input_ids = vec![im_start];
    input_ids.extend(encode(tokenizer, "system")?);
    input_ids.extend(encode(tokenizer, template.system)?);
    input_ids.push(im_end);
    input_ids.extend(newline.iter().copied());

    for turn in conversation.turns() {
        input_ids.extend(encode(tokenizer, template.role(turn.role))?);
        input_ids.extend(newline.iter().copied());
        if has_image && turn.text.contains(DEFAULT_IMAGE_TOKEN) {
            let chunks: Vec<&str> = turn.text.split(DEFAULT_IMAGE_TOKEN).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                input_ids.extend(encode(tokenizer, chunk)?);
                if i + 1 < chunks.len() {
                    input_ids.push(IMAGE_TOKEN_INDEX);
                    input_ids.extend(newline.iter().copied());
                }
            }
        } else {
            input_ids.extend(encode(tokenizer, &turn.text)?);
        }
        input_ids.push(im_end);
        input_ids.extend(newline.iter().copied());
    }

    if input_ids.len() > max_len {
        tracing::warn!(
            len = input_ids.len(),
            max_len,
            "formatted prompt exceeds the maximum length"
        );
    }

    let targets = vec![IGNORE_INDEX; input_ids.len()];
    Ok(TokenizedPrompt { input_ids, targets })
}

#[cfg(test)]
pub(crate) fn test_tokenizer() -> Tokenizer {
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::AddedToken;

    let entries = [
        "<unk>",
        "\n",
        "system",
        "user",
        "assistant",
        "You are a helpful assistant.",
        "Answer the questions.",
        "hello",
        "What is in this picture? ",
        "Describe the first ",
        " and the second ",
        ".",
    ];
    // Collect into the builder's expected map type (AHashMap) via inference.
    let vocab = entries
        .iter()
        .enumerate()
        .map(|(id, entry)| ((*entry).to_string(), id as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.add_special_tokens(&[
        AddedToken::from(IM_START_TOKEN, true),
        AddedToken::from(IM_END_TOKEN, true),
    ]);
    tokenizer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tokenizer: &Tokenizer, token: &str) -> i64 {
        i64::from(tokenizer.token_to_id(token).unwrap())
    }

    #[test]
    fn single_turn_starts_with_system_block() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let mut conversation = Conversation::new();
        conversation.append_human("hello");

        let prompt = preprocess(&conversation, &tokenizer, &template, false, 1024).unwrap();
        let im_start = id(&tokenizer, IM_START_TOKEN);
        let im_end = id(&tokenizer, IM_END_TOKEN);
        let newline = id(&tokenizer, "\n");
        let expected_prefix = [
            im_start,
            id(&tokenizer, "system"),
            id(&tokenizer, "You are a helpful assistant."),
            im_end,
            newline,
            // human role header
            im_start,
            id(&tokenizer, "user"),
            newline,
            id(&tokenizer, "hello"),
            im_end,
            newline,
        ];
        assert_eq!(&prompt.input_ids[..expected_prefix.len()], expected_prefix);
        assert_eq!(prompt.input_ids.len(), expected_prefix.len());
    }

    #[test]
    fn one_marker_one_sentinel() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let mut conversation = Conversation::new();
        conversation.append_human("What is in this picture? <image>");

        let prompt = preprocess(&conversation, &tokenizer, &template, true, 1024).unwrap();
        let sentinels = prompt
            .input_ids
            .iter()
            .filter(|&&id| id == IMAGE_TOKEN_INDEX)
            .count();
        assert_eq!(sentinels, 1);
    }

    #[test]
    fn two_markers_two_sentinels_in_order() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let mut conversation = Conversation::new();
        conversation.append_human("Describe the first <image> and the second <image>.");

        let prompt = preprocess(&conversation, &tokenizer, &template, true, 1024).unwrap();
        let positions: Vec<usize> = prompt
            .input_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == IMAGE_TOKEN_INDEX)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(positions.len(), 2);
        // the connecting text sits between the two sentinels
        let between = &prompt.input_ids[positions[0] + 1..positions[1]];
        assert!(between.contains(&id(&tokenizer, " and the second ")));
    }

    #[test]
    fn marker_without_images_stays_text() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let mut conversation = Conversation::new();
        conversation.append_human("What is in this picture? <image>");

        let prompt = preprocess(&conversation, &tokenizer, &template, false, 1024).unwrap();
        assert!(!prompt.input_ids.contains(&IMAGE_TOKEN_INDEX));
    }

    #[test]
    fn clear_leaves_only_the_system_block() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let mut conversation = Conversation::new();
        conversation.append_human("hello");
        conversation.append_assistant("hello");
        conversation.clear();
        assert!(conversation.is_empty());

        let prompt = preprocess(&conversation, &tokenizer, &template, false, 1024).unwrap();
        let system_block = [
            id(&tokenizer, IM_START_TOKEN),
            id(&tokenizer, "system"),
            id(&tokenizer, "You are a helpful assistant."),
            id(&tokenizer, IM_END_TOKEN),
            id(&tokenizer, "\n"),
        ];
        assert_eq!(prompt.input_ids, system_block);
    }

    #[test]
    fn targets_mirror_inputs_with_ignore_index() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let mut conversation = Conversation::new();
        conversation.append_human("hello");
        conversation.append_assistant("hello");

        let prompt = preprocess(&conversation, &tokenizer, &template, false, 1024).unwrap();
        assert_eq!(prompt.targets.len(), prompt.input_ids.len());
        assert!(prompt.targets.iter().all(|&t| t == IGNORE_INDEX));
    }

    #[test]
    fn template_lookup() {
        assert_eq!(ConvTemplate::from_name("qwen-2").unwrap().name, "qwen-2");
        assert_eq!(ConvTemplate::from_name("chatml").unwrap().name, "chatml");
        assert!(ConvTemplate::from_name("vicuna").is_err());
    }

    #[test]
    fn role_echo_is_derived_from_the_assistant_header() {
        assert_eq!(ConvTemplate::qwen_2().role_echo(), "assistant\n");
    }
}

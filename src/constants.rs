//! Token conventions shared by the prompt formatter and the generation loop.

/// Sentinel id spliced into the token stream wherever an image is attached.
/// Negative so it can never collide with a vocabulary entry; the model swaps
/// it for projected vision features before the language forward pass.
pub const IMAGE_TOKEN_INDEX: i64 = -200;

/// Loss-mask value, kept in the targets sequence at every position.
pub const IGNORE_INDEX: i64 = -100;

/// Inline marker users type in a message to position an image.
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";

pub const IM_START_TOKEN: &str = "<|im_start|>";
pub const IM_END_TOKEN: &str = "<|im_end|>";

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant.";

/// Soft guard on the formatted prompt length, never enforced by truncation.
pub const MAX_PROMPT_TOKENS: usize = 32768;

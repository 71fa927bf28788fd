//! The decode loop: sampling configuration, the separator-derived stopping
//! criterion, response cleanup and the embedding-append generation driver.

use std::io::Write;
use std::time::Instant;

use candle::{IndexOp, Result, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::Cache;
use candle_transformers::models::llava::LLaVA;
use tokenizers::Tokenizer;

use crate::conversation::ConvTemplate;
use crate::token_output_stream::TokenOutputStream;

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub num_beams: usize,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl GenerationOptions {
    pub fn validate(&self) -> Result<()> {
        if self.num_beams != 1 {
            candle::bail!("beam search is not supported, run with --num-beams 1");
        }
        Ok(())
    }

    fn logits_processor(&self) -> LogitsProcessor {
        let temperature = self.temperature;
        let sampling = if temperature <= 0. {
            Sampling::ArgMax
        } else if self.top_p >= 1. {
            Sampling::All { temperature }
        } else {
            Sampling::TopP {
                p: self.top_p,
                temperature,
            }
        };
        LogitsProcessor::from_sampling(self.seed, sampling)
    }
}

/// Stopping criterion derived from the conversation template: the separator
/// as a keyword (an id when the vocabulary has it as one token), plus the
/// tokenizer's end-of-text marker when present.
#[derive(Debug, Clone)]
pub struct StopSpec {
    stop_str: String,
    role_echo: String,
    stop_id: Option<u32>,
    eos_id: Option<u32>,
}

impl StopSpec {
    pub fn from_template(tokenizer: &Tokenizer, template: &ConvTemplate) -> Self {
        let stop_str = template.stop_str().to_string();
        let stop_id = tokenizer.token_to_id(&stop_str);
        let eos_id = tokenizer
            .token_to_id("<|endoftext|>")
            .or_else(|| tokenizer.token_to_id("</s>"));
        StopSpec {
            stop_str,
            role_echo: template.role_echo(),
            stop_id,
            eos_id,
        }
    }

    pub fn stop_str(&self) -> &str {
        &self.stop_str
    }

    fn hits(&self, token: u32) -> bool {
        Some(token) == self.stop_id || Some(token) == self.eos_id
    }
}

/// Strips the role echo and everything from the first stop-string occurrence,
/// then trims. Applied to the full decoded reply before it enters history.
pub fn clean_response(raw: &str, stop_str: &str, role_echo: &str) -> String {
    let cleaned = raw.trim().replace(role_echo, "");
    let reply = match cleaned.find(stop_str) {
        Some(pos) => &cleaned[..pos],
        None => cleaned.as_str(),
    };
    reply.trim().to_string()
}

/// Runs the sampling loop over pre-computed input embeddings, streaming
/// decoded text to stdout as it appears and returning the cleaned reply.
///
/// Newly sampled ids are embedded and appended to the input embeddings; with
/// the KV cache enabled only the last position is re-fed to the model.
pub fn generate(
    llava: &LLaVA,
    input_embeds: &Tensor,
    stream: &mut TokenOutputStream,
    cache: &mut Cache,
    options: &GenerationOptions,
    stop: &StopSpec,
) -> Result<String> {
    let mut logits_processor = options.logits_processor();
    stream.clear();
    let mut embeds = input_embeds.clone();
    let mut index_pos = 0;
    let mut sampled = 0;
    let mut output = String::new();
    // buffers the first pieces until the role echo is either matched or ruled out
    let mut held: Option<String> = Some(String::new());
    let start = Instant::now();

    for index in 0..options.max_new_tokens {
        let (_, embeds_len, _) = embeds.dims3()?;
        let (context_len, context_index) = if cache.use_kv_cache && index > 0 {
            (1, index_pos)
        } else {
            (embeds_len, 0)
        };
        let input = embeds.i((.., embeds_len.saturating_sub(context_len).., ..))?;
        let logits = llava.forward(&input, context_index, cache)?.squeeze(0)?;
        let (_, input_len, _) = input.dims3()?;
        index_pos += input_len;

        let next_token = logits_processor.sample(&logits)?;
        sampled += 1;
        if stop.hits(next_token) {
            break;
        }
        let token_tensor = Tensor::from_vec(vec![next_token], 1, embeds.device())?;
        let next_embeds = llava.llama.embed(&token_tensor)?.unsqueeze(0)?;
        embeds = Tensor::cat(&[&embeds, &next_embeds], 1)?;

        if let Some(piece) = stream.next_token(next_token)? {
            emit(&piece, &mut output, &mut held, &stop.role_echo)?;
        }
        // keyword fallback for separators that do not map to a single token
        if stop.stop_id.is_none() && output.contains(&stop.stop_str) {
            break;
        }
    }
    if let Some(rest) = stream.decode_rest()? {
        emit(&rest, &mut output, &mut held, &stop.role_echo)?;
    }
    if let Some(buffer) = held {
        let visible = buffer.strip_prefix(&stop.role_echo).unwrap_or(&buffer);
        print!("{visible}");
        std::io::stdout().flush()?;
    }

    let elapsed = start.elapsed();
    println!();
    println!(
        "{sampled} tokens generated ({:.2} token/s)",
        sampled as f64 / elapsed.as_secs_f64(),
    );
    Ok(clean_response(&output, &stop.stop_str, &stop.role_echo))
}

fn emit(
    piece: &str,
    output: &mut String,
    held: &mut Option<String>,
    role_echo: &str,
) -> Result<()> {
    output.push_str(piece);
    if let Some(buffer) = held {
        buffer.push_str(piece);
        if role_echo.starts_with(buffer.as_str()) && buffer.len() < role_echo.len() {
            // still a prefix of the echo, keep holding
            return Ok(());
        }
        let visible = buffer.strip_prefix(role_echo).unwrap_or(buffer).to_string();
        print!("{visible}");
        std::io::stdout().flush()?;
        *held = None;
        return Ok(());
    }
    print!("{piece}");
    std::io::stdout().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::IM_END_TOKEN;
    use crate::conversation::test_tokenizer;

    #[test]
    fn beam_count_is_rejected() {
        let mut options = GenerationOptions {
            temperature: 0.2,
            top_p: 0.95,
            num_beams: 1,
            max_new_tokens: 512,
            seed: 299792458,
        };
        assert!(options.validate().is_ok());
        options.num_beams = 4;
        assert!(options.validate().is_err());
    }

    #[test]
    fn separator_maps_to_a_single_stop_id() {
        let tokenizer = test_tokenizer();
        let template = ConvTemplate::qwen_2();
        let stop = StopSpec::from_template(&tokenizer, &template);
        let im_end = tokenizer.token_to_id(IM_END_TOKEN).unwrap();
        assert!(stop.hits(im_end));
        assert!(!stop.hits(tokenizer.token_to_id("hello").unwrap()));
    }

    #[test]
    fn responses_are_cleaned() {
        let stop = "<|im_end|>";
        let echo = "assistant\n";
        assert_eq!(
            clean_response("assistant\nA red bicycle.<|im_end|>\ngarbage", stop, echo),
            "A red bicycle."
        );
        assert_eq!(clean_response("  plain reply  ", stop, echo), "plain reply");
        assert_eq!(clean_response("assistant\n", stop, echo), "");
    }

    #[test]
    fn cleaned_output_never_contains_the_stop_string() {
        let stop = "<|im_end|>";
        let echo = "assistant\n";
        for raw in [
            "assistant\nanswer<|im_end|>",
            "<|im_end|>",
            "a<|im_end|>b<|im_end|>c",
            "no stop at all",
        ] {
            assert!(!clean_response(raw, stop, echo).contains(stop));
        }
    }
}

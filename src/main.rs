use std::io::Write;

use anyhow::{Error as E, Result};
use candle::Tensor;
use candle_nn::VarBuilder;
use candle_transformers::models::llama::Cache;
use candle_transformers::models::llava::config::LLaVAConfig;
use candle_transformers::models::llava::LLaVA;
use clap::Parser;
use tokenizers::Tokenizer;

use llava_qwen_chat::chat::{parse_image_paths, Command};
use llava_qwen_chat::constants::MAX_PROMPT_TOKENS;
use llava_qwen_chat::conversation::{preprocess, ConvTemplate, Conversation};
use llava_qwen_chat::generation::{generate, GenerationOptions, StopSpec};
use llava_qwen_chat::image_processor::{ImageProcessor, ImageSet, VisionParams};
use llava_qwen_chat::loader::{model_name_from_path, resolve_model, weight_dtype};
use llava_qwen_chat::token_output_stream::TokenOutputStream;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Checkpoint directory or Hub model id, must be a llava-qwen family
    /// checkpoint.
    #[arg(long)]
    model_path: String,

    /// Conversation template name.
    #[arg(long, default_value = "qwen-2")]
    conv_mode: String,

    /// Sampling temperature, 0 means greedy decoding.
    #[arg(long, default_value_t = 0.2)]
    temperature: f64,

    /// Nucleus sampling probability cutoff.
    #[arg(long, default_value_t = 0.95)]
    top_p: f64,

    /// Beam count, kept for interface parity; only 1 is supported.
    #[arg(long, default_value_t = 1)]
    num_beams: usize,

    /// Maximum number of tokens sampled per reply.
    #[arg(long, default_value_t = 512)]
    max_new_tokens: usize,

    /// The seed to use when generating random samples.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Disable the KV cache and re-feed the whole context every step.
    #[arg(long)]
    no_kv_cache: bool,

    /// Print the formatted prompt ids before each generation.
    #[arg(long)]
    verbose_prompt: bool,
}

fn prompt_line(prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    let read = std::io::stdin().read_line(&mut line)?;
    if read == 0 {
        // stdin closed, behave like `exit`
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn dump_prompt(input_ids: &[i64], tokenizer: &Tokenizer) {
    for &id in input_ids {
        if id < 0 {
            println!("{id:7} -> <image slot>");
        } else {
            let piece = tokenizer.decode(&[id as u32], false).unwrap_or_default();
            println!("{id:7} -> '{piece}'");
        }
    }
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };
    println!(
        "avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle::utils::with_avx(),
        candle::utils::with_neon(),
        candle::utils::with_simd128(),
        candle::utils::with_f16c()
    );

    let template = ConvTemplate::from_name(&args.conv_mode)?;
    let options = GenerationOptions {
        temperature: args.temperature,
        top_p: args.top_p,
        num_beams: args.num_beams,
        max_new_tokens: args.max_new_tokens,
        seed: args.seed,
    };
    options.validate()?;

    let model_name = model_name_from_path(&args.model_path);
    anyhow::ensure!(
        model_name.to_lowercase().contains("qwen"),
        "expected a llava-qwen family checkpoint, got `{model_name}`"
    );

    let device = llava_qwen_chat::device(args.cpu)?;
    let start = std::time::Instant::now();
    let paths = resolve_model(&args.model_path)?;
    let config_bytes = std::fs::read(&paths.config)?;
    let llava_config: LLaVAConfig = serde_json::from_slice(&config_bytes)?;
    let vision: VisionParams = serde_json::from_slice(&config_bytes)?;
    let dtype = weight_dtype(&llava_config.torch_dtype)?;
    let llama_config = llava_config.to_llama_config();

    let tokenizer = Tokenizer::from_file(&paths.tokenizer).map_err(E::msg)?;
    tracing::info!(model = %model_name, ?dtype, "loading weights");
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&paths.weights, dtype, &device)? };
    let llava = LLaVA::load(vb, &llava_config, None)?;
    let image_processor = ImageProcessor::from_pretrained(&vision.mm_vision_tower)?;
    println!("loaded the model in {:?}", start.elapsed());

    let mut stream = TokenOutputStream::new(tokenizer);
    let stop = StopSpec::from_template(stream.tokenizer(), &template);

    println!("Enter 'exit' to end the conversation, 'reset' to clear the chat history.");
    let mut conversation = Conversation::new();
    let mut images = ImageSet::empty();
    loop {
        // a fresh conversation starts by collecting images for the session
        if conversation.is_empty() {
            let Some(line) = prompt_line("Enter image file paths (comma-separated): ")? else {
                break;
            };
            let image_paths = parse_image_paths(&line);
            images = ImageSet::load(&image_paths, &image_processor, &vision, dtype, &device)?;
            if !images.is_empty() {
                println!("loaded {} image(s)", images.len());
            }
        }

        let Some(line) = prompt_line("User: ")? else {
            println!("Exiting the conversation.");
            break;
        };
        match Command::parse(&line) {
            Command::Exit => {
                println!("Exiting the conversation.");
                break;
            }
            Command::Reset => {
                conversation.clear();
                images = ImageSet::empty();
                println!("Conversation history reset.");
            }
            Command::Say(text) => {
                conversation.append_human(text);
                let prompt = preprocess(
                    &conversation,
                    stream.tokenizer(),
                    &template,
                    !images.is_empty(),
                    MAX_PROMPT_TOKENS,
                )?;
                if args.verbose_prompt {
                    dump_prompt(&prompt.input_ids, stream.tokenizer());
                }
                let input = Tensor::from_vec(
                    prompt.input_ids.clone(),
                    (1, prompt.input_ids.len()),
                    &device,
                )?;
                let input_embeds = if images.is_empty() {
                    llava.llama.embed(&input)?
                } else {
                    llava.prepare_inputs_labels_for_multimodal(
                        &input,
                        images.tensors(),
                        images.sizes(),
                    )?
                };
                let mut cache = Cache::new(!args.no_kv_cache, dtype, &llama_config, &device)?;
                print!("Assistant: ");
                std::io::stdout().flush()?;
                let response = generate(&llava, &input_embeds, &mut stream, &mut cache, &options, &stop)?;
                conversation.append_assistant(response);
            }
        }
    }
    Ok(())
}

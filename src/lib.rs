//! Interactive chat around LLaVA-family vision+language checkpoints.
//!
//! The heavy lifting (model forward passes, KV cache, sampling) lives in
//! candle; this crate owns the conversation template, the image
//! preprocessing glue, checkpoint resolution and the read-eval loop.

pub mod chat;
pub mod constants;
pub mod conversation;
pub mod generation;
pub mod image_processor;
pub mod loader;
pub mod token_output_stream;

use candle::utils::{cuda_is_available, metal_is_available};
use candle::{Device, Result};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        println!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        println!("Running on CPU, to run on GPU, build with `--features cuda`");
        Ok(Device::Cpu)
    }
}

//! CLIP-style image preprocessing for llava checkpoints.
//!
//! Covers the subset of the HuggingFace image-processor pipeline these
//! checkpoints rely on (shortest-edge resize, center crop, rescale,
//! normalize, HWC to CHW) plus the llava aspect-ratio strategies. PIL's
//! bicubic resample maps to CatmullRom here.

use std::cmp::min;
use std::path::Path;

use candle::{bail, DType, Device, Result, Tensor};
use candle_transformers::models::llava::utils::select_best_resolution;
use hf_hub::api::sync::Api;
use image::imageops::{overlay, FilterType};
use image::{DynamicImage, GenericImageView, ImageReader, Rgb, RgbImage};
use serde::Deserialize;

/// Vision-side fields of a llava checkpoint `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionParams {
    pub mm_vision_tower: String,
    #[serde(default = "default_image_aspect_ratio")]
    pub image_aspect_ratio: String,
    #[serde(default)]
    pub image_grid_pinpoints: Vec<(u32, u32)>,
}

fn default_image_aspect_ratio() -> String {
    "square".to_string()
}

/// `size` / `crop_size` appear either as a bare pixel count or as an object,
/// depending on the transformers version that wrote the config.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Edge(u32),
    ShortestEdge { shortest_edge: u32 },
    WidthHeight { height: u32, width: u32 },
}

impl SizeSpec {
    fn pixels(self) -> u32 {
        match self {
            SizeSpec::Edge(edge) | SizeSpec::ShortestEdge { shortest_edge: edge } => edge,
            SizeSpec::WidthHeight { height, width: _ } => height,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessor {
    #[serde(default = "default_size")]
    size: SizeSpec,
    #[serde(default = "default_true")]
    do_resize: bool,
    #[serde(default = "default_true")]
    do_center_crop: bool,
    #[serde(default = "default_size")]
    crop_size: SizeSpec,
    #[serde(default = "default_true")]
    do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    rescale_factor: f32,
    #[serde(default = "default_true")]
    do_normalize: bool,
    #[serde(default = "default_image_mean")]
    image_mean: Vec<f32>,
    #[serde(default = "default_image_std")]
    image_std: Vec<f32>,
}

fn default_size() -> SizeSpec {
    SizeSpec::Edge(224)
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_image_mean() -> Vec<f32> {
    vec![0.48145466, 0.4578275, 0.40821073]
}

fn default_image_std() -> Vec<f32> {
    vec![0.26862954, 0.2613026, 0.2757771]
}

impl ImageProcessor {
    /// Reads `preprocessor_config.json` from a local vision-tower directory
    /// or from the Hub repo the checkpoint config names.
    pub fn from_pretrained(vision_tower: &str) -> Result<Self> {
        let local = Path::new(vision_tower).join("preprocessor_config.json");
        let config_filename = if local.is_file() {
            local
        } else {
            let api = Api::new().map_err(|e| candle::Error::Msg(e.to_string()))?;
            api.model(vision_tower.to_string())
                .get("preprocessor_config.json")
                .map_err(|e| candle::Error::Msg(e.to_string()))?
        };
        serde_json::from_slice(&std::fs::read(config_filename)?)
            .map_err(|e| candle::Error::Msg(e.to_string()))
    }

    fn shortest_edge(&self) -> u32 {
        self.size.pixels()
    }

    fn crop_edge(&self) -> u32 {
        self.crop_size.pixels()
    }

    fn resize_shortest_edge(&self, image: &DynamicImage) -> DynamicImage {
        let size = self.shortest_edge();
        let (width, height) = image.dimensions();
        if width == size && height == size {
            return image.clone();
        }
        let (new_width, new_height) = if width < height {
            (size, (((size * height) as f32) / width as f32).ceil() as u32)
        } else {
            ((((size * width) as f32) / height as f32).ceil() as u32, size)
        };
        image.resize(new_width, new_height, FilterType::CatmullRom)
    }

    fn center_crop(&self, image: &DynamicImage) -> DynamicImage {
        let crop = self.crop_edge();
        let (left, top) = center_offset(image.dimensions(), (crop, crop));
        image.crop_imm(left, top, crop, crop)
    }

    fn to_chw_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        let data = image.to_rgb8().into_raw();
        let mut tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), &Device::Cpu)?
            .to_dtype(DType::F32)?;
        if self.do_rescale {
            tensor = tensor.affine(f64::from(self.rescale_factor), 0.0)?;
        }
        if self.do_normalize {
            let mean = Tensor::from_vec(self.image_mean.clone(), (3,), &Device::Cpu)?;
            let std = Tensor::from_vec(self.image_std.clone(), (3,), &Device::Cpu)?;
            tensor = tensor.broadcast_sub(&mean)?.broadcast_div(&std)?;
        }
        tensor.permute((2, 0, 1))
    }

    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let image = if self.do_resize {
            self.resize_shortest_edge(image)
        } else {
            image.clone()
        };
        let image = if self.do_center_crop {
            self.center_crop(&image)
        } else {
            image
        };
        self.to_chw_tensor(&image)
    }

    fn mean_pixel(&self) -> Rgb<u8> {
        let channel = |i: usize| (self.image_mean.get(i).copied().unwrap_or(0.5) * 255.0) as u8;
        Rgb::from([channel(0), channel(1), channel(2)])
    }
}

pub fn center_offset(image_size: (u32, u32), center_size: (u32, u32)) -> (u32, u32) {
    let offset = |outer: u32, inner: u32| {
        if outer <= inner {
            0
        } else {
            ((outer as f32 - inner as f32) / 2.0).ceil() as u32
        }
    };
    (
        offset(image_size.0, center_size.0),
        offset(image_size.1, center_size.1),
    )
}

fn expand_to_square(image: &DynamicImage, background: Rgb<u8>) -> DynamicImage {
    let (width, height) = image.dimensions();
    match width.cmp(&height) {
        std::cmp::Ordering::Equal => image.clone(),
        std::cmp::Ordering::Less => {
            let mut canvas = DynamicImage::from(RgbImage::from_pixel(height, height, background));
            overlay(&mut canvas, image, i64::from((height - width) / 2), 0);
            canvas
        }
        std::cmp::Ordering::Greater => {
            let mut canvas = DynamicImage::from(RgbImage::from_pixel(width, width, background));
            overlay(&mut canvas, image, 0, i64::from((width - height) / 2));
            canvas
        }
    }
}

/// Scales the image to fit the target resolution, centered on a black canvas
/// of exactly that resolution.
fn resize_with_padding(image: &DynamicImage, target: (u32, u32)) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (target_width, target_height) = target;
    let scale_w = target_width as f32 / width as f32;
    let scale_h = target_height as f32 / height as f32;
    let (new_width, new_height) = if scale_w < scale_h {
        (
            target_width,
            min((height as f32 * scale_w).ceil() as u32, target_height),
        )
    } else {
        (
            min((width as f32 * scale_h).ceil() as u32, target_width),
            target_height,
        )
    };
    let resized = image.resize_exact(new_width, new_height, FilterType::CatmullRom);
    let mut canvas = DynamicImage::new_rgb8(target_width, target_height);
    let (left, top) = center_offset((target_width, target_height), (new_width, new_height));
    overlay(&mut canvas, &resized, i64::from(left), i64::from(top));
    canvas
}

fn split_into_patches(image: &DynamicImage, patch_size: u32) -> Vec<DynamicImage> {
    let (width, height) = image.dimensions();
    let mut patches = Vec::new();
    for y in (0..height).step_by(patch_size as usize) {
        for x in (0..width).step_by(patch_size as usize) {
            patches.push(image.crop_imm(x, y, patch_size, patch_size));
        }
    }
    patches
}

fn process_anyres(
    image: &DynamicImage,
    processor: &ImageProcessor,
    grid_pinpoints: &[(u32, u32)],
) -> Result<Tensor> {
    let best_resolution = select_best_resolution(image.dimensions(), grid_pinpoints);
    let padded = resize_with_padding(image, best_resolution);
    let base = image.resize_exact(
        processor.shortest_edge(),
        processor.shortest_edge(),
        FilterType::CatmullRom,
    );
    let mut patches = vec![base];
    patches.extend(split_into_patches(&padded, processor.crop_edge()));
    let tensors = patches
        .iter()
        .map(|patch| processor.preprocess(patch))
        .collect::<Result<Vec<Tensor>>>()?;
    Tensor::stack(&tensors, 0)
}

/// Runs the aspect-ratio strategy the checkpoint was trained with.
pub fn process_image(
    image: &DynamicImage,
    processor: &ImageProcessor,
    vision: &VisionParams,
) -> Result<Tensor> {
    match vision.image_aspect_ratio.as_str() {
        "square" => processor.preprocess(image)?.unsqueeze(0),
        "pad" => processor
            .preprocess(&expand_to_square(image, processor.mean_pixel()))?
            .unsqueeze(0),
        "anyres" => process_anyres(image, processor, &vision.image_grid_pinpoints),
        ratio => bail!("unsupported image aspect ratio `{ratio}`"),
    }
}

/// Decoded images for the current session segment, preprocessed once and
/// kept together with their original pixel dimensions.
#[derive(Debug)]
pub struct ImageSet {
    tensors: Vec<Tensor>,
    sizes: Vec<(u32, u32)>,
}

impl ImageSet {
    pub fn empty() -> Self {
        ImageSet {
            tensors: Vec::new(),
            sizes: Vec::new(),
        }
    }

    pub fn load(
        paths: &[String],
        processor: &ImageProcessor,
        vision: &VisionParams,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut tensors = Vec::with_capacity(paths.len());
        let mut sizes = Vec::with_capacity(paths.len());
        for path in paths {
            let image = ImageReader::open(path)?
                .decode()
                .map_err(|e| candle::Error::Msg(format!("cannot decode {path}: {e}")))?;
            sizes.push(image.dimensions());
            let tensor = process_image(&image, processor, vision)?
                .to_dtype(dtype)?
                .to_device(device)?;
            tensors.push(tensor);
        }
        Ok(ImageSet { tensors, sizes })
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn sizes(&self) -> &[(u32, u32)] {
        &self.sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_processor(edge: u32) -> ImageProcessor {
        ImageProcessor {
            size: SizeSpec::Edge(edge),
            do_resize: true,
            do_center_crop: true,
            crop_size: SizeSpec::Edge(edge),
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: vec![0.5, 0.5, 0.5],
            image_std: vec![0.5, 0.5, 0.5],
        }
    }

    #[test]
    fn config_accepts_both_size_formats() {
        let flat: ImageProcessor = serde_json::from_str(r#"{"size": 336}"#).unwrap();
        assert_eq!(flat.shortest_edge(), 336);

        let nested: ImageProcessor = serde_json::from_str(
            r#"{"size": {"shortest_edge": 336}, "crop_size": {"height": 336, "width": 336}}"#,
        )
        .unwrap();
        assert_eq!(nested.shortest_edge(), 336);
        assert_eq!(nested.crop_edge(), 336);
    }

    #[test]
    fn center_offsets() {
        assert_eq!(center_offset((100, 100), (50, 50)), (25, 25));
        assert_eq!(center_offset((30, 50), (40, 40)), (0, 5));
        assert_eq!(center_offset((10, 10), (10, 10)), (0, 0));
    }

    #[test]
    fn expand_to_square_pads_the_short_side() {
        let tall = DynamicImage::new_rgb8(30, 50);
        let squared = expand_to_square(&tall, Rgb::from([0, 0, 0]));
        assert_eq!(squared.dimensions(), (50, 50));

        let square = DynamicImage::new_rgb8(40, 40);
        assert_eq!(
            expand_to_square(&square, Rgb::from([0, 0, 0])).dimensions(),
            (40, 40)
        );
    }

    #[test]
    fn resize_with_padding_hits_the_target_resolution() {
        let image = DynamicImage::new_rgb8(200, 200);
        assert_eq!(resize_with_padding(&image, (100, 50)).dimensions(), (100, 50));
    }

    #[test]
    fn patch_grid_covers_the_image() {
        let image = DynamicImage::new_rgb8(672, 672);
        let patches = split_into_patches(&image, 336);
        assert_eq!(patches.len(), 4);
        assert!(patches.iter().all(|p| p.dimensions() == (336, 336)));
    }

    #[test]
    fn preprocess_yields_chw() {
        let processor = test_processor(16);
        let image = DynamicImage::new_rgb8(32, 24);
        let tensor = processor.preprocess(&image).unwrap();
        assert_eq!(tensor.dims(), &[3, 16, 16]);
    }

    #[test]
    fn square_strategy_is_batched() {
        let processor = test_processor(16);
        let vision = VisionParams {
            mm_vision_tower: "openai/clip-vit-large-patch14-336".to_string(),
            image_aspect_ratio: "square".to_string(),
            image_grid_pinpoints: Vec::new(),
        };
        let image = DynamicImage::new_rgb8(20, 20);
        let tensor = process_image(&image, &processor, &vision).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 16, 16]);
    }

    #[test]
    fn unknown_aspect_ratio_is_rejected() {
        let processor = test_processor(16);
        let vision = VisionParams {
            mm_vision_tower: String::new(),
            image_aspect_ratio: "tiled".to_string(),
            image_grid_pinpoints: Vec::new(),
        };
        let image = DynamicImage::new_rgb8(20, 20);
        assert!(process_image(&image, &processor, &vision).is_err());
    }
}

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
};

use anyhow::Context;
use image::{
    imageops::{self, FilterType},
    GrayImage, Luma, RgbImage,
};
use imageproc::contours::{find_contours, BorderType};
use ndarray::{s, Array4, ArrayView1, ArrayView2, Axis, Ix3, Ix4};

use super::{
    session::{ORTConfig, OnnxModel},
    OcrDetection, OcrEngine, OcrEngineFactory,
};
use crate::entities::BBox;

pub const DET_MODEL_FILE: &str = "det.onnx";
pub const REC_MODEL_FILE: &str = "rec.onnx";
pub const DEFAULT_DICT_FILE: &str = "dict.txt";

/// Builds [`PaddleOcr`] from the detection/recognition models in `model_dir`.
#[derive(Debug, Clone)]
pub struct PaddleOcrFactory {
    model_dir: PathBuf,
    ort_config: ORTConfig,
}

impl PaddleOcrFactory {
    pub fn new(model_dir: PathBuf, ort_config: ORTConfig) -> Self {
        Self {
            model_dir,
            ort_config,
        }
    }

    fn dictionary_path(&self, lang: &str) -> PathBuf {
        let per_lang = self.model_dir.join(format!("dict_{lang}.txt"));
        if per_lang.is_file() {
            per_lang
        } else {
            self.model_dir.join(DEFAULT_DICT_FILE)
        }
    }
}

impl OcrEngineFactory for PaddleOcrFactory {
    fn name(&self) -> &'static str {
        PaddleOcr::NAME
    }

    fn build(&self, lang: &str) -> anyhow::Result<Box<dyn OcrEngine>> {
        let det_path = self.model_dir.join(DET_MODEL_FILE);
        let rec_path = self.model_dir.join(REC_MODEL_FILE);
        let dict_path = self.dictionary_path(lang);
        for path in [&det_path, &rec_path, &dict_path] {
            anyhow::ensure!(path.is_file(), "missing model file {}", path.display());
        }
        let dictionary = std::fs::read_to_string(&dict_path)
            .with_context(|| format!("can't read dictionary {}", dict_path.display()))?;

        // ort panics when the onnxruntime shared library can't be loaded
        let (det, rec) = catch_unwind(AssertUnwindSafe(|| {
            anyhow::Ok((
                OnnxModel::load(&self.ort_config, &det_path)?,
                OnnxModel::load(&self.ort_config, &rec_path)?,
            ))
        }))
        .map_err(|_| anyhow::anyhow!("onnxruntime library could not be loaded"))??;

        Ok(Box::new(PaddleOcr {
            det,
            rec,
            decoder: CtcDecoder::from_dictionary(&dictionary),
        }))
    }
}

/// PaddleOCR pipeline: DB text detection followed by CTC line recognition.
#[derive(Debug)]
pub struct PaddleOcr {
    det: OnnxModel,
    rec: OnnxModel,
    decoder: CtcDecoder,
}

impl PaddleOcr {
    pub const NAME: &'static str = "paddle";

    /// Longest side of the detection input.
    pub const DET_MAX_SIDE: u32 = 960;
    const DET_STRIDE: u32 = 32;
    /// Probability above which a pixel counts as text.
    pub const DET_THRESHOLD: f32 = 0.3;
    /// Minimum mean probability inside a candidate box.
    pub const BOX_THRESHOLD: f32 = 0.6;
    pub const UNCLIP_RATIO: f32 = 1.5;
    pub const MIN_BOX_SIDE: f32 = 3.0;

    pub const REC_HEIGHT: u32 = 48;
    const REC_MIN_WIDTH: u32 = 16;
    const REC_MAX_WIDTH: u32 = 3200;
    /// Lines recognized below this score are dropped.
    pub const DROP_SCORE: f32 = 0.5;

    const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
    const STD: [f32; 3] = [0.229, 0.224, 0.225];

    fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<BBox>> {
        let input = detection_input(image);
        let outputs = self.det.session.run(ort::inputs![input]?)?;
        let prob = outputs
            .get(&self.det.output_name)
            .context("can't get the value of detection output")?
            .try_extract_tensor::<f32>()?;
        let prob = prob
            .into_dimensionality::<Ix4>()
            .context("unexpected detection output shape")?;
        Ok(boxes_from_probability_map(
            prob.slice(s![0, 0, .., ..]),
            image.width(),
            image.height(),
        ))
    }

    fn recognize_region(
        &self,
        image: &RgbImage,
        region: &BBox,
    ) -> anyhow::Result<Option<(String, f32)>> {
        let x = region.x0.max(0.0).floor() as u32;
        let y = region.y0.max(0.0).floor() as u32;
        let width = (region.x1.ceil() as u32).min(image.width()).saturating_sub(x);
        let height = (region.y1.ceil() as u32).min(image.height()).saturating_sub(y);
        if width == 0 || height == 0 {
            return Ok(None);
        }
        let mut crop = imageops::crop_imm(image, x, y, width, height).to_image();
        // vertical text lines are read rotated
        if height as f32 / width as f32 >= 1.5 {
            crop = imageops::rotate270(&crop);
        }

        let input = recognition_input(&crop);
        let outputs = self.rec.session.run(ort::inputs![input]?)?;
        let probs = outputs
            .get(&self.rec.output_name)
            .context("can't get the value of recognition output")?
            .try_extract_tensor::<f32>()?;
        let probs = probs
            .into_dimensionality::<Ix3>()
            .context("unexpected recognition output shape")?;

        let steps: Vec<(usize, f32)> = probs
            .index_axis(Axis(0), 0)
            .outer_iter()
            .map(argmax)
            .collect();
        Ok(Some(self.decoder.decode(&steps)))
    }
}

impl OcrEngine for PaddleOcr {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[tracing::instrument(skip_all)]
    fn recognize(&mut self, image: &RgbImage) -> anyhow::Result<Vec<OcrDetection>> {
        let regions = self.detect(image)?;
        tracing::debug!("paddle detected {} text regions", regions.len());

        let mut detections = Vec::with_capacity(regions.len());
        for region in regions {
            let Some((text, confidence)) = self.recognize_region(image, &region)? else {
                continue;
            };
            if text.trim().is_empty() || confidence < Self::DROP_SCORE {
                continue;
            }
            detections.push(OcrDetection {
                polygon: vec![
                    (region.x0, region.y0),
                    (region.x1, region.y0),
                    (region.x1, region.y1),
                    (region.x0, region.y1),
                ],
                text,
                confidence,
            });
        }
        Ok(detections)
    }
}

fn round_to_stride(side: f32) -> u32 {
    ((side / PaddleOcr::DET_STRIDE as f32).round() as u32).max(1) * PaddleOcr::DET_STRIDE
}

/// NCHW tensor, BGR channel order like the models were trained on.
fn detection_input(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let ratio = (PaddleOcr::DET_MAX_SIDE as f32 / width.max(height).max(1) as f32).min(1.0);
    let target_width = round_to_stride(width as f32 * ratio);
    let target_height = round_to_stride(height as f32 * ratio);
    let resized = imageops::resize(image, target_width, target_height, FilterType::Triangle);

    let mut input = Array4::<f32>::zeros((1, 3, target_height as usize, target_width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let bgr = [pixel[2], pixel[1], pixel[0]];
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] =
                (bgr[c] as f32 / 255.0 - PaddleOcr::MEAN[c]) / PaddleOcr::STD[c];
        }
    }
    input
}

fn recognition_input(crop: &RgbImage) -> Array4<f32> {
    let (width, height) = crop.dimensions();
    let target_width = ((PaddleOcr::REC_HEIGHT as f32 * width as f32 / height.max(1) as f32).ceil()
        as u32)
        .clamp(PaddleOcr::REC_MIN_WIDTH, PaddleOcr::REC_MAX_WIDTH);
    let resized = imageops::resize(
        crop,
        target_width,
        PaddleOcr::REC_HEIGHT,
        FilterType::Triangle,
    );

    let mut input = Array4::<f32>::zeros((
        1,
        3,
        PaddleOcr::REC_HEIGHT as usize,
        target_width as usize,
    ));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let bgr = [pixel[2], pixel[1], pixel[0]];
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = (bgr[c] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    input
}

/// Candidate boxes from the DB probability map, in source image pixels.
fn boxes_from_probability_map(prob: ArrayView2<f32>, src_width: u32, src_height: u32) -> Vec<BBox> {
    let (map_height, map_width) = prob.dim();
    if map_height == 0 || map_width == 0 {
        return Vec::new();
    }
    let bitmap = GrayImage::from_fn(map_width as u32, map_height as u32, |x, y| {
        if prob[[y as usize, x as usize]] > PaddleOcr::DET_THRESHOLD {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let scale_x = src_width as f32 / map_width as f32;
    let scale_y = src_height as f32 / map_height as f32;

    let mut boxes = Vec::new();
    for contour in find_contours::<u32>(&bitmap) {
        if !matches!(contour.border_type, BorderType::Outer) {
            continue;
        }
        let Some(mut region) =
            BBox::from_points(contour.points.iter().map(|p| (p.x as f32, p.y as f32)))
        else {
            continue;
        };
        // contour points are pixel positions, the box covers them
        region.x1 += 1.0;
        region.y1 += 1.0;
        if region.width().min(region.height()) < PaddleOcr::MIN_BOX_SIDE {
            continue;
        }
        if box_score(prob, &region) < PaddleOcr::BOX_THRESHOLD {
            continue;
        }
        let region = unclip(&region, PaddleOcr::UNCLIP_RATIO);
        if region.width().min(region.height()) < PaddleOcr::MIN_BOX_SIDE + 2.0 {
            continue;
        }
        boxes.push(BBox {
            x0: (region.x0 * scale_x).clamp(0.0, src_width as f32),
            y0: (region.y0 * scale_y).clamp(0.0, src_height as f32),
            x1: (region.x1 * scale_x).clamp(0.0, src_width as f32),
            y1: (region.y1 * scale_y).clamp(0.0, src_height as f32),
        });
    }
    boxes.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));
    boxes
}

/// Mean probability inside the box.
fn box_score(prob: ArrayView2<f32>, region: &BBox) -> f32 {
    let (height, width) = prob.dim();
    let x0 = (region.x0.max(0.0) as usize).min(width - 1);
    let y0 = (region.y0.max(0.0) as usize).min(height - 1);
    let x1 = (region.x1.max(0.0) as usize).clamp(x0 + 1, width);
    let y1 = (region.y1.max(0.0) as usize).clamp(y0 + 1, height);
    prob.slice(s![y0..y1, x0..x1]).mean().unwrap_or(0.0)
}

/// Grows the box by `area * ratio / perimeter` on every side.
fn unclip(region: &BBox, ratio: f32) -> BBox {
    let perimeter = 2.0 * (region.width() + region.height());
    if perimeter <= 0.0 {
        return region.clone();
    }
    let distance = region.area() * ratio / perimeter;
    BBox {
        x0: region.x0 - distance,
        y0: region.y0 - distance,
        x1: region.x1 + distance,
        y1: region.y1 + distance,
    }
}

fn argmax(row: ArrayView1<f32>) -> (usize, f32) {
    row.iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |best, (idx, p)| if p > best.1 { (idx, p) } else { best })
}

/// Greedy CTC decoding over a PaddleOCR character dictionary.
#[derive(Debug, Clone)]
pub struct CtcDecoder {
    characters: Vec<char>,
}

impl CtcDecoder {
    pub const BLANK_INDEX: usize = 0;

    /// One character per dictionary line, preceded by the blank and followed by a space.
    pub fn from_dictionary(dictionary: &str) -> Self {
        let mut characters = vec!['\0'];
        characters.extend(dictionary.lines().map(|l| l.chars().next().unwrap_or(' ')));
        characters.push(' ');
        Self { characters }
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.len() <= 1
    }

    /// `steps` holds the best class and its probability for every time step.
    /// Repeats collapse, blanks are dropped, confidence is the mean kept probability.
    pub fn decode(&self, steps: &[(usize, f32)]) -> (String, f32) {
        let mut text = String::new();
        let mut kept = Vec::new();
        let mut previous = None;
        for &(idx, prob) in steps {
            if previous == Some(idx) {
                continue;
            }
            previous = Some(idx);
            if idx == Self::BLANK_INDEX {
                continue;
            }
            if let Some(&c) = self.characters.get(idx) {
                text.push(c);
                kept.push(prob);
            }
        }
        let confidence = if kept.is_empty() {
            0.0
        } else {
            kept.iter().sum::<f32>() / kept.len() as f32
        };
        (text, confidence)
    }
}

use std::{collections::HashMap, path::PathBuf, process::Command};

use anyhow::Context;
use image::{ImageFormat, RgbImage};
use itertools::Itertools;
use lazy_static::lazy_static;

use super::{OcrDetection, OcrEngine, OcrEngineFactory};

lazy_static! {
    static ref TESSERACT_LANGS: HashMap<&'static str, &'static str> = HashMap::from([
        ("en", "eng"),
        ("fr", "fra"),
        ("de", "deu"),
        ("es", "spa"),
        ("it", "ita"),
        ("pt", "por"),
        ("nl", "nld"),
        ("ru", "rus"),
        ("ar", "ara"),
        ("ja", "jpn"),
        ("ko", "kor"),
        ("ch", "chi_sim"),
        ("zh", "chi_sim"),
        ("chinese_cht", "chi_tra"),
    ]);
}

/// Tesseract language code for an ISO 639-1 code. Unknown codes pass through.
pub fn tesseract_lang(lang: &str) -> &str {
    TESSERACT_LANGS.get(lang).copied().unwrap_or(lang)
}

#[derive(Debug, Clone)]
pub struct TesseractFactory {
    command: PathBuf,
}

impl TesseractFactory {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

impl OcrEngineFactory for TesseractFactory {
    fn name(&self) -> &'static str {
        Tesseract::NAME
    }

    fn build(&self, lang: &str) -> anyhow::Result<Box<dyn OcrEngine>> {
        let output = Command::new(&self.command)
            .arg("--version")
            .output()
            .with_context(|| format!("can't run {}", self.command.display()))?;
        anyhow::ensure!(
            output.status.success(),
            "{} --version exited with {}",
            self.command.display(),
            output.status
        );
        Ok(Box::new(Tesseract {
            command: self.command.clone(),
            lang: tesseract_lang(lang).to_owned(),
        }))
    }
}

/// Runs the `tesseract` executable on a temporary PNG and reads its TSV output.
#[derive(Debug)]
pub struct Tesseract {
    command: PathBuf,
    lang: String,
}

impl Tesseract {
    pub const NAME: &'static str = "tesseract";
}

impl OcrEngine for Tesseract {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[tracing::instrument(skip_all)]
    fn recognize(&mut self, image: &RgbImage) -> anyhow::Result<Vec<OcrDetection>> {
        let input = tempfile::Builder::new()
            .prefix("docintel-ocr-")
            .suffix(".png")
            .tempfile()?;
        image
            .save_with_format(input.path(), ImageFormat::Png)
            .context("can't write page raster for tesseract")?;

        let output = Command::new(&self.command)
            .arg(input.path())
            .arg("stdout")
            .args(["-l", self.lang.as_str()])
            .arg("tsv")
            .output()
            .with_context(|| format!("can't run {}", self.command.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[derive(Debug)]
struct TsvWord<'a> {
    line_key: (u32, u32, u32, u32),
    left: f32,
    top: f32,
    width: f32,
    height: f32,
    conf: f32,
    text: &'a str,
}

const WORD_LEVEL: u32 = 5;

fn parse_word(row: &str) -> Option<TsvWord<'_>> {
    let cols: Vec<&str> = row.splitn(12, '\t').collect();
    if cols.len() < 12 || cols[0].parse::<u32>().ok()? != WORD_LEVEL {
        return None;
    }
    let num = |i: usize| cols[i].trim().parse::<f32>().ok();
    let key = |i: usize| cols[i].trim().parse::<u32>().ok();
    let text = cols[11].trim();
    let conf = num(10)?;
    if text.is_empty() || conf < 0.0 {
        return None;
    }
    Some(TsvWord {
        line_key: (key(1)?, key(2)?, key(3)?, key(4)?),
        left: num(6)?,
        top: num(7)?,
        width: num(8)?,
        height: num(9)?,
        conf,
        text,
    })
}

/// Groups word rows into one detection per text line.
pub(crate) fn parse_tsv(tsv: &str) -> Vec<OcrDetection> {
    tsv.lines()
        .skip(1)
        .filter_map(parse_word)
        .chunk_by(|word| word.line_key)
        .into_iter()
        .map(|(_, words)| {
            let words: Vec<TsvWord> = words.collect();
            let polygon = words
                .iter()
                .flat_map(|w| [(w.left, w.top), (w.left + w.width, w.top + w.height)])
                .collect();
            let text = words.iter().map(|w| w.text).join(" ");
            let confidence =
                words.iter().map(|w| w.conf).sum::<f32>() / words.len() as f32 / 100.0;
            OcrDetection {
                polygon,
                text,
                confidence,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_groups_lines() {
        let tsv = [
            HEADER,
            "1\t1\t0\t0\t0\t0\t0\t0\t1700\t2200\t-1\t",
            "4\t1\t1\t1\t1\t0\t100\t50\t400\t40\t-1\t",
            "5\t1\t1\t1\t1\t1\t100\t50\t180\t40\t96.5\tHello",
            "5\t1\t1\t1\t1\t2\t300\t52\t200\t38\t91.5\tWorld",
            "5\t1\t1\t1\t2\t1\t100\t120\t90\t30\t80\tSecond",
            "5\t1\t1\t1\t2\t2\t200\t120\t50\t30\t-1\t ",
        ]
        .join("\n");

        let detections = parse_tsv(&tsv);
        assert_eq!(detections.len(), 2);

        assert_eq!(detections[0].text, "Hello World");
        assert!((detections[0].confidence - 0.94).abs() < 1e-6);
        let bbox = crate::entities::BBox::from_points(detections[0].polygon.iter().copied())
            .unwrap();
        assert_eq!(bbox.to_int(), [100, 50, 500, 90]);

        assert_eq!(detections[1].text, "Second");
        assert!((detections[1].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tsv_empty_page() {
        let tsv = format!("{HEADER}\n1\t1\t0\t0\t0\t0\t0\t0\t1700\t2200\t-1\t\n");
        assert!(parse_tsv(&tsv).is_empty());
        assert!(parse_tsv("").is_empty());
    }

    #[test]
    fn test_tesseract_lang() {
        assert_eq!(tesseract_lang("en"), "eng");
        assert_eq!(tesseract_lang("ch"), "chi_sim");
        assert_eq!(tesseract_lang("eng+fra"), "eng+fra");
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let factory = TesseractFactory::new(PathBuf::from("/nonexistent/docintel-tesseract"));
        assert!(factory.build("en").is_err());
    }
}

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::{BoxEncoding, Detection, DetectionResult};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 18.0;
const CAPTION_SCALE: f32 = 24.0;
const CAPTION_MARGIN: u32 = 20;

/// Track rates printed in the frame caption.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RateOverlay {
    pub decoding_fps: f64,
    pub detection_fps: f64,
}

/// Draws detections on frame copies.
///
/// Box outlines are always drawn. Per-box labels and the rate caption need a
/// font; without one they are skipped.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Outlines only.
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Outlines plus text, rendered with the TrueType/OpenType font at `path`.
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| anyhow!("invalid font {}: {}", path.display(), e))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Copy of `image` with every detection outlined and, when a font is
    /// loaded, labelled, plus the rate caption in the bottom-right corner.
    pub fn annotate(&self, image: &RgbImage, detections: &DetectionResult, rates: Option<RateOverlay>) -> RgbImage {
        let mut canvas = image.clone();
        let (width, height) = canvas.dimensions();

        for detection in detections.iter() {
            let Some((x0, y0, x1, y1)) = pixel_rect(detection.bbox, detections.encoding(), width, height) else {
                continue;
            };
            for ring in 0..BOX_THICKNESS {
                let (left, top) = (x0 + ring, y0 + ring);
                let (right, bottom) = (x1.saturating_sub(ring), y1.saturating_sub(ring));
                if right < left || bottom < top {
                    break;
                }
                let rect = Rect::at(left as i32, top as i32).of_size(right - left + 1, bottom - top + 1);
                draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
            }

            if let Some(font) = &self.font {
                let label = detection_label(&detection);
                let scale = PxScale::from(LABEL_SCALE);
                let (_, text_h) = text_size(scale, font, &label);
                let y = y0.saturating_sub(text_h + BOX_THICKNESS);
                draw_text_mut(&mut canvas, BOX_COLOR, x0 as i32, y as i32, scale, font, &label);
            }
        }

        if let (Some(font), Some(rates)) = (&self.font, rates) {
            let caption = rate_caption(detections.len(), rates);
            let scale = PxScale::from(CAPTION_SCALE);
            let (text_w, text_h) = text_size(scale, font, &caption);
            let x = width.saturating_sub(text_w + CAPTION_MARGIN);
            let y = height.saturating_sub(text_h * 2);
            draw_text_mut(&mut canvas, BOX_COLOR, x as i32, y as i32, scale, font, &caption);
        }
        canvas
    }
}

/// Copy of `image` with every detection drawn as a rectangle outline.
pub fn draw_detections(image: &RgbImage, detections: &DetectionResult) -> RgbImage {
    Annotator::new().annotate(image, detections, None)
}

/// `"<name> - <score>%"`, falling back to the label id when unnamed.
pub fn detection_label(detection: &Detection<'_>) -> String {
    let percent = (detection.score * 100.0).round() as i64;
    match detection.name {
        Some(name) => format!("{} - {}%", name, percent),
        None => format!("{} - {}%", detection.label, percent),
    }
}

pub fn rate_caption(boxes: usize, rates: RateOverlay) -> String {
    format!(
        "Boxes: {} - Decoding: {:.1} FPS - Detection: {:.1} FPS",
        boxes, rates.decoding_fps, rates.detection_fps
    )
}

/// Inclusive pixel rectangle `(x0, y0, x1, y1)` clamped to the image, or
/// `None` when the box lies entirely outside it.
fn pixel_rect(bbox: [f32; 4], encoding: BoxEncoding, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if width == 0 || height == 0 || bbox.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let (w, h) = (width as f32, height as f32);
    let [x0, y0, x1, y1] = match encoding {
        BoxEncoding::CenterNormalized => {
            let [cy, cx, bw, bh] = bbox;
            [(cx - bw / 2.0) * w, (cy - bh / 2.0) * h, (cx + bw / 2.0) * w, (cy + bh / 2.0) * h]
        }
        BoxEncoding::CornersPixels => bbox,
    };

    if x1 < 0.0 || y1 < 0.0 || x0 >= w || y0 >= h || x1 < x0 || y1 < y0 {
        return None;
    }
    let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max - 1);
    Some((clamp(x0, width), clamp(y0, height), clamp(x1, width), clamp(y1, height)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, StubBackend};
    use std::collections::BTreeMap;

    #[test]
    fn draws_on_a_copy_only() {
        let image = RgbImage::new(10, 10);
        let mut detections = DetectionResult::empty(BoxEncoding::CornersPixels);
        detections.push([2.0, 2.0, 7.0, 7.0], 0.9, 0);

        let annotated = draw_detections(&image, &detections);

        assert_eq!(annotated.get_pixel(2, 5).0, [0, 255, 0]);
        assert_eq!(annotated.get_pixel(3, 5).0, [0, 255, 0]);
        assert_eq!(annotated.get_pixel(7, 7).0, [0, 255, 0]);
        assert_eq!(annotated.get_pixel(5, 5).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(2, 5).0, [0, 0, 0]);
    }

    #[test]
    fn normalized_boxes_are_scaled_and_clamped() {
        assert_eq!(
            pixel_rect([0.5, 0.5, 0.5, 0.5], BoxEncoding::CenterNormalized, 100, 40),
            Some((25, 10, 75, 30))
        );
        assert_eq!(
            pixel_rect([0.5, 0.95, 0.5, 2.0], BoxEncoding::CenterNormalized, 100, 40),
            Some((70, 0, 99, 39))
        );
        assert_eq!(pixel_rect([120.0, 0.0, 130.0, 5.0], BoxEncoding::CornersPixels, 100, 40), None);
    }

    #[test]
    fn outline_lands_on_the_detected_cell() -> Result<()> {
        // Bright top-right quadrant of an 80x40 frame.
        let mut image = RgbImage::new(80, 40);
        for y in 0..20 {
            for x in 40..80 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let detections = StubBackend::with_grid(2, 2).detect(&image, Some(0.5))?;
        assert_eq!(detections.len(), 1);

        let annotated = draw_detections(&image, &detections);
        let green_in = |xs: std::ops::Range<u32>, ys: std::ops::Range<u32>| {
            ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
                .any(|(x, y)| annotated.get_pixel(x, y).0 == [0, 255, 0])
        };
        assert!(green_in(40..80, 0..20));
        assert!(!green_in(0..40, 21..40));
        Ok(())
    }

    #[test]
    fn labels_use_names_and_rounded_percent() {
        let mut detections =
            DetectionResult::empty(BoxEncoding::CornersPixels).with_names(BTreeMap::from([(1, "dent".to_string())]));
        detections.push([0.0, 0.0, 1.0, 1.0], 0.876, 1);
        detections.push([0.0, 0.0, 1.0, 1.0], 0.5, 4);

        let labels: Vec<String> = detections.iter().map(|d| detection_label(&d)).collect();
        assert_eq!(labels, ["dent - 88%", "4 - 50%"]);
    }

    #[test]
    fn caption_reports_boxes_and_rates() {
        let caption = rate_caption(
            3,
            RateOverlay {
                decoding_fps: 24.96,
                detection_fps: 4.0,
            },
        );
        assert_eq!(caption, "Boxes: 3 - Decoding: 25.0 FPS - Detection: 4.0 FPS");
    }

    #[test]
    fn unreadable_font_is_an_error() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), b"not a font")?;
        assert!(Annotator::with_font_file(file.path()).is_err());
        assert!(!Annotator::new().has_font());
        Ok(())
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 标注渲染: 半透明掩码叠加, 检测模式下额外绘制框和置信度

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rand::Rng;
use std::path::Path;

use super::analysis::FrameAnalysis;
use crate::config::RenderMode;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 3;
const LABEL_SCALE: f32 = 18.0;

/// 内置标签字体 (DejaVu Sans)
static EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/font/DejaVuSans.ttf");

pub struct Renderer {
    mode: RenderMode,
    font: Option<FontArc>,
}

impl Renderer {
    /// font_path 加载失败时退回内置字体
    pub fn new(mode: RenderMode, font_path: Option<&Path>) -> Self {
        let font = font_path
            .and_then(|p| match std::fs::read(p) {
                Ok(bytes) => match FontArc::try_from_vec(bytes) {
                    Ok(font) => Some(font),
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "字体解析失败, 使用内置字体");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "字体加载失败, 使用内置字体");
                    None
                }
            })
            .or_else(|| match FontArc::try_from_slice(EMBEDDED_FONT) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::error!(error = %e, "内置字体解析失败, 标签不绘制文字");
                    None
                }
            });
        Self { mode, font }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// 掩码叠加透明度
    pub fn overlay_alpha(&self) -> f32 {
        match self.mode {
            RenderMode::Segmentation => 0.3,
            RenderMode::Detection => 0.2,
        }
    }

    /// 在帧副本上绘制所有 person 实例
    pub fn annotate(&self, frame: &RgbImage, analysis: &FrameAnalysis) -> RgbImage {
        let mut out = frame.clone();
        let mut rng = rand::thread_rng();
        let alpha = self.overlay_alpha();

        for person in &analysis.persons {
            if let Some(occ) = &person.occupancy {
                let color = [
                    rng.gen_range(50..255u8),
                    rng.gen_range(50..255u8),
                    rng.gen_range(50..255u8),
                ];
                blend_mask(&mut out, occ, color, alpha);
            }
        }

        if self.mode == RenderMode::Detection {
            for person in &analysis.persons {
                self.draw_box(&mut out, person.bbox.xmin(), person.bbox.ymin(), person.bbox.xmax(), person.bbox.ymax());
                self.draw_label(
                    &mut out,
                    person.bbox.xmin() as i32,
                    person.bbox.ymin() as i32,
                    &format!("Person: {:.2}", person.bbox.confidence()),
                );
            }
        }

        out
    }

    fn draw_box(&self, img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32) {
        let (w, h) = img.dimensions();
        let x1 = (x1.max(0.0) as i32).min(w as i32 - 1);
        let y1 = (y1.max(0.0) as i32).min(h as i32 - 1);
        let x2 = (x2.max(0.0) as i32).min(w as i32 - 1);
        let y2 = (y2.max(0.0) as i32).min(h as i32 - 1);
        // 线宽: 逐层内缩
        for t in 0..BOX_THICKNESS {
            let bw = x2 - x1 - 2 * t;
            let bh = y2 - y1 - 2 * t;
            if bw <= 0 || bh <= 0 {
                break;
            }
            let rect = Rect::at(x1 + t, y1 + t).of_size(bw as u32, bh as u32);
            draw_hollow_rect_mut(img, rect, BOX_COLOR);
        }
    }

    fn draw_label(&self, img: &mut RgbImage, x: i32, y: i32, text: &str) {
        let scale = PxScale::from(LABEL_SCALE);
        let (tw, th) = match &self.font {
            Some(font) => text_size(scale, font, text),
            None => ((LABEL_SCALE * 0.6 * text.len() as f32) as u32, LABEL_SCALE as u32),
        };
        let top = (y - th as i32 - 10).max(0);
        let bg = Rect::at(x, top).of_size(tw.max(1), th + 10);
        draw_filled_rect_mut(img, bg, BOX_COLOR);
        if let Some(font) = &self.font {
            draw_text_mut(img, TEXT_COLOR, x, top + 5, scale, font, text);
        }
    }
}

/// 只在占用像素上按 alpha 混合颜色
fn blend_mask(img: &mut RgbImage, occupancy: &[bool], color: [u8; 3], alpha: f32) {
    let beta = 1.0 - alpha;
    for (pixel, occupied) in img.pixels_mut().zip(occupancy) {
        if !*occupied {
            continue;
        }
        for c in 0..3 {
            let v = pixel.0[c] as f32 * beta + color[c] as f32 * alpha;
            pixel.0[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::analysis::PersonRegion;
    use crate::detection::types::Bbox;

    fn analysis_with_mask(w: u32, h: u32, bbox: Bbox) -> FrameAnalysis {
        let mut occ = vec![false; (w * h) as usize];
        occ[0] = true;
        FrameAnalysis {
            persons: vec![PersonRegion {
                bbox,
                occupancy: Some(occ),
            }],
            area: 1,
        }
    }

    #[test]
    fn test_segmentation_only_touches_masked_pixels() {
        let frame = RgbImage::from_pixel(20, 16, Rgb([10, 10, 10]));
        let renderer = Renderer::new(RenderMode::Segmentation, None);
        let out = renderer.annotate(&frame, &analysis_with_mask(20, 16, Bbox::new(2., 2., 10., 8., 0, 0.87)));
        assert_ne!(out.get_pixel(0, 0), &Rgb([10, 10, 10]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([10, 10, 10]));
        // 无框
        assert_eq!(out.get_pixel(2, 2), &Rgb([10, 10, 10]));
    }

    #[test]
    fn test_detection_draws_green_box() {
        let frame = RgbImage::from_pixel(120, 80, Rgb([10, 10, 10]));
        let renderer = Renderer::new(RenderMode::Detection, None);
        let out = renderer.annotate(&frame, &analysis_with_mask(120, 80, Bbox::new(10., 40., 30., 30., 0, 0.87)));
        assert_eq!(out.get_pixel(10, 40), &BOX_COLOR);
        assert_eq!(out.get_pixel(12, 42), &BOX_COLOR);
        assert_eq!(out.get_pixel(15, 45), &Rgb([10, 10, 10]));
    }

    #[test]
    fn test_label_drawn_above_box_without_configured_font() {
        let frame = RgbImage::from_pixel(160, 80, Rgb([10, 10, 10]));
        let renderer = Renderer::new(RenderMode::Detection, None);
        let out = renderer.annotate(&frame, &analysis_with_mask(160, 80, Bbox::new(10., 40., 30., 30., 0, 0.87)));

        // 框上方: 绿色底 + 深色文字
        let mut background = 0;
        let mut glyph = 0;
        for y in 0..40 {
            for x in 10..160 {
                let p = out.get_pixel(x, y);
                if *p == BOX_COLOR {
                    background += 1;
                } else if p.0[1] < 128 && *p != Rgb([10, 10, 10]) {
                    glyph += 1;
                }
            }
        }
        assert!(background > 0);
        assert!(glyph > 0);
        // 框左侧之外不受影响
        assert_eq!(out.get_pixel(5, 20), &Rgb([10, 10, 10]));
    }

    #[test]
    fn test_alpha_per_mode() {
        assert_eq!(Renderer::new(RenderMode::Segmentation, None).overlay_alpha(), 0.3);
        assert_eq!(Renderer::new(RenderMode::Detection, None).overlay_alpha(), 0.2);
    }

    #[test]
    fn test_missing_font_falls_back_to_embedded() {
        let renderer = Renderer::new(RenderMode::Detection, Some(Path::new("/nonexistent/font.ttf")));
        assert!(renderer.font.is_some());
        let frame = RgbImage::new(8, 8);
        let _ = renderer.annotate(&frame, &FrameAnalysis::default());
    }
}

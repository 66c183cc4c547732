// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8-seg ONNX 推理引擎
// 包含: 模型加载、letterbox 预处理、推理、NMS 与掩码后处理

use anyhow::{anyhow, Context, Result};
use image::{imageops, ImageBuffer, Luma, RgbImage};
use ndarray::{s, Array, Array2, Array4, ArrayD, Axis};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::sync::Mutex;

use super::types::{non_max_suppression, Bbox, DetectionResult, Instance, Mask};
use super::InferenceEngine;
use crate::config::ModelConfig;

const CXYWH_OFFSET: usize = 4;
const PAD_VALUE: f32 = 144.0 / 255.0;

/// YOLOv8 实例分割模型
pub struct YoloSegEngine {
    session: Mutex<Session>,
    width: u32,
    height: u32,
    conf: f32,
    iou: f32,
}

impl YoloSegEngine {
    /// 从配置创建模型
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if config.cuda {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build()])?;
        }
        let session = builder
            .commit_from_file(&config.path)
            .with_context(|| format!("failed to load model {}", config.path.display()))?;

        tracing::info!(
            model = %config.path.display(),
            width = config.width,
            height = config.height,
            cuda = config.cuda,
            "分割模型加载成功"
        );

        Ok(Self {
            session: Mutex::new(session),
            width: config.width,
            height: config.height,
            conf: config.conf,
            iou: config.iou,
        })
    }

    fn scale_wh(&self, w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
        let r = (w1 / w0).min(h1 / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    /// letterbox: 等比缩放后贴在左上角, 其余填充灰色
    fn preprocess(&self, frame: &RgbImage) -> Array4<f32> {
        let (w0, h0) = frame.dimensions();
        let (_, w_new, h_new) =
            self.scale_wh(w0 as f32, h0 as f32, self.width as f32, self.height as f32);
        let img = imageops::resize(
            frame,
            (w_new as u32).max(1),
            (h_new as u32).max(1),
            imageops::FilterType::CatmullRom,
        );

        let mut ys = Array::from_elem(
            (1, 3, self.height as usize, self.width as usize),
            PAD_VALUE,
        );
        for (x, y, rgb) in img.enumerate_pixels() {
            let x = x as usize;
            let y = y as usize;
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = (r as f32) / 255.0;
            ys[[0, 1, y, x]] = (g as f32) / 255.0;
            ys[[0, 2, y, x]] = (b as f32) / 255.0;
        }
        ys
    }

    fn infer(&self, input: Array4<f32>) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        let input_tensor = Tensor::from_array(input)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs!["images" => input_tensor])
            .context("inference failed")?;
        let preds = outputs["output0"]
            .try_extract_array::<f32>()
            .context("failed to extract output0")?
            .to_owned();
        let protos = outputs["output1"]
            .try_extract_array::<f32>()
            .context("failed to extract output1")?
            .to_owned();
        Ok((preds, protos))
    }

    fn postprocess(
        &self,
        preds: ArrayD<f32>,
        protos: ArrayD<f32>,
        w0: u32,
        h0: u32,
    ) -> Result<DetectionResult> {
        // protos: [1, nm, mh, mw]
        let proto_shape = protos.shape().to_vec();
        if proto_shape.len() != 4 {
            return Err(anyhow!("unexpected proto shape {:?}", proto_shape));
        }
        let (nm, mh, mw) = (proto_shape[1], proto_shape[2], proto_shape[3]);
        let proto = protos
            .slice(s![0, .., .., ..])
            .to_owned()
            .into_shape_with_order((nm, mh * mw))?;

        // preds: [1, 4 + nc + nm, anchors]
        let anchor = preds.index_axis(Axis(0), 0);
        let channels = anchor.shape()[0];
        if channels <= CXYWH_OFFSET + nm {
            return Err(anyhow!("unexpected prediction shape {:?}", preds.shape()));
        }
        let nc = channels - CXYWH_OFFSET - nm;

        let width_original = w0 as f32;
        let height_original = h0 as f32;
        let ratio =
            (self.width as f32 / width_original).min(self.height as f32 / height_original);

        let mut data: Vec<(Bbox, Vec<f32>)> = Vec::new();
        for pred in anchor.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);
            let Some((id, &confidence)) = clss
                .iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };
            if confidence < self.conf {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let x = cx - w / 2.;
            let y = cy - h / 2.;
            let coefs = pred.slice(s![CXYWH_OFFSET + nc..]).to_vec();
            data.push((
                Bbox::new(
                    x.max(0.0f32).min(width_original),
                    y.max(0.0f32).min(height_original),
                    w,
                    h,
                    id,
                    confidence,
                ),
                coefs,
            ));
        }

        non_max_suppression(&mut data, self.iou);

        let (_, w_mask, h_mask) = self.scale_wh(width_original, height_original, mw as f32, mh as f32);
        let mut instances = Vec::with_capacity(data.len());
        for (bbox, coefs) in data {
            let coefs = Array::from_shape_vec((1, nm), coefs)?;
            let logits = coefs.dot(&proto);
            let probs: Vec<f32> = logits.iter().map(|v| 1.0 / (1.0 + (-v).exp())).collect();

            let mask_im: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(mw as u32, mh as u32, probs)
                    .ok_or_else(|| anyhow!("can not create image from mask"))?;
            let cropped = imageops::crop_imm(
                &mask_im,
                0,
                0,
                (w_mask as u32).clamp(1, mw as u32),
                (h_mask as u32).clamp(1, mh as u32),
            )
            .to_image();
            let resized = imageops::resize(&cropped, w0, h0, imageops::FilterType::Triangle);

            // 框外清零
            let (x1, y1, x2, y2) = (bbox.xmin(), bbox.ymin(), bbox.xmax(), bbox.ymax());
            let mask = Array2::from_shape_fn((h0 as usize, w0 as usize), |(y, x)| {
                let (xf, yf) = (x as f32, y as f32);
                if xf < x1 || xf > x2 || yf < y1 || yf > y2 {
                    0.0
                } else {
                    resized.get_pixel(x as u32, y as u32).0[0]
                }
            });
            instances.push(Instance::new(bbox, Some(Mask::new(mask))));
        }

        Ok(DetectionResult::new(instances))
    }
}

impl InferenceEngine for YoloSegEngine {
    fn predict(&self, frame: &RgbImage) -> Result<Option<DetectionResult>> {
        let (w0, h0) = frame.dimensions();
        if w0 == 0 || h0 == 0 {
            return Ok(None);
        }
        let input = self.preprocess(frame);
        let (preds, protos) = self.infer(input)?;
        let result = self.postprocess(preds, protos, w0, h0)?;
        Ok(if result.is_empty() { None } else { Some(result) })
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use image::{imageops, ImageBuffer, Luma};
use ndarray::Array2;

/// COCO person 类别
pub const PERSON_CLASS: usize = 0;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct DetectionResult {
    // 单帧的实例分割结果
    instances: Vec<Instance>,
}

impl DetectionResult {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self { instances }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// 仅 person 类别的实例
    pub fn persons(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.is_person())
    }
}

/// 一个检测实例: 框 + 可选掩码
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub bbox: Bbox,
    pub mask: Option<Mask>,
}

impl Instance {
    pub fn new(bbox: Bbox, mask: Option<Mask>) -> Self {
        Self { bbox, mask }
    }

    pub fn class_id(&self) -> usize {
        self.bbox.id()
    }

    pub fn confidence(&self) -> f32 {
        self.bbox.confidence()
    }

    pub fn is_person(&self) -> bool {
        self.bbox.id() == PERSON_CLASS
    }
}

/// 掩码占用概率图, 形状为 (height, width), 取值 0..=1
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    data: Array2<f32>,
}

impl Mask {
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let data = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            f(x as u32, y as u32)
        });
        Self { data }
    }

    pub fn width(&self) -> u32 {
        self.data.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.data.nrows() as u32
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// 重采样到指定尺寸 (双线性)
    pub fn resize(&self, width: u32, height: u32) -> ImageBuffer<Luma<f32>, Vec<f32>> {
        let raw: Vec<f32> = self.data.iter().copied().collect();
        let src = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(self.width(), self.height(), raw)
            .unwrap_or_else(|| ImageBuffer::new(self.width(), self.height()));
        if src.dimensions() == (width, height) {
            return src;
        }
        imageops::resize(&src, width, height, imageops::FilterType::Triangle)
    }

    /// 重采样后逐像素判断是否被占用 (> threshold), 行优先
    pub fn occupancy(&self, width: u32, height: u32, threshold: f32) -> Vec<bool> {
        if width == 0 || height == 0 || self.data.is_empty() {
            return vec![false; (width * height) as usize];
        }
        self.resize(width, height)
            .pixels()
            .map(|p| p.0[0] > threshold)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = (self.xmin + self.width).min(another.xmin + another.width);
        let t = self.ymin.max(another.ymin);
        let b = (self.ymin + self.height).min(another.ymin + another.height);
        (r - l + 1.).max(0.) * (b - t + 1.).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        self.intersection_area(another) / self.union(another)
    }
}

/// 按置信度降序的贪心 NMS, 附带数据随框一起保留或丢弃
pub fn non_max_suppression<T>(xs: &mut Vec<(Bbox, T)>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.0.confidence().total_cmp(&b1.0.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].0.iou(&xs[index].0);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

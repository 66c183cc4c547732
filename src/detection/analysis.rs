// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 单帧分析: 是否有人 + 分割面积

use super::types::{Bbox, DetectionResult};

/// 一个 person 实例在帧坐标系下的区域
#[derive(Clone, Debug, PartialEq)]
pub struct PersonRegion {
    pub bbox: Bbox,
    /// 帧尺寸的占用图 (行优先), 无掩码时为 None
    pub occupancy: Option<Vec<bool>>,
}

impl PersonRegion {
    pub fn pixel_count(&self) -> u64 {
        self.occupancy
            .as_ref()
            .map(|occ| occ.iter().filter(|o| **o).count() as u64)
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameAnalysis {
    pub persons: Vec<PersonRegion>,
    /// 所有 person 掩码的占用像素总数
    pub area: u64,
}

impl FrameAnalysis {
    pub fn person_present(&self) -> bool {
        !self.persons.is_empty()
    }
}

/// 从检测结果提取 person 区域; 掩码先缩放到帧尺寸再按阈值二值化
pub fn analyze(
    result: Option<&DetectionResult>,
    width: u32,
    height: u32,
    threshold: f32,
) -> FrameAnalysis {
    let Some(result) = result else {
        return FrameAnalysis::default();
    };

    let persons: Vec<PersonRegion> = result
        .persons()
        .map(|inst| PersonRegion {
            bbox: inst.bbox.clone(),
            occupancy: inst
                .mask
                .as_ref()
                .map(|m| m.occupancy(width, height, threshold)),
        })
        .collect();
    let area = persons.iter().map(PersonRegion::pixel_count).sum();

    FrameAnalysis { persons, area }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{Instance, Mask};

    fn square_mask(w: u32, h: u32, side: u32) -> Mask {
        Mask::from_fn(w, h, |x, y| if x < side && y < side { 0.9 } else { 0.1 })
    }

    #[test]
    fn test_none_is_empty() {
        let a = analyze(None, 64, 48, 0.5);
        assert!(!a.person_present());
        assert_eq!(a.area, 0);
    }

    #[test]
    fn test_area_sums_person_masks_only() {
        let result = DetectionResult::new(vec![
            Instance::new(Bbox::new(0., 0., 4., 4., 0, 0.9), Some(square_mask(16, 12, 4))),
            Instance::new(Bbox::new(0., 0., 3., 3., 0, 0.8), Some(square_mask(16, 12, 3))),
            Instance::new(Bbox::new(0., 0., 8., 8., 5, 0.9), Some(square_mask(16, 12, 8))),
        ]);
        let a = analyze(Some(&result), 16, 12, 0.5);
        assert!(a.person_present());
        assert_eq!(a.persons.len(), 2);
        assert_eq!(a.area, 16 + 9);
    }

    #[test]
    fn test_person_without_mask_has_zero_area() {
        let result = DetectionResult::new(vec![Instance::new(
            Bbox::new(1., 1., 4., 4., 0, 0.7),
            None,
        )]);
        let a = analyze(Some(&result), 16, 12, 0.5);
        assert!(a.person_present());
        assert_eq!(a.area, 0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mask = Mask::from_fn(4, 4, |_, _| 0.5);
        let result = DetectionResult::new(vec![Instance::new(
            Bbox::new(0., 0., 4., 4., 0, 0.9),
            Some(mask),
        )]);
        assert_eq!(analyze(Some(&result), 4, 4, 0.5).area, 0);
    }
}

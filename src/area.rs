// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
//! 跨摄像头分割面积乘积统计

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// 面积统计快照
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AreaStats {
    pub current_product: u64,
    pub camera_areas: BTreeMap<String, u64>,
    pub max_product: u64,
    /// 仅统计非零乘积, 保留一位小数
    pub average_product: f64,
    pub total_calculations: u64,
    pub non_zero_products: u64,
}

#[derive(Debug)]
struct AreaState {
    areas: BTreeMap<String, u64>,
    current_product: u64,
    max_product: u64,
    product_sum: f64,
    non_zero_products: u64,
    total_calculations: u64,
    /// 每个摄像头已关闭的最大会话号, 不大于它的样本被丢弃
    closed_sessions: BTreeMap<String, u64>,
}

impl AreaState {
    fn apply(&mut self, camera_id: &str, area: u64) {
        let Some(slot) = self.areas.get_mut(camera_id) else {
            tracing::warn!(camera_id, "未知摄像头的面积样本, 忽略");
            return;
        };
        *slot = area;

        let product = self
            .areas
            .values()
            .fold(1u64, |acc, a| acc.saturating_mul(*a));
        self.current_product = product;
        self.max_product = self.max_product.max(product);
        if product > 0 {
            self.product_sum += product as f64;
            self.non_zero_products += 1;
        }
        self.total_calculations += 1;

        tracing::trace!(camera_id, area, product, "面积乘积更新");
    }
}

pub struct AreaAggregator {
    state: Mutex<AreaState>,
}

impl AreaAggregator {
    /// 为固定的一组摄像头创建, 初始面积均为 0
    pub fn new<I, S>(camera_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let areas = camera_ids.into_iter().map(|id| (id.into(), 0)).collect();
        Self {
            state: Mutex::new(AreaState {
                areas,
                current_product: 0,
                max_product: 0,
                product_sum: 0.0,
                non_zero_products: 0,
                total_calculations: 0,
                closed_sessions: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AreaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 覆盖该摄像头面积并重算乘积
    pub fn update(&self, camera_id: &str, area: u64) {
        self.lock().apply(camera_id, area);
    }

    /// 带会话号的样本; 会话已关闭时丢弃
    pub fn update_session(&self, camera_id: &str, session: u64, area: u64) {
        let mut state = self.lock();
        if let Some(&closed) = state.closed_sessions.get(camera_id) {
            if session <= closed {
                tracing::trace!(camera_id, session, closed, "已关闭会话的面积样本, 丢弃");
                return;
            }
        }
        state.apply(camera_id, area);
    }

    /// 关闭会话并把面积置零; 之后到达的同会话样本不再生效
    pub fn close_session(&self, camera_id: &str, session: u64) {
        let mut state = self.lock();
        let closed = state.closed_sessions.entry(camera_id.to_string()).or_insert(0);
        *closed = (*closed).max(session);
        state.apply(camera_id, 0);
    }

    pub fn current_product(&self) -> u64 {
        self.lock().current_product
    }

    pub fn current_areas(&self) -> BTreeMap<String, u64> {
        self.lock().areas.clone()
    }

    pub fn snapshot(&self) -> AreaStats {
        let state = self.lock();
        let average = if state.non_zero_products > 0 {
            state.product_sum / state.non_zero_products as f64
        } else {
            0.0
        };
        AreaStats {
            current_product: state.current_product,
            camera_areas: state.areas.clone(),
            max_product: state.max_product,
            average_product: (average * 10.0).round() / 10.0,
            total_calculations: state.total_calculations,
            non_zero_products: state.non_zero_products,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_and_zero_excluded_from_average() {
        let agg = AreaAggregator::new(["camera1", "camera2"]);
        agg.update("camera1", 6);
        assert_eq!(agg.current_product(), 0);
        agg.update("camera2", 7);
        assert_eq!(agg.current_product(), 42);

        let before = agg.snapshot();
        assert_eq!(before.average_product, 42.0);
        assert_eq!(before.max_product, 42);
        assert_eq!(before.total_calculations, 2);

        agg.update("camera1", 0);
        let after = agg.snapshot();
        assert_eq!(agg.current_product(), 0);
        assert_eq!(after.average_product, before.average_product);
        assert_eq!(after.max_product, 42);
        assert_eq!(after.total_calculations, 3);
        assert_eq!(after.non_zero_products, 1);
    }

    #[test]
    fn test_average_rounded() {
        let agg = AreaAggregator::new(["a", "b"]);
        agg.update("a", 1);
        agg.update("b", 1);
        agg.update("b", 2);
        agg.update("b", 2);
        // (1 + 2 + 2) / 3
        assert_eq!(agg.snapshot().average_product, 1.7);
    }

    #[test]
    fn test_unknown_camera_ignored() {
        let agg = AreaAggregator::new(["camera1", "camera2"]);
        agg.update("camera9", 100);
        let stats = agg.snapshot();
        assert_eq!(stats.total_calculations, 0);
        assert_eq!(agg.current_areas().len(), 2);
    }

    #[test]
    fn test_closed_session_samples_are_dropped() {
        let agg = AreaAggregator::new(["camera1", "camera2"]);
        agg.update_session("camera1", 1, 10);
        agg.update_session("camera2", 1, 10);
        assert_eq!(agg.current_product(), 100);

        agg.close_session("camera1", 1);
        assert_eq!(agg.current_product(), 0);
        // 断开前排队的样本晚到
        agg.update_session("camera1", 1, 10);
        assert_eq!(agg.current_areas().get("camera1"), Some(&0));
        assert_eq!(agg.current_product(), 0);

        // 新会话正常生效
        agg.update_session("camera1", 2, 3);
        assert_eq!(agg.current_product(), 30);
        // 其他摄像头不受影响
        agg.update_session("camera2", 1, 4);
        assert_eq!(agg.current_product(), 12);
    }

    #[test]
    fn test_reads_have_no_side_effects() {
        let agg = AreaAggregator::new(["camera1", "camera2"]);
        agg.update("camera1", 3);
        let a = agg.snapshot();
        let _ = agg.current_product();
        let _ = agg.current_areas();
        assert_eq!(agg.snapshot(), a);
        assert_eq!(agg.current_areas().get("camera1"), Some(&3));
    }
}

// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 告警生命周期管理
//
// 三个目录 (pending/correct/incorrect) 是持久化状态, 内存中保存它们的索引,
// 写入时同步落盘, 只在启动时重新扫描。

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Timelike};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::AlarmConfig;
use crate::error::AlarmError;

/// alarm_{camera}_{YYYYMMDD}_{HHMMSS}_{id}.jpg
static FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^alarm_([^_]+)_([^_]+)_([^_]+)_([^_.]+)\.jpg$").expect("valid alarm filename regex")
});

const STATS_FILE: &str = "statistics.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Pending,
    Correct,
    Incorrect,
}

impl AlarmState {
    pub fn dir_name(&self) -> &'static str {
        match self {
            AlarmState::Pending => "pending",
            AlarmState::Correct => "correct",
            AlarmState::Incorrect => "incorrect",
        }
    }

    fn from_verdict(is_correct: bool) -> Self {
        if is_correct {
            AlarmState::Correct
        } else {
            AlarmState::Incorrect
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alarm {
    pub id: String,
    pub camera_id: String,
    pub created_at: DateTime<Local>,
    pub filename: String,
    pub path: PathBuf,
    pub state: AlarmState,
    pub evaluated_at: Option<DateTime<Local>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlarmStatistics {
    pub total_alarms: usize,
    pub pending_alarms: usize,
    pub correct_alarms: usize,
    pub incorrect_alarms: usize,
    pub evaluation_percentage: f64,
    pub accuracy_percentage: f64,
}

impl AlarmStatistics {
    pub fn from_counts(pending: usize, correct: usize, incorrect: usize) -> Self {
        let evaluated = correct + incorrect;
        let total = pending + evaluated;
        let evaluation_percentage = if total > 0 {
            evaluated as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let accuracy_percentage = if evaluated > 0 {
            correct as f64 / evaluated as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_alarms: total,
            pending_alarms: pending,
            correct_alarms: correct,
            incorrect_alarms: incorrect,
            evaluation_percentage: round1(evaluation_percentage),
            accuracy_percentage: round1(accuracy_percentage),
        }
    }
}

#[derive(Serialize)]
struct StatisticsDocument<'a> {
    #[serde(flatten)]
    stats: &'a AlarmStatistics,
    last_updated: String,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// 三个集合的快照, 均为新到旧
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlarmCollections {
    pub pending: Vec<Alarm>,
    pub correct: Vec<Alarm>,
    pub incorrect: Vec<Alarm>,
}

#[derive(Default)]
struct AlarmBook {
    // 队首最新
    pending: VecDeque<Alarm>,
    correct: VecDeque<Alarm>,
    incorrect: VecDeque<Alarm>,
    last_alarm: HashMap<String, DateTime<Local>>,
    in_flight: HashSet<String>,
}

impl AlarmBook {
    fn statistics(&self) -> AlarmStatistics {
        AlarmStatistics::from_counts(self.pending.len(), self.correct.len(), self.incorrect.len())
    }

    fn category_mut(&mut self, state: AlarmState) -> &mut VecDeque<Alarm> {
        match state {
            AlarmState::Pending => &mut self.pending,
            AlarmState::Correct => &mut self.correct,
            AlarmState::Incorrect => &mut self.incorrect,
        }
    }

    /// 淘汰超出容量的最旧记录, 跳过正在评估的
    fn evict_pending(&mut self, capacity: usize) -> Vec<Alarm> {
        let mut evicted = Vec::new();
        while self.pending.len() > capacity {
            let Some(idx) = self
                .pending
                .iter()
                .rposition(|a| !self.in_flight.contains(&a.id))
            else {
                break;
            };
            if let Some(alarm) = self.pending.remove(idx) {
                evicted.push(alarm);
            }
        }
        evicted
    }
}

fn evict_oldest(list: &mut VecDeque<Alarm>, capacity: usize) -> Vec<Alarm> {
    let mut evicted = Vec::new();
    while list.len() > capacity {
        match list.pop_back() {
            Some(alarm) => evicted.push(alarm),
            None => break,
        }
    }
    evicted
}

pub struct AlarmManager {
    root: PathBuf,
    cooldown: chrono::Duration,
    max_pending: usize,
    max_per_category: usize,
    jpeg_quality: u8,
    book: Mutex<AlarmBook>,
    // 串行化 statistics.json 写入
    stats_lock: Mutex<()>,
}

impl AlarmManager {
    /// 创建目录并从目录内容重建三个集合
    pub fn open(config: &AlarmConfig) -> Result<Self, AlarmError> {
        let root = config.dir.clone();
        for state in [AlarmState::Pending, AlarmState::Correct, AlarmState::Incorrect] {
            let dir = root.join(state.dir_name());
            fs::create_dir_all(&dir).map_err(|e| AlarmError::io(&dir, e))?;
        }

        let manager = Self {
            root,
            cooldown: chrono::Duration::milliseconds(config.cooldown().as_millis() as i64),
            max_pending: config.max_pending,
            max_per_category: config.max_per_category,
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            book: Mutex::new(AlarmBook::default()),
            stats_lock: Mutex::new(()),
        };
        manager.reload();
        Ok(manager)
    }

    pub fn dir(&self, state: AlarmState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    pub fn statistics_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    fn lock(&self) -> MutexGuard<'_, AlarmBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========== 启动重建 ==========

    /// 启动时扫描目录; 任何目录错误都会重置为三个空集合.
    /// 只在 open 中调用, 运行期调用会丢失评估中的占位
    fn reload(&self) {
        let loaded = match self.scan_all() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "告警目录扫描失败, 重置为空");
                AlarmCollections::default()
            }
        };
        let (pending, correct, incorrect) = self.reconcile(loaded);

        let evicted = {
            let mut book = self.lock();
            book.pending = pending.into();
            book.correct = correct.into();
            book.incorrect = incorrect.into();
            book.in_flight.clear();

            let mut evicted = evict_oldest(&mut book.pending, self.max_pending);
            evicted.extend(evict_oldest(&mut book.correct, self.max_per_category));
            evicted.extend(evict_oldest(&mut book.incorrect, self.max_per_category));

            tracing::info!(
                pending = book.pending.len(),
                correct = book.correct.len(),
                incorrect = book.incorrect.len(),
                "告警已从目录加载"
            );
            evicted
        };
        self.remove_files(&evicted);
        self.persist_statistics();
    }

    fn scan_all(&self) -> Result<AlarmCollections, AlarmError> {
        Ok(AlarmCollections {
            pending: self.scan_dir(AlarmState::Pending)?,
            correct: self.scan_dir(AlarmState::Correct)?,
            incorrect: self.scan_dir(AlarmState::Incorrect)?,
        })
    }

    fn scan_dir(&self, state: AlarmState) -> Result<Vec<Alarm>, AlarmError> {
        let dir = self.dir(state);
        let entries = fs::read_dir(&dir).map_err(|e| AlarmError::io(&dir, e))?;

        let mut alarms = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AlarmError::io(&dir, e))?;
            let path = entry.path();
            let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(caps) = FILENAME_RE.captures(&filename) else {
                continue;
            };

            let stamp = format!("{}_{}", &caps[2], &caps[3]);
            let created_at = match NaiveDateTime::parse_from_str(&stamp, "%Y%m%d_%H%M%S")
                .ok()
                .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            {
                Some(t) => t,
                None => match entry.metadata().and_then(|m| m.modified()) {
                    Ok(mtime) => truncate_secs(DateTime::<Local>::from(mtime)),
                    Err(e) => {
                        tracing::warn!(file = %filename, error = %e, "无法读取文件时间, 跳过");
                        continue;
                    }
                },
            };

            alarms.push(Alarm {
                id: caps[4].to_string(),
                camera_id: caps[1].to_string(),
                created_at,
                filename,
                path,
                state,
                evaluated_at: None,
            });
        }

        alarms.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(alarms)
    }

    /// 同一编号出现在多个目录时: correct > incorrect > pending;
    /// pending 中的残留副本 (移动中断) 会被删除
    fn reconcile(&self, loaded: AlarmCollections) -> (Vec<Alarm>, Vec<Alarm>, Vec<Alarm>) {
        fn keep(list: Vec<Alarm>, seen: &mut HashSet<String>) -> (Vec<Alarm>, Vec<Alarm>) {
            list.into_iter().partition(|a| seen.insert(a.id.clone()))
        }

        let mut seen: HashSet<String> = HashSet::new();
        let (correct, _) = keep(loaded.correct, &mut seen);
        let (incorrect, dup_incorrect) = keep(loaded.incorrect, &mut seen);
        let (pending, dup_pending) = keep(loaded.pending, &mut seen);

        for alarm in &dup_incorrect {
            tracing::warn!(file = %alarm.filename, "告警同时存在于 correct 和 incorrect, 以 correct 为准");
        }
        for alarm in &dup_pending {
            tracing::warn!(file = %alarm.filename, "删除已评估告警的残留副本");
            if let Err(e) = fs::remove_file(&alarm.path) {
                tracing::warn!(file = %alarm.filename, error = %e, "删除残留副本失败");
            }
        }
        (pending, correct, incorrect)
    }

    // ========== 创建 ==========

    pub fn create(&self, camera_id: &str, frame: &RgbImage) -> bool {
        self.create_at(camera_id, frame, Local::now())
    }

    /// 冷却期内返回 false 且无副作用; 图片写入失败时回滚冷却时间
    pub fn create_at(&self, camera_id: &str, frame: &RgbImage, now: DateTime<Local>) -> bool {
        if let Err(e) = validate_camera_id(camera_id) {
            tracing::warn!(error = %e, "拒绝创建告警");
            return false;
        }
        // 冷却按精确时间比较, 文件名和 created_at 只保留到秒
        let created_at = truncate_secs(now);

        // 1. 冷却检查并占位
        let previous = {
            let mut book = self.lock();
            let previous = book.last_alarm.get(camera_id).copied();
            if let Some(last) = previous {
                if now.signed_duration_since(last) < self.cooldown {
                    tracing::trace!(camera_id, "告警冷却中");
                    return false;
                }
            }
            book.last_alarm.insert(camera_id.to_string(), now);
            previous
        };

        // 2. 写图片
        let id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let filename = format!(
            "alarm_{}_{}_{}.jpg",
            camera_id,
            created_at.format("%Y%m%d_%H%M%S"),
            id
        );
        let path = self.dir(AlarmState::Pending).join(&filename);
        if let Err(e) = self.write_jpeg(&path, frame) {
            tracing::error!(camera_id, file = %filename, error = %e, "告警图片保存失败");
            let _ = fs::remove_file(&path);
            let mut book = self.lock();
            if book.last_alarm.get(camera_id) == Some(&now) {
                match previous {
                    Some(prev) => book.last_alarm.insert(camera_id.to_string(), prev),
                    None => book.last_alarm.remove(camera_id),
                };
            }
            return false;
        }

        // 3. 入队并淘汰
        let alarm = Alarm {
            id,
            camera_id: camera_id.to_string(),
            created_at,
            filename,
            path,
            state: AlarmState::Pending,
            evaluated_at: None,
        };
        tracing::info!(camera_id, alarm_id = %alarm.id, file = %alarm.filename, "新告警");
        let evicted = {
            let mut book = self.lock();
            book.pending.push_front(alarm);
            book.evict_pending(self.max_pending)
        };

        self.remove_files(&evicted);
        self.persist_statistics();
        true
    }

    fn write_jpeg(&self, path: &Path, frame: &RgbImage) -> Result<(), AlarmError> {
        let file = fs::File::create(path).map_err(|e| AlarmError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.jpeg_quality).encode_image(frame)?;
        writer.flush().map_err(|e| AlarmError::io(path, e))?;
        drop(writer);

        if !path.is_file() {
            return Err(AlarmError::NotWritten(path.to_path_buf()));
        }
        Ok(())
    }

    // ========== 评估 ==========

    pub fn evaluate(&self, alarm_id: &str, is_correct: bool) -> bool {
        self.evaluate_at(alarm_id, is_correct, Local::now())
    }

    /// 文件移动成功后才提交内存状态; 移动失败时记录保持 pending 不变
    pub fn evaluate_at(&self, alarm_id: &str, is_correct: bool, now: DateTime<Local>) -> bool {
        let target = AlarmState::from_verdict(is_correct);

        // 1. 标记为评估中
        let alarm = {
            let mut book = self.lock();
            if book.in_flight.contains(alarm_id) {
                tracing::warn!(alarm_id, "告警正在评估中");
                return false;
            }
            let Some(alarm) = book.pending.iter().find(|a| a.id == alarm_id).cloned() else {
                tracing::warn!(alarm_id, "未找到待评估告警");
                return false;
            };
            book.in_flight.insert(alarm_id.to_string());
            alarm
        };

        // 2. 移动文件
        let dest = self.dir(target).join(&alarm.filename);
        if let Err(e) = move_file(&alarm.path, &dest) {
            tracing::error!(alarm_id, file = %alarm.filename, error = %e, "移动告警图片失败");
            self.lock().in_flight.remove(alarm_id);
            return false;
        }

        // 3. 提交
        let evicted = {
            let mut book = self.lock();
            book.in_flight.remove(alarm_id);
            if let Some(idx) = book.pending.iter().position(|a| a.id == alarm_id) {
                book.pending.remove(idx);
            }
            let evaluated = Alarm {
                path: dest,
                state: target,
                evaluated_at: Some(now),
                ..alarm
            };
            let list = book.category_mut(target);
            list.push_front(evaluated);
            evict_oldest(list, self.max_per_category)
        };
        tracing::info!(alarm_id, verdict = target.dir_name(), "告警已评估");

        self.remove_files(&evicted);
        self.persist_statistics();
        true
    }

    // ========== 查询 ==========

    /// 最新的 limit 个待评估告警 (仅文件存在的), 以及待评估总数
    pub fn list_pending(&self, limit: usize) -> (Vec<Alarm>, usize) {
        let (snapshot, total) = {
            let book = self.lock();
            (book.pending.iter().cloned().collect::<Vec<_>>(), book.pending.len())
        };
        let page = snapshot
            .into_iter()
            .filter(|a| a.path.is_file())
            .take(limit)
            .collect();
        (page, total)
    }

    pub fn get(&self, alarm_id: &str) -> Option<Alarm> {
        let book = self.lock();
        book.pending
            .iter()
            .chain(book.correct.iter())
            .chain(book.incorrect.iter())
            .find(|a| a.id == alarm_id)
            .cloned()
    }

    pub fn collections(&self) -> AlarmCollections {
        let book = self.lock();
        AlarmCollections {
            pending: book.pending.iter().cloned().collect(),
            correct: book.correct.iter().cloned().collect(),
            incorrect: book.incorrect.iter().cloned().collect(),
        }
    }

    pub fn statistics(&self) -> AlarmStatistics {
        self.lock().statistics()
    }

    /// 按文件名依次在 pending → correct → incorrect 中查找图片
    pub fn find_image(&self, filename: &str) -> Option<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return None;
        }
        [AlarmState::Pending, AlarmState::Correct, AlarmState::Incorrect]
            .iter()
            .map(|s| self.dir(*s).join(filename))
            .find(|p| p.is_file())
    }

    // ========== 持久化 ==========

    /// 写入 statistics.json (先写临时文件再重命名)
    pub fn save_statistics(&self) -> Result<(), AlarmError> {
        let _guard = self.stats_lock.lock().unwrap_or_else(|e| e.into_inner());
        let stats = self.statistics();
        let doc = StatisticsDocument {
            stats: &stats,
            last_updated: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let path = self.statistics_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| AlarmError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| AlarmError::io(&path, e))?;
        Ok(())
    }

    fn persist_statistics(&self) {
        if let Err(e) = self.save_statistics() {
            tracing::error!(error = %e, "保存告警统计失败");
        }
    }

    fn remove_files(&self, evicted: &[Alarm]) {
        for alarm in evicted {
            match fs::remove_file(&alarm.path) {
                Ok(()) => tracing::debug!(file = %alarm.filename, state = alarm.state.dir_name(), "淘汰旧告警"),
                Err(e) => tracing::warn!(file = %alarm.filename, error = %e, "淘汰告警时删除文件失败"),
            }
        }
    }
}

fn validate_camera_id(camera_id: &str) -> Result<(), AlarmError> {
    let bad = camera_id.is_empty()
        || camera_id
            .chars()
            .any(|c| c == '_' || c == '/' || c == '\\' || c.is_whitespace());
    if bad {
        return Err(AlarmError::InvalidCamera(camera_id.to_string()));
    }
    Ok(())
}

fn truncate_secs(t: DateTime<Local>) -> DateTime<Local> {
    t.with_nanosecond(0).unwrap_or(t)
}

/// rename, 跨设备时退化为 copy + remove
fn move_file(src: &Path, dst: &Path) -> Result<(), AlarmError> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(|e| AlarmError::io(src, e))?;
    if let Err(e) = fs::remove_file(src) {
        let _ = fs::remove_file(dst);
        return Err(AlarmError::io(src, e));
    }
    Ok(())
}

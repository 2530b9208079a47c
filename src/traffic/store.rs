//! 流量账本存储与异步监控服务

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::decoder::{Decoded, decode_line};
use super::model::{PendingMeta, TransactionRecord};

/// 有界流量账本（同步核心，所有变更经由唯一逻辑写入者）
///
/// 账本按 Entry 到达顺序存放记录，配套两个交叉索引：
/// id → 位置（O(1) 查找与原地更新）、关联键 → 最新记录 id（迟到元数据
/// 定向合并）。超出容量时从头部 FIFO 淘汰并重建位置索引
pub struct TrafficLogStore {
    records: Vec<TransactionRecord>,
    pending_meta_by_key: HashMap<String, PendingMeta>,
    latest_id_by_key: HashMap<String, Uuid>,
    index_by_id: HashMap<Uuid, usize>,
    capacity: usize,
    ignored_lines: u64,
}

impl TrafficLogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            pending_meta_by_key: HashMap::new(),
            latest_id_by_key: HashMap::new(),
            index_by_id: HashMap::new(),
            capacity: capacity.max(1),
            ignored_lines: 0,
        }
    }

    /// 摄入一行原始日志，返回可见状态是否发生变化
    ///
    /// 畸形行静默丢弃并计数，摄入路径本身永不失败
    pub fn ingest(&mut self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        match decode_line(trimmed) {
            Decoded::Entry(record) => {
                self.append_entry(*record);
                true
            }
            Decoded::Metadata { key, meta } => self.apply_meta(&key, meta),
            Decoded::Ignore => {
                self.ignored_lines += 1;
                false
            }
        }
    }

    /// 批量摄入：严格保持行序，不合并不丢弃中间更新，
    /// 聚合为单个"是否有变化"信号供上游节流重绘
    pub fn ingest_batch<I, S>(&mut self, lines: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut changed = false;
        for line in lines {
            changed |= self.ingest(line.as_ref());
        }
        changed
    }

    /// O(1) 按 id 查找；淘汰后的 id 返回 None，这是正常结果而非错误
    pub fn record_by_id(&self, id: Uuid) -> Option<&TransactionRecord> {
        self.index_by_id.get(&id).map(|&index| &self.records[index])
    }

    /// 按到达顺序的全部记录
    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 被丢弃的畸形/未识别行计数
    pub fn ignored_lines(&self) -> u64 {
        self.ignored_lines
    }

    /// 清空账本、待定缓冲与全部索引；之前的所有 id 一并失效
    pub fn clear(&mut self) {
        self.records.clear();
        self.pending_meta_by_key.clear();
        self.latest_id_by_key.clear();
        self.index_by_id.clear();
    }

    fn append_entry(&mut self, mut record: TransactionRecord) {
        // 早于 Entry 到达的元数据在此一次性消费
        if let Some(pending) = self.pending_meta_by_key.remove(&record.correlation_key) {
            pending.apply_to(&mut record);
        }

        let id = record.id;
        let key = record.correlation_key.clone();
        self.records.push(record);
        // 同键重复物化时，最近一次胜出
        self.latest_id_by_key.insert(key, id);
        self.index_by_id.insert(id, self.records.len() - 1);

        if self.records.len() > self.capacity {
            self.evict_overflow();
        }
    }

    /// FIFO 淘汰最旧记录；被淘汰的 id 从所有索引中移除，
    /// 位置索引整体重建（淘汰相对追加低频，O(n) 可接受）
    fn evict_overflow(&mut self) {
        let overflow = self.records.len() - self.capacity;
        let removed: HashSet<Uuid> = self
            .records
            .drain(..overflow)
            .map(|record| record.id)
            .collect();
        self.latest_id_by_key.retain(|_, id| !removed.contains(id));
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.index_by_id = self
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.id, index))
            .collect();
    }

    /// 合并元数据：命中已物化记录则原地更新并返回 true；
    /// 否则累积到待定缓冲返回 false。空元数据不分配缓冲条目
    fn apply_meta(&mut self, key: &str, meta: PendingMeta) -> bool {
        if meta.is_empty() {
            return false;
        }

        if let Some(&index) = self
            .latest_id_by_key
            .get(key)
            .and_then(|id| self.index_by_id.get(id))
        {
            meta.apply_to(&mut self.records[index]);
            return true;
        }

        self.pending_meta_by_key
            .entry(key.to_string())
            .or_default()
            .merge(meta);
        false
    }
}

/// 异步流量监控服务（公开 API）
///
/// 引擎输出行经有界通道交接到唯一写入任务分批摄入，满足单写者模型；
/// 慢消费或暂停的读端不会反压阻塞引擎的输出管道
pub struct TrafficMonitor {
    sender: mpsc::Sender<String>,
    store: Arc<RwLock<TrafficLogStore>>,
}

impl TrafficMonitor {
    /// 创建监控服务并启动后台摄入任务
    pub fn new(capacity: usize, channel_capacity: usize) -> Self {
        let store = Arc::new(RwLock::new(TrafficLogStore::new(capacity)));
        let (sender, mut receiver) = mpsc::channel::<String>(channel_capacity.max(1));

        let ingest_store = store.clone();
        tokio::spawn(async move {
            while let Some(first) = receiver.recv().await {
                // 将当前可取的行聚成一批，一次写锁内按序摄入
                let mut batch = vec![first];
                while let Ok(line) = receiver.try_recv() {
                    batch.push(line);
                    if batch.len() >= 500 {
                        break;
                    }
                }
                let changed = ingest_store.write().ingest_batch(&batch);
                if changed {
                    tracing::trace!(lines = batch.len(), "流量账本已更新");
                }
            }
        });

        Self { sender, store }
    }

    /// 非阻塞摄入一行（发送到通道，通道满时丢弃该行）
    pub fn ingest_line(&self, line: String) {
        if self.sender.try_send(line).is_err() {
            tracing::warn!("流量事件通道已满，丢弃日志行");
        }
    }

    /// 按到达顺序的只读快照
    pub fn snapshot(&self) -> Vec<TransactionRecord> {
        self.store.read().records().to_vec()
    }

    /// O(1) 按 id 查询，供调用方在每帧校验所持选中项是否仍有效
    pub fn record(&self, id: Uuid) -> Option<TransactionRecord> {
        self.store.read().record_by_id(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    pub fn ignored_lines(&self) -> u64 {
        self.store.read().ignored_lines()
    }

    /// 清空账本；随时可调用，之后所有旧 id 查询均返回 None
    pub fn clear(&self) {
        self.store.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde_json::{Value, json};

    fn marked(payload: &Value) -> String {
        format!("PREFIX CRAB_JSON {payload}")
    }

    fn entry_line(request_id: &str, url: &str) -> String {
        marked(&json!({
            "type": "entry", "event": "upstream",
            "method": "GET", "url": url,
            "request_id": request_id
        }))
    }

    #[test]
    fn test_entry_materializes_record() {
        let mut store = TrafficLogStore::new(800);
        let changed = store.ingest(&entry_line("r1", "https://a.test/"));

        assert!(changed);
        assert_eq!(store.len(), 1);
        let record = &store.records()[0];
        assert_eq!(record.method, "GET");
        assert_eq!(record.correlation_key, "id|r1");
        assert!(record.request_headers.is_none());
    }

    #[test]
    fn test_meta_after_entry_updates_in_place() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&entry_line("r1", "https://a.test/"));
        let id = store.records()[0].id;

        let changed = store.ingest(&marked(&json!({
            "type": "meta", "event": "request_headers",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/",
            "request_id": "r1",
            "headers_b64": BASE64.encode("Host: a.test")
        })));

        assert!(changed);
        assert_eq!(store.len(), 1);
        let record = store.record_by_id(id).expect("id 应保持稳定");
        assert_eq!(record.id, id);
        assert_eq!(record.request_headers.as_deref(), Some("Host: a.test"));
    }

    #[test]
    fn test_meta_before_entry_buffers_then_attaches() {
        let mut store = TrafficLogStore::new(800);

        // Entry 未到，元数据只累积，无可见变化
        let changed = store.ingest(&marked(&json!({
            "type": "meta", "event": "request_headers",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/",
            "request_id": "r1",
            "headers_b64": BASE64.encode("Host: a.test")
        })));
        assert!(!changed);
        assert!(store.is_empty());

        // Entry 到达时，物化记录已带上缓冲中的头部
        let changed = store.ingest(&entry_line("r1", "https://a.test/"));
        assert!(changed);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.records()[0].request_headers.as_deref(),
            Some("Host: a.test")
        );
    }

    #[test]
    fn test_request_id_overrides_tuple_drift() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&marked(&json!({
            "type": "entry", "event": "upstream",
            "method": "GET", "url": "https://a.test/",
            "peer": "9.9.9.9:9", "request_id": "abc"
        })));

        // 元数据中 peer/method 文本不同也不影响按 request_id 定位
        let changed = store.ingest(&marked(&json!({
            "type": "meta", "event": "response_headers",
            "peer": "1.1.1.1:1", "method": "POST", "url": "https://other.test/",
            "request_id": "abc",
            "headers_b64": BASE64.encode("Server: crab")
        })));

        assert!(changed);
        assert_eq!(
            store.records()[0].response_headers.as_deref(),
            Some("Server: crab")
        );
    }

    #[test]
    fn test_meta_only_touches_target_record() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&entry_line("r1", "https://a.test/"));
        store.ingest(&entry_line("r2", "https://b.test/"));

        store.ingest(&marked(&json!({
            "type": "meta", "event": "response_headers",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://b.test/",
            "request_id": "r2",
            "headers_b64": BASE64.encode("Server: crab")
        })));

        assert!(store.records()[0].response_headers.is_none());
        assert_eq!(
            store.records()[1].response_headers.as_deref(),
            Some("Server: crab")
        );
    }

    #[test]
    fn test_malformed_line_is_idempotent_ignore() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&entry_line("r1", "https://a.test/"));
        let before: Vec<Uuid> = store.records().iter().map(|r| r.id).collect();

        for _ in 0..5 {
            assert!(!store.ingest("CRAB_JSON {broken"));
            assert!(!store.ingest("plain text line"));
            assert!(!store.ingest("   "));
        }

        let after: Vec<Uuid> = store.records().iter().map(|r| r.id).collect();
        assert_eq!(before, after);
        assert_eq!(store.ignored_lines(), 10); // 空白行不计数
    }

    #[test]
    fn test_order_preserved() {
        let mut store = TrafficLogStore::new(800);
        for index in 0..3 {
            store.ingest(&entry_line(
                &format!("r{index}"),
                &format!("https://a.test/{index}"),
            ));
        }
        let urls: Vec<&str> = store.records().iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://a.test/0", "https://a.test/1", "https://a.test/2"]
        );
    }

    #[test]
    fn test_capacity_eviction_is_fifo() {
        let mut store = TrafficLogStore::new(3);
        for index in 0..5 {
            store.ingest(&entry_line(
                &format!("r{index}"),
                &format!("https://a.test/{index}"),
            ));
        }

        assert_eq!(store.len(), 3);
        let urls: Vec<&str> = store.records().iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://a.test/2", "https://a.test/3", "https://a.test/4"]
        );
    }

    #[test]
    fn test_evicted_id_no_longer_resolvable() {
        let mut store = TrafficLogStore::new(2);
        store.ingest(&entry_line("r0", "https://a.test/0"));
        let evicted = store.records()[0].id;
        store.ingest(&entry_line("r1", "https://a.test/1"));
        store.ingest(&entry_line("r2", "https://a.test/2"));

        assert!(store.record_by_id(evicted).is_none());
        // 存活记录的索引在淘汰重建后仍然正确
        for record in store.records().to_vec() {
            assert_eq!(store.record_by_id(record.id).unwrap().url, record.url);
        }
    }

    #[test]
    fn test_meta_for_evicted_key_is_dropped() {
        let mut store = TrafficLogStore::new(1);
        store.ingest(&entry_line("r0", "https://a.test/0"));
        store.ingest(&entry_line("r1", "https://a.test/1"));

        // r0 已被淘汰，键成为孤儿，迟到元数据静默丢弃到待定缓冲
        let changed = store.ingest(&marked(&json!({
            "type": "meta", "event": "response_headers",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/0",
            "request_id": "r0",
            "headers_b64": BASE64.encode("Server: crab")
        })));
        assert!(!changed);
        assert_eq!(store.len(), 1);
        assert!(store.records()[0].response_headers.is_none());
    }

    #[test]
    fn test_clear_resets_identity_space() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&entry_line("r1", "https://a.test/"));
        let old_id = store.records()[0].id;

        store.clear();
        assert!(store.is_empty());
        assert!(store.record_by_id(old_id).is_none());

        // 清空后同键重新摄入得到全新记录，不复活旧数据
        store.ingest(&entry_line("r1", "https://a.test/"));
        assert_eq!(store.len(), 1);
        assert_ne!(store.records()[0].id, old_id);
        assert!(store.records()[0].request_headers.is_none());
    }

    #[test]
    fn test_clear_drops_pending_meta() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&marked(&json!({
            "type": "meta", "event": "request_headers",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/",
            "request_id": "r1",
            "headers_b64": BASE64.encode("Host: a.test")
        })));

        store.clear();

        store.ingest(&entry_line("r1", "https://a.test/"));
        assert!(store.records()[0].request_headers.is_none());
    }

    #[test]
    fn test_empty_meta_is_noop() {
        let mut store = TrafficLogStore::new(800);
        // sample_b64 解码为空、又无 body_bytes 的元数据是空更新
        let changed = store.ingest(&marked(&json!({
            "type": "meta", "event": "body_inspection",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/",
            "request_id": "r1",
            "direction": "request", "sample_b64": ""
        })));
        assert!(!changed);

        store.ingest(&entry_line("r1", "https://a.test/"));
        assert!(store.records()[0].request_body_preview.is_none());
    }

    #[test]
    fn test_duplicate_entry_same_key_latest_wins() {
        let mut store = TrafficLogStore::new(800);
        store.ingest(&entry_line("r1", "https://a.test/"));
        store.ingest(&entry_line("r1", "https://a.test/"));
        assert_eq!(store.len(), 2);

        store.ingest(&marked(&json!({
            "type": "meta", "event": "response_headers",
            "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/",
            "request_id": "r1",
            "headers_b64": BASE64.encode("Server: crab")
        })));

        // 迟到元数据合并到最近一次物化的记录
        assert!(store.records()[0].response_headers.is_none());
        assert_eq!(
            store.records()[1].response_headers.as_deref(),
            Some("Server: crab")
        );
    }

    #[test]
    fn test_ingest_batch_preserves_order_and_aggregates_signal() {
        let mut store = TrafficLogStore::new(800);
        let lines = vec![
            entry_line("r1", "https://a.test/"),
            "noise line".to_string(),
            marked(&json!({
                "type": "meta", "event": "request_headers",
                "peer": "1.1.1.1:1", "method": "GET", "url": "https://a.test/",
                "request_id": "r1",
                "headers_b64": BASE64.encode("Host: a.test")
            })),
        ];

        assert!(store.ingest_batch(&lines));
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.records()[0].request_headers.as_deref(),
            Some("Host: a.test")
        );

        assert!(!store.ingest_batch(["noise", "more noise"]));
    }

    #[tokio::test]
    async fn test_monitor_ingests_via_channel() {
        let monitor = TrafficMonitor::new(800, 64);
        monitor.ingest_line(entry_line("r1", "https://a.test/"));

        // 后台任务异步摄入，轮询等待直至可见
        for _ in 0..100 {
            if monitor.len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.len(), 1);

        let id = monitor.snapshot()[0].id;
        assert!(monitor.record(id).is_some());

        monitor.clear();
        assert!(monitor.is_empty());
        assert!(monitor.record(id).is_none());
    }
}

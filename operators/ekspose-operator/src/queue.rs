//! 工作队列模块
//!
//! 该模块实现了带去重与退避重试的协调键队列：
//! - 已在队列中的键再次加入时直接合并
//! - 同一个键同一时刻最多只由一个 worker 处理
//! - 处理中的键再次加入时标记为脏，处理完成后重新入队
//! - 失败的键按指数退避延迟重新入队，延迟有上限

use ekspose_common::ReconcileKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::config::BackoffConfig;

/// 指数退避限速器
///
/// 第 n 次失败的延迟为 `base * 2^n`，不超过 `max`。
#[derive(Debug)]
pub struct ExponentialBackoff {
    /// 首次延迟
    base: Duration,
    /// 最大延迟
    max: Duration,
    /// 每个键的失败次数
    failures: HashMap<ReconcileKey, u32>,
}

impl ExponentialBackoff {
    /// 创建新的限速器
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// 记录一次失败并返回下次重试前的延迟
    pub fn when(&mut self, key: &ReconcileKey) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // 2^32 倍的首次延迟早已超过任何合理的上限
        if exp >= 32 {
            return self.max;
        }

        self.base
            .checked_mul(1u32 << exp)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }

    /// 清除失败记录
    pub fn forget(&mut self, key: &ReconcileKey) {
        self.failures.remove(key);
    }

    /// 失败次数
    pub fn num_requeues(&self, key: &ReconcileKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// 队列内部状态
#[derive(Debug, Default)]
struct QueueState {
    /// 等待处理的键，按入队顺序排列
    queue: VecDeque<ReconcileKey>,
    /// 需要处理的键（包括队列中的和处理中又被加入的）
    dirty: HashSet<ReconcileKey>,
    /// 正在处理的键
    processing: HashSet<ReconcileKey>,
    /// 是否已关闭
    shutting_down: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    limiter: Mutex<ExponentialBackoff>,
    notify: Notify,
}

/// 协调键工作队列
///
/// 克隆得到的是同一个队列的句柄。
#[derive(Clone)]
pub struct ChangeQueue {
    shared: Arc<Shared>,
}

impl ChangeQueue {
    /// 创建新的队列
    pub fn new(backoff: &BackoffConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                limiter: Mutex::new(ExponentialBackoff::new(
                    backoff.base_delay(),
                    backoff.max_delay(),
                )),
                notify: Notify::new(),
            }),
        }
    }

    /// 加入一个键
    ///
    /// 键已在等待中时不做任何事；键正在处理时只标记为脏，
    /// 等 [`ChangeQueue::done`] 时重新入队。
    pub async fn add(&self, key: ReconcileKey) {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down {
            return;
        }

        if !state.dirty.insert(key.clone()) {
            debug!("键 {} 已在队列中，合并", key);
            return;
        }

        if state.processing.contains(&key) {
            debug!("键 {} 正在处理，完成后重新入队", key);
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// 延迟一段时间后加入一个键
    pub fn add_after(&self, key: ReconcileKey, delay: Duration) {
        if delay.is_zero() {
            let queue = self.clone();
            tokio::spawn(async move { queue.add(key).await });
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// 按退避策略延迟重新入队
    ///
    /// 返回本次使用的延迟。
    pub async fn add_rate_limited(&self, key: ReconcileKey) -> Duration {
        let delay = self.shared.limiter.lock().await.when(&key);
        debug!("键 {} 将在 {:?} 后重试", key, delay);
        self.add_after(key, delay);
        delay
    }

    /// 清除键的重试记录
    pub async fn forget(&self, key: &ReconcileKey) {
        self.shared.limiter.lock().await.forget(key);
    }

    /// 键的重试次数
    pub async fn num_requeues(&self, key: &ReconcileKey) -> u32 {
        self.shared.limiter.lock().await.num_requeues(key)
    }

    /// 取出下一个键
    ///
    /// 队列为空时阻塞等待；队列关闭后返回 `None`。
    pub async fn get(&self) -> Option<ReconcileKey> {
        loop {
            // 必须在检查状态之前注册通知，避免错过检查与等待之间的唤醒
            let notified = self.shared.notify.notified();

            {
                let mut state = self.shared.state.lock().await;
                if state.shutting_down {
                    return None;
                }

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// 标记键处理完成
    ///
    /// 处理期间再次被加入的键会重新入队。
    pub async fn done(&self, key: &ReconcileKey) {
        let mut state = self.shared.state.lock().await;
        state.processing.remove(key);

        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// 关闭队列
    ///
    /// 丢弃所有等待中的键并唤醒所有阻塞的 [`ChangeQueue::get`]。
    pub async fn shut_down(&self) {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down {
            return;
        }

        state.shutting_down = true;
        let dropped = state.queue.len();
        state.queue.clear();
        state.dirty.clear();
        drop(state);

        self.shared.notify.notify_waiters();
        info!("工作队列已关闭，丢弃 {} 个等待中的键", dropped);
    }

    /// 是否已关闭
    pub async fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().await.shutting_down
    }

    /// 等待中的键数量
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    /// 是否没有等待中的键
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ReconcileKey {
        ReconcileKey::new("default", name).unwrap()
    }

    fn queue() -> ChangeQueue {
        ChangeQueue::new(&BackoffConfig {
            base_delay_ms: 10,
            max_delay_secs: 1,
        })
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_coalesced() {
        let queue = queue();
        queue.add(key("web")).await;
        queue.add(key("web")).await;
        assert_eq!(queue.len().await, 1);

        queue.add(key("api")).await;
        assert_eq!(queue.len().await, 2);

        assert_eq!(queue.get().await, Some(key("web")));
        assert_eq!(queue.get().await, Some(key("api")));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_flight_key_is_not_handed_out_twice() {
        let queue = queue();
        queue.add(key("web")).await;
        let first = queue.get().await.unwrap();

        // 处理期间再次加入，只标记为脏
        queue.add(key("web")).await;
        assert_eq!(queue.len().await, 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.get()).await;
        assert!(blocked.is_err());

        // 处理完成后重新入队
        queue.done(&first).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await, Some(key("web")));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add(key("web")).await;
        let k = queue.get().await.unwrap();
        queue.done(&k).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = queue();
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(key("web")).await;

        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(key("web")));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getters() {
        let queue = queue();
        let getters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down().await;

        for getter in getters {
            let got = tokio::time::timeout(Duration::from_secs(1), getter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, None);
        }

        // 关闭后的加入被忽略
        queue.add(key("web")).await;
        assert!(queue.is_empty().await);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_keys() {
        let queue = queue();
        queue.add(key("web")).await;
        queue.add(key("api")).await;
        queue.shut_down().await;

        assert!(queue.is_shutting_down().await);
        assert!(queue.is_empty().await);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = queue();
        let k = key("web");

        assert_eq!(queue.add_rate_limited(k.clone()).await, Duration::from_millis(10));
        assert_eq!(queue.add_rate_limited(k.clone()).await, Duration::from_millis(20));
        assert_eq!(queue.num_requeues(&k).await, 2);

        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(got, Some(k.clone()));

        queue.forget(&k).await;
        assert_eq!(queue.num_requeues(&k).await, 0);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let k = key("web");

        let delays: Vec<_> = (0..10).map(|_| backoff.when(&k)).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert_eq!(delays[7], Duration::from_millis(640));
        assert_eq!(delays[8], Duration::from_secs(1));
        assert_eq!(delays[9], Duration::from_secs(1));

        // 其他键互不影响
        assert_eq!(backoff.when(&key("api")), Duration::from_millis(5));

        for _ in 0..100 {
            backoff.when(&k);
        }
        assert_eq!(backoff.when(&k), Duration::from_secs(1));

        backoff.forget(&k);
        assert_eq!(backoff.when(&k), Duration::from_millis(5));
    }
}

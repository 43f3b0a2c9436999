//! 指标收集模块
//!
//! 该模块统计控制器的事件、协调结果、队列深度和缓存状态，
//! 并以 Prometheus 文本格式导出。

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// 指标收集器
pub struct MetricsCollector {
    /// Prometheus 注册表
    registry: Registry,
    /// 收到的缓存通知数
    events_total: IntCounterVec,
    /// 协调次数，按结果区分
    reconcile_total: IntCounterVec,
    /// 协调失败次数，按错误类别区分
    reconcile_errors_total: IntCounterVec,
    /// 协调耗时
    reconcile_duration_seconds: Histogram,
    /// 超过永久性错误重试上限而被放弃的键
    dead_letter_total: IntCounter,
    /// 等待中的键数量
    queue_depth: IntGauge,
    /// 缓存中的 Deployment 数量
    cached_objects: IntGauge,
    /// 缓存是否已同步
    cache_synced: IntGauge,
}

impl MetricsCollector {
    /// 创建新的指标收集器
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("ekspose_events_total", "Deployment notifications received from the cache"),
            &["event"],
        )?;

        let reconcile_total = IntCounterVec::new(
            Opts::new("ekspose_reconcile_total", "Reconciliations by result"),
            &["result"],
        )?;

        let reconcile_errors_total = IntCounterVec::new(
            Opts::new("ekspose_reconcile_errors_total", "Failed reconciliations by error kind"),
            &["kind"],
        )?;

        let reconcile_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "ekspose_reconcile_duration_seconds",
            "Time spent reconciling a single key",
        ))?;

        let dead_letter_total = IntCounter::new(
            "ekspose_dead_letter_total",
            "Keys dropped after exceeding the permanent error retry limit",
        )?;

        let queue_depth = IntGauge::new("ekspose_queue_depth", "Keys waiting in the work queue")?;

        let cached_objects = IntGauge::new(
            "ekspose_cached_deployments",
            "Deployments held in the local cache",
        )?;

        let cache_synced = IntGauge::new(
            "ekspose_cache_synced",
            "Whether the Deployment cache finished its initial sync",
        )?;

        // 注册指标
        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_errors_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(dead_letter_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(cached_objects.clone()))?;
        registry.register(Box::new(cache_synced.clone()))?;

        Ok(Self {
            registry,
            events_total,
            reconcile_total,
            reconcile_errors_total,
            reconcile_duration_seconds,
            dead_letter_total,
            queue_depth,
            cached_objects,
            cache_synced,
        })
    }

    /// 记录一条缓存通知
    pub fn record_event(&self, event: &str) {
        self.events_total.with_label_values(&[event]).inc();
    }

    /// 记录一次成功的协调
    pub fn record_success(&self, elapsed: Duration) {
        self.reconcile_total.with_label_values(&["success"]).inc();
        self.reconcile_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// 记录一次失败的协调
    pub fn record_failure(&self, kind: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&["error"]).inc();
        self.reconcile_errors_total.with_label_values(&[kind]).inc();
        self.reconcile_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// 记录一个被放弃的键
    pub fn record_dead_letter(&self) {
        self.dead_letter_total.inc();
    }

    /// 设置队列深度
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// 设置缓存对象数量
    pub fn set_cached_objects(&self, count: usize) {
        self.cached_objects.set(count as i64);
    }

    /// 设置缓存同步状态
    pub fn set_cache_synced(&self, synced: bool) {
        self.cache_synced.set(i64::from(synced));
    }

    /// 以 Prometheus 文本格式导出全部指标
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("编码指标失败")?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

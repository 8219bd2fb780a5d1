//! 熔断器
//!
//! 每个外部依赖(嵌入、生成、向量库)持有一个独立实例。
//! 滚动窗口按桶统计成功/失败,失败率超阈值且样本量足够时打开;
//! 打开期间请求直接短路,冷却期满后进入半开,放行单个探测请求,
//! 探测成功则关闭,失败则重新打开。状态迁移通过 broadcast 通道对外可见。

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use docqa_error::{DocqaError, Result};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// 滚动统计窗口
    pub window: Duration,
    /// 窗口内的桶数
    pub buckets: usize,
    /// 触发打开的失败率(百分比)
    pub error_threshold_pct: f64,
    /// 窗口内至少需要的调用次数,不足时不评估失败率
    pub volume_threshold: u32,
    /// 打开后进入半开前的冷却时间
    pub reset_timeout: Duration,
    /// 单次调用超时,超时计为失败
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            buckets: 10,
            error_threshold_pct: 50.0,
            volume_threshold: 10,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 状态迁移事件,供日志或监控端订阅
#[derive(Debug, Clone)]
pub struct StateChange {
    pub breaker: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    success: u32,
    failure: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    buckets: VecDeque<Bucket>,
    opened_at: Option<Instant>,
    /// 半开状态下是否已有探测请求在途
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateChange>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                buckets: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// 经熔断器执行一次调用。打开状态直接返回 `ServiceUnavailable`,
    /// 携带距半开还剩的秒数;超时计为失败并返回 `Timeout`。
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit().await?;
        match tokio::time::timeout(self.cfg.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure().await;
                Err(e)
            }
            Err(_) => {
                self.record_failure().await;
                Err(DocqaError::Timeout {
                    operation: self.name.clone(),
                    timeout_ms: self.cfg.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// 同 [`call`],但在熔断器短路时改走降级闭包而不是返回错误。
    pub async fn call_with_fallback<T, F, FB>(&self, fut: F, fallback: FB) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        match self.call(fut).await {
            Err(DocqaError::ServiceUnavailable { .. }) => fallback(),
            other => other,
        }
    }

    async fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.cfg.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    let remaining = self.cfg.reset_timeout - elapsed;
                    Err(DocqaError::ServiceUnavailable {
                        service: self.name.clone(),
                        retry_after: Some(remaining.max(Duration::from_secs(1))),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(DocqaError::ServiceUnavailable {
                        service: self.name.clone(),
                        retry_after: Some(Duration::from_secs(1)),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.buckets.clear();
                self.transition(&mut inner, BreakerState::Closed);
            }
            _ => {
                self.bucket_for_now(&mut inner).success += 1;
            }
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                self.bucket_for_now(&mut inner).failure += 1;
                let (total, failures) = Self::window_totals(&inner);
                if total >= self.cfg.volume_threshold {
                    let pct = failures as f64 / total as f64 * 100.0;
                    if pct >= self.cfg.error_threshold_pct {
                        inner.opened_at = Some(Instant::now());
                        self.transition(&mut inner, BreakerState::Open);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    /// 流式调用建立之后的中途失败也要计入,见 resilient 模块
    pub(crate) async fn record_stream_failure(&self) {
        self.record_failure().await;
    }

    fn bucket_for_now<'a>(&self, inner: &'a mut Inner) -> &'a mut Bucket {
        let now = Instant::now();
        let bucket_len = self.cfg.window / self.cfg.buckets as u32;
        let need_new = inner
            .buckets
            .back()
            .map_or(true, |b| now.duration_since(b.start) >= bucket_len);
        if need_new {
            inner.buckets.push_back(Bucket {
                start: now,
                success: 0,
                failure: 0,
            });
        }
        while let Some(front) = inner.buckets.front() {
            if now.duration_since(front.start) > self.cfg.window {
                inner.buckets.pop_front();
            } else {
                break;
            }
        }
        inner.buckets.back_mut().unwrap()
    }

    fn window_totals(inner: &Inner) -> (u32, u32) {
        let mut total = 0u32;
        let mut failures = 0u32;
        for b in &inner.buckets {
            total += b.success + b.failure;
            failures += b.failure;
        }
        (total, failures)
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                warn!(breaker = %self.name, ?from, ?to, "circuit breaker opened")
            }
            _ => info!(breaker = %self.name, ?from, ?to, "circuit breaker state change"),
        }
        let _ = self.events.send(StateChange {
            breaker: self.name.clone(),
            from,
            to,
        });
    }
}

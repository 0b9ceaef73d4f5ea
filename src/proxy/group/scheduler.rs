//! 空闲挂起的周期探测
//!
//! 组启动后立即探测一次，之后只在被使用期间按固定间隔探测。每次拨号都会
//! touch 调度器；超过 `idle_timeout` 没有 touch 时循环退出，下一次 touch
//! 重新启动它。

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 一轮探测的执行者
#[async_trait]
pub trait ProbeRound: Send + Sync + 'static {
    async fn probe_round(&self);
}

struct State {
    started: bool,
    running: bool,
    last_active: Instant,
}

struct Shared {
    name: String,
    interval: Duration,
    idle_timeout: Duration,
    state: Mutex<State>,
    close: CancellationToken,
}

pub struct IdleScheduler {
    shared: Arc<Shared>,
}

impl IdleScheduler {
    pub fn new(name: &str, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                interval,
                idle_timeout,
                state: Mutex::new(State {
                    started: false,
                    running: false,
                    last_active: Instant::now(),
                }),
                close: CancellationToken::new(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// 标记已启动，并在后台立即做一轮探测（不启动周期循环）
    pub fn post_start<T: ProbeRound>(&self, target: Weak<T>) {
        {
            let mut state = self.shared.state.lock();
            state.started = true;
            state.last_active = Instant::now();
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_round(&shared, &target).await;
        });
    }

    /// 记录一次使用；循环未运行时重新拉起
    pub fn touch<T: ProbeRound>(&self, target: Weak<T>) {
        let mut state = self.shared.state.lock();
        if !state.started || self.shared.close.is_cancelled() {
            return;
        }
        if state.running {
            state.last_active = Instant::now();
            return;
        }
        state.running = true;
        drop(state);

        debug!(group = %self.shared.name, "probe loop started");
        let shared = self.shared.clone();
        tokio::spawn(run_loop(shared, target));
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// 关闭信号：停止循环并取消进行中的探测
    pub fn close(&self) {
        self.shared.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.is_cancelled()
    }

    pub async fn closed(&self) {
        self.shared.close.cancelled().await
    }
}

impl Drop for IdleScheduler {
    fn drop(&mut self) {
        self.shared.close.cancel();
    }
}

/// Returns false once the owner is gone or the scheduler was closed.
async fn run_round<T: ProbeRound>(shared: &Shared, target: &Weak<T>) -> bool {
    let Some(target) = target.upgrade() else {
        return false;
    };
    tokio::select! {
        _ = shared.close.cancelled() => false,
        _ = target.probe_round() => true,
    }
}

async fn run_loop<T: ProbeRound>(shared: Arc<Shared>, target: Weak<T>) {
    // 上次活跃距今已超过一个周期时先补一轮
    let stale = {
        let mut state = shared.state.lock();
        if state.last_active.elapsed() > shared.interval {
            state.last_active = Instant::now();
            true
        } else {
            false
        }
    };
    if !stale || run_round(&shared, &target).await {
        let mut ticker = interval_at(Instant::now() + shared.interval, shared.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shared.close.cancelled() => break,
                _ = ticker.tick() => {}
            }
            {
                let mut state = shared.state.lock();
                if state.last_active.elapsed() > shared.idle_timeout {
                    state.running = false;
                    debug!(group = %shared.name, "probe loop idle, suspended");
                    return;
                }
            }
            if !run_round(&shared, &target).await {
                break;
            }
        }
    }
    shared.state.lock().running = false;
}

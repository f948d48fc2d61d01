//! 退避延迟计算
//!
//! 所有需要重试的组件共用 decorrelated jitter：延迟在 `[base, previous * factor]`
//! 之间随机取值，避免大量客户端在同一时刻集中重试。

use rand::Rng;
use std::time::Duration;

/// 计算下一次重试延迟：`min(max_delay, random(base_delay, previous_delay * factor))`
///
/// 结果总在 `[base_delay, max_delay]` 内；`base_delay > max_delay` 时直接返回 `max_delay`。
pub fn decorrelated_jitter(
    max_delay: Duration,
    base_delay: Duration,
    previous_delay: Duration,
    factor: f64,
) -> Duration {
    let base = base_delay.as_millis() as u64;
    let max = max_delay.as_millis() as u64;
    if base >= max {
        return max_delay;
    }

    let upper = (previous_delay.as_millis() as f64 * factor.max(1.0)) as u64;
    let upper = upper.max(base);
    let picked = if upper == base {
        base
    } else {
        rand::thread_rng().gen_range(base..=upper)
    };
    Duration::from_millis(picked.min(max))
}

/// 带尝试计数的退避状态
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    previous: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        Self {
            base,
            max,
            factor,
            previous: base,
            attempts: 0,
        }
    }

    /// 计算下一次延迟并累加尝试次数
    pub fn next_delay(&mut self) -> Duration {
        let delay = decorrelated_jitter(self.max, self.base, self.previous, self.factor);
        self.previous = delay;
        self.attempts += 1;
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn previous_delay(&self) -> Duration {
        self.previous
    }

    pub fn reset(&mut self) {
        self.previous = self.base;
        self.attempts = 0;
    }
}

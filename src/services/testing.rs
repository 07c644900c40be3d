//! 测试用的内存替身

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::unit::{ServiceUnit, UnitCommands};
use crate::services::readiness::PortProbe;
use crate::services::supervisor::{DriverError, UnitDriver};
use crate::services::updater::{SourceUpdater, UpdateError};

/// 可编排行为的驱动
pub struct FakeDriver {
    fail_stop: bool,
    fail_start: bool,
    up: AtomicBool,
    /// 第 N 次查询起报告运行
    up_after: Option<u32>,
    is_up_calls: AtomicU32,
    events: Mutex<Vec<&'static str>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            fail_stop: false,
            fail_start: false,
            up: AtomicBool::new(true),
            up_after: None,
            is_up_calls: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn never_up(self) -> Self {
        self.up.store(false, Ordering::SeqCst);
        self
    }

    pub fn up_after_polls(mut self, polls: u32) -> Self {
        self.up_after = Some(polls);
        self
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.events().iter().filter(|e| **e == "stop").count()
    }

    pub fn start_calls(&self) -> usize {
        self.events().iter().filter(|e| **e == "start").count()
    }

    pub fn is_up_calls(&self) -> u32 {
        self.is_up_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn stop(&self, _unit: &ServiceUnit) -> Result<(), DriverError> {
        self.events.lock().unwrap().push("stop");
        if self.fail_stop {
            return Err(DriverError::Failed("no such unit".to_string()));
        }
        Ok(())
    }

    async fn start(&self, _unit: &ServiceUnit) -> Result<(), DriverError> {
        self.events.lock().unwrap().push("start");
        if self.fail_start {
            return Err(DriverError::Failed("image build failed".to_string()));
        }
        Ok(())
    }

    async fn is_up(&self, _unit: &ServiceUnit) -> Result<bool, DriverError> {
        let calls = self.is_up_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(after) = self.up_after {
            return Ok(calls >= after);
        }
        Ok(self.up.load(Ordering::SeqCst))
    }

    async fn unit_commands(&self, _unit: &ServiceUnit) -> UnitCommands {
        UnitCommands {
            pre_start: "/bin/true".to_string(),
            start: "/bin/true".to_string(),
            stop: "/bin/true".to_string(),
        }
    }
}

/// 记录调用次数的源码更新器
pub struct FakeUpdater {
    fail: bool,
    delay: Duration,
    calls: AtomicU32,
}

impl FakeUpdater {
    pub fn ok() -> Self {
        Self {
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn conflicting() -> Self {
        Self {
            fail: true,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// 每次更新先等待一段时间
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceUpdater for FakeUpdater {
    async fn update(&self, revision: Option<&str>) -> Result<String, UpdateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(UpdateError::NotFastForward {
                target: revision.unwrap_or("FETCH_HEAD").to_string(),
                detail: "Not possible to fast-forward, aborting.".to_string(),
            });
        }
        Ok(revision.unwrap_or("0123456789abcdef").to_string())
    }
}

/// 端口探测替身
pub enum ProbeBehavior {
    Never,
    /// 从第 N 次探测起报告监听
    FromAttempt(u32),
    /// 从创建起经过指定时间后报告监听
    AfterElapsed(Duration),
}

pub struct FakeProbe {
    behavior: ProbeBehavior,
    created: Instant,
    calls: AtomicU32,
}

impl FakeProbe {
    pub fn new(behavior: ProbeBehavior) -> Self {
        Self {
            behavior,
            created: Instant::now(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn probe(&self, _port: u16) -> bool {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behavior {
            ProbeBehavior::Never => false,
            ProbeBehavior::FromAttempt(k) => call >= k,
            ProbeBehavior::AfterElapsed(d) => self.created.elapsed() >= d,
        }
    }
}

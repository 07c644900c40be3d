//! 部署记录存储
//!
//! 运行中的部署尝试按 id 索引，结束后移入有上限的历史记录

use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::config::env::constants::MAX_ATTEMPT_HISTORY;
use crate::domain::deploy::DeploymentAttempt;

/// 部署记录存储
pub struct AttemptStore {
    /// 运行中的部署
    active: RwLock<HashMap<String, DeploymentAttempt>>,
    /// 已结束的部署（最新在前）
    history: RwLock<VecDeque<DeploymentAttempt>>,
    max_history: usize,
}

impl AttemptStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ATTEMPT_HISTORY)
    }

    /// 指定历史记录上限
    pub fn with_capacity(max_history: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// 登记新的部署尝试
    pub async fn create(&self, attempt: DeploymentAttempt) -> String {
        let id = attempt.id.clone();
        self.active.write().await.insert(id.clone(), attempt);
        id
    }

    /// 没有运行中的部署时才登记，检查与写入在同一把写锁内完成
    pub async fn create_exclusive(&self, attempt: DeploymentAttempt) -> bool {
        let mut active = self.active.write().await;
        if !active.is_empty() {
            return false;
        }
        active.insert(attempt.id.clone(), attempt);
        true
    }

    /// 写入最新快照；进入终态的记录移到历史记录
    pub async fn update(&self, attempt: DeploymentAttempt) {
        if attempt.is_finished() {
            self.active.write().await.remove(&attempt.id);

            let mut history = self.history.write().await;
            history.retain(|a| a.id != attempt.id);
            history.push_front(attempt);
            while history.len() > self.max_history {
                history.pop_back();
            }
        } else {
            self.active.write().await.insert(attempt.id.clone(), attempt);
        }
    }

    /// 查询部署（先查运行中，再查历史记录）
    pub async fn get(&self, id: &str) -> Option<DeploymentAttempt> {
        if let Some(attempt) = self.active.read().await.get(id) {
            return Some(attempt.clone());
        }
        let history = self.history.read().await;
        history.iter().find(|a| a.id == id).cloned()
    }

    /// 运行中的部署
    pub async fn running(&self) -> Vec<DeploymentAttempt> {
        let active = self.active.read().await;
        let mut running: Vec<_> = active.values().cloned().collect();
        running.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        running
    }

    /// 最近的部署：运行中的在前，然后是历史记录
    pub async fn recent(&self, limit: usize) -> Vec<DeploymentAttempt> {
        let mut recent = self.running().await;
        let history = self.history.read().await;
        recent.extend(history.iter().cloned());
        recent.truncate(limit);
        recent
    }
}

impl Default for AttemptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::{DeployOutcome, DeployPhase, Trigger};

    fn attempt(id: &str) -> DeploymentAttempt {
        DeploymentAttempt::new(id.to_string(), &Trigger::default())
    }

    #[tokio::test]
    async fn test_attempt_lifecycle() {
        let store = AttemptStore::new();
        store.create(attempt("a-1")).await;

        let mut snapshot = store.get("a-1").await.unwrap();
        assert_eq!(snapshot.phase, DeployPhase::Updating);
        assert_eq!(store.running().await.len(), 1);

        snapshot.enter(DeployPhase::Probing);
        snapshot.probes_issued = 2;
        store.update(snapshot.clone()).await;
        assert_eq!(store.get("a-1").await.unwrap().probes_issued, 2);

        snapshot.complete(DeployOutcome::Success, "ok");
        store.update(snapshot).await;

        assert!(store.running().await.is_empty());
        let finished = store.get("a-1").await.unwrap();
        assert_eq!(finished.outcome, Some(DeployOutcome::Success));
        assert_eq!(store.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_history_limit() {
        let store = AttemptStore::with_capacity(5);

        for i in 0..10 {
            let mut a = attempt(&format!("a-{}", i));
            a.complete(DeployOutcome::Error, "failed");
            store.update(a).await;
        }

        assert_eq!(store.recent(100).await.len(), 5);
        let recent = store.recent(3).await;
        let ids: Vec<_> = recent.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a-9", "a-8", "a-7"]);
        assert!(store.get("a-0").await.is_none());
    }

    #[tokio::test]
    async fn test_create_exclusive_refuses_second_running_attempt() {
        let store = std::sync::Arc::new(AttemptStore::new());

        let (first, second) = tokio::join!(
            store.create_exclusive(attempt("a-1")),
            store.create_exclusive(attempt("a-2")),
        );
        assert!(first ^ second);
        assert_eq!(store.running().await.len(), 1);

        let mut live = store.running().await.remove(0);
        live.complete(DeployOutcome::Success, "ok");
        store.update(live).await;
        assert!(store.create_exclusive(attempt("a-3")).await);
    }

    #[tokio::test]
    async fn test_recent_lists_running_first() {
        let store = AttemptStore::new();

        let mut done = attempt("done");
        done.complete(DeployOutcome::Timeout, "port not listening");
        store.update(done).await;
        store.create(attempt("live")).await;

        let recent = store.recent(10).await;
        assert_eq!(recent[0].id, "live");
        assert_eq!(recent[1].id, "done");
    }
}

//! ProcessGroup - swap and exclusivity coordinator
//!
//! A group decides which of its members may run at the same time. When both `swap` and
//! `exclusive` are set, every start, stop and unload in the group goes through one group-wide slot
//! and starting a member first stops its siblings. Otherwise each member has a slot of its own and
//! members start and stop independently.

use crate::config::{GroupConfig, ModelConfig};
use crate::process::{InFlightGuard, Process, ProcessError, ProcessState};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ProcessGroup {
    id: String,
    config: GroupConfig,
    processes: HashMap<String, Arc<Process>>,
    /// Slot shared by all members when the group swaps exclusively
    swap_lock: Mutex<()>,
    member_locks: HashMap<String, Mutex<()>>,
    shutdown: CancellationToken,
}

impl ProcessGroup {
    pub fn new(
        id: impl Into<String>,
        config: GroupConfig,
        models: &HashMap<String, ModelConfig>,
        health_check_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let id = id.into();
        let mut processes = HashMap::new();
        let mut member_locks = HashMap::new();

        for member in &config.members {
            let Some(model) = models.get(member) else {
                warn!(group = %id, model = %member, "Skipping member without a model definition");
                continue;
            };
            processes.insert(
                member.clone(),
                Arc::new(Process::new(
                    member.clone(),
                    model.clone(),
                    health_check_timeout,
                    shutdown.clone(),
                )),
            );
            member_locks.insert(member.clone(), Mutex::new(()));
        }

        debug!(
            group = %id,
            members = processes.len(),
            swap = config.swap,
            exclusive = config.exclusive,
            persistent = config.persistent,
            "Created process group"
        );

        Self {
            id,
            config,
            processes,
            swap_lock: Mutex::new(()),
            member_locks,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Whether all transitions in the group share one slot.
    pub fn is_serialized(&self) -> bool {
        self.config.swap && self.config.exclusive
    }

    pub fn process(&self, model: &str) -> Option<&Arc<Process>> {
        self.processes.get(model)
    }

    /// Members in configured order.
    pub fn members(&self) -> impl Iterator<Item = &Arc<Process>> {
        self.config
            .members
            .iter()
            .filter_map(|member| self.processes.get(member))
    }

    fn member(&self, model: &str) -> Result<&Arc<Process>, ProcessError> {
        self.processes
            .get(model)
            .ok_or_else(|| ProcessError::NotMember {
                model: model.to_string(),
                group: self.id.clone(),
            })
    }

    fn slot(&self, model: &str) -> Result<&Mutex<()>, ProcessError> {
        if self.is_serialized() {
            return Ok(&self.swap_lock);
        }
        self.member_locks
            .get(model)
            .ok_or_else(|| ProcessError::NotMember {
                model: model.to_string(),
                group: self.id.clone(),
            })
    }

    /// Wait for the slot, giving up if shutdown is signalled first.
    async fn acquire_slot(&self, model: &str) -> Result<MutexGuard<'_, ()>, ProcessError> {
        let slot = self.slot(model)?;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ProcessError::ShutdownInterrupted),
            guard = slot.lock() => Ok(guard),
        }
    }

    /// Make `model` ready, stopping siblings first if the group swaps exclusively.
    ///
    /// The returned guard counts the caller's request as in flight, so the process will not be
    /// stopped underneath it.
    pub async fn ensure_ready(self: &Arc<Self>, model: &str) -> Result<InFlightGuard, ProcessError> {
        let process = Arc::clone(self.member(model)?);

        // Reaping needs the slot, so skip it while another caller holds the slot
        let reaped = match self.slot(model)?.try_lock() {
            Ok(_slot) => process.reap_if_exited(),
            Err(_) => false,
        };
        if !reaped {
            if let Some(guard) = process.acquire_in_flight() {
                return Ok(guard);
            }
        }

        let _slot = self.acquire_slot(model).await?;

        process.reap_if_exited();
        if let Some(guard) = process.acquire_in_flight() {
            return Ok(guard);
        }

        if self.is_serialized() {
            self.evict_siblings(model).await;
        }

        process.start().await?;
        self.spawn_idle_watcher(&process);

        process
            .acquire_in_flight()
            .ok_or_else(|| ProcessError::NotReady {
                model: model.to_string(),
            })
    }

    async fn evict_siblings(&self, model: &str) {
        for sibling in self.members().filter(|process| process.id() != model) {
            if matches!(
                sibling.current_state(),
                ProcessState::Ready | ProcessState::Starting
            ) {
                info!(group = %self.id, model = %sibling.id(), requested = %model, "Swapping out model");
                if let Err(e) = sibling.stop().await {
                    warn!(group = %self.id, model = %sibling.id(), error = %e, "Failed to stop sibling");
                }
            }
        }
    }

    /// Stop one member.
    pub async fn unload(&self, model: &str) -> Result<(), ProcessError> {
        let process = self.member(model)?;
        let _slot = self.slot(model)?.lock().await;
        process.stop().await
    }

    /// Stop every member. Errors are logged.
    pub async fn unload_all(&self) {
        if self.is_serialized() {
            let _slot = self.swap_lock.lock().await;
            for process in self.members() {
                self.stop_logged(process).await;
            }
        } else {
            join_all(self.members().map(|process| async move {
                if let Some(slot) = self.member_locks.get(process.id()) {
                    let _slot = slot.lock().await;
                    self.stop_logged(process).await;
                }
            }))
            .await;
        }
    }

    async fn stop_logged(&self, process: &Process) {
        if let Err(e) = process.stop().await {
            warn!(group = %self.id, model = %process.id(), error = %e, "Failed to stop process");
        }
    }

    fn spawn_idle_watcher(self: &Arc<Self>, process: &Arc<Process>) {
        let Some(ttl) = process.config().idle_ttl() else {
            return;
        };
        let Some(ready) = process.ready_token() else {
            return;
        };

        let group = Arc::clone(self);
        let process = Arc::clone(process);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_check_interval(ttl));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ready.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if is_idle(&process, ttl) && group.stop_if_idle(&process, &ready, ttl).await {
                    break;
                }
            }
            debug!(model = %process.id(), "Idle watcher finished");
        });
    }

    /// Re-check idleness under the slot and stop the process if it still holds.
    async fn stop_if_idle(&self, process: &Process, ready: &CancellationToken, ttl: Duration) -> bool {
        let Ok(_slot) = self.acquire_slot(process.id()).await else {
            return true;
        };

        if ready.is_cancelled() {
            return true;
        }
        if !is_idle(process, ttl) {
            return false;
        }

        info!(group = %self.id, model = %process.id(), ttl = ?ttl, "Unloading idle model");
        if let Err(e) = process.stop().await {
            warn!(group = %self.id, model = %process.id(), error = %e, "Failed to unload idle model");
        }
        true
    }
}

fn is_idle(process: &Process, ttl: Duration) -> bool {
    process.current_state() == ProcessState::Ready
        && process.in_flight() == 0
        && process.idle_for() > ttl
}

fn idle_check_interval(ttl: Duration) -> Duration {
    (ttl / 4).clamp(Duration::from_millis(100), Duration::from_secs(1))
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ports::free_port;

    fn sleeper(ttl: u64) -> ModelConfig {
        let port = free_port().unwrap();
        ModelConfig::builder()
            .cmd("sleep 60")
            .proxy(format!("http://127.0.0.1:{port}/").parse().unwrap())
            .check_endpoint("none")
            .ttl(ttl)
            .build()
    }

    fn group(config: GroupConfig, ttl: u64) -> (Arc<ProcessGroup>, CancellationToken) {
        let models = config
            .members
            .iter()
            .map(|member| (member.clone(), sleeper(ttl)))
            .collect();
        let shutdown = CancellationToken::new();
        let group = ProcessGroup::new(
            "test",
            config,
            &models,
            Duration::from_secs(5),
            shutdown.clone(),
        );
        (Arc::new(group), shutdown)
    }

    fn members(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn state(group: &ProcessGroup, model: &str) -> ProcessState {
        group.process(model).unwrap().current_state()
    }

    #[tokio::test]
    async fn test_exclusive_swap_stops_siblings() {
        let (group, _shutdown) = group(
            GroupConfig::builder().members(members(&["a", "b"])).build(),
            0,
        );
        assert!(group.is_serialized());

        let guard = group.ensure_ready("a").await.unwrap();
        drop(guard);
        assert_eq!(state(&group, "a"), ProcessState::Ready);

        drop(group.ensure_ready("b").await.unwrap());
        assert_eq!(state(&group, "a"), ProcessState::Stopped);
        assert_eq!(state(&group, "b"), ProcessState::Ready);

        drop(group.ensure_ready("a").await.unwrap());
        assert_eq!(state(&group, "a"), ProcessState::Ready);
        assert_eq!(state(&group, "b"), ProcessState::Stopped);

        group.unload_all().await;
    }

    #[tokio::test]
    async fn test_non_exclusive_group_runs_members_together() {
        for config in [
            GroupConfig::builder()
                .swap(false)
                .members(members(&["a", "b"]))
                .build(),
            GroupConfig::builder()
                .exclusive(false)
                .members(members(&["a", "b"]))
                .build(),
        ] {
            let (group, _shutdown) = group(config, 0);
            assert!(!group.is_serialized());

            let (a, b) = tokio::join!(group.ensure_ready("a"), group.ensure_ready("b"));
            drop((a.unwrap(), b.unwrap()));
            assert_eq!(state(&group, "a"), ProcessState::Ready);
            assert_eq!(state(&group, "b"), ProcessState::Ready);

            group.unload_all().await;
            assert_eq!(state(&group, "a"), ProcessState::Stopped);
            assert_eq!(state(&group, "b"), ProcessState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_guard_points_at_process_address() {
        let (group, _shutdown) = group(
            GroupConfig::builder().members(members(&["a"])).build(),
            0,
        );
        let guard = group.ensure_ready("a").await.unwrap();
        assert_eq!(
            Some(guard.address().clone()),
            group.process("a").unwrap().address()
        );
        drop(guard);
        group.unload_all().await;
    }

    #[tokio::test]
    async fn test_unload_single_member() {
        let (group, _shutdown) = group(
            GroupConfig::builder()
                .swap(false)
                .members(members(&["a", "b"]))
                .build(),
            0,
        );
        drop(group.ensure_ready("a").await.unwrap());
        drop(group.ensure_ready("b").await.unwrap());

        group.unload("a").await.unwrap();
        assert_eq!(state(&group, "a"), ProcessState::Stopped);
        assert_eq!(state(&group, "b"), ProcessState::Ready);

        group.unload_all().await;
    }

    #[tokio::test]
    async fn test_unknown_member() {
        let (group, _shutdown) = group(
            GroupConfig::builder().members(members(&["a"])).build(),
            0,
        );
        assert!(matches!(
            group.ensure_ready("ghost").await,
            Err(ProcessError::NotMember { .. })
        ));
        assert!(group.unload("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_idle_ttl_unloads_model() {
        let (group, _shutdown) = group(
            GroupConfig::builder().members(members(&["a"])).build(),
            1,
        );
        drop(group.ensure_ready("a").await.unwrap());
        assert_eq!(state(&group, "a"), ProcessState::Ready);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(state(&group, "a"), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_idle_ttl_waits_for_in_flight_requests() {
        let (group, _shutdown) = group(
            GroupConfig::builder().members(members(&["a"])).build(),
            1,
        );
        let guard = group.ensure_ready("a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(state(&group, "a"), ProcessState::Ready);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(state(&group, "a"), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_crashed_member_is_restarted() {
        let port = free_port().unwrap();
        let mut models = HashMap::new();
        models.insert(
            "a".to_string(),
            ModelConfig::builder()
                .cmd("sleep 0.2")
                .proxy(format!("http://127.0.0.1:{port}/").parse().unwrap())
                .check_endpoint("none")
                .build(),
        );
        let group = Arc::new(ProcessGroup::new(
            "test",
            GroupConfig::builder().members(members(&["a"])).build(),
            &models,
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        drop(group.ensure_ready("a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(600)).await;

        drop(group.ensure_ready("a").await.unwrap());
        assert_eq!(state(&group, "a"), ProcessState::Ready);
        group.unload_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_after_crash_all_succeed() {
        let port = free_port().unwrap();
        let mut models = HashMap::new();
        models.insert(
            "a".to_string(),
            ModelConfig::builder()
                .cmd("sleep 0.5")
                .proxy(format!("http://127.0.0.1:{port}/").parse().unwrap())
                .check_endpoint("none")
                .build(),
        );
        let group = Arc::new(ProcessGroup::new(
            "test",
            GroupConfig::builder().members(members(&["a"])).build(),
            &models,
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        for _ in 0..3 {
            drop(group.ensure_ready("a").await.unwrap());
            tokio::time::sleep(Duration::from_millis(800)).await;

            let results = join_all((0..16).map(|_| {
                let group = Arc::clone(&group);
                tokio::spawn(async move { group.ensure_ready("a").await.map(drop) })
            }))
            .await;
            for result in results {
                result.unwrap().unwrap();
            }
            assert_eq!(state(&group, "a"), ProcessState::Ready);
        }
        group.unload_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_slot_waiters() {
        let port = free_port().unwrap();
        let mut models = HashMap::new();
        for id in ["a", "b"] {
            models.insert(
                id.to_string(),
                ModelConfig::builder()
                    .cmd("sleep 60")
                    .proxy(format!("http://127.0.0.1:{port}/").parse().unwrap())
                    .build(),
            );
        }
        let shutdown = CancellationToken::new();
        let group = Arc::new(ProcessGroup::new(
            "test",
            GroupConfig::builder().members(members(&["a", "b"])).build(),
            &models,
            Duration::from_secs(30),
            shutdown.clone(),
        ));

        let a = tokio::spawn({
            let group = Arc::clone(&group);
            async move { group.ensure_ready("a").await.map(drop) }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let b = tokio::spawn({
            let group = Arc::clone(&group);
            async move { group.ensure_ready("b").await.map(drop) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.cancel();
        for handle in [a, b] {
            let result = tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(ProcessError::ShutdownInterrupted)));
        }

        group.unload_all().await;
        assert_eq!(state(&group, "a"), ProcessState::Stopped);
        assert_eq!(state(&group, "b"), ProcessState::Stopped);
    }
}

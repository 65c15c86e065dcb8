//! ProxyManager - aggregates every process group behind one entry point

use crate::config::{Config, ModelConfig};
use crate::process::{InFlightGuard, Process, ProcessError, ProcessState};
use crate::process_group::ProcessGroup;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Owns all process groups and resolves models to them.
///
/// Built once at startup from a validated [`Config`]; the group and process registries are never
/// modified afterwards.
pub struct ProxyManager {
    config: Arc<Config>,
    groups: HashMap<String, Arc<ProcessGroup>>,
    /// model id -> group id
    model_groups: HashMap<String, String>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl ProxyManager {
    #[instrument(skip(config))]
    pub fn new(config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let mut groups = HashMap::with_capacity(config.groups.len());
        let mut model_groups = HashMap::new();

        for (group_id, group_config) in &config.groups {
            let group = ProcessGroup::new(
                group_id.clone(),
                group_config.clone(),
                &config.models,
                config.health_check_timeout,
                shutdown.clone(),
            );
            for member in &group_config.members {
                model_groups.insert(member.clone(), group_id.clone());
            }
            groups.insert(group_id.clone(), Arc::new(group));
        }

        info!(
            groups = groups.len(),
            models = model_groups.len(),
            "Created proxy manager"
        );

        Self {
            config: Arc::new(config),
            groups,
            model_groups,
            shutdown,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve a requested name or alias to the model id and its configuration.
    pub fn resolve<'a>(&'a self, requested: &'a str) -> Option<(&'a str, &'a ModelConfig)> {
        self.config.find_config(requested)
    }

    pub fn group_for(&self, model: &str) -> Option<&Arc<ProcessGroup>> {
        let group_id = self.model_groups.get(model)?;
        self.groups.get(group_id)
    }

    pub fn process(&self, model: &str) -> Option<&Arc<Process>> {
        self.group_for(model)?.process(model)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Make `model` ready in its group and count the caller's request against it.
    pub async fn ensure_ready(&self, model: &str) -> Result<InFlightGuard, ProcessError> {
        if self.is_shutting_down() {
            return Err(ProcessError::ShutdownInterrupted);
        }
        let group = self.group_for(model).ok_or_else(|| ProcessError::NotMember {
            model: model.to_string(),
            group: "(none)".to_string(),
        })?;
        group.ensure_ready(model).await
    }

    /// Models that are not stopped or failed, sorted by id.
    pub fn running(&self) -> Vec<(String, ProcessState)> {
        let mut running: Vec<_> = self
            .groups
            .values()
            .flat_map(|group| group.members())
            .filter_map(|process| {
                let state = process.current_state();
                state
                    .is_running()
                    .then(|| (process.id().to_string(), state))
            })
            .collect();
        running.sort();
        running
    }

    /// Configured models that are not unlisted, sorted by id.
    pub fn listed_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self
            .config
            .models
            .iter()
            .filter(|(_, model)| !model.unlisted)
            .map(|(id, _)| id.as_str())
            .collect();
        models.sort_unstable();
        models
    }

    /// Stop every model in every group, persistent groups included.
    pub async fn unload_all(&self) {
        join_all(self.groups.values().map(|group| group.unload_all())).await;
    }

    /// Abort pending starts and slot waits, then stop everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutting down all models");
        }
        self.shutdown.cancel();
        self.unload_all().await;
    }
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, DEFAULT_GROUP_ID, GroupConfig};
    use crate::process::ports::free_port;

    fn sleeper(aliases: &[&str]) -> ModelConfig {
        let port = free_port().unwrap();
        ModelConfig::builder()
            .cmd("sleep 60")
            .proxy(format!("http://127.0.0.1:{port}/").parse().unwrap())
            .check_endpoint("none")
            .aliases(aliases.iter().map(|a| a.to_string()).collect())
            .build()
    }

    fn manager() -> ProxyManager {
        let mut models = HashMap::new();
        models.insert("model1".to_string(), sleeper(&["m1"]));
        models.insert("model2".to_string(), sleeper(&[]));
        models.insert("model3".to_string(), sleeper(&[]));
        models.insert("forever".to_string(), sleeper(&[]));

        let mut groups = HashMap::new();
        groups.insert(
            "persistent".to_string(),
            GroupConfig::builder()
                .persistent(true)
                .swap(false)
                .members(vec!["forever".to_string()])
                .build(),
        );

        let config =
            Config::from_config_file(ConfigFile::builder().models(models).groups(groups).build())
                .unwrap();
        ProxyManager::new(config)
    }

    #[tokio::test]
    async fn test_resolve_and_groups() {
        let manager = manager();
        assert_eq!(manager.resolve("m1").map(|(id, _)| id), Some("model1"));
        assert!(manager.resolve("missing").is_none());

        assert_eq!(manager.group_for("model1").unwrap().id(), DEFAULT_GROUP_ID);
        assert_eq!(manager.group_for("forever").unwrap().id(), "persistent");
        assert!(manager.group_for("forever").unwrap().config().persistent);
        assert!(manager.process("model3").is_some());
        assert!(manager.process("missing").is_none());
    }

    #[tokio::test]
    async fn test_running_and_persistent_group() {
        let manager = manager();
        assert!(manager.running().is_empty());

        drop(manager.ensure_ready("forever").await.unwrap());
        drop(manager.ensure_ready("model1").await.unwrap());
        drop(manager.ensure_ready("model2").await.unwrap());

        assert_eq!(
            manager.running(),
            vec![
                ("forever".to_string(), ProcessState::Ready),
                ("model2".to_string(), ProcessState::Ready),
            ]
        );

        manager.unload_all().await;
        assert!(manager.running().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = manager();
        drop(manager.ensure_ready("model1").await.unwrap());

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutting_down());
        assert!(manager.running().is_empty());
        assert!(matches!(
            manager.ensure_ready("model1").await,
            Err(ProcessError::ShutdownInterrupted)
        ));
    }

    #[test]
    fn test_listed_models() {
        let mut models = HashMap::new();
        models.insert("b".to_string(), sleeper(&[]));
        models.insert("a".to_string(), sleeper(&[]));
        let mut hidden = sleeper(&[]);
        hidden.unlisted = true;
        models.insert("hidden".to_string(), hidden);

        let config =
            Config::from_config_file(ConfigFile::builder().models(models).build()).unwrap();
        assert_eq!(ProxyManager::new(config).listed_models(), vec!["a", "b"]);
    }
}

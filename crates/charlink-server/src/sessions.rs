//! One conversation orchestrator per user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use charlink_client::{ConversationOrchestrator, OrchestratorConfig};
use charlink_net::GenerativeBackend;
use charlink_prompt::SystemInstructionTemplate;
use charlink_shared::UserId;
use charlink_store::{MessageLog, SnapshotOrder};
use tokio::sync::Mutex;
use tracing::{debug, info};

struct Entry {
    session: Arc<ConversationOrchestrator>,
    last_used: Instant,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, Entry>>,
    log: Arc<dyn MessageLog>,
    backend: Arc<dyn GenerativeBackend>,
    template: SystemInstructionTemplate,
    config: OrchestratorConfig,
}

impl SessionRegistry {
    pub fn new(
        log: Arc<dyn MessageLog>,
        backend: Arc<dyn GenerativeBackend>,
        template: SystemInstructionTemplate,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            log,
            backend,
            template,
            config,
        }
    }

    /// The user's orchestrator, created on first use.
    pub async fn get_or_create(&self, user: &UserId) -> Arc<ConversationOrchestrator> {
        self.get_or_create_at(user, Instant::now()).await
    }

    async fn get_or_create_at(&self, user: &UserId, now: Instant) -> Arc<ConversationOrchestrator> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(user.clone()).or_insert_with(|| {
            debug!(user = %user, "session created");
            Entry {
                session: Arc::new(ConversationOrchestrator::new(
                    user.clone(),
                    self.log.clone(),
                    self.backend.clone(),
                    self.template.clone(),
                    self.config.clone(),
                )),
                last_used: now,
            }
        });
        entry.last_used = now;
        entry.session.clone()
    }

    /// Message order used by every session's view.
    pub fn order(&self) -> SnapshotOrder {
        self.config.order
    }

    pub async fn get(&self, user: &UserId) -> Option<Arc<ConversationOrchestrator>> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(user)?;
        entry.last_used = Instant::now();
        Some(entry.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Shut down and forget sessions unused for `max_idle`.  Sessions a
    /// request is still holding are kept.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(Instant::now(), max_idle).await
    }

    async fn evict_idle_at(&self, now: Instant, max_idle: Duration) -> usize {
        let evicted: Vec<(UserId, Entry)> = {
            let mut sessions = self.sessions.lock().await;
            let idle: Vec<UserId> = sessions
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_duration_since(entry.last_used) >= max_idle
                        && Arc::strong_count(&entry.session) == 1
                })
                .map(|(user, _)| user.clone())
                .collect();
            idle.into_iter()
                .filter_map(|user| sessions.remove_entry(&user))
                .collect()
        };

        let count = evicted.len();
        for (user, entry) in evicted {
            entry.session.shutdown().await;
            debug!(user = %user, "idle session evicted");
        }
        if count > 0 {
            info!(count, "idle sessions evicted");
        }
        count
    }

    /// Stop every listener.  Called once when the server exits.
    pub async fn shutdown_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.session.shutdown().await;
        }
        info!(count, "sessions shut down");
    }
}

//! Per-Project WebSocket Fan-out
//!
//! Tracks which live sockets are subscribed to which project and pushes
//! notification frames to all of them. Delivery is strictly best-effort:
//! sends go over per-socket unbounded channels and are never awaited, so a
//! slow or dead consumer cannot stall ingestion.
//!
//! The subscriber registry is self-healing: a send to a closed channel
//! prunes that subscriber on the spot, and a project whose last subscriber
//! is gone disappears from the map entirely. Sockets that close cleanly
//! still call [`ProjectBroadcaster::leave`]; pruning covers the ones that
//! never get the chance.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use loghouse_ingest::{NotificationSink, NotifyCounts};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct ProjectBroadcaster {
    subscribers: Mutex<HashMap<String, HashMap<Uuid, UnboundedSender<String>>>>,
}

impl ProjectBroadcaster {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<Uuid, UnboundedSender<String>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a socket's send channel under a project. The returned id is
    /// the handle for [`leave`](Self::leave).
    pub fn join(&self, project_id: &str, sender: UnboundedSender<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock()
            .entry(project_id.to_string())
            .or_default()
            .insert(id, sender);
        debug!(project_id, subscriber = %id, "WebSocket subscribed");
        id
    }

    pub fn leave(&self, project_id: &str, id: Uuid) {
        let mut subscribers = self.lock();
        if let Some(project) = subscribers.get_mut(project_id) {
            project.remove(&id);
            if project.is_empty() {
                subscribers.remove(project_id);
            }
        }
        debug!(project_id, subscriber = %id, "WebSocket unsubscribed");
    }

    /// Live subscriber count for a project.
    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.lock().get(project_id).map(HashMap::len).unwrap_or(0)
    }

    /// Send one frame to every subscriber of a project, pruning any whose
    /// channel has closed.
    pub fn send_to_project(&self, project_id: &str, frame: String) {
        let mut subscribers = self.lock();
        let Some(project) = subscribers.get_mut(project_id) else {
            return;
        };

        project.retain(|id, sender| {
            let alive = sender.send(frame.clone()).is_ok();
            if !alive {
                debug!(project_id, subscriber = %id, "Pruning closed WebSocket subscriber");
            }
            alive
        });

        if project.is_empty() {
            subscribers.remove(project_id);
        }
    }
}

impl NotificationSink for ProjectBroadcaster {
    fn broadcast(&self, project_id: &str, kind: &str, counts: NotifyCounts) {
        let frame = serde_json::json!({
            "type": kind,
            "projectId": project_id,
            "count": counts.count,
            "criticalCount": counts.critical_count,
        })
        .to_string();
        self.send_to_project(project_id, frame);
    }
}

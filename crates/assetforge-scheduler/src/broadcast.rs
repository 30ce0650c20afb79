//! Topic-scoped progress broadcaster for live-progress connections.

use assetforge_core::ConnectionId;
use assetforge_core::JobId;
use assetforge_core::event::{ProgressEvent, ServerMessage, Topic};
use assetforge_core::job::{Job, JobStatus, QueueName};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

/// Outbound half of a connection's message channel.
pub type ConnectionSender = mpsc::UnboundedSender<ServerMessage>;

struct Connection {
    sender: ConnectionSender,
    user_id: Option<String>,
    topics: HashSet<Topic>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    topics: HashMap<Topic, HashSet<ConnectionId>>,
}

impl Inner {
    fn leave(&mut self, id: ConnectionId, topic: &Topic) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Queue `message` for every member of `topic`. Closed channels are skipped.
    fn deliver(&self, topic: &Topic, message: &ServerMessage) -> usize {
        let Some(members) = self.topics.get(topic) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count()
    }
}

/// Delivers progress events to the connections subscribed to each topic.
///
/// Every channel is unbounded, so a slow client never blocks the publisher
/// or other clients. Delivery is at most once: nothing is buffered for
/// clients that subscribe later.
#[derive(Default)]
pub struct ProgressBroadcaster {
    inner: RwLock<Inner>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and greet it with `connected`.
    pub async fn connect(&self, sender: ConnectionSender) -> ConnectionId {
        let id = ConnectionId::new();
        let _ = sender.send(ServerMessage::Connected {
            connection_id: id.to_string(),
        });
        self.inner.write().await.connections.insert(
            id,
            Connection {
                sender,
                user_id: None,
                topics: HashSet::new(),
                connected_at: Utc::now(),
            },
        );
        debug!(connection_id = %id, "live connection registered");
        id
    }

    /// Drop a connection and all of its topic memberships.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.remove(&id) {
            for topic in &conn.topics {
                inner.leave(id, topic);
            }
            debug!(
                connection_id = %id,
                open_for_secs = (Utc::now() - conn.connected_at).num_seconds(),
                "live connection removed"
            );
        }
    }

    /// Join a topic. Joining twice is a no-op; the acknowledgement is sent
    /// either way. Returns false for an unknown connection.
    pub async fn subscribe(&self, id: ConnectionId, topic: Topic) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        conn.topics.insert(topic.clone());
        let _ = conn.sender.send(ServerMessage::Subscribed {
            topic: topic.clone(),
        });
        inner.topics.entry(topic).or_default().insert(id);
        true
    }

    pub async fn unsubscribe(&self, id: ConnectionId, topic: Topic) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        conn.topics.remove(&topic);
        let _ = conn.sender.send(ServerMessage::Unsubscribed {
            topic: topic.clone(),
        });
        inner.leave(id, &topic);
        true
    }

    /// Bind a connection to a user and join that user's topic.
    pub async fn authenticate(&self, id: ConnectionId, user_id: String) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        if let Some(previous) = conn.user_id.replace(user_id.clone()) {
            let old = Topic::User(previous);
            conn.topics.remove(&old);
            inner.leave(id, &old);
        }
        let topic = Topic::User(user_id.clone());
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.topics.insert(topic.clone());
            let _ = conn.sender.send(ServerMessage::Authenticated { user_id });
        }
        inner.topics.entry(topic).or_default().insert(id);
        true
    }

    /// Send directly to one connection.
    pub async fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    /// Deliver an event to its job topic, its project topic if any, and the
    /// global topic. Returns the number of messages queued.
    pub async fn publish(&self, event: ProgressEvent) -> usize {
        let inner = self.inner.read().await;
        let job_message = match event.queue_name {
            QueueName::AssetGeneration => ServerMessage::AssetProgress(event.clone()),
            QueueName::StylePackTraining => ServerMessage::StyleTrainingProgress(event.clone()),
        };
        let mut delivered = inner.deliver(&Topic::Job(event.job_id), &job_message);
        if let Some(project_id) = &event.project_id {
            delivered += inner.deliver(
                &Topic::Project(project_id.clone()),
                &ServerMessage::Progress(event.clone()),
            );
        }
        delivered += inner.deliver(&Topic::Global, &ServerMessage::ProgressUpdate(event));
        delivered
    }

    /// Publish a job's current state. Terminal states also notify the owner.
    pub async fn publish_job(&self, job: &Job) -> usize {
        let mut delivered = self.publish(ProgressEvent::from_job(job)).await;
        if job.is_terminal() {
            let title = match job.status {
                JobStatus::Completed => "Job completed",
                JobStatus::Failed => "Job failed",
                _ => "Job cancelled",
            };
            let message = match (&job.status, &job.last_error) {
                (JobStatus::Failed, Some(error)) => error.clone(),
                _ => format!("{} job {} is {}", job.queue_name, job.id, job.status),
            };
            delivered += self
                .notify_user(&job.owner_id, title, message, Some(job.id))
                .await;
        }
        delivered
    }

    /// Send a notification to every connection of `user_id`.
    pub async fn notify_user(
        &self,
        user_id: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        job_id: Option<JobId>,
    ) -> usize {
        let notification = ServerMessage::Notification {
            title: title.into(),
            message: message.into(),
            job_id,
        };
        self.inner
            .read()
            .await
            .deliver(&Topic::User(user_id.to_string()), &notification)
    }

    /// Send a system message to every connection.
    pub async fn system_message(&self, message: impl Into<String>) -> usize {
        self.send_all(ServerMessage::SystemMessage {
            message: message.into(),
        })
        .await
    }

    /// Tell every client the server is going away and forget all connections.
    pub async fn shutdown(&self, message: impl Into<String>) -> usize {
        let sent = self
            .send_all(ServerMessage::ServerShutdown {
                message: message.into(),
            })
            .await;
        let mut inner = self.inner.write().await;
        inner.connections.clear();
        inner.topics.clear();
        info!(count = sent, "notified live connections of shutdown");
        sent
    }

    async fn send_all(&self, message: ServerMessage) -> usize {
        self.inner
            .read()
            .await
            .connections
            .values()
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .read()
            .await
            .topics
            .get(topic)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(job_id: JobId, percentage: f32, project: Option<&str>) -> ProgressEvent {
        ProgressEvent {
            job_id,
            queue_name: QueueName::AssetGeneration,
            status: JobStatus::Processing,
            percentage,
            stage: "generating".to_string(),
            message: None,
            estimated_time_remaining: None,
            timestamp: Utc::now(),
            payload: None,
            project_id: project.map(str::to_string),
            owner_id: "user-1".to_string(),
        }
    }

    async fn connect(
        broadcaster: &ProgressBroadcaster,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.connect(tx).await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Connected { .. })));
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn percentages(messages: &[ServerMessage]) -> Vec<f32> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::AssetProgress(e) => Some(e.percentage),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn job_subscribers_receive_events_in_publish_order() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        let (a, mut rx_a) = connect(&broadcaster).await;
        let (b, mut rx_b) = connect(&broadcaster).await;
        broadcaster.subscribe(a, Topic::Job(job)).await;
        broadcaster.subscribe(b, Topic::Job(job)).await;

        broadcaster.publish(event(job, 25.0, None)).await;
        broadcaster.publish(event(job, 50.0, None)).await;

        assert_eq!(percentages(&drain(&mut rx_a)), vec![25.0, 50.0]);
        assert_eq!(percentages(&drain(&mut rx_b)), vec![25.0, 50.0]);
    }

    #[tokio::test]
    async fn publish_reaches_project_and_global_topics() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        let (project_conn, mut rx_project) = connect(&broadcaster).await;
        let (global_conn, mut rx_global) = connect(&broadcaster).await;
        let (_idle, mut rx_idle) = connect(&broadcaster).await;
        broadcaster
            .subscribe(project_conn, Topic::Project("proj-1".to_string()))
            .await;
        broadcaster.subscribe(global_conn, Topic::Global).await;
        drain(&mut rx_project);
        drain(&mut rx_global);

        let delivered = broadcaster.publish(event(job, 10.0, Some("proj-1"))).await;

        assert_eq!(delivered, 2);
        assert!(matches!(
            drain(&mut rx_project).as_slice(),
            [ServerMessage::Progress(_)]
        ));
        assert!(matches!(
            drain(&mut rx_global).as_slice(),
            [ServerMessage::ProgressUpdate(_)]
        ));
        assert!(drain(&mut rx_idle).is_empty());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_disconnect_drops_topics() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        let (id, mut rx) = connect(&broadcaster).await;
        broadcaster.subscribe(id, Topic::Job(job)).await;
        broadcaster.subscribe(id, Topic::Job(job)).await;
        drain(&mut rx);

        broadcaster.publish(event(job, 5.0, None)).await;
        assert_eq!(drain(&mut rx).len(), 1);

        broadcaster.disconnect(id).await;
        assert_eq!(broadcaster.subscriber_count(&Topic::Job(job)).await, 0);
        assert_eq!(broadcaster.connection_count().await, 0);
        assert_eq!(broadcaster.publish(event(job, 6.0, None)).await, 0);
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_block_others() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        let (gone, rx_gone) = connect(&broadcaster).await;
        let (live, mut rx_live) = connect(&broadcaster).await;
        broadcaster.subscribe(gone, Topic::Job(job)).await;
        broadcaster.subscribe(live, Topic::Job(job)).await;
        drop(rx_gone);
        drain(&mut rx_live);

        assert_eq!(broadcaster.publish(event(job, 40.0, None)).await, 1);
        assert_eq!(percentages(&drain(&mut rx_live)), vec![40.0]);
    }

    #[tokio::test]
    async fn authenticated_connections_get_owner_notifications() {
        let broadcaster = ProgressBroadcaster::new();
        let (id, mut rx) = connect(&broadcaster).await;
        broadcaster.authenticate(id, "user-1".to_string()).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Authenticated { .. }]
        ));

        let sent = broadcaster
            .notify_user("user-1", "Job completed", "done", None)
            .await;
        assert_eq!(sent, 1);
        assert_eq!(broadcaster.notify_user("user-2", "t", "m", None).await, 0);

        broadcaster.authenticate(id, "user-2".to_string()).await;
        assert_eq!(broadcaster.notify_user("user-1", "t", "m", None).await, 0);
    }

    #[tokio::test]
    async fn shutdown_notifies_and_clears() {
        let broadcaster = ProgressBroadcaster::new();
        let (_, mut rx) = connect(&broadcaster).await;
        assert_eq!(broadcaster.shutdown("bye").await, 1);
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::ServerShutdown { .. })
        ));
        assert_eq!(broadcaster.connection_count().await, 0);
    }
}

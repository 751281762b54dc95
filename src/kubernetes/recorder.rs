//! [`EventRecorder`] publishing core events

use crate::domain::ports::{EventRecorder, EventType};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes events on behalf of one controller instance
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// `controller` is the reporting component, `instance` the replica identity
    pub fn new(client: Client, controller: &str, instance: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: Some(instance.to_string()),
            },
        }
    }
}

fn kube_event_type(event_type: EventType) -> KubeEventType {
    match event_type {
        EventType::Normal => KubeEventType::Normal,
        EventType::Warning => KubeEventType::Warning,
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let event = Event {
            type_: kube_event_type(event_type),
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                object = ?regarding.name,
                reason = %reason,
                "Failed to record event: {}",
                e
            );
        }
    }
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder")
            .field("controller", &self.reporter.controller)
            .field("instance", &self.reporter.instance)
            .finish()
    }
}

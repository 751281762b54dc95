//! [`ClusterApi`] over a live API server

use crate::domain::ports::{ClaimWatchEvent, ClusterApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{
    Event as CoreEvent, Node, PersistentVolume, PersistentVolumeClaim,
};
use kube::api::{DeleteParams, PostParams};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

type WatchResult<K> = std::result::Result<watcher::Event<K>, watcher::Error>;

fn claim_signals(event: WatchResult<PersistentVolumeClaim>) -> Vec<ClaimWatchEvent> {
    match event {
        Ok(watcher::Event::Applied(claim)) => vec![ClaimWatchEvent::Changed(claim)],
        Ok(watcher::Event::Deleted(_)) => vec![ClaimWatchEvent::Deleted],
        // The listing is filtered to one name: empty means it is gone
        Ok(watcher::Event::Restarted(claims)) if claims.is_empty() => {
            vec![ClaimWatchEvent::Deleted]
        }
        Ok(watcher::Event::Restarted(claims)) => {
            claims.into_iter().map(ClaimWatchEvent::Changed).collect()
        }
        Err(e) => vec![ClaimWatchEvent::Failed(e.to_string())],
    }
}

/// When an event was last recorded, by the newest timestamp it carries
fn recorded_at(event: &CoreEvent) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

fn event_signal(event: CoreEvent) -> ClaimWatchEvent {
    ClaimWatchEvent::Event {
        reason: event.reason.unwrap_or_default(),
    }
}

fn event_signals(event: WatchResult<CoreEvent>, since: DateTime<Utc>) -> Vec<ClaimWatchEvent> {
    match event {
        Ok(watcher::Event::Applied(recorded)) => vec![event_signal(recorded)],
        // Listings replay history; only what was recorded from `since` on counts
        Ok(watcher::Event::Restarted(listed)) => listed
            .into_iter()
            .filter(|e| recorded_at(e).is_some_and(|at| at >= since))
            .map(event_signal)
            .collect(),
        Ok(watcher::Event::Deleted(_)) => Vec::new(),
        Err(e) => vec![ClaimWatchEvent::Failed(e.to_string())],
    }
}

/// Wait for a watch's first listing, so the watch is live once this returns
async fn established<K>(
    mut raw: BoxStream<'static, WatchResult<K>>,
) -> Result<(Vec<K>, BoxStream<'static, WatchResult<K>>)> {
    loop {
        match raw.next().await {
            Some(Ok(watcher::Event::Restarted(listed))) => return Ok((listed, raw)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::Watch(e.to_string())),
            None => return Err(Error::Watch("watch closed before listing".into())),
        }
    }
}

/// Merge a claim watch and its event watch into one signal stream
async fn claim_watch(
    claims: BoxStream<'static, WatchResult<PersistentVolumeClaim>>,
    events: BoxStream<'static, WatchResult<CoreEvent>>,
    since: DateTime<Utc>,
) -> Result<BoxStream<'static, ClaimWatchEvent>> {
    let (listed_claims, claims) = established(claims).await?;
    let (listed_events, events) = established(events).await?;

    let claim_changes = stream::iter(claim_signals(Ok(watcher::Event::Restarted(listed_claims))))
        .chain(claims.flat_map(|event| stream::iter(claim_signals(event))));
    let recorded = stream::iter(event_signals(
        Ok(watcher::Event::Restarted(listed_events)),
        since,
    ))
    .chain(events.flat_map(move |event| stream::iter(event_signals(event, since))));

    Ok(stream::select(claim_changes, recorded).boxed())
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes().get_opt(name).await?)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        Ok(self.volumes().create(&PostParams::default(), volume).await?)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims(namespace).get_opt(name).await?)
    }

    async fn replace_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim.namespace().unwrap_or_default();
        Ok(self
            .claims(&namespace)
            .replace(&claim.name_any(), &PostParams::default(), claim)
            .await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?)
    }

    async fn watch_claim(
        &self,
        claim: &PersistentVolumeClaim,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, ClaimWatchEvent>> {
        let namespace = claim.namespace().unwrap_or_default();
        let name = claim.name_any();
        let uid = claim.uid().unwrap_or_default();
        debug!(claim = %format!("{}/{}", namespace, name), "Watching claim");

        let claims = watcher(
            self.claims(&namespace),
            watcher::Config::default().fields(&format!("metadata.name={}", name)),
        )
        .boxed();

        let events: Api<CoreEvent> = Api::namespaced(self.client.clone(), &namespace);
        let events = watcher(
            events,
            watcher::Config::default().fields(&format!("involvedObject.uid={}", uid)),
        )
        .boxed();

        claim_watch(claims, events, since).await
    }
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi").finish_non_exhaustive()
    }
}

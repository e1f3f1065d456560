//! Append-only stream with consumer groups and per-group pending lists.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use hotpath::backend::{
    ConsumerStats, ReadCursor, StreamGroup, StreamLog, StreamMessage, StreamStats,
};
use hotpath::errors::{BackendError, BackendResult};
use hotpath::types::{ConsumerName, MessageId, Timestamp};
use tracing::debug;

use crate::backend::InMemoryBackend;

#[derive(Debug, Clone)]
struct Delivery {
    consumer: String,
    delivered_at: Timestamp,
    count: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: Option<MessageId>,
    pending: BTreeMap<MessageId, Delivery>,
    consumers: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Stream {
    last_id: Option<MessageId>,
    entries: BTreeMap<MessageId, BTreeMap<String, String>>,
    groups: HashMap<String, Group>,
}

impl Stream {
    pub(crate) fn append(&mut self, fields: BTreeMap<String, String>, now_millis: u64) -> MessageId {
        let id = self
            .last_id
            .map_or(MessageId::new(now_millis, 0), |last| last.successor_at(now_millis));
        self.last_id = Some(id);
        self.entries.insert(id, fields);
        id
    }

    fn message(&self, id: MessageId, delivery: &Delivery) -> StreamMessage {
        StreamMessage {
            id,
            fields: self.entries.get(&id).cloned().unwrap_or_default(),
            delivery_count: delivery.count,
        }
    }
}

fn no_group(group: &StreamGroup) -> BackendError {
    BackendError::NoSuchGroup(format!("{}/{}", group.stream, group.group))
}

impl InMemoryBackend {
    /// Delivers up to `count` new messages, or nothing if none are waiting.
    fn deliver_new(
        &self,
        group: &StreamGroup,
        consumer: &ConsumerName,
        count: usize,
    ) -> BackendResult<Vec<StreamMessage>> {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let stream = state.streams.get_mut(&group.stream).ok_or_else(|| no_group(group))?;
        let Stream {
            entries, groups, ..
        } = stream;
        let g = groups.get_mut(&group.group).ok_or_else(|| no_group(group))?;
        g.consumers.insert(consumer.to_string());

        let start = g.last_delivered;
        let mut delivered = Vec::new();
        for (id, fields) in entries
            .iter()
            .filter(|(id, _)| start.map_or(true, |s| **id > s))
            .take(count)
        {
            g.pending.insert(
                *id,
                Delivery {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    count: 1,
                },
            );
            g.last_delivered = Some(*id);
            delivered.push(StreamMessage {
                id: *id,
                fields: fields.clone(),
                delivery_count: 1,
            });
        }
        Ok(delivered)
    }
}

#[async_trait]
impl StreamLog for InMemoryBackend {
    async fn ensure_group(&self, group: &StreamGroup) -> BackendResult<bool> {
        self.check()?;
        let mut state = self.inner.state.lock();
        let stream = state.streams.entry(group.stream.clone()).or_default();
        if stream.groups.contains_key(&group.group) {
            return Ok(false);
        }
        stream.groups.insert(group.group.clone(), Group::default());
        debug!(stream = %group.stream, group = %group.group, "consumer group created");
        Ok(true)
    }

    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
    ) -> BackendResult<MessageId> {
        self.check()?;
        let now = self.now();
        let id = self.inner.state.lock().append(stream, fields, now);
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        group: &StreamGroup,
        consumer: &ConsumerName,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> BackendResult<Vec<StreamMessage>> {
        self.check()?;

        if let ReadCursor::Pending { after } = cursor {
            let now = self.now();
            let mut state = self.inner.state.lock();
            let stream = state.streams.get_mut(&group.stream).ok_or_else(|| no_group(group))?;
            let g = stream.groups.get_mut(&group.group).ok_or_else(|| no_group(group))?;
            g.consumers.insert(consumer.to_string());

            let mut redelivered = Vec::new();
            for (id, delivery) in g
                .pending
                .iter_mut()
                .filter(|(id, d)| d.consumer == consumer.as_ref() && after.map_or(true, |a| **id > a))
                .take(count)
            {
                delivery.count += 1;
                delivery.delivered_at = now;
                redelivered.push((*id, delivery.clone()));
            }
            return Ok(redelivered
                .into_iter()
                .map(|(id, delivery)| stream.message(id, &delivery))
                .collect());
        }

        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.deliver_new(group, consumer, count)?;
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
            self.check()?;
        }
    }

    async fn ack(&self, group: &StreamGroup, ids: &[MessageId]) -> BackendResult<u64> {
        self.check()?;
        let mut state = self.inner.state.lock();
        let Some(g) = state
            .streams
            .get_mut(&group.stream)
            .and_then(|s| s.groups.get_mut(&group.group))
        else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| g.pending.remove(id).is_some()).count() as u64)
    }

    async fn claim_idle(
        &self,
        group: &StreamGroup,
        consumer: &ConsumerName,
        min_idle: Duration,
        count: usize,
    ) -> BackendResult<Vec<StreamMessage>> {
        self.check()?;
        let now = self.now();
        let mut state = self.inner.state.lock();
        let stream = state.streams.get_mut(&group.stream).ok_or_else(|| no_group(group))?;
        let g = stream.groups.get_mut(&group.group).ok_or_else(|| no_group(group))?;
        g.consumers.insert(consumer.to_string());

        let mut claimed = Vec::new();
        for (id, delivery) in g
            .pending
            .iter_mut()
            .filter(|(_, d)| {
                d.consumer != consumer.as_ref() && now.duration_since(d.delivered_at) >= min_idle
            })
            .take(count)
        {
            debug!(message_id = %id, from = %delivery.consumer, to = %consumer, "pending message claimed");
            delivery.consumer = consumer.to_string();
            delivery.count += 1;
            delivery.delivered_at = now;
            claimed.push((*id, delivery.clone()));
        }
        Ok(claimed
            .into_iter()
            .map(|(id, delivery)| stream.message(id, &delivery))
            .collect())
    }

    async fn stats(&self, group: &StreamGroup) -> BackendResult<StreamStats> {
        self.check()?;
        let state = self.inner.state.lock();
        let stream = state.streams.get(&group.stream).ok_or_else(|| no_group(group))?;
        let g = stream.groups.get(&group.group).ok_or_else(|| no_group(group))?;

        let consumers = g
            .consumers
            .iter()
            .map(|name| ConsumerStats {
                name: name.clone(),
                pending: g.pending.values().filter(|d| &d.consumer == name).count() as u64,
            })
            .collect();
        Ok(StreamStats {
            length: stream.entries.len() as u64,
            pending: g.pending.len() as u64,
            last_delivered: g.last_delivered,
            consumers,
        })
    }
}

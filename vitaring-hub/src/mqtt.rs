use crate::channel::{feed_path, FeedSignal, LiveChannel};
use crate::config::FeedConf;
use crate::error::{Result, TelemetryError};
use crate::models::DeviceId;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS, SubscribeReasonCode};
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a single publish on the device topic means.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Record(Value),
    /// Empty retained message or JSON `null`: nothing at this path.
    Absent,
}

pub fn decode_payload(payload: &[u8]) -> FeedEvent {
    let text = String::from_utf8_lossy(payload);
    if text.trim().is_empty() {
        return FeedEvent::Absent;
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Null) => FeedEvent::Absent,
        Ok(value) => FeedEvent::Record(value),
        Err(e) => {
            debug!("non-JSON payload on feed ({e}), forwarding as text");
            FeedEvent::Record(Value::String(text.into_owned()))
        }
    }
}

/// What the channel task does with one event from the MQTT event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedAction {
    /// (Re)connected: the session is clean, so the topic must be subscribed again.
    Subscribe,
    Deliver(FeedEvent),
    SetupFailed(String),
    Ignore,
}

pub fn feed_action(event: &Event, topic: &str) -> FeedAction {
    match event {
        Event::Incoming(Incoming::ConnAck(ack)) => match ack.code {
            ConnectReturnCode::Success => FeedAction::Subscribe,
            code => FeedAction::SetupFailed(format!("broker refused connection: {code:?}")),
        },
        Event::Incoming(Incoming::Publish(p)) if p.topic == topic => FeedAction::Deliver(decode_payload(&p.payload)),
        Event::Incoming(Incoming::SubAck(ack))
            if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) =>
        {
            FeedAction::SetupFailed(format!("broker refused subscription to {topic}"))
        }
        _ => FeedAction::Ignore,
    }
}

/// Live channel over the MQTT retained-message tree `<root>/<deviceId>`.
pub struct MqttChannel {
    feed: FeedConf,
    task: Option<JoinHandle<()>>,
    topic: Option<String>,
}

impl MqttChannel {
    pub fn new(feed: FeedConf) -> Self {
        Self { feed, task: None, topic: None }
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .feed
            .client_id
            .clone()
            .unwrap_or_else(|| format!("vitaring-hub-{}", Uuid::new_v4().simple()));
        let mut opts = MqttOptions::new(client_id, &self.feed.host, self.feed.port);
        opts.set_keep_alive(Duration::from_secs(self.feed.keep_alive_secs.max(1)));
        opts.set_clean_session(true);
        opts
    }
}

impl LiveChannel for MqttChannel {
    fn open(&mut self, device_id: &DeviceId, signal: FeedSignal) -> Result<()> {
        if self.is_open() {
            return Err(TelemetryError::InvalidOperatorCall(
                "channel already open; close it before opening another device".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::SubscriptionSetup(format!("no tokio runtime: {e}")))?;

        let topic = feed_path(&self.feed.root, device_id);
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        let task_topic = topic.clone();

        let task = runtime.spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("feed connection error on {task_topic}: {e}");
                        signal.setup_failed(e);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                };
                match feed_action(&event, &task_topic) {
                    FeedAction::Subscribe => {
                        debug!("connected, subscribing to {task_topic}");
                        if let Err(e) = client.subscribe(&task_topic, QoS::AtLeastOnce).await {
                            signal.setup_failed(e);
                            return;
                        }
                    }
                    FeedAction::Deliver(FeedEvent::Record(raw)) => signal.record(raw),
                    FeedAction::Deliver(FeedEvent::Absent) => signal.absent(),
                    FeedAction::SetupFailed(msg) => signal.setup_failed(msg),
                    FeedAction::Ignore => {}
                }
            }
        });

        info!("live channel opening {topic}");
        self.task = Some(task);
        self.topic = Some(topic);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Some(topic) = self.topic.take() {
                info!("live channel closed for {topic}");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.close();
    }
}

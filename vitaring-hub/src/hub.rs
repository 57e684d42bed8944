/*!
TELEMETRY HUB - single owner of the ring's current state

Arbitrates between the live channel and the synthetic source, runs live
payloads through the normalizer, derives the connection status and
broadcasts every accepted change as a full `DeviceState`.

All mutation happens under one lock: operator calls, channel callbacks and
timer ticks each take it for the whole apply-and-publish step. Every source
transition bumps an epoch, and callbacks created under an older epoch are
dropped, so a closed channel or a cancelled timer can never write state.
*/

use crate::channel::{FeedSignal, LiveChannel, Lost, LostReason};
use crate::config::HubConfig;
use crate::error::{Result, TelemetryError};
use crate::health::{HealthTracker, HubHealth, HubView};
use crate::identity::{DeviceIdentityResolver, IdentityMatch};
use crate::models::{ConnectionStatus, DeviceId, DeviceState, SourceMode, TelemetryRecord};
use crate::normalizer::{self, PayloadNormalizer};
use crate::state::{new_state, Shared};
use crate::synthetic::{Scenario, SyntheticSource};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubPhase {
    Idle,
    ListeningLive,
    ListeningSynthetic,
}

impl fmt::Display for HubPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HubPhase::Idle => "idle",
            HubPhase::ListeningLive => "listening_live",
            HubPhase::ListeningSynthetic => "listening_synthetic",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub restart_grace: Duration,
    pub synthetic_baseline: Scenario,
    pub synthetic_seed: Option<u64>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            restart_grace: DEFAULT_RESTART_GRACE,
            synthetic_baseline: Scenario::Demo,
            synthetic_seed: None,
        }
    }
}

impl HubSettings {
    pub fn from_config(cfg: &HubConfig) -> Result<Self> {
        Ok(Self {
            restart_grace: cfg.restart_grace(),
            synthetic_baseline: cfg.synthetic.baseline.parse()?,
            synthetic_seed: cfg.synthetic.seed,
        })
    }
}

type CoreRef = Weak<parking_lot::Mutex<HubCore>>;

struct HubCore {
    phase: HubPhase,
    state: DeviceState,
    /// Connection as the feed reports it, before the manual override.
    feed_connection: ConnectionStatus,
    manual_offline: bool,
    epoch: u64,
    live_target: Option<DeviceId>,
    normalizer: Option<PayloadNormalizer>,
    channel: Box<dyn LiveChannel>,
    synthetic: SyntheticSource,
    resolver: DeviceIdentityResolver,
    subscribers: Vec<(u64, mpsc::UnboundedSender<DeviceState>)>,
    next_subscriber: u64,
    health: HealthTracker,
}

impl HubCore {
    fn reported_connection(&self) -> ConnectionStatus {
        if self.manual_offline {
            ConnectionStatus::ManualOffline
        } else {
            self.feed_connection
        }
    }

    fn publish(&mut self) {
        self.state.connection = self.reported_connection();
        let snapshot = self.state.clone();
        self.subscribers.retain(|(id, tx)| {
            let delivered = tx.send(snapshot.clone()).is_ok();
            if !delivered {
                debug!("dropping closed subscriber {id}");
            }
            delivered
        });
        self.health.mark_published();
    }

    /// Closes the channel and stops the timer; any callback still in flight
    /// carries the old epoch and is ignored.
    fn halt_sources(&mut self) {
        self.channel.close();
        self.synthetic.stop();
        self.epoch += 1;
        self.live_target = None;
        self.normalizer = None;
    }

    fn reset_current(&mut self) {
        self.state.current = None;
        self.feed_connection = ConnectionStatus::Offline;
    }

    /// Opens the channel under a fresh epoch. A setup failure is surfaced
    /// like a lost feed; returns false in that case.
    fn open_live(&mut self, device_id: DeviceId, core: &CoreRef) -> bool {
        self.epoch += 1;
        let epoch = self.epoch;
        self.normalizer = Some(PayloadNormalizer::for_device(device_id.clone()));
        self.live_target = Some(device_id.clone());

        let on_record = {
            let core = core.clone();
            move |raw: Value| {
                if let Some(core) = core.upgrade() {
                    core.lock().accept_live(epoch, raw);
                }
            }
        };
        let on_lost = {
            let core = core.clone();
            move |lost: Lost| {
                if let Some(core) = core.upgrade() {
                    core.lock().accept_lost(epoch, lost);
                }
            }
        };

        match self.channel.open(&device_id, FeedSignal::new(on_record, on_lost)) {
            Ok(()) => {
                self.health.mark_channel_opened();
                info!("listening live on {device_id}");
                true
            }
            Err(e) => {
                error!("could not open live channel for {device_id}: {e}");
                self.health.mark_lost();
                self.reset_current();
                false
            }
        }
    }

    fn is_current(&self, epoch: u64, phase: HubPhase) -> bool {
        if epoch == self.epoch && self.phase == phase {
            return true;
        }
        debug!("ignoring event from epoch {epoch} (now {} in {})", self.epoch, self.phase);
        self.health.mark_stale_dropped();
        false
    }

    fn accept_live(&mut self, epoch: u64, raw: Value) {
        if !self.is_current(epoch, HubPhase::ListeningLive) {
            return;
        }
        let Some(normalizer) = &self.normalizer else {
            return;
        };
        let record = normalizer.normalize(&raw, self.state.current.as_ref());

        match self.resolver.classify(&record.device_id) {
            IdentityMatch::Legacy { rank } => warn!(
                "payload on {} reports legacy device id {} (rank {rank})",
                normalizer.device_id(),
                record.device_id
            ),
            IdentityMatch::Unknown => debug!(
                "payload on {} reports unrecognised device id {}",
                normalizer.device_id(),
                record.device_id
            ),
            IdentityMatch::Active => {}
        }

        debug!(
            "live record: pulse {} surface {:.2}°C pressure {:.2}hPa",
            record.pulse_proxy_value, record.surface_temperature, record.barometric_pressure
        );
        self.state.current = Some(record);
        self.feed_connection = ConnectionStatus::Online;
        self.health.mark_record_accepted();
        self.publish();
    }

    fn accept_lost(&mut self, epoch: u64, lost: Lost) {
        if !self.is_current(epoch, HubPhase::ListeningLive) {
            return;
        }
        match (&lost.reason, lost.was_receiving) {
            (LostReason::PathAbsent, true) => warn!("feed lost for {}", self.state.active_device_id),
            (LostReason::PathAbsent, false) => info!("no data has arrived for {}", self.state.active_device_id),
            (LostReason::SetupFailed(msg), _) => error!("feed unavailable for {}: {msg}", self.state.active_device_id),
        }
        self.reset_current();
        self.health.mark_lost();
        self.publish();
    }

    fn accept_synthetic(&mut self, epoch: u64, record: TelemetryRecord) {
        if !self.is_current(epoch, HubPhase::ListeningSynthetic) {
            return;
        }
        self.apply_synthetic(record);
    }

    fn apply_synthetic(&mut self, record: TelemetryRecord) {
        let record = normalizer::settle(record, self.state.current.as_ref());
        self.state.current = Some(record);
        self.feed_connection = ConnectionStatus::Online;
        self.health.mark_record_accepted();
        self.publish();
    }

    /// Close-then-open onto `device_id`, leaving synthetic mode if needed.
    fn switch_live(&mut self, device_id: DeviceId, core: &CoreRef) {
        self.halt_sources();
        self.reset_current();
        self.resolver.retarget(device_id.clone());
        self.synthetic.retarget(device_id.clone());
        self.state.active_device_id = device_id.clone();
        self.state.source_mode = SourceMode::Live;
        self.phase = HubPhase::ListeningLive;
        self.open_live(device_id, core);
        self.publish();
    }
}

/// Handle to a running hub. Clones share the same state.
#[derive(Clone)]
pub struct TelemetryHub {
    core: Shared<HubCore>,
    settings: Arc<HubSettings>,
    health: HealthTracker,
}

impl TelemetryHub {
    pub fn new(settings: HubSettings, channel: Box<dyn LiveChannel>, resolver: DeviceIdentityResolver) -> Self {
        let health = HealthTracker::new();
        let active = resolver.resolve().clone();
        let synthetic = SyntheticSource::new(settings.synthetic_baseline, settings.synthetic_seed, active.clone());
        let core = HubCore {
            phase: HubPhase::Idle,
            state: DeviceState::initial(active),
            feed_connection: ConnectionStatus::Offline,
            manual_offline: false,
            epoch: 0,
            live_target: None,
            normalizer: None,
            channel,
            synthetic,
            resolver,
            subscribers: Vec::new(),
            next_subscriber: 0,
            health: health.clone(),
        };
        Self {
            core: new_state(core),
            settings: Arc::new(settings),
            health,
        }
    }

    pub fn from_config(cfg: &HubConfig, channel: Box<dyn LiveChannel>) -> Result<Self> {
        let settings = HubSettings::from_config(cfg)?;
        let resolver = DeviceIdentityResolver::from_config(&cfg.device)?;
        Ok(Self::new(settings, channel, resolver))
    }

    fn core_ref(&self) -> CoreRef {
        Arc::downgrade(&self.core)
    }

    /// The current snapshot is delivered first, then every publication.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = self.core.lock();
        core.state.connection = core.reported_connection();
        let id = core.next_subscriber;
        core.next_subscriber += 1;
        // The receiver is alive here, so this cannot fail.
        let _ = tx.send(core.state.clone());
        core.subscribers.push((id, tx));
        Subscription { id, rx, hub: self.core_ref() }
    }

    pub fn snapshot(&self) -> DeviceState {
        let core = self.core.lock();
        let mut state = core.state.clone();
        state.connection = core.reported_connection();
        state
    }

    pub fn phase(&self) -> HubPhase {
        self.core.lock().phase
    }

    pub fn resolver(&self) -> DeviceIdentityResolver {
        self.core.lock().resolver.clone()
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn health(&self) -> HubHealth {
        let view = {
            let core = self.core.lock();
            HubView {
                phase: core.phase.to_string(),
                source_mode: core.state.source_mode,
                connection: core.reported_connection(),
                active_device_id: core.state.active_device_id.clone(),
                subscribers: core.subscribers.len(),
            }
        };
        self.health.get_health(view)
    }

    pub fn start_live(&self, device_id: &str) -> Result<()> {
        let device_id = DeviceId::new(device_id)?;
        let core_ref = self.core_ref();
        let mut core = self.core.lock();
        core.switch_live(device_id, &core_ref);
        Ok(())
    }

    /// Starts listening on whatever id the resolver currently prefers.
    pub fn start_live_resolved(&self) -> Result<()> {
        let target = self.core.lock().resolver.resolve().clone();
        self.start_live(target.as_str())
    }

    /// Moves the hub to another device id. While live this is a
    /// close-then-open; otherwise only the target changes.
    pub fn retarget(&self, device_id: &str) -> Result<()> {
        let device_id = DeviceId::new(device_id)?;
        let core_ref = self.core_ref();
        let mut core = self.core.lock();
        if core.phase == HubPhase::ListeningLive {
            info!("retargeting live channel to {device_id}");
            core.switch_live(device_id, &core_ref);
        } else if core.state.active_device_id != device_id {
            core.resolver.retarget(device_id.clone());
            core.synthetic.retarget(device_id.clone());
            core.state.active_device_id = device_id;
            core.publish();
        }
        Ok(())
    }

    /// Closes the channel, waits the grace delay, then reopens the same id.
    /// The reopen is abandoned if a source transition (start, stop, retarget
    /// or another restart) moved the epoch meanwhile. Calls that leave the
    /// source alone, like the offline override, do not cancel it.
    pub async fn restart(&self) -> Result<()> {
        let (target, pending) = {
            let mut core = self.core.lock();
                if core.phase != HubPhase::ListeningLive {
                return Err(TelemetryError::InvalidOperatorCall(format!(
                    "restart needs a live subscription (hub is {})",
                    core.phase
                )));
            }
            let Some(target) = core.live_target.clone() else {
                return Err(TelemetryError::InvalidOperatorCall("no live target to restart".into()));
            };
            core.channel.close();
            core.epoch += 1;
            self.health.mark_restart();
            (target, core.epoch)
        };

        info!("restarting live channel for {target} in {:?}", self.settings.restart_grace);
        tokio::time::sleep(self.settings.restart_grace).await;

        let core_ref = self.core_ref();
        let mut core = self.core.lock();
        if core.epoch != pending || core.phase != HubPhase::ListeningLive {
            info!("restart of {target} superseded");
            return Ok(());
        }
        if !core.open_live(target, &core_ref) {
            core.publish();
        }
        Ok(())
    }

    pub fn start_synthetic(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(TelemetryError::InvalidOperatorCall(
                "synthetic interval must be greater than zero".into(),
            ));
        }
        let core_ref = self.core_ref();
        let mut core = self.core.lock();
        core.halt_sources();
        core.reset_current();
        let epoch = core.epoch;

        let started = core.synthetic.start(interval, move |record| {
            if let Some(core) = core_ref.upgrade() {
                core.lock().accept_synthetic(epoch, record);
            }
        });
        match started {
            Ok(()) => {
                core.phase = HubPhase::ListeningSynthetic;
                core.state.source_mode = SourceMode::Synthetic;
                core.publish();
                Ok(())
            }
            Err(e) => {
                core.phase = HubPhase::Idle;
                core.state.source_mode = SourceMode::None;
                core.publish();
                Err(e)
            }
        }
    }

    pub fn stop_synthetic(&self) {
        let mut core = self.core.lock();
        if core.phase != HubPhase::ListeningSynthetic {
            core.synthetic.stop();
            return;
        }
        core.halt_sources();
        core.reset_current();
        core.phase = HubPhase::Idle;
        core.state.source_mode = SourceMode::None;
        core.publish();
    }

    /// Publishes one record for the named scenario right away. From idle this
    /// enters synthetic mode without a timer; while live it is refused.
    pub fn emit_scenario(&self, name: &str) -> Result<()> {
        let scenario: Scenario = name.parse()?;
        let mut core = self.core.lock();
        match core.phase {
            HubPhase::ListeningLive => {
                warn!("refusing scenario {name} while live");
                return Err(TelemetryError::SourceConflict { active: SourceMode::Live });
            }
            HubPhase::Idle => {
                core.epoch += 1;
                core.phase = HubPhase::ListeningSynthetic;
                core.state.source_mode = SourceMode::Synthetic;
            }
            HubPhase::ListeningSynthetic => {}
        }
        let record = core.synthetic.sample(scenario);
        info!("scenario {name}: pulse {}", record.pulse_proxy_value);
        core.apply_synthetic(record);
        Ok(())
    }

    pub fn set_offline_override(&self, enabled: bool) {
        let mut core = self.core.lock();
        if core.manual_offline == enabled {
            return;
        }
        info!("manual offline override {}", if enabled { "set" } else { "cleared" });
        core.manual_offline = enabled;
        core.publish();
    }

    /// Tears down whichever source is active. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut core = self.core.lock();
        let was_active = core.phase != HubPhase::Idle;
        core.halt_sources();
        if was_active {
            info!("hub stopped");
            core.phase = HubPhase::Idle;
            core.state.source_mode = SourceMode::None;
            core.reset_current();
            core.publish();
        }
    }
}

/// Receives every publication from the moment of subscribing.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DeviceState>,
    hub: CoreRef,
}

impl Subscription {
    /// `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<DeviceState> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeviceState> {
        self.rx.try_recv().ok()
    }

    /// Everything published since the last read, oldest first.
    pub fn drain(&mut self) -> Vec<DeviceState> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(core) = self.hub.upgrade() {
            core.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

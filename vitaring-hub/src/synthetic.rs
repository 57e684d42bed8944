//! Synthetic telemetry for demos and tests.
//!
//! Produces plausible ring readings without a device: each scenario has a
//! band per field and values wander inside it as a bounded random walk, so a
//! test can assert band membership for any scenario on every sample.

use crate::error::{Result, TelemetryError};
use crate::models::{DeviceId, RecordKind, TelemetryRecord};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    Demo,
    Exercise,
    Rest,
    Outdoor,
    LowBattery,
}

impl FromStr for Scenario {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" => Ok(Self::Demo),
            "exercise" => Ok(Self::Exercise),
            "rest" => Ok(Self::Rest),
            "outdoor" => Ok(Self::Outdoor),
            "low_battery" | "low-battery" => Ok(Self::LowBattery),
            other => Err(TelemetryError::InvalidOperatorCall(format!("unknown scenario '{other}'"))),
        }
    }
}

/// Inclusive value range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn width(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioProfile {
    pub pulse: Band,
    pub object_temperature: Band,
    pub surface_temperature: Band,
    pub ambient_temperature: Band,
    pub pressure: Band,
    pub altitude: Band,
    pub battery: Band,
    pub infrared: Band,
}

const INFRARED_BAND: Band = Band::new(1000.0, 1800.0);

const DEMO: ScenarioProfile = ScenarioProfile {
    pulse: Band::new(70.0, 95.0),
    object_temperature: Band::new(32.0, 38.0),
    surface_temperature: Band::new(30.0, 36.0),
    ambient_temperature: Band::new(28.0, 36.0),
    pressure: Band::new(990.0, 1010.0),
    altitude: Band::new(106.0, 116.0),
    battery: Band::new(60.0, 100.0),
    infrared: INFRARED_BAND,
};

const EXERCISE: ScenarioProfile = ScenarioProfile {
    pulse: Band::new(130.0, 160.0),
    object_temperature: Band::new(36.5, 38.5),
    surface_temperature: Band::new(33.0, 36.0),
    ambient_temperature: Band::new(28.0, 34.0),
    pressure: Band::new(995.0, 1015.0),
    altitude: Band::new(100.0, 120.0),
    battery: Band::new(50.0, 90.0),
    infrared: INFRARED_BAND,
};

const REST: ScenarioProfile = ScenarioProfile {
    pulse: Band::new(60.0, 75.0),
    object_temperature: Band::new(33.0, 35.0),
    surface_temperature: Band::new(30.0, 33.0),
    ambient_temperature: Band::new(24.0, 28.0),
    pressure: Band::new(1005.0, 1020.0),
    altitude: Band::new(100.0, 110.0),
    battery: Band::new(70.0, 100.0),
    infrared: INFRARED_BAND,
};

const OUTDOOR: ScenarioProfile = ScenarioProfile {
    pulse: Band::new(75.0, 100.0),
    object_temperature: Band::new(32.0, 37.0),
    surface_temperature: Band::new(26.0, 38.0),
    ambient_temperature: Band::new(20.0, 38.0),
    pressure: Band::new(985.0, 1015.0),
    altitude: Band::new(100.0, 150.0),
    battery: Band::new(50.0, 100.0),
    infrared: INFRARED_BAND,
};

const LOW_BATTERY: ScenarioProfile = ScenarioProfile {
    pulse: Band::new(65.0, 85.0),
    object_temperature: Band::new(33.0, 36.0),
    surface_temperature: Band::new(30.0, 34.0),
    ambient_temperature: Band::new(26.0, 32.0),
    pressure: Band::new(1000.0, 1015.0),
    altitude: Band::new(100.0, 115.0),
    battery: Band::new(5.0, 15.0),
    infrared: INFRARED_BAND,
};

impl Scenario {
    pub fn profile(self) -> &'static ScenarioProfile {
        match self {
            Scenario::Demo => &DEMO,
            Scenario::Exercise => &EXERCISE,
            Scenario::Rest => &REST,
            Scenario::Outdoor => &OUTDOOR,
            Scenario::LowBattery => &LOW_BATTERY,
        }
    }

    pub fn record_kind(self) -> RecordKind {
        match self {
            Scenario::Demo => RecordKind::Demo,
            Scenario::Exercise => RecordKind::Exercise,
            Scenario::Rest => RecordKind::Rest,
            Scenario::Outdoor => RecordKind::Outdoor,
            Scenario::LowBattery => RecordKind::LowBattery,
        }
    }
}

/// Last walk position, per field, for the scenario that produced it.
#[derive(Debug, Clone, Copy)]
struct WalkState {
    scenario: Scenario,
    pulse: f64,
    object_temperature: f64,
    surface_temperature: f64,
    ambient_temperature: f64,
    pressure: f64,
    altitude: f64,
    battery: f64,
    infrared: f64,
}

/// Percent of charge used per generated record, at most.
pub const BATTERY_DRAIN_PER_STEP: f64 = 0.5;

/// Bounded random walk over a scenario profile.
pub struct ScenarioGenerator {
    rng: StdRng,
    device_id: DeviceId,
    walk: Option<WalkState>,
    last_captured: Option<OffsetDateTime>,
}

impl ScenarioGenerator {
    pub fn new(device_id: DeviceId, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng, device_id, walk: None, last_captured: None }
    }

    pub fn next(&mut self, scenario: Scenario) -> TelemetryRecord {
        let profile = scenario.profile();
        let walk = match self.walk {
            Some(prev) if prev.scenario == scenario => WalkState {
                scenario,
                pulse: self.step(prev.pulse, profile.pulse),
                object_temperature: self.step(prev.object_temperature, profile.object_temperature),
                surface_temperature: self.step(prev.surface_temperature, profile.surface_temperature),
                ambient_temperature: self.step(prev.ambient_temperature, profile.ambient_temperature),
                pressure: self.step(prev.pressure, profile.pressure),
                altitude: self.step(prev.altitude, profile.altitude),
                battery: self.drain(prev.battery, profile.battery),
                infrared: self.step(prev.infrared, profile.infrared),
            },
            // First sample, or a scenario switch: start somewhere inside the new
            // bands. The battery carries over, pulled into the new band.
            carried => WalkState {
                scenario,
                pulse: self.seed_in(profile.pulse),
                object_temperature: self.seed_in(profile.object_temperature),
                surface_temperature: self.seed_in(profile.surface_temperature),
                ambient_temperature: self.seed_in(profile.ambient_temperature),
                pressure: self.seed_in(profile.pressure),
                altitude: self.seed_in(profile.altitude),
                battery: match carried {
                    Some(prev) => prev.battery.clamp(profile.battery.min, profile.battery.max),
                    None => self.seed_in(profile.battery),
                },
                infrared: self.seed_in(profile.infrared),
            },
        };
        self.walk = Some(walk);

        let now = OffsetDateTime::now_utc();
        let captured_at = match self.last_captured {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_captured = Some(captured_at);

        TelemetryRecord {
            altitude: round2(walk.altitude),
            ambient_temperature: round2(walk.ambient_temperature),
            surface_temperature: round2(walk.surface_temperature),
            object_temperature: round2(walk.object_temperature),
            pulse_proxy_value: round_in(walk.pulse, profile.pulse),
            infrared_value: round_in(walk.infrared, profile.infrared),
            barometric_pressure: round2(walk.pressure),
            battery_level: (walk.battery * 10.0).round() / 10.0,
            device_id: self.device_id.clone(),
            device_display_name: Some("VitaRing Demo".into()),
            powered_on: true,
            reachable: true,
            captured_at,
            record_kind: scenario.record_kind(),
        }
    }

    pub fn set_device(&mut self, device_id: DeviceId) {
        self.device_id = device_id;
    }

    fn seed_in(&mut self, band: Band) -> f64 {
        self.rng.random_range(band.min..=band.max)
    }

    /// The battery only ever runs down while a scenario lasts.
    fn drain(&mut self, prev: f64, band: Band) -> f64 {
        let used = self.rng.random_range(0.0..=BATTERY_DRAIN_PER_STEP);
        (prev - used).clamp(band.min, band.max)
    }

    fn step(&mut self, prev: f64, band: Band) -> f64 {
        let reach = band.width() * 0.1;
        let delta = self.rng.random_range(-reach..=reach);
        (prev + delta).clamp(band.min, band.max)
    }
}

/// Two decimals, as the ring firmware reports. Band edges are whole numbers
/// or halves, so rounding never leaves the band.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_in(value: f64, band: Band) -> u32 {
    value.round().clamp(band.min.ceil(), band.max.floor()) as u32
}

pub type SyntheticHandler = Arc<dyn Fn(TelemetryRecord) + Send + Sync>;

/// Timer-driven generator. The timer task is owned here and nowhere else.
pub struct SyntheticSource {
    baseline: Scenario,
    generator: Arc<Mutex<ScenarioGenerator>>,
    task: Option<JoinHandle<()>>,
    on_record: Option<SyntheticHandler>,
}

impl SyntheticSource {
    pub fn new(baseline: Scenario, seed: Option<u64>, device_id: DeviceId) -> Self {
        Self {
            baseline,
            generator: Arc::new(Mutex::new(ScenarioGenerator::new(device_id, seed))),
            task: None,
            on_record: None,
        }
    }

    pub fn baseline(&self) -> Scenario {
        self.baseline
    }

    /// One baseline record per tick, the first one immediately. Restarting
    /// replaces the running timer.
    pub fn start<F>(&mut self, interval: Duration, on_record: F) -> Result<()>
    where
        F: Fn(TelemetryRecord) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(TelemetryError::InvalidOperatorCall(
                "synthetic interval must be greater than zero".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::InvalidOperatorCall(format!("no tokio runtime: {e}")))?;
        self.stop();

        let handler: SyntheticHandler = Arc::new(on_record);
        let tick_handler = handler.clone();
        let generator = self.generator.clone();
        let baseline = self.baseline;

        self.task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let record = generator.lock().next(baseline);
                debug!("synthetic tick: pulse {} ({:?})", record.pulse_proxy_value, baseline);
                tick_handler(record);
            }
        }));
        self.on_record = Some(handler);
        info!("synthetic source started ({:?}, every {:?})", self.baseline, interval);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("synthetic source stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Later records carry `device_id`.
    pub fn retarget(&self, device_id: DeviceId) {
        self.generator.lock().set_device(device_id);
    }

    /// Produces one record for `scenario` right away, without touching the timer.
    pub fn emit_scenario(&self, scenario: Scenario) -> TelemetryRecord {
        let record = self.sample(scenario);
        if let Some(handler) = &self.on_record {
            handler(record.clone());
        }
        record
    }

    /// One generator step, no callback.
    pub fn sample(&self, scenario: Scenario) -> TelemetryRecord {
        self.generator.lock().next(scenario)
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::new("ESP32C3-A835B29E9EF0").unwrap()
    }

    fn assert_in_profile(record: &TelemetryRecord, scenario: Scenario) {
        let p = scenario.profile();
        assert!(p.pulse.contains(record.pulse_proxy_value as f64), "pulse {} outside {:?}", record.pulse_proxy_value, scenario);
        assert!(p.object_temperature.contains(record.object_temperature));
        assert!(p.surface_temperature.contains(record.surface_temperature));
        assert!(p.ambient_temperature.contains(record.ambient_temperature));
        assert!(p.pressure.contains(record.barometric_pressure));
        assert!(p.altitude.contains(record.altitude));
        assert!(p.battery.contains(record.battery_level));
        assert!(p.infrared.contains(record.infrared_value as f64));
        assert_eq!(record.record_kind, scenario.record_kind());
    }

    #[test]
    fn test_every_scenario_stays_in_band() {
        let source = SyntheticSource::new(Scenario::Demo, Some(42), device());
        let all = [Scenario::Demo, Scenario::Exercise, Scenario::Rest, Scenario::Outdoor, Scenario::LowBattery];

        for round in 0..200 {
            // Alternate between long runs of one scenario and switches.
            let scenario = all[(round / 20) % all.len()];
            let record = source.sample(scenario);
            assert_in_profile(&record, scenario);
        }
        for round in 0..100 {
            let scenario = all[round % all.len()];
            assert_in_profile(&source.sample(scenario), scenario);
        }
    }

    #[test]
    fn test_exercise_pulse_range_for_many_seeds() {
        for seed in 0..50 {
            let source = SyntheticSource::new(Scenario::Demo, Some(seed), device());
            for _ in 0..20 {
                let record = source.emit_scenario(Scenario::Exercise);
                assert!((130..=160).contains(&record.pulse_proxy_value));
            }
        }
    }

    #[test]
    fn test_seeded_walk_is_reproducible() {
        let a = SyntheticSource::new(Scenario::Rest, Some(9), device());
        let b = SyntheticSource::new(Scenario::Rest, Some(9), device());
        for _ in 0..10 {
            let (ra, rb) = (a.sample(Scenario::Rest), b.sample(Scenario::Rest));
            assert_eq!(ra.pulse_proxy_value, rb.pulse_proxy_value);
            assert_eq!(ra.barometric_pressure, rb.barometric_pressure);
        }
    }

    #[test]
    fn test_walk_steps_are_bounded() {
        let source = SyntheticSource::new(Scenario::Outdoor, Some(3), device());
        let mut prev = source.sample(Scenario::Outdoor);
        let reach = OUTDOOR.altitude.width() * 0.1 + 0.01;
        for _ in 0..50 {
            let next = source.sample(Scenario::Outdoor);
            assert!((next.altitude - prev.altitude).abs() <= reach);
            assert!(next.captured_at >= prev.captured_at);
            prev = next;
        }
    }

    #[test]
    fn test_battery_drains_and_carries_across_scenarios() {
        let source = SyntheticSource::new(Scenario::Demo, Some(21), device());
        let mut prev = source.sample(Scenario::Rest);
        for _ in 0..30 {
            let next = source.sample(Scenario::Rest);
            assert!(next.battery_level <= prev.battery_level);
            assert!(prev.battery_level - next.battery_level <= BATTERY_DRAIN_PER_STEP + 0.1);
            prev = next;
        }

        // Rest and outdoor bands overlap, so the charge level simply continues.
        let outdoor = source.sample(Scenario::Outdoor);
        assert!((outdoor.battery_level - prev.battery_level).abs() <= 0.1);

        // Low battery pulls the carried level down to the top of its band.
        let low = source.sample(Scenario::LowBattery);
        assert_eq!(low.battery_level, LOW_BATTERY.battery.max);
        assert_eq!(low.record_kind, RecordKind::LowBattery);
    }

    #[test]
    fn test_retarget_changes_record_device() {
        let source = SyntheticSource::new(Scenario::Demo, Some(2), device());
        source.retarget(DeviceId::new("ESP32C3-A835629EDEF8").unwrap());
        let record = source.sample(Scenario::Demo);
        assert_eq!(record.device_id.as_str(), "ESP32C3-A835629EDEF8");
        assert_eq!(record.device_display_name.as_deref(), Some("VitaRing Demo"));
    }

    #[test]
    fn test_scenario_names() {
        assert_eq!("exercise".parse::<Scenario>().unwrap(), Scenario::Exercise);
        assert_eq!("Low-Battery".parse::<Scenario>().unwrap(), Scenario::LowBattery);
        assert!(matches!("sprint".parse::<Scenario>(), Err(TelemetryError::InvalidOperatorCall(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut source = SyntheticSource::new(Scenario::Demo, Some(1), device());
        assert!(source.start(Duration::ZERO, |_| {}).is_err());
        assert!(!source.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_and_idempotent_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut source = SyntheticSource::new(Scenario::Rest, Some(5), device());

        source.start(Duration::from_millis(100), move |r| sink.lock().push(r)).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        source.stop();
        source.stop();
        let ticks = seen.lock().len();
        assert_eq!(ticks, 4);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(seen.lock().len(), ticks);
        assert!(seen.lock().iter().all(|r| r.record_kind == RecordKind::Rest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_scenario_does_not_touch_timer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut source = SyntheticSource::new(Scenario::Demo, Some(5), device());

        source.start(Duration::from_millis(100), move |r| sink.lock().push(r.record_kind)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        source.emit_scenario(Scenario::Exercise);
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.stop();

        assert_eq!(
            *seen.lock(),
            vec![RecordKind::Demo, RecordKind::Demo, RecordKind::Exercise, RecordKind::Demo]
        );
    }
}

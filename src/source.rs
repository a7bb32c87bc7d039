//! Sensor sources for the greenhouse collector.
//!
//! A [`SensorSource`] produces one [`Reading`] per call. Two variants exist:
//! [`SimulatedSource`], a bounded random generator used for development and
//! demos, and [`HardwareSource`], which reads a real channel through the
//! [`ChannelReader`] transport interface.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::reading::Reading;

/// Errors raised when a sensor cannot produce a reading.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The underlying channel is not reachable
    #[error("sensor {sensor_id} is disconnected: {reason}")]
    Disconnected { sensor_id: String, reason: String },

    /// The channel returned something that is not a finite number
    #[error("sensor {sensor_id} returned invalid value {value}")]
    InvalidValue { sensor_id: String, value: f64 },
}

/// A producer of sensor readings.
///
/// `sample` is synchronous and must not block; it is called from the
/// sampling task on every tick.
pub trait SensorSource: Send {
    /// Identifier of the channel this source reports as.
    fn sensor_id(&self) -> &str;

    /// Take one reading.
    fn sample(&mut self) -> Result<Reading, ReadError>;
}

/// Health band of a value on a greenhouse channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Optimal,
    Normal,
    Critical,
}

/// Environment channels monitored in a greenhouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreenhouseChannel {
    Temperature,
    Humidity,
    Co2,
    LightIntensity,
    SoilMoisture,
    SoilPh,
    SoilTemperature,
    WindSpeed,
}

impl GreenhouseChannel {
    /// Get all channels.
    pub fn all() -> &'static [GreenhouseChannel] {
        &[
            GreenhouseChannel::Temperature,
            GreenhouseChannel::Humidity,
            GreenhouseChannel::Co2,
            GreenhouseChannel::LightIntensity,
            GreenhouseChannel::SoilMoisture,
            GreenhouseChannel::SoilPh,
            GreenhouseChannel::SoilTemperature,
            GreenhouseChannel::WindSpeed,
        ]
    }

    /// Sensor id used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            GreenhouseChannel::Temperature => "temperature",
            GreenhouseChannel::Humidity => "humidity",
            GreenhouseChannel::Co2 => "co2",
            GreenhouseChannel::LightIntensity => "light_intensity",
            GreenhouseChannel::SoilMoisture => "soil_moisture",
            GreenhouseChannel::SoilPh => "soil_ph",
            GreenhouseChannel::SoilTemperature => "soil_temperature",
            GreenhouseChannel::WindSpeed => "wind_speed",
        }
    }

    /// Look a channel up by its sensor id.
    pub fn from_sensor_id(sensor_id: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.name() == sensor_id)
    }

    /// Unit tag for this channel.
    pub fn unit(&self) -> &'static str {
        match self {
            GreenhouseChannel::Temperature | GreenhouseChannel::SoilTemperature => "°C",
            GreenhouseChannel::Humidity | GreenhouseChannel::SoilMoisture => "%",
            GreenhouseChannel::Co2 => "ppm",
            GreenhouseChannel::LightIntensity => "lux",
            GreenhouseChannel::SoilPh => "pH",
            GreenhouseChannel::WindSpeed => "m/s",
        }
    }

    /// Physical range used when simulating the channel.
    pub fn range(&self) -> (f64, f64) {
        match self {
            GreenhouseChannel::Temperature => (5.0, 40.0),
            GreenhouseChannel::Humidity => (30.0, 95.0),
            GreenhouseChannel::Co2 => (300.0, 1500.0),
            GreenhouseChannel::LightIntensity => (0.0, 50_000.0),
            GreenhouseChannel::SoilMoisture => (20.0, 80.0),
            GreenhouseChannel::SoilPh => (5.0, 8.0),
            GreenhouseChannel::SoilTemperature => (10.0, 35.0),
            GreenhouseChannel::WindSpeed => (0.0, 5.0),
        }
    }

    /// Band in which crops grow best.
    pub fn optimal(&self) -> (f64, f64) {
        match self {
            GreenhouseChannel::Temperature => (18.0, 25.0),
            GreenhouseChannel::Humidity => (60.0, 75.0),
            GreenhouseChannel::Co2 => (400.0, 800.0),
            GreenhouseChannel::LightIntensity => (20_000.0, 40_000.0),
            GreenhouseChannel::SoilMoisture => (40.0, 65.0),
            GreenhouseChannel::SoilPh => (6.0, 6.8),
            GreenhouseChannel::SoilTemperature => (15.0, 25.0),
            GreenhouseChannel::WindSpeed => (0.5, 2.0),
        }
    }

    /// Critical low/high thresholds (inclusive).
    pub fn critical(&self) -> (f64, f64) {
        match self {
            GreenhouseChannel::Temperature => (10.0, 35.0),
            GreenhouseChannel::Humidity => (40.0, 85.0),
            GreenhouseChannel::Co2 => (350.0, 1200.0),
            GreenhouseChannel::LightIntensity => (15_000.0, 45_000.0),
            GreenhouseChannel::SoilMoisture => (30.0, 75.0),
            GreenhouseChannel::SoilPh => (5.5, 7.5),
            GreenhouseChannel::SoilTemperature => (12.0, 30.0),
            GreenhouseChannel::WindSpeed => (0.2, 3.0),
        }
    }

    /// Decimal places kept when simulating.
    pub fn precision(&self) -> u32 {
        match self {
            GreenhouseChannel::SoilPh => 2,
            GreenhouseChannel::Temperature
            | GreenhouseChannel::SoilTemperature
            | GreenhouseChannel::WindSpeed => 1,
            _ => 0,
        }
    }

    /// Classify a value against the channel's bands.
    pub fn classify(&self, value: f64) -> ChannelStatus {
        let (crit_low, crit_high) = self.critical();
        let (opt_low, opt_high) = self.optimal();

        if value <= crit_low || value >= crit_high {
            ChannelStatus::Critical
        } else if value >= opt_low && value <= opt_high {
            ChannelStatus::Optimal
        } else {
            ChannelStatus::Normal
        }
    }

    /// Simulation settings covering the channel's full range.
    pub fn spec(&self) -> ChannelSpec {
        let (min, max) = self.range();
        ChannelSpec {
            sensor_id: self.name().to_string(),
            unit: self.unit().to_string(),
            min,
            max,
            precision: self.precision(),
            step: None,
        }
    }
}

/// Settings for one simulated channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub sensor_id: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,

    /// Decimal places to round to
    pub precision: u32,

    /// Maximum change per sample; `None` draws uniformly from the range
    pub step: Option<f64>,
}

impl ChannelSpec {
    /// Override the simulated range.
    ///
    /// A range that is not finite makes every sample fail with
    /// [`ReadError::InvalidValue`].
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min.min(max);
        self.max = max.max(min);
        self
    }

    /// Turn the channel into a bounded random walk.
    ///
    /// A non-finite step falls back to uniform draws.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step.is_finite().then(|| step.abs());
        self
    }

    /// The bound that makes the range unusable, if any.
    fn invalid_bound(&self) -> Option<f64> {
        if !self.min.is_finite() {
            Some(self.min)
        } else if !self.max.is_finite() {
            Some(self.max)
        } else if !(self.max - self.min).is_finite() {
            // Each bound is finite but the span overflows
            Some(self.max - self.min)
        } else {
            None
        }
    }
}

/// Keeps capture timestamps non-decreasing for one channel.
#[derive(Debug, Default)]
struct CaptureClock {
    last: Option<DateTime<Utc>>,
}

impl CaptureClock {
    fn now(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamped = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamped);
        stamped
    }
}

/// Bounded random generator for one channel.
pub struct SimulatedSource {
    spec: ChannelSpec,
    rng: StdRng,
    current: Option<f64>,
    clock: CaptureClock,
    samples: u64,
}

impl SimulatedSource {
    /// Create a source seeded from system entropy.
    pub fn new(spec: ChannelSpec) -> Self {
        Self::with_rng(spec, StdRng::from_entropy())
    }

    /// Create a deterministic source.
    pub fn with_seed(spec: ChannelSpec, seed: u64) -> Self {
        Self::with_rng(spec, StdRng::seed_from_u64(seed))
    }

    fn with_rng(spec: ChannelSpec, rng: StdRng) -> Self {
        Self {
            spec,
            rng,
            current: None,
            clock: CaptureClock::default(),
            samples: 0,
        }
    }

    /// Number of readings produced so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn next_value(&mut self) -> Result<f64, ReadError> {
        if let Some(value) = self.spec.invalid_bound() {
            return Err(ReadError::InvalidValue {
                sensor_id: self.spec.sensor_id.clone(),
                value,
            });
        }

        let (min, max) = (self.spec.min, self.spec.max);
        if max <= min {
            return Ok(min);
        }

        let value = match (self.current, self.spec.step) {
            (Some(current), Some(step)) if step > 0.0 && step.is_finite() => {
                let delta = self.rng.gen_range(-step..=step);
                (current + delta).clamp(min, max)
            }
            _ => self.rng.gen_range(min..=max),
        };
        self.current = Some(value);

        let factor = 10f64.powi(self.spec.precision as i32);
        let rounded = (value * factor).round() / factor;
        if rounded.is_finite() {
            Ok(rounded.clamp(min, max))
        } else {
            Ok(value)
        }
    }
}

impl SensorSource for SimulatedSource {
    fn sensor_id(&self) -> &str {
        &self.spec.sensor_id
    }

    fn sample(&mut self) -> Result<Reading, ReadError> {
        let value = self.next_value()?;
        let captured_at = self.clock.now();
        self.samples += 1;
        Ok(Reading::captured(
            self.spec.sensor_id.clone(),
            value,
            self.spec.unit.clone(),
            captured_at,
        ))
    }
}

/// Transport to a physical sensor channel.
///
/// Implementations wrap whatever bus the hardware sits on (I2C, serial,
/// MQTT bridge). Reads must return promptly.
pub trait ChannelReader: Send {
    fn read_value(&mut self) -> std::io::Result<f64>;
}

/// A source backed by real hardware.
pub struct HardwareSource<R: ChannelReader> {
    sensor_id: String,
    unit: String,
    reader: R,
    clock: CaptureClock,
    failures: u64,
}

impl<R: ChannelReader> HardwareSource<R> {
    pub fn new(sensor_id: impl Into<String>, unit: impl Into<String>, reader: R) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            unit: unit.into(),
            reader,
            clock: CaptureClock::default(),
            failures: 0,
        }
    }

    /// Number of failed reads so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl<R: ChannelReader> SensorSource for HardwareSource<R> {
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    fn sample(&mut self) -> Result<Reading, ReadError> {
        let value = match self.reader.read_value() {
            Ok(value) => value,
            Err(e) => {
                self.failures += 1;
                return Err(ReadError::Disconnected {
                    sensor_id: self.sensor_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if !value.is_finite() {
            self.failures += 1;
            return Err(ReadError::InvalidValue {
                sensor_id: self.sensor_id.clone(),
                value,
            });
        }

        Ok(Reading::captured(
            self.sensor_id.clone(),
            value,
            self.unit.clone(),
            self.clock.now(),
        ))
    }
}

/// The four channels sampled by a basic greenhouse node.
pub fn default_rig() -> Vec<Box<dyn SensorSource>> {
    vec![
        Box::new(SimulatedSource::new(
            GreenhouseChannel::Temperature.spec().with_range(15.0, 30.0),
        )),
        Box::new(SimulatedSource::new(
            GreenhouseChannel::Humidity.spec().with_range(40.0, 80.0),
        )),
        Box::new(SimulatedSource::new(
            GreenhouseChannel::LightIntensity.spec().with_range(0.0, 1000.0),
        )),
        Box::new(SimulatedSource::new(
            GreenhouseChannel::SoilMoisture.spec().with_range(20.0, 90.0),
        )),
    ]
}

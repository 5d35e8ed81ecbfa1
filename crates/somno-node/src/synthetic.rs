//! Synthetic sensor sources for running the node without the bed hardware.
//!
//! Each source owns a thread that calls its generator on a fixed schedule
//! and pushes the result into the sink. Out-of-range readings are reported
//! through [`SampleSink::on_error`] instead. Signals vary smoothly over time so
//! the processing stages see something that looks like a sleeper.

use std::f64::consts::PI;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::Sender;
use log::{info, warn};
use somno_core::schedule::run_periodic;
use somno_core::sensors::{
    EnvironmentReading, MotionSample, PRESSURE_COLS, PRESSURE_ROWS, PressureFrame, SampleSink,
    SensorError, SensorPayload, SensorSource,
};

/// Interval between environment readings.
pub const ENVIRONMENT_PERIOD: Duration = Duration::from_secs(20);
/// Interval between pressure scans.
pub const PRESSURE_PERIOD: Duration = Duration::from_secs(1);

/// Breathing frequency of the synthetic sleeper, Hz.
const BREATHING_HZ: f64 = 0.25;
/// Heartbeat frequency of the synthetic sleeper, Hz.
const HEARTBEAT_HZ: f64 = 1.2;

type Generator = Box<dyn FnMut(f64) -> SensorPayload + Send>;

/// A [`SensorSource`] driven by a function of elapsed seconds.
pub struct SyntheticSource {
    name: &'static str,
    period: Duration,
    generator: Option<Generator>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    fn new(name: &'static str, period: Duration, generator: Generator) -> Self {
        Self {
            name,
            period,
            generator: Some(generator),
            stop: None,
            handle: None,
        }
    }

    /// Pressure mat scanned at 1 Hz.
    pub fn pressure() -> Self {
        Self::new("pressure", PRESSURE_PERIOD, Box::new(|t| {
            SensorPayload::Pressure(pressure_frame(t))
        }))
    }

    /// Gyroscope and accelerometer at `rate_hz`.
    pub fn motion(rate_hz: f64) -> Self {
        let period = Duration::from_secs_f64(1.0 / rate_hz.max(1.0));
        Self::new("motion", period, Box::new(|t| SensorPayload::Motion(motion_sample(t))))
    }

    /// Temperature and humidity every 20 s.
    pub fn environment() -> Self {
        Self::new("environment", ENVIRONMENT_PERIOD, Box::new(|t| {
            SensorPayload::Environment(environment_reading(t))
        }))
    }
}

impl SensorSource for SyntheticSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&mut self, sink: Arc<dyn SampleSink>) -> Result<(), SensorError> {
        let Some(mut generator) = self.generator.take() else {
            return Err(SensorError::InitializationFailed {
                sensor: self.name,
                details: "already started".into(),
            });
        };

        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let period = self.period;
        let name = self.name;
        let handle = std::thread::Builder::new()
            .name(format!("{}-source", self.name))
            .spawn(move || {
                let started = Instant::now();
                run_periodic(period, &stop_rx, || {
                    let t = started.elapsed().as_secs_f64();
                    let payload = generator(t);
                    match payload.check_range(name) {
                        Ok(()) => sink.on_sample(Utc::now(), payload),
                        Err(e) => sink.on_error(e),
                    }
                });
            })
            .map_err(|e| SensorError::InitializationFailed {
                sensor: self.name,
                details: e.to_string(),
            })?;

        info!("[{}] synthetic source every {:?}", self.name, self.period);
        self.stop = Some(stop);
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[{}] source thread panicked", self.name);
            }
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleeper lying on their back, rolling slowly left and right over a few
/// minutes.
pub fn pressure_frame(t: f64) -> PressureFrame {
    let centre_col = (PRESSURE_COLS as f64 - 1.0) / 2.0 + 2.0 * (2.0 * PI * t / 600.0).sin();
    let centre_row = PRESSURE_ROWS as f64 / 2.0;
    let breathing = 1.0 + 0.03 * (2.0 * PI * BREATHING_HZ * t).sin();

    PressureFrame::from_fn(|r, c| {
        let dr = (r as f64 - centre_row) / 5.0;
        let dc = (c as f64 - centre_col) / 2.2;
        let load = 450.0 * (-(dr * dr + dc * dc) / 2.0).exp() * breathing;
        // Fixed per-cell offset standing in for sensor noise.
        let offset = ((r * 7 + c * 13) % 11) as f64;
        (350.0 + load + offset).round() as u16
    })
}

/// Chest movement on the gyroscope: a breathing wave with a weaker cardiac
/// ripple.
pub fn motion_sample(t: f64) -> MotionSample {
    let breath = (2.0 * PI * BREATHING_HZ * t).sin();
    let beat = 0.3 * (2.0 * PI * HEARTBEAT_HZ * t).sin();
    let jitter = 0.02 * (2.0 * PI * 7.3 * t).sin();
    MotionSample([
        (breath + beat + jitter) as f32,
        (0.5 * breath + beat) as f32,
        (0.1 * breath + beat - jitter) as f32,
        (0.01 * breath) as f32,
        0.0,
        1.0,
    ])
}

/// Slowly drifting bedroom climate.
pub fn environment_reading(t: f64) -> EnvironmentReading {
    EnvironmentReading {
        temperature_celsius: (21.0 + 1.5 * (t / 900.0).sin() + 0.3 * (t / 137.0).cos()) as f32,
        humidity_percent: (48.0 + 6.0 * (t / 1200.0).sin() + 1.0 * (t / 91.0).cos()) as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use parking_lot::Mutex;
    use somno_core::sensors::{ChannelKind, Stamped, Timestamp};
    use somno_core::signal::SignalProcessor;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SensorPayload>>, Mutex<Vec<SensorError>>);

    impl SampleSink for Collect {
        fn on_sample(&self, _timestamp: Timestamp, payload: SensorPayload) {
            self.0.lock().push(payload);
        }

        fn on_error(&self, error: SensorError) {
            self.1.lock().push(error);
        }
    }

    #[test]
    fn test_source_pushes_until_stopped() {
        let sink = Arc::new(Collect::default());
        let mut source = SyntheticSource::motion(100.0);
        source.start(sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        source.stop();

        let count = sink.0.lock().len();
        assert!(count > 0);
        assert!(sink.0.lock().iter().all(|p| p.channel() == ChannelKind::Motion));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.0.lock().len(), count);
    }

    #[test]
    fn test_bad_reading_is_dropped_and_acquisition_continues() {
        let sink = Arc::new(Collect::default());
        let mut calls = 0u32;
        let mut source = SyntheticSource::new(
            "motion",
            Duration::from_millis(5),
            Box::new(move |t| {
                calls += 1;
                let mut sample = motion_sample(t);
                if calls == 1 {
                    sample.0[2] = f32::NAN;
                }
                SensorPayload::Motion(sample)
            }),
        );
        source.start(sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        source.stop();

        let errors = sink.1.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SensorError::OutOfRange { sensor: "motion", .. }));
        let samples = sink.0.lock();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|p| p.check_range("motion").is_ok()));
    }

    #[test]
    fn test_source_starts_once() {
        let sink = Arc::new(Collect::default());
        let mut source = SyntheticSource::environment();
        source.start(sink.clone()).unwrap();
        assert!(source.start(sink).is_err());
    }

    #[test]
    fn test_pressure_frame_has_a_body() {
        let frame = pressure_frame(0.0);
        let values: Vec<u16> = frame.rows().iter().flatten().copied().collect();
        let max = *values.iter().max().unwrap();
        let min = *values.iter().min().unwrap();
        assert!(max > 700 && max < 5000, "max {}", max);
        assert!(min >= 350);
    }

    #[test]
    fn test_motion_yields_plausible_vitals() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let samples: Vec<_> = (0..1200)
            .map(|i| {
                let t = i as f64 / 20.0;
                Stamped::new(start + TimeDelta::milliseconds(i * 50), motion_sample(t))
            })
            .collect();

        let metrics = SignalProcessor::new(20.0).unwrap().process(&samples).unwrap();
        let rr = metrics.respiratory_rate.unwrap();
        assert!((rr - 15.0).abs() < 2.0, "respiratory rate {}", rr);
        let hr = metrics.heart_rate.unwrap();
        assert!((hr - 72.0).abs() < 7.2, "heart rate {}", hr);
    }
}

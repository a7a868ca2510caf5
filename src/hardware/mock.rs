//! Mock signal sources for testing and the demo binary
//!
//! Each mock shares its state with a [`MockSourceHandle`] so a test can keep
//! injecting events after the source has been moved into a session.

use crate::core::PositionSample;
use crate::hardware::{
    BeaconScanner, ConnectionInfo, ConnectionInfoSource, EventSink, OrientationSource,
    PositionSource, SensorError, SensorEvent, SensorKind, SensorResult,
};
use crate::processing::motion::AcquisitionOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct MockState {
    sensor: SensorKind,
    supported: bool,
    fixes: VecDeque<SensorResult<PositionSample>>,
    hang_on_request: bool,
    sink: Option<EventSink>,
    start_count: u32,
    stop_count: u32,
    start_error: Option<SensorError>,
}

impl MockState {
    fn new(sensor: SensorKind, supported: bool) -> Self {
        Self {
            sensor,
            supported,
            fixes: VecDeque::new(),
            hang_on_request: false,
            sink: None,
            start_count: 0,
            stop_count: 0,
            start_error: None,
        }
    }

    fn start(&mut self, sink: EventSink) -> SensorResult<()> {
        if !self.supported {
            return Err(SensorError::Unavailable {
                sensor: self.sensor,
            });
        }
        if let Some(error) = self.start_error.clone() {
            return Err(error);
        }
        self.start_count += 1;
        self.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        if self.sink.take().is_some() {
            self.stop_count += 1;
        }
    }
}

/// Test-side view of a mock source
#[derive(Debug, Clone)]
pub struct MockSourceHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockSourceHandle {
    /// Push an event through the running source; false when stopped or full
    pub fn emit(&self, event: SensorEvent) -> bool {
        let state = self.state.lock();
        match &state.sink {
            Some(sink) => sink.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Queue the result of the next one-shot request
    pub fn queue_fix(&self, result: SensorResult<PositionSample>) {
        self.state.lock().fixes.push_back(result);
    }

    /// Make one-shot requests never resolve
    pub fn hang_requests(&self, hang: bool) {
        self.state.lock().hang_on_request = hang;
    }

    /// Make the next starts fail with `error`
    pub fn fail_start(&self, error: Option<SensorError>) {
        self.state.lock().start_error = error;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().start_count
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().stop_count
    }
}

/// Scriptable GPS source
#[derive(Debug)]
pub struct MockPositionSource {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockPositionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPositionSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(SensorKind::Gps, true))),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(SensorKind::Gps, false))),
        }
    }

    pub fn handle(&self) -> MockSourceHandle {
        MockSourceHandle {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl PositionSource for MockPositionSource {
    fn is_supported(&self) -> bool {
        self.state.lock().supported
    }

    async fn request_fix(&mut self, options: &AcquisitionOptions) -> SensorResult<PositionSample> {
        let (hang, next) = {
            let mut state = self.state.lock();
            if !state.supported {
                return Err(SensorError::Unavailable {
                    sensor: SensorKind::Gps,
                });
            }
            (state.hang_on_request, state.fixes.pop_front())
        };

        if hang {
            std::future::pending::<()>().await;
        }

        next.unwrap_or(Err(SensorError::Timeout {
            sensor: SensorKind::Gps,
            timeout_ms: options.timeout_ms,
        }))
    }

    fn start_watch(&mut self, _options: &AcquisitionOptions, sink: EventSink) -> SensorResult<()> {
        self.state.lock().start(sink)
    }

    fn stop_watch(&mut self) {
        self.state.lock().stop();
    }

    fn is_active(&self) -> bool {
        self.state.lock().sink.is_some()
    }
}

/// Scriptable event stream usable as a beacon scanner or compass
#[derive(Debug)]
pub struct MockStreamSource {
    state: Arc<Mutex<MockState>>,
}

impl MockStreamSource {
    pub fn new(sensor: SensorKind) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(sensor, true))),
        }
    }

    pub fn unsupported(sensor: SensorKind) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(sensor, false))),
        }
    }

    pub fn handle(&self) -> MockSourceHandle {
        MockSourceHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl BeaconScanner for MockStreamSource {
    fn is_supported(&self) -> bool {
        self.state.lock().supported
    }

    fn start(&mut self, sink: EventSink) -> SensorResult<()> {
        self.state.lock().start(sink)
    }

    fn stop(&mut self) {
        self.state.lock().stop();
    }

    fn is_active(&self) -> bool {
        self.state.lock().sink.is_some()
    }
}

impl OrientationSource for MockStreamSource {
    fn is_supported(&self) -> bool {
        self.state.lock().supported
    }

    fn start(&mut self, sink: EventSink) -> SensorResult<()> {
        self.state.lock().start(sink)
    }

    fn stop(&mut self) {
        self.state.lock().stop();
    }

    fn is_active(&self) -> bool {
        self.state.lock().sink.is_some()
    }
}

/// Connection info that tests can change at runtime
#[derive(Debug, Clone, Default)]
pub struct MockConnectionInfo {
    info: Arc<Mutex<Option<ConnectionInfo>>>,
}

impl MockConnectionInfo {
    pub fn new(info: Option<ConnectionInfo>) -> Self {
        Self {
            info: Arc::new(Mutex::new(info)),
        }
    }

    pub fn set(&self, info: Option<ConnectionInfo>) {
        *self.info.lock() = info;
    }
}

impl ConnectionInfoSource for MockConnectionInfo {
    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.lock().clone()
    }
}

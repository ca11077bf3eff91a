//! Connection session - scan, connect, discover, bind, and drive the fingerprint pipeline
//!
//! One worker task owns every piece of mutable state (session state,
//! latched peripheral, characteristic bindings, assembly buffer, write
//! gate). Transport events, caller commands and timer expiries all arrive
//! on the same queue and are handled one at a time, in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fingerlock_proto::{CharacteristicRegistry, CharacteristicRole, LockCommand, ServiceRole};
use tokio::sync::{mpsc, oneshot};

use crate::assembler::FingerprintAssembler;
use crate::classifier::{ClassificationPipeline, Classifier};
use crate::config::SessionConfig;
use crate::error::{SessionError, TransportError};
use crate::lock::{GateTicket, LockController};
use crate::sink::{DecisionRecord, EventSink, SessionEvent};
use crate::transport::{CharacteristicRef, EventSender, PeripheralHandle, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    ConnectFailed,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Found,
    Cancelled,
    TimedOut,
}

/// Point-in-time view of the session, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub peripheral: Option<PeripheralHandle>,
    pub connecting: bool,
    pub bound: Vec<CharacteristicRole>,
    pub gate_open: bool,
    pub pending_chunks: usize,
}

impl SessionSnapshot {
    pub fn is_bound(&self, role: CharacteristicRole) -> bool {
        self.bound.contains(&role)
    }

    pub fn is_ready(&self) -> bool {
        CharacteristicRole::ALL.iter().all(|role| self.is_bound(*role))
    }
}

pub(crate) enum Input {
    Transport(TransportEvent),
    Command(Command),
    Timer(Timer),
}

pub(crate) enum Command {
    StartScan {
        attempt: u64,
        reply: ScanReply,
    },
    /// The caller of scan `attempt` stopped waiting
    ScanTimedOut {
        attempt: u64,
        reply: oneshot::Sender<ScanOutcome>,
    },
    CancelScan,
    Connect,
    Disconnect,
    ForceWrite {
        command: LockCommand,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

type ScanReply = oneshot::Sender<Result<ScanOutcome, SessionError>>;

pub(crate) enum Timer {
    ConnectDeadline(u64),
    DisconnectDeadline(u64),
    GateSettle(GateTicket),
}

/// Receiving end of the session queue, handed to [`ConnectionSession::new`]
pub struct Inbox {
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
}

/// Create the session queue. The [`EventSender`] goes to the transport,
/// the [`Inbox`] to the session.
pub fn inbox() -> (EventSender, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender::new(tx.clone()), Inbox { tx, rx })
}

/// Caller-facing control surface; cheap to clone
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Input>,
    scans: Arc<AtomicU64>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| SessionError::Closed)
    }

    /// Scan until a peripheral whose name contains the marker is seen, the
    /// scan is cancelled, or `timeout` elapses. On `Found` the peripheral is
    /// latched for [`connect`](Self::connect).
    pub async fn start_scan(&self, timeout: Duration) -> Result<ScanOutcome, SessionError> {
        let attempt = self.next_scan();
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartScan { attempt, reply })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                // A match may have raced the deadline; the worker knows which
                let (reply, rx) = oneshot::channel();
                self.send(Command::ScanTimedOut { attempt, reply })?;
                rx.await.map_err(|_| SessionError::Closed)
            }
        }
    }

    fn next_scan(&self) -> u64 {
        self.scans.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn cancel_scan(&self) -> Result<(), SessionError> {
        self.send(Command::CancelScan)
    }

    /// No-op when nothing is latched or a connection exists already
    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(Command::Connect)
    }

    /// No-op when not connected
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Disconnect)
    }

    /// Unlock without classification
    pub async fn force_open(&self) -> Result<(), SessionError> {
        self.force_write(LockCommand::Open).await
    }

    /// Lock without classification
    pub async fn force_close(&self) -> Result<(), SessionError> {
        self.force_write(LockCommand::Close).await
    }

    async fn force_write(&self, command: LockCommand) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceWrite { command, reply })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Also acts as a barrier: everything queued before it has been handled
    pub async fn status(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown)
    }
}

/// The session worker
pub struct ConnectionSession<T, C> {
    transport: T,
    pipeline: ClassificationPipeline<C>,
    sink: Arc<dyn EventSink>,
    config: SessionConfig,
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,

    state: SessionState,
    peripheral: Option<PeripheralHandle>,
    bindings: HashMap<CharacteristicRole, CharacteristicRef>,
    assembler: FingerprintAssembler,
    lock: LockController,
    scan_waiter: Option<(u64, ScanReply)>,
    /// How the most recently resolved scan ended, for a caller whose timeout raced it
    last_scan: Option<(u64, ScanOutcome)>,
    connecting: Option<u64>,
    disconnecting: Option<u64>,
    next_attempt: u64,
}

impl<T: Transport, C: Classifier> ConnectionSession<T, C> {
    pub fn new(
        inbox: Inbox,
        transport: T,
        classifier: C,
        sink: Arc<dyn EventSink>,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let handle = SessionHandle {
            tx: inbox.tx.clone(),
            scans: Arc::new(AtomicU64::new(0)),
        };

        let session = Self {
            transport,
            pipeline: ClassificationPipeline::new(classifier),
            sink,
            config,
            tx: inbox.tx,
            rx: inbox.rx,
            state: SessionState::Idle,
            peripheral: None,
            bindings: HashMap::new(),
            assembler: FingerprintAssembler::new(),
            lock: LockController::new(),
            scan_waiter: None,
            last_scan: None,
            connecting: None,
            disconnecting: None,
            next_attempt: 0,
        };

        (session, handle)
    }

    /// Handle inputs until [`SessionHandle::shutdown`]. The transport keeps
    /// its own sender, so the queue never closes on its own.
    pub async fn run(mut self) {
        log::info!("Session started (marker {:?})", self.config.name_marker);

        while let Some(input) = self.rx.recv().await {
            match input {
                Input::Command(Command::Shutdown) => break,
                Input::Command(command) => self.handle_command(command),
                Input::Transport(event) => self.handle_event(event),
                Input::Timer(timer) => self.handle_timer(timer),
            }
        }

        if self.finish_scan(Ok(ScanOutcome::Cancelled)) {
            self.stop_scanning();
        }
        if let (Some(peripheral), SessionState::Connected) = (&self.peripheral, self.state) {
            if let Err(e) = self.transport.disconnect(peripheral) {
                log::warn!("Disconnect on shutdown failed: {e}");
            }
        }

        log::info!("Session stopped");
    }

    // =========================================================================
    // Caller commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan { attempt, reply } => self.start_scan(attempt, reply),
            Command::ScanTimedOut { attempt, reply } => {
                let _ = reply.send(self.scan_timed_out(attempt));
            }
            Command::CancelScan => {
                if self.finish_scan(Ok(ScanOutcome::Cancelled)) {
                    self.stop_scanning();
                    self.set_state(SessionState::Idle);
                    log::info!("Scan cancelled");
                }
            }
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::ForceWrite { command, reply } => {
                let _ = reply.send(self.write_lock(command, true));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn start_scan(&mut self, attempt: u64, reply: ScanReply) {
        if self.state == SessionState::Connected || self.connecting.is_some() {
            let _ = reply.send(Err(SessionError::AlreadyConnected));
            return;
        }

        // Only one scan at a time: the older caller gets Cancelled
        if self.finish_scan(Ok(ScanOutcome::Cancelled)) {
            self.stop_scanning();
        }
        self.peripheral = None;

        if let Err(e) = self.transport.start_scan() {
            self.set_state(SessionState::Idle);
            let _ = reply.send(Err(e.into()));
            return;
        }

        log::info!("Scanning for {:?}", self.config.name_marker);
        self.scan_waiter = Some((attempt, reply));
        self.set_state(SessionState::Scanning);
        self.report("Scanning....");
    }

    /// Only the scan `attempt` itself expires; a superseded caller learns how its scan ended
    fn scan_timed_out(&mut self, attempt: u64) -> ScanOutcome {
        if matches!(&self.scan_waiter, Some((pending, _)) if *pending == attempt) {
            self.scan_waiter = None;
            self.last_scan = Some((attempt, ScanOutcome::TimedOut));
            self.stop_scanning();
            self.set_state(SessionState::Idle);
            self.report("(No Connector)");
            return ScanOutcome::TimedOut;
        }

        match self.last_scan {
            Some((resolved, outcome)) if resolved == attempt => outcome,
            _ => ScanOutcome::Cancelled,
        }
    }

    /// Answer the pending scan caller, if any. Returns whether one was waiting.
    fn finish_scan(&mut self, result: Result<ScanOutcome, SessionError>) -> bool {
        let Some((attempt, waiter)) = self.scan_waiter.take() else {
            return false;
        };
        if let Ok(outcome) = &result {
            self.last_scan = Some((attempt, *outcome));
        }
        let _ = waiter.send(result);
        true
    }

    fn stop_scanning(&self) {
        if let Err(e) = self.transport.stop_scan() {
            log::warn!("Failed to stop scan: {e}");
        }
    }

    fn connect(&mut self) {
        let Some(peripheral) = self.peripheral.clone() else {
            log::debug!("Connect ignored: no peripheral found yet");
            return;
        };
        if self.state == SessionState::Connected || self.connecting.is_some() {
            log::debug!("Connect ignored: already connected to {peripheral}");
            return;
        }

        log::info!("Connecting to {peripheral}");
        match self.transport.connect(&peripheral) {
            Ok(()) => {
                let attempt = self.next_attempt();
                self.connecting = Some(attempt);
                self.schedule(self.config.connect_timeout(), Timer::ConnectDeadline(attempt));
            }
            Err(e) => self.connect_failed(e),
        }
    }

    fn disconnect(&mut self) {
        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        if self.state != SessionState::Connected && self.connecting.is_none() {
            log::debug!("Disconnect ignored: {peripheral} is not connected");
            return;
        }
        if self.disconnecting.is_some() {
            return;
        }

        log::info!("Disconnecting from {peripheral}");
        match self.transport.disconnect(&peripheral) {
            Ok(()) => {
                self.connecting = None;
                let attempt = self.next_attempt();
                self.disconnecting = Some(attempt);
                self.schedule(
                    self.config.disconnect_timeout(),
                    Timer::DisconnectDeadline(attempt),
                );
            }
            Err(e) => self.report(format!("Disconnect failed: {e}")),
        }
    }

    /// Write a lock command to the bound lock characteristic
    fn write_lock(&mut self, command: LockCommand, forced: bool) -> Result<(), SessionError> {
        let peripheral = match (&self.peripheral, self.state) {
            (Some(peripheral), SessionState::Connected) => peripheral.clone(),
            _ => return Err(SessionError::NotConnected),
        };
        let characteristic = *self
            .bindings
            .get(&CharacteristicRole::LockState)
            .ok_or(SessionError::NotBound(CharacteristicRole::LockState))?;

        let byte = if forced {
            self.lock.force_write(command)
        } else {
            self.lock.request_write(command)?
        };

        if let Err(e) = self.transport.write_value(&peripheral, characteristic, vec![byte], true) {
            self.lock.on_write_failed();
            return Err(e.into());
        }

        log::info!("Writing {command:?} (0x{byte:02x}) to lock");
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        let bound = CharacteristicRole::ALL
            .into_iter()
            .filter(|role| self.bindings.contains_key(role))
            .collect();

        SessionSnapshot {
            state: self.state,
            peripheral: self.peripheral.clone(),
            connecting: self.connecting.is_some(),
            bound,
            gate_open: self.lock.is_gate_open(),
            pending_chunks: self.assembler.filled(),
        }
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered { peripheral, name, rssi } => {
                self.on_discovered(peripheral, name, rssi)
            }
            TransportEvent::ScanFailed { error } => {
                if self.scan_waiter.is_some() {
                    self.set_state(SessionState::Idle);
                    self.report(format!("Scan failed: {error}"));
                    self.finish_scan(Err(error.into()));
                }
            }
            TransportEvent::Connected { peripheral } => self.on_connected(peripheral),
            TransportEvent::ConnectFailed { peripheral, error } => {
                if self.peripheral.as_ref() != Some(&peripheral) {
                    return;
                }
                if self.connecting.take().is_some() {
                    self.connect_failed(error);
                }
            }
            TransportEvent::Disconnected { peripheral } => {
                let linked = self.state == SessionState::Connected
                    || self.connecting.is_some()
                    || self.disconnecting.is_some();
                if linked && self.peripheral.as_ref() == Some(&peripheral) {
                    self.teardown();
                } else {
                    log::debug!("Ignoring disconnect of {peripheral}");
                }
            }
            TransportEvent::ServicesDiscovered { peripheral, result } => {
                if self.is_current(&peripheral) {
                    self.on_services(&peripheral, result);
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => {
                if self.is_current(&peripheral) {
                    self.on_characteristics(&peripheral, service, result);
                }
            }
            TransportEvent::NotifySet {
                characteristic,
                result,
            } => match result {
                Ok(()) => log::debug!("Notifications enabled on {}", characteristic.uuid),
                Err(e) => self.report(format!("Could not subscribe to fingerprint events: {e}")),
            },
            TransportEvent::WriteCompleted {
                characteristic,
                result,
            } => self.on_write_completed(characteristic, result),
            TransportEvent::ValueUpdated {
                characteristic,
                result,
            } => self.on_value(characteristic, result),
        }
    }

    fn on_discovered(&mut self, peripheral: PeripheralHandle, name: Option<String>, rssi: Option<i16>) {
        if self.scan_waiter.is_none() {
            return;
        }
        let Some(name) = name else {
            return;
        };
        log::debug!("Discovered {name} ({peripheral}) rssi {rssi:?}");
        if !name.contains(&self.config.name_marker) {
            return;
        }

        log::info!("Found {name} ({peripheral})");
        self.peripheral = Some(peripheral);
        self.stop_scanning();
        self.set_state(SessionState::Idle);
        self.report("Found!!");
        self.finish_scan(Ok(ScanOutcome::Found));
    }

    fn on_connected(&mut self, peripheral: PeripheralHandle) {
        if self.peripheral.as_ref() != Some(&peripheral) {
            log::debug!("Ignoring connection to unexpected peripheral {peripheral}");
            return;
        }
        if self.connecting.take().is_none() {
            // Timed out already; the cancel request will tear this link down
            log::debug!("Ignoring late connection to {peripheral}");
            return;
        }

        log::info!("Connected to {peripheral}");
        self.bindings.clear();
        self.assembler.reset();
        self.set_state(SessionState::Connected);
        self.report("Connected");

        // Only the two known services; everything else on the peripheral is ignored
        let filter = CharacteristicRegistry::service_filter();
        if let Err(e) = self.transport.discover_services(&peripheral, &filter) {
            self.report(format!("Service discovery failed: {e}"));
        }
    }

    fn connect_failed(&mut self, error: TransportError) {
        log::warn!("Connect failed: {error}");
        self.set_state(SessionState::ConnectFailed);
        self.report(format!("(No Connector) {error}"));
    }

    fn on_services(&mut self, peripheral: &PeripheralHandle, result: Result<Vec<uuid::Uuid>, TransportError>) {
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                self.report(format!("Service discovery failed: {e}"));
                return;
            }
        };
        log::debug!("Discovered {} services", services.len());

        for service in services {
            let Some(role) = ServiceRole::from_uuid(service) else {
                log::debug!("Ignoring unknown service {service}");
                continue;
            };
            log::debug!("Discovering characteristics of {role:?} service");
            if let Err(e) = self.transport.discover_characteristics(peripheral, service) {
                self.report(format!("Characteristic discovery failed for {role:?}: {e}"));
            }
        }
    }

    fn on_characteristics(
        &mut self,
        peripheral: &PeripheralHandle,
        service: uuid::Uuid,
        result: Result<Vec<CharacteristicRef>, TransportError>,
    ) {
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => {
                self.report(format!("Characteristic discovery failed: {e}"));
                return;
            }
        };

        for characteristic in characteristics {
            let Some(role) = CharacteristicRegistry::lookup(service, characteristic.uuid) else {
                log::debug!("Unknown characteristic {} in service {service}", characteristic.uuid);
                continue;
            };

            log::debug!("Bound {role:?} -> {}", characteristic.uuid);
            self.bindings.insert(role, characteristic);

            // No subscription, no fingerprint events
            if role == CharacteristicRole::FingerEventDetect {
                if let Err(e) = self.transport.set_notify(peripheral, characteristic, true) {
                    self.report(format!("Could not subscribe to fingerprint events: {e}"));
                }
            }
        }

        if CharacteristicRole::ALL.iter().all(|role| self.bindings.contains_key(role)) {
            log::info!("All characteristics bound");
            self.report("Ready");
        }
    }

    fn on_write_completed(&mut self, characteristic: CharacteristicRef, result: Result<(), TransportError>) {
        if CharacteristicRegistry::lookup(characteristic.service, characteristic.uuid)
            != Some(CharacteristicRole::LockState)
        {
            log::debug!("Write completed on {}", characteristic.uuid);
            return;
        }

        match result {
            Ok(()) => {
                log::info!("Lock state set");
                if let Some(ticket) = self.lock.on_write_acknowledged() {
                    self.schedule(self.config.settle_delay(), Timer::GateSettle(ticket));
                }
            }
            Err(e) => {
                self.lock.on_write_failed();
                self.report(format!("Lock write failed: {e}"));
            }
        }
    }

    fn on_value(&mut self, characteristic: CharacteristicRef, result: Result<Vec<u8>, TransportError>) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Value update from {} failed: {e}", characteristic.uuid);
                return;
            }
        };
        if self.state != SessionState::Connected {
            return;
        }
        let Some(role) = CharacteristicRegistry::lookup(characteristic.service, characteristic.uuid)
        else {
            log::debug!("Ignoring value from unknown characteristic {}", characteristic.uuid);
            return;
        };

        if role.is_fingerprint() && self.lock.is_gate_open() {
            log::debug!("Discarding {role:?} while the lock write settles");
            return;
        }

        match role {
            CharacteristicRole::FingerEventDetect => self.on_fingerprint_event(),
            CharacteristicRole::LockState => log::debug!("Lock state is now {value:02x?}"),
            data => {
                if let Some(assembled) = self.assembler.on_chunk_received(data, &value) {
                    self.on_fingerprint_complete(&assembled);
                }
            }
        }
    }

    fn on_fingerprint_event(&mut self) {
        log::info!("Fingerprint event detected");

        // Reset before the reads go out, or a late chunk from the last cycle could land here
        self.assembler.on_event_detected();

        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        for role in CharacteristicRole::DATA {
            match self.bindings.get(&role) {
                Some(characteristic) => {
                    if let Err(e) = self.transport.read_value(&peripheral, *characteristic) {
                        log::warn!("Read of {role:?} failed: {e}");
                    }
                }
                None => log::warn!("{role:?} is not bound; fingerprint cannot be assembled"),
            }
        }
    }

    fn on_fingerprint_complete(&mut self, assembled: &str) {
        let label = match self.pipeline.classify(assembled) {
            Ok(label) => label,
            Err(e) => {
                log::warn!("Classification failed: {e}");
                self.report(format!("Classification failed: {e}"));
                return;
            }
        };

        let command = LockController::decide(label);
        log::info!("Fingerprint class {label} -> {command:?}");

        if let Err(e) = self.write_lock(command, false) {
            log::warn!("Lock write skipped: {e}");
        }

        self.sink
            .on_event(SessionEvent::Decision(DecisionRecord::now(label, command)));
    }

    // =========================================================================
    // Timers and helpers
    // =========================================================================

    fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ConnectDeadline(attempt) => {
                if self.connecting != Some(attempt) {
                    return;
                }
                self.connecting = None;
                if let Some(peripheral) = &self.peripheral {
                    if let Err(e) = self.transport.disconnect(peripheral) {
                        log::debug!("Cancelling connect failed: {e}");
                    }
                }
                let waited = self.config.connect_timeout();
                self.connect_failed(TransportError::Connect(format!("timed out after {waited:?}")));
            }
            Timer::DisconnectDeadline(attempt) => {
                if self.disconnecting == Some(attempt) {
                    log::warn!("Disconnect not confirmed, dropping the link state");
                    self.teardown();
                }
            }
            Timer::GateSettle(ticket) => {
                if self.lock.settle(ticket) {
                    log::info!("Fingerprint notifications re-enabled");
                }
            }
        }
    }

    /// Forget the link: bindings, latched peripheral, partial fingerprint, gate
    fn teardown(&mut self) {
        if !self.assembler.is_complete() && self.assembler.filled() > 0 {
            log::debug!("Dropping {} fingerprint chunks", self.assembler.filled());
        }
        if let Some(peripheral) = &self.peripheral {
            log::info!("Disconnected from {peripheral}");
        }

        self.bindings.clear();
        self.assembler.reset();
        self.lock.reset();
        self.peripheral = None;
        self.connecting = None;
        self.disconnecting = None;
        self.set_state(SessionState::Disconnected);
        self.report("Disconnected");
    }

    fn is_current(&self, peripheral: &PeripheralHandle) -> bool {
        self.state == SessionState::Connected && self.peripheral.as_ref() == Some(peripheral)
    }

    fn next_attempt(&mut self) -> u64 {
        self.next_attempt += 1;
        self.next_attempt
    }

    fn schedule(&self, delay: Duration, timer: Timer) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Timer(timer));
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.sink.on_event(SessionEvent::State(state));
        }
    }

    fn report(&self, text: impl Into<String>) {
        self.sink.on_event(SessionEvent::Status(text.into()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::classifier::{ClassLabel, FEATURE_LEN, NoModel};
    use crate::error::ClassificationError;
    use crate::lock::REJECT_LABEL;
    use crate::mock::{Behavior, MOCK_PERIPHERAL, MockTransport, Request};
    use crate::sink::{ChannelSink, Verdict};

    struct Harness {
        handle: SessionHandle,
        mock: MockTransport,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Harness {
        fn start<C: Classifier>(behavior: Behavior, classifier: C) -> Self {
            let (sender, inbox) = inbox();
            let mock = MockTransport::new(sender, behavior);
            let (sink, events) = ChannelSink::new();
            let (session, handle) = ConnectionSession::new(
                inbox,
                mock.clone(),
                classifier,
                Arc::new(sink),
                SessionConfig::default(),
            );
            tokio::spawn(session.run());
            Self { handle, mock, events }
        }

        /// Let cascading transport events drain; each snapshot round trip
        /// handles one more generation of them
        async fn settle(&self) -> SessionSnapshot {
            let mut snapshot = self.handle.status().await.unwrap();
            for _ in 0..16 {
                snapshot = self.handle.status().await.unwrap();
            }
            snapshot
        }

        async fn bring_up(&self) {
            let outcome = self.handle.start_scan(Duration::from_secs(5)).await.unwrap();
            assert_eq!(outcome, ScanOutcome::Found);
            self.handle.connect().unwrap();
            let snapshot = self.settle().await;
            assert_eq!(snapshot.state, SessionState::Connected);
            assert!(snapshot.is_ready(), "bound: {:?}", snapshot.bound);
        }

        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn decisions(&mut self) -> Vec<DecisionRecord> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    SessionEvent::Decision(record) => Some(record),
                    _ => None,
                })
                .collect()
        }

        fn drain_has_status(&mut self, prefix: &str) -> bool {
            self.drain().iter().any(|event| matches!(
                event,
                SessionEvent::Status(text) if text.starts_with(prefix)
            ))
        }
    }

    fn counting(label: ClassLabel) -> (impl Classifier, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let classifier =
            move |_: &[f64; FEATURE_LEN]| -> Result<ClassLabel, ClassificationError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(label)
            };
        (classifier, calls)
    }

    fn fingerprint() -> Vec<u8> {
        (0..=255).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn scan_times_out_without_a_match() {
        let (classifier, _) = counting(0);
        let h = Harness::start(Behavior::silent(), classifier);

        let started = Instant::now();
        let outcome = h.handle.start_scan(Duration::from_millis(500)).await.unwrap();
        assert_eq!(outcome, ScanOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(600));

        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.peripheral, None);
        assert_eq!(h.mock.requests(), vec![Request::StartScan, Request::StopScan]);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_ignores_names_without_the_marker() {
        let (classifier, _) = counting(0);
        let mut behavior = Behavior::fingerlock();
        behavior.advertisements.pop();
        let h = Harness::start(behavior, classifier);

        let outcome = h.handle.start_scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, ScanOutcome::TimedOut);
        assert_eq!(h.settle().await.peripheral, None);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_latches_the_marker_device() {
        let (classifier, _) = counting(0);
        let mut h = Harness::start(Behavior::fingerlock(), classifier);

        let outcome = h.handle.start_scan(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ScanOutcome::Found);

        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.peripheral, Some(PeripheralHandle::new(MOCK_PERIPHERAL)));
        assert_eq!(h.mock.requests(), vec![Request::StartScan, Request::StopScan]);

        let events = h.drain();
        assert!(events.contains(&SessionEvent::State(SessionState::Scanning)));
        assert!(events.contains(&SessionEvent::Status("Found!!".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_a_pending_scan() {
        let (classifier, _) = counting(0);
        let h = Harness::start(Behavior::silent(), classifier);

        let handle = h.handle.clone();
        let scan = tokio::spawn(async move { handle.start_scan(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        assert_eq!(h.settle().await.state, SessionState::Scanning);

        h.handle.cancel_scan().unwrap();
        assert_eq!(scan.await.unwrap().unwrap(), ScanOutcome::Cancelled);
        assert_eq!(h.settle().await.state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_scan_cancels_the_previous_one() {
        let (classifier, _) = counting(0);
        let h = Harness::start(Behavior::silent(), classifier);

        let handle = h.handle.clone();
        let first = tokio::spawn(async move { handle.start_scan(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        h.settle().await;

        let handle = h.handle.clone();
        let second = tokio::spawn(async move { handle.start_scan(Duration::from_secs(30)).await });
        assert_eq!(first.await.unwrap().unwrap(), ScanOutcome::Cancelled);

        h.settle().await;
        h.handle.cancel_scan().unwrap();
        assert_eq!(second.await.unwrap().unwrap(), ScanOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_scan_timeout_leaves_the_newer_scan_running() {
        let (classifier, _) = counting(0);
        let mut h = Harness::start(Behavior::silent(), classifier);

        // The first caller's deadline fires after a second scan was queued
        let first = h.handle.next_scan();
        let (reply, abandoned) = oneshot::channel();
        h.handle.send(Command::StartScan { attempt: first, reply }).unwrap();
        drop(abandoned);

        let handle = h.handle.clone();
        let second = tokio::spawn(async move { handle.start_scan(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;

        let (reply, timed_out) = oneshot::channel();
        h.handle.send(Command::ScanTimedOut { attempt: first, reply }).unwrap();
        assert_eq!(timed_out.await.unwrap(), ScanOutcome::Cancelled);

        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Scanning);
        assert!(!second.is_finished());
        assert!(!h.drain_has_status("(No Connector)"));

        h.handle.cancel_scan().unwrap();
        assert_eq!(second.await.unwrap().unwrap(), ScanOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_racing_a_match_reports_found() {
        let (classifier, _) = counting(0);
        let h = Harness::start(Behavior::fingerlock(), classifier);

        let attempt = h.handle.next_scan();
        let (reply, found) = oneshot::channel();
        h.handle.send(Command::StartScan { attempt, reply }).unwrap();
        h.settle().await;

        let (reply, timed_out) = oneshot::channel();
        h.handle.send(Command::ScanTimedOut { attempt, reply }).unwrap();
        assert_eq!(timed_out.await.unwrap(), ScanOutcome::Found);
        assert_eq!(found.await.unwrap().unwrap(), ScanOutcome::Found);
        assert_eq!(
            h.settle().await.peripheral,
            Some(PeripheralHandle::new(MOCK_PERIPHERAL))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scan_failure_resolves_the_caller_with_the_error() {
        let (classifier, _) = counting(0);
        let mut h = Harness::start(Behavior::silent(), classifier);

        let handle = h.handle.clone();
        let scan = tokio::spawn(async move { handle.start_scan(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        assert_eq!(h.settle().await.state, SessionState::Scanning);

        h.mock.emit(TransportEvent::ScanFailed {
            error: TransportError::Scan("adapter powered off".to_string()),
        });
        let err = scan.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Scan(_))), "{err:?}");

        assert_eq!(h.settle().await.state, SessionState::Idle);
        assert_eq!(h.mock.requests(), vec![Request::StartScan]);
        assert!(h.drain_has_status("Scan failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_binds_every_role_and_subscribes_to_events() {
        let (classifier, _) = counting(0);
        let mut h = Harness::start(Behavior::fingerlock(), classifier);
        h.bring_up().await;

        let requests = h.mock.requests();
        assert!(requests.contains(&Request::DiscoverServices(
            CharacteristicRegistry::service_filter()
        )));

        let discovered: Vec<_> = requests
            .iter()
            .filter_map(|r| match r {
                Request::DiscoverCharacteristics(service) => Some(*service),
                _ => None,
            })
            .collect();
        assert_eq!(discovered.len(), 2);
        assert!(discovered.contains(&ServiceRole::Fingerprint.uuid()));
        assert!(discovered.contains(&ServiceRole::DoorLock.uuid()));

        let event = CharacteristicRef::for_role(CharacteristicRole::FingerEventDetect);
        assert!(requests.contains(&Request::SetNotify(event, true)));

        let events = h.drain();
        assert!(events.contains(&SessionEvent::State(SessionState::Connected)));
        assert!(events.contains(&SessionEvent::Status("Ready".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_a_found_peripheral_is_a_no_op() {
        let (classifier, _) = counting(0);
        let h = Harness::start(Behavior::fingerlock(), classifier);

        h.handle.connect().unwrap();
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(h.mock.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_while_connected_is_refused() {
        let (classifier, _) = counting(0);
        let h = Harness::start(Behavior::fingerlock(), classifier);
        h.bring_up().await;

        let err = h.handle.start_scan(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_the_peripheral_never_answers() {
        let (classifier, _) = counting(0);
        let mut behavior = Behavior::fingerlock();
        behavior.accept_connect = false;
        let mut h = Harness::start(behavior, classifier);

        h.handle.start_scan(Duration::from_secs(5)).await.unwrap();
        h.handle.connect().unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        let snapshot = h.settle().await;
        assert!(snapshot.connecting);
        assert_eq!(snapshot.state, SessionState::Idle);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        let snapshot = h.settle().await;
        assert!(!snapshot.connecting);
        assert_eq!(snapshot.state, SessionState::ConnectFailed);

        let peripheral = PeripheralHandle::new(MOCK_PERIPHERAL);
        assert!(h.mock.requests().contains(&Request::Disconnect(peripheral)));
        assert!(h.drain().iter().any(|event| matches!(
            event,
            SessionEvent::Status(text) if text.starts_with("(No Connector)")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn reported_connect_failure_is_not_retried() {
        let (classifier, _) = counting(0);
        let mut behavior = Behavior::fingerlock();
        behavior.accept_connect = false;
        let mut h = Harness::start(behavior, classifier);

        h.handle.start_scan(Duration::from_secs(5)).await.unwrap();
        h.handle.connect().unwrap();
        h.settle().await;

        let peripheral = PeripheralHandle::new(MOCK_PERIPHERAL);
        h.mock.emit(TransportEvent::ConnectFailed {
            peripheral: peripheral.clone(),
            error: TransportError::Connect("peer refused".to_string()),
        });
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::ConnectFailed);
        assert!(!snapshot.connecting);
        assert_eq!(snapshot.peripheral, Some(peripheral.clone()));
        assert!(h.drain_has_status("(No Connector)"));

        // The old deadline is stale and nothing reconnects on its own
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.settle().await.state, SessionState::ConnectFailed);
        let requests = h.mock.requests();
        let connects = requests.iter().filter(|r| matches!(r, Request::Connect(_))).count();
        assert_eq!(connects, 1);
        assert!(!requests.contains(&Request::Disconnect(peripheral)));

        h.mock.configure(|b| b.accept_connect = true);
        h.handle.connect().unwrap();
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(snapshot.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_errors_leave_roles_unbound() {
        let (classifier, _) = counting(0);
        let mut behavior = Behavior::fingerlock();
        behavior.discovery_error = Some(TransportError::Discovery("gatt error 0x85".to_string()));
        let mut h = Harness::start(behavior, classifier);

        h.handle.start_scan(Duration::from_secs(5)).await.unwrap();
        h.handle.connect().unwrap();
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(snapshot.bound.is_empty());
        assert!(
            !h.mock
                .requests()
                .iter()
                .any(|r| matches!(r, Request::DiscoverCharacteristics(_)))
        );
        assert!(h.drain_has_status("Service discovery failed"));

        h.mock.emit(TransportEvent::CharacteristicsDiscovered {
            peripheral: PeripheralHandle::new(MOCK_PERIPHERAL),
            service: ServiceRole::Fingerprint.uuid(),
            result: Err(TransportError::Discovery("att error 0x0a".to_string())),
        });
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(snapshot.bound.is_empty());
        assert!(h.drain_has_status("Characteristic discovery failed"));

        // Nothing bound, so a touch cannot start an assembly
        h.mock.touch();
        h.settle().await;
        assert!(h.mock.reads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_fingerprint_locks_the_door() {
        let (classifier, calls) = counting(REJECT_LABEL);
        let mut h = Harness::start(Behavior::fingerlock().with_fingerprint(&fingerprint()), classifier);
        h.bring_up().await;

        h.mock.touch();
        h.settle().await;

        assert_eq!(h.mock.reads(), CharacteristicRole::DATA.to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.mock.lock_writes(), vec![vec![0x01]]);

        let decisions = h.decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].verdict, Verdict::Ng);
        assert_eq!(decisions[0].label, 2);
        assert_eq!(decisions[0].command, LockCommand::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_fingerprint_opens_the_door() {
        let (classifier, _) = counting(7);
        let mut h = Harness::start(Behavior::fingerlock().with_fingerprint(&fingerprint()), classifier);
        h.bring_up().await;

        h.mock.touch();
        h.settle().await;

        assert_eq!(h.mock.lock_writes(), vec![vec![0x02]]);
        let decisions = h.decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].to_string(), "OK (Finger 7)");
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_assemble_in_any_arrival_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let classifier =
            move |features: &[f64; FEATURE_LEN]| -> Result<ClassLabel, ClassificationError> {
                captured.lock().unwrap().push(features.to_vec());
                Ok(0)
            };
        // No values: the reads go unanswered and the test delivers the chunks
        let h = Harness::start(Behavior::fingerlock(), classifier);
        h.bring_up().await;

        let print = fingerprint();
        h.mock.touch();
        h.settle().await;
        h.mock.notify(CharacteristicRole::FingerData3, &print[200..]);
        h.mock.notify(CharacteristicRole::FingerData1, &print[..100]);
        h.settle().await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(h.settle().await.pending_chunks, 2);

        h.mock.notify(CharacteristicRole::FingerData2, &print[100..200]);
        h.settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], 0.0);
        assert_eq!(seen[0][255], 1.0);
        assert_eq!(seen[0][51], 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_discards_fingerprints_until_settled() {
        let (classifier, calls) = counting(7);
        let h = Harness::start(Behavior::fingerlock().with_fingerprint(&fingerprint()), classifier);
        h.bring_up().await;

        h.mock.touch();
        let snapshot = h.settle().await;
        assert!(snapshot.gate_open);
        assert_eq!(h.mock.reads().len(), 3);

        // The lock's own bounce is swallowed
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        h.mock.touch();
        h.mock.notify(CharacteristicRole::FingerData1, &[0xff]);
        h.settle().await;
        assert_eq!(h.mock.reads().len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert!(h.settle().await.gate_open);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!h.settle().await.gate_open);

        h.mock.touch();
        h.settle().await;
        assert_eq!(h.mock.reads().len(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.mock.lock_writes(), vec![vec![0x02], vec![0x02]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_reopens_the_pipeline_immediately() {
        let (classifier, calls) = counting(7);
        let mut behavior = Behavior::fingerlock().with_fingerprint(&fingerprint());
        behavior.write_result = Some(Err(TransportError::Write("att error 0x0e".to_string())));
        let h = Harness::start(behavior, classifier);
        h.bring_up().await;

        h.mock.touch();
        assert!(!h.settle().await.gate_open);

        h.mock.touch();
        h.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.mock.lock_writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_writes_settle_from_the_last_acknowledgment() {
        let (classifier, _) = counting(7);
        let mut behavior = Behavior::fingerlock().with_fingerprint(&fingerprint());
        behavior.write_result = None;
        let h = Harness::start(behavior, classifier);
        h.bring_up().await;

        h.mock.touch();
        h.settle().await;
        h.handle.force_close().await.unwrap();
        assert_eq!(h.mock.lock_writes(), vec![vec![0x02], vec![0x01]]);

        h.mock.acknowledge_write(Ok(()));
        h.settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.mock.acknowledge_write(Ok(()));
        h.settle().await;

        // Past the first acknowledgment's window, inside the second's
        tokio::time::sleep(Duration::from_millis(2_001)).await;
        assert!(h.settle().await.gate_open);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!h.settle().await.gate_open);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_the_gate_for_a_pending_forced_write() {
        let (classifier, calls) = counting(7);
        let mut behavior = Behavior::fingerlock().with_fingerprint(&fingerprint());
        behavior.write_result = None;
        let h = Harness::start(behavior, classifier);
        h.bring_up().await;

        h.mock.touch();
        h.settle().await;
        h.handle.force_close().await.unwrap();

        h.mock.acknowledge_write(Err(TransportError::Write("att error 0x0e".to_string())));
        assert!(h.settle().await.gate_open);

        h.mock.touch();
        h.settle().await;
        assert_eq!(h.mock.reads().len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        h.mock.acknowledge_write(Ok(()));
        h.settle().await;
        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert!(h.settle().await.gate_open);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!h.settle().await.gate_open);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_notifications_pass_while_the_gate_is_open() {
        let (classifier, _) = counting(7);
        let h = Harness::start(Behavior::fingerlock().with_fingerprint(&fingerprint()), classifier);
        h.bring_up().await;

        h.mock.touch();
        assert!(h.settle().await.gate_open);

        h.mock.notify(CharacteristicRole::LockState, &[0x02]);
        let snapshot = h.settle().await;
        assert!(snapshot.gate_open);
        assert_eq!(snapshot.state, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn classification_failure_keeps_the_session_running() {
        let mut h = Harness::start(Behavior::fingerlock().with_fingerprint(&fingerprint()), NoModel);
        h.bring_up().await;

        h.mock.touch();
        let snapshot = h.settle().await;
        assert!(!snapshot.gate_open);
        assert!(h.mock.lock_writes().is_empty());
        assert!(h.drain().iter().any(|event| matches!(
            event,
            SessionEvent::Status(text) if text.starts_with("Classification failed")
        )));

        h.mock.touch();
        h.settle().await;
        assert_eq!(h.mock.reads().len(), 6);
        assert_eq!(h.settle().await.state, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn short_fingerprint_is_not_classified() {
        let (classifier, calls) = counting(7);
        let h = Harness::start(Behavior::fingerlock().with_fingerprint(&[0x10; 255]), classifier);
        h.bring_up().await;

        h.mock.touch();
        h.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(h.mock.lock_writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_assembly_drops_partial_data() {
        let (classifier, calls) = counting(7);
        let mut h = Harness::start(Behavior::fingerlock(), classifier);
        h.bring_up().await;

        let print = fingerprint();
        h.mock.touch();
        h.mock.notify(CharacteristicRole::FingerData1, &print[..100]);
        assert_eq!(h.settle().await.pending_chunks, 1);

        h.mock.drop_link();
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.peripheral, None);
        assert!(snapshot.bound.is_empty());
        assert_eq!(snapshot.pending_chunks, 0);
        assert!(h.drain().contains(&SessionEvent::State(SessionState::Disconnected)));

        // Stragglers from the dead link are ignored
        h.mock.notify(CharacteristicRole::FingerData2, &print[100..200]);
        h.mock.notify(CharacteristicRole::FingerData3, &print[200..]);
        h.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // A fresh link starts from scratch
        h.bring_up().await;
        h.mock.touch();
        h.mock.notify(CharacteristicRole::FingerData2, &print[100..200]);
        h.mock.notify(CharacteristicRole::FingerData3, &print[200..]);
        h.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.mock.notify(CharacteristicRole::FingerData1, &print[..100]);
        h.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_request_tears_down_on_confirmation() {
        let (classifier, _) = counting(7);
        let h = Harness::start(Behavior::fingerlock(), classifier);
        h.bring_up().await;

        h.handle.disconnect().unwrap();
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(
            h.mock
                .requests()
                .contains(&Request::Disconnect(PeripheralHandle::new(MOCK_PERIPHERAL)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_disconnect_is_forced_after_the_deadline() {
        let (classifier, _) = counting(7);
        let mut behavior = Behavior::fingerlock();
        behavior.confirm_disconnect = false;
        let h = Harness::start(behavior, classifier);
        h.bring_up().await;

        h.handle.disconnect().unwrap();
        assert_eq!(h.settle().await.state, SessionState::Connected);

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        let snapshot = h.settle().await;
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(snapshot.bound.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_when_idle_is_a_no_op() {
        let (classifier, _) = counting(7);
        let h = Harness::start(Behavior::fingerlock(), classifier);

        h.handle.disconnect().unwrap();
        assert_eq!(h.settle().await.state, SessionState::Idle);
        assert!(h.mock.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn force_writes_need_a_connection() {
        let (classifier, _) = counting(7);
        let h = Harness::start(Behavior::fingerlock(), classifier);

        assert!(matches!(h.handle.force_open().await, Err(SessionError::NotConnected)));

        h.bring_up().await;
        h.handle.force_open().await.unwrap();
        assert!(h.settle().await.gate_open);

        // Forced writes go out even while the gate is open
        h.handle.force_close().await.unwrap();
        assert_eq!(h.mock.lock_writes(), vec![vec![0x02], vec![0x01]]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_worker_and_drops_the_link() {
        let (classifier, _) = counting(7);
        let h = Harness::start(Behavior::fingerlock(), classifier);
        h.bring_up().await;

        h.handle.shutdown().unwrap();
        assert!(matches!(h.handle.status().await, Err(SessionError::Closed)));
        assert!(
            h.mock
                .requests()
                .contains(&Request::Disconnect(PeripheralHandle::new(MOCK_PERIPHERAL)))
        );
    }
}

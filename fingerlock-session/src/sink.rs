//! Display/status sink

use std::fmt;

use fingerlock_proto::LockCommand;
use tokio::sync::mpsc;

use crate::classifier::ClassLabel;
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Ng,
}

impl Verdict {
    pub fn for_command(command: LockCommand) -> Self {
        match command {
            LockCommand::Open => Verdict::Ok,
            LockCommand::Close => Verdict::Ng,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Ok => "OK",
            Verdict::Ng => "NG",
        })
    }
}

/// Outcome of one classified fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    /// Local time, `YYYY/MM/DD HH:MM:SS`
    pub timestamp: String,
    pub verdict: Verdict,
    pub label: ClassLabel,
    pub command: LockCommand,
}

impl DecisionRecord {
    pub fn now(label: ClassLabel, command: LockCommand) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string(),
            verdict: Verdict::for_command(command),
            label,
            command,
        }
    }
}

impl fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Finger {})", self.verdict, self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    State(SessionState),
    /// Human-readable status line (found device, failures, ...)
    Status(String),
    Decision(DecisionRecord),
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::State(state) => log::info!("Session state: {state:?}"),
            SessionEvent::Status(text) => log::info!("{text}"),
            SessionEvent::Decision(record) => log::info!("{}  {record}", record.timestamp),
        }
    }
}

/// Forwards events to a receiver owned by the display side
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: SessionEvent) {
        // Display went away; the session keeps running without it
        let _ = self.tx.send(event);
    }
}

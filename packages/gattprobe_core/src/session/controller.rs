//! The session controller and its monopolization loop

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::anomaly::AnomalySignal;
use super::config::SessionConfig;
use super::{
    ConnectError, PayloadOutcome, Session, SessionDuration, SessionState, SessionSummary,
};
use crate::ble::gatt::{ascii_preview, keep_alive_command, CommandSpec};
use crate::ble::transport::{
    BleAddress, BleTransport, ChannelId, Notification, NotificationSink, WriteMode,
};
use crate::ble::BleError;
use crate::event_log::{EventKind, EventLog};

/// Why `maintain_connection` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The configured duration ran out.
    DurationElapsed,
    /// The stop signal fired.
    Stopped,
    /// The link dropped and aggressive mode was off.
    LinkLost,
}

/// Result of one `maintain_connection` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintainOutcome {
    pub exit: LoopExit,
    /// Wall-clock time spent inside the loop, backoff included.
    pub elapsed: Duration,
    pub reconnect_attempts: u32,
}

/// Sole owner of the transport and of the session it carries.
pub struct SessionController {
    transport: Box<dyn BleTransport>,
    config: SessionConfig,
    session: Session,
    log: EventLog,
    notify_tx: NotificationSink,
    notify_rx: mpsc::UnboundedReceiver<Notification>,
    anomalies_emitted: usize,
}

impl SessionController {
    pub fn new(peer: BleAddress, transport: Box<dyn BleTransport>, config: SessionConfig) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            session: Session::new(peer),
            log: EventLog::new(),
            notify_tx,
            notify_rx,
            anomalies_emitted: 0,
        }
    }

    /// Establish the link and subscribe to notifications.
    ///
    /// A failed subscription is logged and otherwise ignored: the session
    /// continues without passive monitoring.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let peer = self.session.peer;
        let timeout = self.config.connect_timeout();
        self.session.close_interval();
        self.session.state = SessionState::Connecting;
        log::debug!("Connecting to {} (timeout {:?})", peer, timeout);

        let attempt = tokio::time::timeout(timeout, self.transport.connect(&peer, timeout)).await;
        let result = match attempt {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(classify_connect_error(peer, e, timeout)),
            Err(_) => Err(ConnectError::Timeout { peer, after: timeout }),
        };

        if let Err(e) = result {
            self.session.state = SessionState::Disconnected;
            self.record(EventKind::ConnectionFailed {
                target: peer.to_string(),
                error: e.to_string(),
            });
            return Err(e);
        }

        self.session.state = SessionState::Connected;
        self.session.connection_start = Some(Instant::now());
        let rssi = self.transport.rssi().await;
        self.record(EventKind::ConnectionEstablished {
            target: peer.to_string(),
            rssi,
        });

        let sink = self.notify_tx.clone();
        let subscribed = tokio::time::timeout(
            self.config.write_timeout(),
            self.transport.subscribe(ChannelId::Notify, sink),
        )
        .await
        .unwrap_or(Err(BleError::Timeout));
        if let Err(e) = subscribed {
            self.record(EventKind::SubscriptionFailed {
                channel: ChannelId::Notify,
                error: e.to_string(),
            });
        }
        Ok(())
    }

    /// Re-establish the link after a detected loss.
    ///
    /// Identical to `connect` except that success counts as a reconnect.
    pub async fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.connect().await?;
        self.session.reconnect_count += 1;
        log::info!(
            "[+] Reconnected (total reconnects: {})",
            self.session.reconnect_count
        );
        Ok(())
    }

    /// Hold the link for `duration` or until `stop` fires.
    ///
    /// On a lost link the loop ends unless `aggressive` is set, in which case
    /// it tries one reconnect per iteration and backs off after a failure.
    /// Backoff time counts against `duration`. Every sleep is at most one
    /// poll interval and is cut short by `stop`.
    pub async fn maintain_connection(
        &mut self,
        duration: SessionDuration,
        keep_alive: bool,
        aggressive: bool,
        stop: &mut watch::Receiver<bool>,
    ) -> MaintainOutcome {
        let started = Instant::now();
        let mut last_keep_alive = started;
        let mut last_status = started;
        let mut attempts = 0u32;

        log::info!(
            "[*] Holding link to {} for {} (keep-alive: {}, aggressive: {})",
            self.session.peer,
            duration,
            keep_alive,
            aggressive
        );

        let exit = loop {
            let elapsed = started.elapsed();
            if *stop.borrow() {
                self.record(EventKind::StopRequested {
                    elapsed_seconds: elapsed.as_secs_f64(),
                });
                break LoopExit::Stopped;
            }
            if duration.is_expired(elapsed) {
                break LoopExit::DurationElapsed;
            }

            self.drain_notifications();

            if !self.link_up().await {
                self.handle_link_loss("Peer no longer reports a live link");
                if !aggressive {
                    break LoopExit::LinkLost;
                }

                attempts += 1;
                self.record(EventKind::ReconnectionAttempt { attempt: attempts });
                match self.reconnect().await {
                    Ok(()) => {}
                    Err(e) => {
                        let backoff = clamp_to(
                            self.config.reconnect_backoff().max(self.config.poll_interval()),
                            duration.remaining(started.elapsed()),
                        );
                        self.session.state = SessionState::Degraded;
                        self.record(EventKind::ReconnectionFailed {
                            attempt: attempts,
                            error: e.to_string(),
                            backoff_seconds: backoff.as_secs_f64(),
                        });
                        pause(backoff, stop).await;
                    }
                }
                continue;
            }

            self.session.state = SessionState::Monitoring;

            if keep_alive && last_keep_alive.elapsed() >= self.config.keep_alive_interval() {
                self.send_keep_alive().await;
                last_keep_alive = Instant::now();
            }

            if last_status.elapsed() >= self.config.status_interval() {
                log::info!(
                    "[STATUS] Uptime: {:.0}s | Keep-alives: {} | Reconnects: {}",
                    self.session.uptime().as_secs_f64(),
                    self.session.keep_alive_count,
                    self.session.reconnect_count
                );
                last_status = Instant::now();
            }

            let tick = clamp_to(
                self.config.poll_interval(),
                duration.remaining(started.elapsed()),
            );
            pause(tick, stop).await;
        };

        self.drain_notifications();
        MaintainOutcome {
            exit,
            elapsed: started.elapsed(),
            reconnect_attempts: attempts,
        }
    }

    /// Write a fuzz payload without acknowledgment and check the peer survived.
    pub async fn send_payload(&mut self, spec: &CommandSpec) -> PayloadOutcome {
        let settle = self.config.settle_delay();
        self.deliver(spec, WriteMode::WithoutResponse, settle).await
    }

    /// Write a command with an explicit write mode and settle delay.
    pub async fn send_command(
        &mut self,
        spec: &CommandSpec,
        mode: WriteMode,
        settle: Duration,
    ) -> PayloadOutcome {
        self.deliver(spec, mode, settle).await
    }

    async fn deliver(
        &mut self,
        spec: &CommandSpec,
        mode: WriteMode,
        settle: Duration,
    ) -> PayloadOutcome {
        if !self.link_up().await {
            self.handle_link_loss(&format!("Link already down before sending {}", spec.id));
            return PayloadOutcome::LinkDown;
        }

        let written = self.write(&spec.payload, mode).await;
        if written.is_ok() {
            self.record(EventKind::PayloadSent {
                name: spec.id.clone(),
                size: spec.payload.len(),
                payload_hex: spec.payload_hex(),
                preview: spec.preview(),
            });
            tokio::time::sleep(settle).await;
        }
        self.drain_notifications();

        // Liveness decides first: a write that failed because the peer went
        // away is still a crash signal.
        if !self.link_up().await {
            let reason = match &written {
                Ok(()) => "Link dropped immediately after write".to_string(),
                Err(e) => format!("Link dropped during write: {}", e),
            };
            self.record(EventKind::DeviceCrash {
                payload: spec.id.clone(),
                reason: reason.clone(),
            });
            self.emit_anomaly(AnomalySignal::unexpected_disconnect(&spec.id));
            self.handle_link_loss(&reason);
            return PayloadOutcome::DeviceUnresponsive;
        }

        match written {
            Ok(()) => PayloadOutcome::Delivered,
            Err(e) => {
                self.record(EventKind::SendError {
                    payload: spec.id.clone(),
                    error: e.to_string(),
                });
                PayloadOutcome::TransportError(e.to_string())
            }
        }
    }

    /// Send the no-op keep-alive. Failures are logged, never fatal.
    pub async fn send_keep_alive(&mut self) -> bool {
        let spec = keep_alive_command();
        match self.write(&spec.payload, WriteMode::WithoutResponse).await {
            Ok(()) => {
                self.session.keep_alive_count += 1;
                self.record(EventKind::KeepAlive {
                    count: self.session.keep_alive_count,
                    command: spec.payload_hex(),
                });
                true
            }
            Err(e) => {
                self.record(EventKind::KeepAliveFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Log and screen every queued notification, in arrival order.
    pub fn drain_notifications(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(notification) = self.notify_rx.try_recv() {
            drained += 1;
            let data = notification.data;
            self.record(EventKind::ResponseReceived {
                channel: notification.channel,
                data: hex::encode(&data),
                ascii: ascii_preview(&data),
                size: data.len(),
            });
            for signal in self.config.anomaly.inspect(&data) {
                self.emit_anomaly(signal);
            }
        }
        drained
    }

    pub fn emit_anomaly(&mut self, signal: AnomalySignal) {
        self.anomalies_emitted += 1;
        self.record(EventKind::AnomalyDetected {
            kind: signal.kind,
            description: signal.description,
        });
    }

    /// Close the link. Errors are logged, never returned.
    pub async fn disconnect(&mut self) {
        self.drain_notifications();
        let result = tokio::time::timeout(self.config.write_timeout(), self.transport.disconnect())
            .await
            .unwrap_or(Err(BleError::Timeout));
        self.session.close_interval();
        self.session.state = SessionState::Disconnected;
        self.record(EventKind::Disconnected {
            error: result.err().map(|e| e.to_string()),
        });
    }

    /// Append an event to the session log.
    pub fn record(&mut self, kind: EventKind) {
        self.log.append(kind);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            peer: self.session.peer,
            state: self.session.state,
            uptime: self.session.uptime(),
            reconnect_count: self.session.reconnect_count,
            keep_alive_count: self.session.keep_alive_count,
            anomalies_emitted: self.anomalies_emitted,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.session.uptime()
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn peer(&self) -> BleAddress {
        self.session.peer
    }

    pub fn reconnect_count(&self) -> u32 {
        self.session.reconnect_count
    }

    pub fn keep_alive_count(&self) -> u32 {
        self.session.keep_alive_count
    }

    pub fn anomalies_emitted(&self) -> usize {
        self.anomalies_emitted
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Consume the controller, handing over its event log.
    pub fn into_log(self) -> EventLog {
        self.log
    }

    async fn link_up(&self) -> bool {
        tokio::time::timeout(self.config.write_timeout(), self.transport.is_connected())
            .await
            .unwrap_or(false)
    }

    async fn write(&mut self, data: &[u8], mode: WriteMode) -> Result<(), BleError> {
        tokio::time::timeout(
            self.config.write_timeout(),
            self.transport.write(ChannelId::Command, data, mode),
        )
        .await
        .unwrap_or(Err(BleError::Timeout))
    }

    /// Close the connected interval and log the loss once.
    fn handle_link_loss(&mut self, reason: &str) {
        if self.session.connection_start.is_none() {
            return;
        }
        let interval = self.session.close_interval();
        self.session.state = SessionState::Degraded;
        self.record(EventKind::ConnectionLost {
            reason: reason.to_string(),
            uptime_seconds: interval.as_secs_f64(),
        });
    }
}

fn classify_connect_error(peer: BleAddress, error: BleError, timeout: Duration) -> ConnectError {
    match error {
        BleError::Timeout => ConnectError::Timeout { peer, after: timeout },
        BleError::ServiceNotFound(_) | BleError::CharacteristicNotFound(_) => {
            ConnectError::ProtocolMismatch {
                peer,
                reason: error.to_string(),
            }
        }
        other => ConnectError::PeerUnreachable {
            peer,
            reason: other.to_string(),
        },
    }
}

fn clamp_to(wait: Duration, remaining: Option<Duration>) -> Duration {
    match remaining {
        Some(remaining) => wait.min(remaining),
        None => wait,
    }
}

/// Sleep for `wait`, returning early if `stop` turns true.
pub(crate) async fn pause(wait: Duration, stop: &mut watch::Receiver<bool>) {
    if wait.is_zero() || *stop.borrow() {
        return;
    }
    let deadline = Instant::now() + wait;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return,
            changed = stop.changed() => match changed {
                Ok(()) if *stop.borrow() => return,
                Ok(()) => continue,
                Err(_) => {
                    // Sender gone: nobody can stop us any more.
                    tokio::time::sleep_until(deadline).await;
                    return;
                }
            },
        }
    }
}

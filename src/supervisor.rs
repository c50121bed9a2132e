//! # Connection supervisor
//!
//! The only code that talks to the daemon. It owns the session and runs one
//! [`ConnectionSupervisor::tick`] per loop iteration:
//!
//! ```text
//! Disconnected --connect ok--> Connected --error--> Failure --> Waiting
//!      ^                           |                               |
//!      |                           +--reconnect/disconnect---------+
//!      +--------------------backoff elapsed------------------------+
//! ```
//!
//! While connected, the daemon sits in idle. Each tick polls the socket for a
//! short while and leaves idle only when there is something to do: a change
//! reported by the daemon, a queued command, or a due timer. Commands that
//! arrive while waiting to reconnect are answered right away with
//! "MPD disconnected", except for engine-local ones.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::api::{Notification, Request, Response};
use crate::daemon::{Connector, Daemon};
use crate::error::{EngineError, Result};
use crate::events;
use crate::handler::{self, Action};
use crate::job_queue::JobQueue;
use crate::session::Session;
use crate::tracker::unix_now;

/// How long one tick waits on the daemon socket or the inbound queue
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Failure,
    Connected,
    ReconnectRequested,
    DisconnectRequested,
    Waiting,
}

/// Linear reconnect backoff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    interval: i64,
}

impl Backoff {
    pub const STEP: i64 = 2;
    pub const CAP: i64 = 20;

    /// Grow the interval and return the time of the next attempt
    pub fn schedule(&mut self, now: i64) -> i64 {
        self.interval = (self.interval + Self::STEP).min(Self::CAP);
        now + self.interval
    }

    pub fn reset(&mut self) {
        self.interval = 0;
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }
}

pub struct ConnectionSupervisor {
    connector: Box<dyn Connector>,
    daemon: Option<Box<dyn Daemon>>,
    state: ConnectionState,
    backoff: Backoff,
    reconnect_at: i64,
    session: Session,
    inbound: Arc<JobQueue<Request>>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Box<dyn Connector>, session: Session, inbound: Arc<JobQueue<Request>>) -> Self {
        Self {
            connector,
            daemon: None,
            state: ConnectionState::Disconnected,
            backoff: Backoff::default(),
            reconnect_at: 0,
            session,
            inbound,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn reconnect_at(&self) -> i64 {
        self.reconnect_at
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Run until `stop` returns true, then flush state and answer leftover jobs
    pub fn run(&mut self, stop: impl Fn() -> bool) {
        info!("Connection supervisor started");
        while !stop() {
            self.tick(unix_now());
        }
        self.shutdown();
    }

    /// Advance the state machine by one step
    pub fn tick(&mut self, now: i64) {
        match self.state {
            ConnectionState::Disconnected => self.connect(now),
            ConnectionState::Failure => {
                self.drop_connection();
                self.reconnect_at = self.backoff.schedule(now);
                warn!(
                    "MPD connection failed, retrying in {} seconds",
                    self.backoff.interval()
                );
                self.state = ConnectionState::Waiting;
            }
            ConnectionState::DisconnectRequested => {
                self.drop_connection();
                self.reconnect_at = self.backoff.schedule(now);
                info!("Disconnected on request, reconnecting in {} seconds", self.backoff.interval());
                self.state = ConnectionState::Waiting;
            }
            ConnectionState::ReconnectRequested => {
                self.drop_connection();
                self.backoff.reset();
                self.reconnect_at = now;
                info!("Reconnecting to MPD");
                self.state = ConnectionState::Waiting;
            }
            ConnectionState::Waiting => {
                if now >= self.reconnect_at {
                    debug!("Backoff elapsed");
                    self.state = ConnectionState::Disconnected;
                    return;
                }
                if let Some(request) = self.inbound.shift(POLL_INTERVAL) {
                    if let Err(e) = self.serve(request, now) {
                        warn!("Request while waiting to reconnect failed: {e}");
                    }
                }
            }
            ConnectionState::Connected => self.connected_tick(now),
        }
    }

    fn connect(&mut self, now: i64) {
        let settings = self.session.config.connection.clone();
        info!("Connecting to MPD at {}:{}", settings.host, settings.port);
        let mut daemon = match self.connector.connect(&settings) {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("MPD connection to {} failed: {e}", settings.host);
                self.state = ConnectionState::Failure;
                return;
            }
        };

        match setup_session(&mut self.session, &mut *daemon, now) {
            Ok(()) => {
                let (major, minor, patch) = daemon.version();
                info!("Connected to MPD {major}.{minor}.{patch}");
                self.daemon = Some(daemon);
                self.backoff.reset();
                self.state = ConnectionState::Connected;
            }
            Err(e) => {
                error!("MPD session setup failed: {e}");
                self.state = ConnectionState::Failure;
            }
        }
    }

    fn drop_connection(&mut self) {
        if self.daemon.take().is_some() || self.state == ConnectionState::Failure {
            self.session.on_disconnected();
            self.session.emit(Notification::MpdDisconnected);
        }
    }

    fn connected_tick(&mut self, now: i64) {
        let Some(daemon) = self.daemon.as_mut() else {
            self.state = ConnectionState::Failure;
            return;
        };
        let ready = match daemon.poll_idle(POLL_INTERVAL) {
            Ok(ready) => ready,
            Err(e) => {
                error!("Waiting for MPD events failed: {e}");
                self.state = ConnectionState::Failure;
                return;
            }
        };

        let jobs = !self.inbound.is_empty();
        let played = self.session.tracker.played_due(now);
        let jukebox = self.session.jukebox_due(now);
        let smartpls = self.session.smartpls_due(now);
        if !(ready || jobs || played || jukebox || smartpls) {
            return;
        }
        debug!(
            "Leaving idle: events={ready} jobs={jobs} played={played} jukebox={jukebox} smartpls={smartpls}"
        );

        if let Err(e) = self.service(now) {
            self.recover(e);
        }
    }

    /// One round outside idle
    fn service(&mut self, now: i64) -> Result<()> {
        let Some(daemon) = self.daemon.as_deref_mut() else {
            return Err(EngineError::Connection("no session".to_string()));
        };
        let changed = daemon.leave_idle()?;
        if !changed.is_empty() {
            events::dispatch(&mut self.session, daemon, &changed, now)?;
        }
        self.session.mark_played(daemon, now)?;
        if self.session.jukebox_due(now) {
            self.session.fill_jukebox(daemon, now)?;
        }
        if self.session.smartpls_due(now) {
            self.session.refresh_smartpls(daemon, now)?;
        }
        if let Some(request) = self.inbound.shift(Duration::ZERO) {
            self.serve(request, now)?;
        }
        if let Some(daemon) = self.daemon.as_deref_mut() {
            daemon.enter_idle()?;
        }
        Ok(())
    }

    /// Execute one job and answer it.
    ///
    /// A rejected command is cleared on the spot. If that fails, or the
    /// connection is gone, the caller gets "MPD disconnected" and the error is
    /// returned.
    fn serve(&mut self, request: Request, now: i64) -> Result<()> {
        let daemon: Option<&mut dyn Daemon> = match self.daemon.as_mut() {
            Some(daemon) => Some(&mut **daemon),
            None => None,
        };
        match handler::execute(&mut self.session, daemon, &request, now) {
            Ok((result, action)) => {
                self.session.reply(Response::result(&request, result));
                match action {
                    Action::None => {}
                    Action::Reconnect => self.state = ConnectionState::ReconnectRequested,
                    Action::Disconnect => self.state = ConnectionState::DisconnectRequested,
                }
                Ok(())
            }
            Err(e) if e.is_connection() => {
                self.session.reply(Response::disconnected(&request));
                Err(e)
            }
            Err(e @ EngineError::Protocol { .. }) => {
                let cleared = match self.daemon.as_mut() {
                    Some(daemon) => daemon.clear_error(),
                    None => Err(EngineError::Connection("no session".to_string())),
                };
                match cleared {
                    Ok(()) => {
                        warn!("{e}");
                        self.session.reply(Response::error(&request, &e.to_string()));
                        Ok(())
                    }
                    Err(clear) => {
                        self.session.reply(Response::disconnected(&request));
                        Err(EngineError::Connection(format!(
                            "can not recover from {e}: {clear}"
                        )))
                    }
                }
            }
            Err(e) => {
                warn!("Request {:?} failed: {e}", request.command);
                self.session.reply(Response::error(&request, &e.to_string()));
                Ok(())
            }
        }
    }

    /// Clear a protocol error or give up on the connection
    fn recover(&mut self, e: EngineError) {
        if e.is_connection() {
            error!("{e}");
            self.state = ConnectionState::Failure;
            return;
        }
        warn!("{e}");
        let Some(daemon) = self.daemon.as_mut() else {
            self.state = ConnectionState::Failure;
            return;
        };
        let cleared = daemon.clear_error().and_then(|_| daemon.enter_idle());
        if let Err(e) = cleared {
            error!("Can not recover from MPD error: {e}");
            self.state = ConnectionState::Failure;
        }
    }

    /// Flush in-memory state and answer whatever is still queued
    pub fn shutdown(&mut self) {
        info!("Connection supervisor stopping");
        self.session.shutdown();
        for request in self.inbound.drain() {
            self.session.reply(Response::disconnected(&request));
        }
        self.daemon = None;
    }
}

/// Authenticate, detect features and park a fresh session in idle
fn setup_session(session: &mut Session, daemon: &mut dyn Daemon, now: i64) -> Result<()> {
    let settings = &session.config.connection;
    if let Some(password) = &settings.password {
        daemon.password(password)?;
    }
    daemon.set_timeout(settings.timeout)?;
    session.on_connected(daemon, now)?;
    daemon.enter_idle()
}

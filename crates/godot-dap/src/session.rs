//! Debug session façade: the launch/configuration ordering state machine on
//! top of [`Client`].
//!
//! Godot's adapter is strict about ordering. `setBreakpoints` after
//! `configurationDone` is silently ignored, stepping while the game runs gets
//! an error response, and the `launch` response is held back until
//! `configurationDone` has been processed. The [`Session`] encodes that
//! ordering as a state machine and rejects out-of-order calls locally with
//! [`DapError::InvalidState`], so misuse costs nothing on the wire.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::ToSocketAddrs;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::{Client, ClientConfig};
use crate::launch::LaunchConfig;
use crate::messages::{
    Breakpoint, Capabilities, ContinueOutcome, EvaluateArguments, EvaluateOutcome, Event,
    InitializeArguments, Scope, ScopesArguments, ScopesBody, SetBreakpointsArguments,
    SetBreakpointsBody, Source, SourceBreakpoint, StackTrace, StackTraceArguments, StoppedBody,
    Thread, ThreadArguments, ThreadsBody, Variable, VariablesArguments, VariablesBody,
};
use crate::{DapError, Result};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, TCP not yet established. Never observable through
    /// [`Session::state`]: connect replaces it before returning the session.
    Idle,
    /// TCP established, `initialize` not yet exchanged.
    Connected,
    /// Capabilities received and the `initialized` event observed.
    Initialized,
    /// `launch` or `attach` sent; breakpoints may be set, the game is not
    /// under our control yet.
    LaunchPending,
    /// `configurationDone` sent; the game is starting.
    Configured,
    Running,
    Stopped,
    /// The adapter reported the debuggee gone.
    Terminated,
    /// [`Session::disconnect`] ran; the connection is gone for good.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Initialized => "initialized",
            SessionState::LaunchPending => "launch-pending",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Terminated => "terminated",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Shared {
    state: StdMutex<SessionState>,
    /// Latest `stopped` event body. A watch channel rather than a broadcast
    /// subscription so [`Session::wait_for_stop`] also sees a stop that
    /// arrived before it was called.
    stops: watch::Sender<Option<StoppedBody>>,
    /// Bumped (under the state lock) for every `stopped` event, so a resume
    /// response racing a fresh stop can tell whether the stop context it is
    /// about to clear is still the one it saw before sending.
    stop_epoch: AtomicU64,
    launch_args: StdMutex<Option<Value>>,
}

/// One debug session against a Godot editor. Cloning shares the session.
#[derive(Clone)]
pub struct Session {
    client: Client,
    shared: Arc<Shared>,
}

/// Deferred acknowledgment of a `launch` or `attach` request.
///
/// Godot holds these responses until `configurationDone` is processed, so
/// the request is sent in the background and this handle carries its
/// eventual outcome. An error response surfaces here as
/// [`DapError::Protocol`]; dropping the handle discards the outcome without
/// cancelling the request.
pub struct LaunchHandle {
    outcome: oneshot::Receiver<Result<()>>,
}

impl LaunchHandle {
    /// Waits for the adapter's response to the start request.
    pub async fn acknowledged(self) -> Result<()> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DapError::Disconnected),
        }
    }
}

impl Session {
    /// Connects with [`ClientConfig::default`].
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    pub async fn connect_with_config(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Self> {
        let (stops, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            state: StdMutex::new(SessionState::Idle),
            stops,
            stop_epoch: AtomicU64::new(0),
            launch_args: StdMutex::new(None),
        });

        let client = Client::connect_with_config(addr, config).await?;
        *crate::poison::lock(&shared.state, "session state") = SessionState::Connected;

        tokio::spawn(watch_lifecycle(
            client.subscribe_events(),
            client.clone(),
            Arc::clone(&shared),
        ));

        Ok(Self { client, shared })
    }

    /// Performs the `initialize` exchange: sends the request, decodes the
    /// capabilities, and waits for the `initialized` event before returning.
    pub async fn initialize(&self) -> Result<Capabilities> {
        self.require("initialize", &[SessionState::Connected])?;

        // Subscribe before sending so an adapter that emits `initialized`
        // ahead of the response body cannot slip past us.
        let events = self.client.subscribe_events();
        let arguments = serde_json::to_value(InitializeArguments::default())
            .map_err(|err| DapError::Encoding(err.to_string()))?;
        let body = self
            .client
            .send_request("initialize", Some(arguments))
            .await?;
        let capabilities = decode_body_or_default::<Capabilities>("initialize", body)?;

        self.client
            .wait_for_event_on(
                events,
                |event| matches!(event, Event::Initialized),
                self.client.config().request_timeout,
            )
            .await?;

        self.set_state(SessionState::Initialized);
        Ok(capabilities)
    }

    /// Sends `launch` without waiting for its response. Godot answers only
    /// after `configurationDone`, so the session moves straight to
    /// `LaunchPending` where breakpoints may be set; the returned handle
    /// resolves once the adapter acknowledges or rejects the launch.
    pub async fn launch(&self, arguments: Value) -> Result<LaunchHandle> {
        self.start_deferred("launch", arguments).await
    }

    /// Validates `config` and launches with its generated arguments.
    pub async fn launch_with_config(&self, config: &LaunchConfig) -> Result<LaunchHandle> {
        config.validate()?;
        self.launch(config.to_launch_args()).await
    }

    /// Attaches to a game the editor is already running. Same deferred
    /// acknowledgment shape as [`Session::launch`].
    pub async fn attach(&self, arguments: Value) -> Result<LaunchHandle> {
        self.start_deferred("attach", arguments).await
    }

    /// Sends `launch` immediately followed by `configurationDone` and waits
    /// for both responses. Use this when no breakpoints need setting between
    /// the two; Godot may answer them in either order.
    pub async fn launch_and_configure(&self, arguments: Value) -> Result<()> {
        self.start_and_configure("launch", arguments).await
    }

    /// `attach` + `configurationDone` back to back, both responses awaited
    /// in either arrival order.
    pub async fn attach_and_configure(&self, arguments: Value) -> Result<()> {
        self.start_and_configure("attach", arguments).await
    }

    async fn start_deferred(
        &self,
        command: &'static str,
        arguments: Value,
    ) -> Result<LaunchHandle> {
        self.require(command, &[SessionState::Initialized])?;

        *crate::poison::lock(&self.shared.launch_args, "launch arguments") =
            Some(arguments.clone());
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let client = self.client.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = client.send_request(command, Some(arguments)).await;
            match &outcome {
                Ok(_) => debug!(target: "godot.dap", command, "start request acknowledged"),
                Err(err) => {
                    warn!(target: "godot.dap", command, %err, "start request failed");
                    // Roll back so the caller can retry with a fixed config.
                    let mut state = crate::poison::lock(&shared.state, "session state");
                    if *state == SessionState::LaunchPending {
                        *state = SessionState::Initialized;
                    }
                }
            }
            let _ = outcome_tx.send(outcome.map(|_| ()));
        });

        self.set_state(SessionState::LaunchPending);
        Ok(LaunchHandle {
            outcome: outcome_rx,
        })
    }

    async fn start_and_configure(&self, command: &'static str, arguments: Value) -> Result<()> {
        self.require(command, &[SessionState::Initialized])?;

        *crate::poison::lock(&self.shared.launch_args, "launch arguments") =
            Some(arguments.clone());
        self.client
            .send_request_pair((command, Some(arguments)), ("configurationDone", None))
            .await?;
        self.set_state(SessionState::Configured);
        Ok(())
    }

    /// Replaces all breakpoints in one source file.
    ///
    /// `path` must be absolute in host form; translate `res://` paths with
    /// [`crate::resolve_source_path`] first. An empty `lines` clears the
    /// file's breakpoints. Must run before [`Session::configuration_done`],
    /// because Godot ignores breakpoints set after it.
    pub async fn set_breakpoints(&self, path: &Path, lines: &[u64]) -> Result<Vec<Breakpoint>> {
        self.require(
            "setBreakpoints",
            &[SessionState::Initialized, SessionState::LaunchPending],
        )?;

        let arguments = SetBreakpointsArguments {
            source: Source {
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
                path: Some(path.to_string_lossy().into_owned()),
            },
            breakpoints: lines
                .iter()
                .map(|&line| SourceBreakpoint {
                    line,
                    condition: None,
                })
                .collect(),
        };
        let arguments =
            serde_json::to_value(arguments).map_err(|err| DapError::Encoding(err.to_string()))?;
        let body = self
            .client
            .send_request("setBreakpoints", Some(arguments))
            .await?;
        let body = decode_body_or_default::<SetBreakpointsBody>("setBreakpoints", body)?;
        Ok(body.breakpoints)
    }

    /// Ends the configuration phase. Godot starts the game once this is
    /// acknowledged.
    pub async fn configuration_done(&self) -> Result<()> {
        self.require("configurationDone", &[SessionState::LaunchPending])?;
        self.client.send_request("configurationDone", None).await?;
        self.set_state(SessionState::Configured);
        Ok(())
    }

    /// Resumes execution (the DAP `continue` request).
    pub async fn resume(&self, thread_id: u64) -> Result<ContinueOutcome> {
        let body = self.request_while_stopped("continue", thread_id).await?;
        decode_body_or_default("continue", body)
    }

    pub async fn next(&self, thread_id: u64) -> Result<()> {
        self.request_while_stopped("next", thread_id).await?;
        Ok(())
    }

    pub async fn step_in(&self, thread_id: u64) -> Result<()> {
        self.request_while_stopped("stepIn", thread_id).await?;
        Ok(())
    }

    pub async fn step_out(&self, thread_id: u64) -> Result<()> {
        self.request_while_stopped("stepOut", thread_id).await?;
        Ok(())
    }

    /// Asks the adapter to break execution. The resulting `stopped` event
    /// moves the session to `Stopped`.
    pub async fn pause(&self, thread_id: u64) -> Result<()> {
        self.require("pause", &[SessionState::Configured, SessionState::Running])?;
        self.client
            .send_request("pause", Some(thread_arguments(thread_id)?))
            .await?;
        Ok(())
    }

    pub async fn threads(&self) -> Result<Vec<Thread>> {
        self.require("threads", &[SessionState::Stopped])?;
        let body = self.client.send_request("threads", None).await?;
        let body = decode_body::<ThreadsBody>("threads", body)?;
        Ok(body.threads)
    }

    pub async fn stack_trace(
        &self,
        thread_id: u64,
        start_frame: u64,
        levels: u64,
    ) -> Result<StackTrace> {
        self.require("stackTrace", &[SessionState::Stopped])?;
        let arguments = serde_json::to_value(StackTraceArguments {
            thread_id,
            start_frame,
            levels,
        })
        .map_err(|err| DapError::Encoding(err.to_string()))?;
        let body = self
            .client
            .send_request("stackTrace", Some(arguments))
            .await?;
        decode_body("stackTrace", body)
    }

    pub async fn scopes(&self, frame_id: u64) -> Result<Vec<Scope>> {
        self.require("scopes", &[SessionState::Stopped])?;
        let arguments = serde_json::to_value(ScopesArguments { frame_id })
            .map_err(|err| DapError::Encoding(err.to_string()))?;
        let body = self.client.send_request("scopes", Some(arguments)).await?;
        let body = decode_body::<ScopesBody>("scopes", body)?;
        Ok(body.scopes)
    }

    /// Fetches the children of one variable container. A `variables_reference`
    /// is only valid while the session stays in the `Stopped` state it was
    /// produced in; after a resume the adapter invalidates it.
    pub async fn variables(&self, variables_reference: u64) -> Result<Vec<Variable>> {
        self.require("variables", &[SessionState::Stopped])?;
        let arguments = serde_json::to_value(VariablesArguments {
            variables_reference,
        })
        .map_err(|err| DapError::Encoding(err.to_string()))?;
        let body = self
            .client
            .send_request("variables", Some(arguments))
            .await?;
        let body = decode_body::<VariablesBody>("variables", body)?;
        Ok(body.variables)
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<u64>,
        context: &str,
    ) -> Result<EvaluateOutcome> {
        self.require("evaluate", &[SessionState::Stopped])?;
        let arguments = serde_json::to_value(EvaluateArguments {
            expression: expression.to_string(),
            frame_id,
            context: context.to_string(),
        })
        .map_err(|err| DapError::Encoding(err.to_string()))?;
        let body = self
            .client
            .send_request("evaluate", Some(arguments))
            .await?;
        decode_body("evaluate", body)
    }

    /// Waits until the session is stopped, returning the `stopped` event
    /// body. Returns immediately if a stop already happened and execution has
    /// not resumed since.
    pub async fn wait_for_stop(&self, deadline: Duration) -> Result<StoppedBody> {
        let mut stops = self.shared.stops.subscribe();
        if let Some(body) = stops.borrow_and_update().as_ref() {
            return Ok(body.clone());
        }

        let shutdown = self.client.shutdown_token();
        let next_stop = async {
            loop {
                if stops.changed().await.is_err() {
                    return Err(DapError::Disconnected);
                }
                if let Some(body) = stops.borrow_and_update().as_ref() {
                    return Ok(body.clone());
                }
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => Err(DapError::Disconnected),
            outcome = timeout(deadline, next_stop) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(DapError::Timeout),
            },
        }
    }

    /// Ends the session: best-effort `disconnect` request, then connection
    /// teardown. Safe to call more than once.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = crate::poison::lock(&self.shared.state, "session state");
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }

        if self.client.is_connected() {
            let farewell = self.client.send_request("disconnect", None);
            if timeout(Duration::from_secs(1), farewell).await.is_err() {
                debug!(target: "godot.dap", "disconnect request unanswered; closing anyway");
            }
        }
        self.client.shutdown();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *crate::poison::lock(&self.shared.state, "session state")
    }

    /// The body of the most recent `stopped` event, if any.
    pub fn last_stop(&self) -> Option<StoppedBody> {
        self.shared.stops.borrow().clone()
    }

    /// The arguments passed to the last `launch` or `attach`.
    pub fn launch_arguments(&self) -> Option<Value> {
        crate::poison::lock(&self.shared.launch_args, "launch arguments").clone()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Sends a `continue`/step request and marks the session running.
    ///
    /// The adapter may hit the next stop before its response reaches us; in
    /// that case the `stopped` event wins and the session stays stopped with
    /// the new stop context. The epoch check runs under the state lock, the
    /// same lock the lifecycle watcher holds while recording a stop, so the
    /// two cannot interleave.
    async fn request_while_stopped(
        &self,
        command: &'static str,
        thread_id: u64,
    ) -> Result<Option<Value>> {
        self.require(command, &[SessionState::Stopped])?;
        let epoch = self.shared.stop_epoch.load(Ordering::SeqCst);
        let body = self
            .client
            .send_request(command, Some(thread_arguments(thread_id)?))
            .await?;

        let mut state = crate::poison::lock(&self.shared.state, "session state");
        if self.shared.stop_epoch.load(Ordering::SeqCst) == epoch {
            self.shared.stops.send_replace(None);
            if *state != SessionState::Closed {
                *state = SessionState::Running;
            }
        }
        Ok(body)
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(DapError::InvalidState { operation, state })
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = crate::poison::lock(&self.shared.state, "session state");
        if *state != SessionState::Closed {
            debug!(target: "godot.dap", from = %*state, to = %next, "session state");
            *state = next;
        }
    }
}

/// Tracks execution state from the event stream. Runs until the connection
/// goes away.
async fn watch_lifecycle(
    mut events: broadcast::Receiver<Event>,
    client: Client,
    shared: Arc<Shared>,
) {
    let shutdown = client.shutdown_token();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(Event::Stopped(body)) => {
                // Epoch bump and stop recording stay under the state lock so
                // a racing resume response cannot erase this stop.
                let mut state = crate::poison::lock(&shared.state, "session state");
                if matches!(
                    *state,
                    SessionState::Configured | SessionState::Running | SessionState::Stopped
                ) {
                    *state = SessionState::Stopped;
                }
                shared.stop_epoch.fetch_add(1, Ordering::SeqCst);
                shared.stops.send_replace(Some(body));
                drop(state);
            }
            Ok(Event::Continued(_)) => {
                let mut state = crate::poison::lock(&shared.state, "session state");
                if *state == SessionState::Stopped {
                    *state = SessionState::Running;
                }
                drop(state);
                shared.stops.send_replace(None);
            }
            Ok(Event::Exited(_)) | Ok(Event::Terminated) => {
                let mut state = crate::poison::lock(&shared.state, "session state");
                if *state != SessionState::Closed {
                    *state = SessionState::Terminated;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "godot.dap", skipped, "lifecycle watcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn thread_arguments(thread_id: u64) -> Result<Value> {
    serde_json::to_value(ThreadArguments { thread_id })
        .map_err(|err| DapError::Encoding(err.to_string()))
}

fn decode_body<T: DeserializeOwned>(command: &str, body: Option<Value>) -> Result<T> {
    let Some(body) = body else {
        return Err(DapError::Encoding(format!(
            "missing {command} response body"
        )));
    };
    serde_json::from_value(body)
        .map_err(|err| DapError::Encoding(format!("malformed {command} response body: {err}")))
}

// Some adapters omit optional bodies entirely; default in that case.
fn decode_body_or_default<T: DeserializeOwned + Default>(
    command: &str,
    body: Option<Value>,
) -> Result<T> {
    match body {
        Some(body) => serde_json::from_value(body).map_err(|err| {
            DapError::Encoding(format!("malformed {command} response body: {err}"))
        }),
        None => Ok(T::default()),
    }
}

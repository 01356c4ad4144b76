//! Operation executor - turns change operations into remote calls
//!
//! Every call is retried on transient errors with bounded backoff. Calls
//! that return an operation handle are polled until done, failed,
//! cancelled or past the deadline. After a successful write the resource is
//! fetched again so the caller records what the remote actually holds.

use crate::context::{CallContext, Clock, Deadline, SystemClock};
use crate::error::{Error, RemoteError, RemoteErrorKind, Result};
use crate::retry::{RetryConfig, RetryError, with_retry};
use crate::transport::{OperationHandle, OperationStatus, RemoteResource, Request, Transport};
use crate::types::{ChangeOperation, CreateTarget, LiveState, OperationKind, ResourceIdentity, fingerprint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Retry tuning for calls and for polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Backoff for the mutating call and for fetches
    pub retry: RetryConfig,
    /// Poll interval growth; `max_attempts` bounds consecutive transient
    /// poll failures, not the number of polls
    pub poll: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll: RetryConfig::polling(),
        }
    }
}

/// What an operation acts on
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A resource that does not exist yet
    New(&'a CreateTarget),
    /// A resource with known live state
    Existing(&'a LiveState),
    /// A resource known only by identity; valid for DELETE
    Known(&'a ResourceIdentity),
}

impl std::fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New(create) => create.fmt(f),
            Self::Existing(live) => live.identity.fmt(f),
            Self::Known(identity) => identity.fmt(f),
        }
    }
}

/// Result of executing one operation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Live state fetched after the write converged
    Live(LiveState),
    Deleted,
    /// Local-only change, nothing sent
    Local,
}

/// Executes change operations against a [`Transport`]
pub struct Executor {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            config: ExecutorConfig::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Execute a single operation
    pub fn execute(&self, target: Target<'_>, op: &ChangeOperation, ctx: &CallContext) -> Result<Outcome> {
        let deadline = Deadline::start(ctx, self.clock());
        self.run(target, op, &deadline)
    }

    /// Read live state without mutating anything
    pub fn fetch(&self, identity: &ResourceIdentity, ctx: &CallContext) -> Result<LiveState> {
        let deadline = Deadline::start(ctx, self.clock());
        self.fetch_within(identity, &deadline)
    }

    pub(crate) fn run(&self, target: Target<'_>, op: &ChangeOperation, deadline: &Deadline<'_>) -> Result<Outcome> {
        match (op.kind, target) {
            (OperationKind::Noop, _) => Ok(Outcome::Local),
            (OperationKind::Create, Target::New(create)) => {
                self.create(create, op, deadline).map(Outcome::Live)
            }
            (OperationKind::Update, Target::Existing(live)) => {
                self.update(live, op, deadline).map(Outcome::Live)
            }
            (OperationKind::Delete, Target::Existing(live)) => {
                self.delete(&live.identity, deadline).map(|()| Outcome::Deleted)
            }
            (OperationKind::Delete, Target::Known(identity)) => {
                self.delete(identity, deadline).map(|()| Outcome::Deleted)
            }
            (kind, target) => Err(Error::InvalidOperation {
                kind,
                target: target.to_string(),
            }),
        }
    }

    fn create(&self, target: &CreateTarget, op: &ChangeOperation, deadline: &Deadline<'_>) -> Result<LiveState> {
        log::info!("Creating {target}");
        let request = Request::Create {
            target: target.clone(),
            payload: op.payload.clone(),
        };
        let name = target.to_string();
        let response = with_retry(&self.config.retry, self.clock(), deadline, &name, |_| {
            self.transport.call(&request)
        })
        .map_err(|e| match e {
            RetryError::Remote { cause, .. } if cause.kind == RemoteErrorKind::AlreadyExists => {
                Error::AlreadyExists(name.clone())
            }
            other => self.call_error(&name, None, other),
        })?;

        let identity = response.identity;
        if let Some(operation) = &response.operation {
            self.wait(operation, &identity.to_string(), deadline)?;
        }
        self.fetch_within(&identity, deadline).map_err(|e| match e {
            Error::NotFound(id) => Error::IndeterminateState {
                target: id.to_string(),
                detail: "create completed but the resource cannot be read".into(),
            },
            other => other,
        })
    }

    fn update(&self, live: &LiveState, op: &ChangeOperation, deadline: &Deadline<'_>) -> Result<LiveState> {
        let identity = &live.identity;
        log::info!("Updating {identity} [{}]", op.fields.join(", "));
        let request = Request::Patch {
            identity: identity.clone(),
            payload: op.payload.clone(),
            update_mask: op.fields.clone(),
            fingerprint: Some(live.fingerprint.clone()),
        };
        let name = identity.to_string();

        let result = with_retry(&self.config.retry, self.clock(), deadline, &name, |_| {
            self.transport.call(&request)
        })
        .map_err(|e| self.call_error(&name, Some(identity), e))
        .and_then(|response| match &response.operation {
            Some(operation) => self.wait(operation, &name, deadline),
            None => Ok(()),
        });

        match result {
            Ok(()) => self.fetch_within(identity, deadline),
            Err(Error::OperationFailed {
                target,
                attempts,
                cause,
                ..
            }) => {
                // Part of the patch may have landed
                let refreshed = self.fetch_within(identity, deadline).ok().map(Box::new);
                Err(Error::OperationFailed {
                    target,
                    attempts,
                    cause,
                    refreshed,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn delete(&self, identity: &ResourceIdentity, deadline: &Deadline<'_>) -> Result<()> {
        log::info!("Deleting {identity}");
        let request = Request::Delete {
            identity: identity.clone(),
        };
        let name = identity.to_string();
        let response = match with_retry(&self.config.retry, self.clock(), deadline, &name, |_| {
            self.transport.call(&request)
        }) {
            Ok(response) => response,
            Err(RetryError::Remote { cause, .. }) if cause.kind == RemoteErrorKind::NotFound => {
                log::debug!("{name} already gone");
                return Ok(());
            }
            Err(e) => return Err(self.call_error(&name, Some(identity), e)),
        };

        let Some(operation) = &response.operation else {
            return Ok(());
        };
        match self.wait(operation, &name, deadline) {
            Err(Error::OperationFailed { cause, .. }) if cause.kind == RemoteErrorKind::NotFound => {
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) fn fetch_within(&self, identity: &ResourceIdentity, deadline: &Deadline<'_>) -> Result<LiveState> {
        let name = identity.to_string();
        with_retry(&self.config.retry, self.clock(), deadline, &name, |_| {
            self.transport.fetch(identity)
        })
        .map(live_state)
        .map_err(|e| self.call_error(&name, Some(identity), e))
    }

    /// Poll a long-running operation until it settles.
    fn wait(&self, operation: &OperationHandle, target: &str, deadline: &Deadline<'_>) -> Result<()> {
        let poll = &self.config.poll;
        let mut polls: u32 = 0;
        let mut poll_errors: u32 = 0;
        log::debug!("{target}: waiting on {operation}");

        loop {
            if let Some(reason) = deadline.check(self.clock()) {
                log::warn!("{target}: stopped waiting on {operation}: {reason}");
                return Err(Error::Cancelled {
                    target: target.to_string(),
                    reason,
                });
            }

            match self.transport.poll(operation) {
                Ok(OperationStatus::Done) => {
                    log::debug!("{target}: {operation} done after {} poll(s)", polls + 1);
                    return Ok(());
                }
                Ok(OperationStatus::Failed(cause)) => {
                    return Err(Error::OperationFailed {
                        target: target.to_string(),
                        attempts: 1,
                        cause,
                        refreshed: None,
                    });
                }
                Ok(OperationStatus::Pending) => poll_errors = 0,
                Err(e) if e.is_transient() => {
                    poll_errors += 1;
                    if poll_errors >= poll.max_attempts.max(1) {
                        return Err(indeterminate(target, &e));
                    }
                    log::warn!("{target}: poll {poll_errors}/{} failed: {e}", poll.max_attempts);
                }
                Err(e) => return Err(indeterminate(target, &e)),
            }

            deadline.sleep(self.clock(), poll.delay_for_attempt(polls));
            polls = polls.saturating_add(1);
        }
    }

    fn call_error(&self, target: &str, identity: Option<&ResourceIdentity>, err: RetryError) -> Error {
        match err {
            RetryError::Stopped { reason, .. } => Error::Cancelled {
                target: target.to_string(),
                reason,
            },
            RetryError::Remote { cause, attempts } => match (cause.kind, identity) {
                (RemoteErrorKind::Conflict, Some(identity)) => Error::Conflict {
                    identity: identity.clone(),
                },
                (RemoteErrorKind::NotFound, Some(identity)) => Error::NotFound(identity.clone()),
                _ => Error::OperationFailed {
                    target: target.to_string(),
                    attempts,
                    cause,
                    refreshed: None,
                },
            },
        }
    }
}

fn indeterminate(target: &str, err: &RemoteError) -> Error {
    Error::IndeterminateState {
        target: target.to_string(),
        detail: format!("lost track of the operation: {err}"),
    }
}

/// Record a remote read, fingerprinting it when the remote has no etag.
fn live_state(remote: RemoteResource) -> LiveState {
    LiveState {
        fingerprint: remote.etag.unwrap_or_else(|| fingerprint(&remote.attributes)),
        identity: remote.identity,
        attributes: remote.attributes,
        observed_at: chrono::Utc::now(),
    }
}

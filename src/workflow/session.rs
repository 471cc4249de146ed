//! Drives a [`CorrectionWorkflow`] against real collaborators.

use std::future::Future;
use std::time::Duration;

use crate::client::{ClientError, ProtocolStack};
use crate::resolver::{PublicAddressResolver, ResolverError};

use super::{
    Command, Completion, CorrectionWorkflow, Event, FailureReason, RequestFailure, RequestToken,
};

/// Time limits and retry budget of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long to collect I-Am replies
    pub discovery_wait: Duration,
    /// Limit for one confirmed request
    pub request_timeout: Duration,
    /// Limit for one public address lookup
    pub resolver_timeout: Duration,
    /// Extra attempts after a timeout or transport failure
    pub retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_wait: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            resolver_timeout: Duration::from_secs(10),
            retries: 2,
        }
    }
}

enum Attempt<T, E> {
    Done(T),
    Failed(E),
    TimedOut,
}

/// Executes workflow commands until the run ends
pub struct Session<S, R> {
    stack: S,
    resolver: R,
    config: SessionConfig,
}

impl<S, R> Session<S, R>
where
    S: ProtocolStack,
    R: PublicAddressResolver,
{
    pub fn new(stack: S, resolver: R, config: SessionConfig) -> Self {
        Self {
            stack,
            resolver,
            config,
        }
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Run the workflow to completion
    pub async fn run(&self, workflow: &mut CorrectionWorkflow) -> Result<Completion, FailureReason> {
        let mut command = workflow.start();
        while let Some(current) = command.take() {
            log::trace!("executing {:?}", current);
            for event in self.execute(&current).await {
                if let Some(next) = workflow.handle(event) {
                    command = Some(next);
                    break;
                }
            }
        }

        workflow.outcome().unwrap_or_else(|| {
            Err(FailureReason::Transport(format!(
                "workflow stopped in state {:?}",
                workflow.state()
            )))
        })
    }

    async fn execute(&self, command: &Command) -> Vec<Event> {
        let token = command.token();
        match command {
            Command::Discover {
                destination, range, ..
            } => {
                let wait = self.config.discovery_wait;
                let found = self
                    .attempt(wait + self.config.request_timeout, |_| {
                        self.stack.who_is(*destination, *range, wait)
                    })
                    .await;
                let mut events = Vec::new();
                match found {
                    Ok(devices) => {
                        events.extend(
                            devices
                                .into_iter()
                                .map(|device| Event::DeviceFound { token, device }),
                        );
                        // Reaches the workflow only if no reply was accepted
                        events.push(Event::RequestFailed {
                            token,
                            failure: RequestFailure::NoResponse,
                        });
                    }
                    Err(failure) => events.push(Event::RequestFailed { token, failure }),
                }
                events
            }
            Command::ReadProperty {
                address, request, ..
            } => {
                let event = match self
                    .attempt(self.config.request_timeout, |_| {
                        self.stack.read_property(*address, request)
                    })
                    .await
                {
                    Ok(ack) => Event::PropertyValue {
                        token,
                        value: ack.value,
                    },
                    Err(failure) => Event::RequestFailed { token, failure },
                };
                vec![event]
            }
            Command::WriteProperty {
                address, request, ..
            } => {
                let event = match self
                    .attempt(self.config.request_timeout, |_| {
                        self.stack.write_property(*address, request)
                    })
                    .await
                {
                    Ok(()) => Event::WriteAcknowledged { token },
                    Err(failure) => Event::RequestFailed { token, failure },
                };
                vec![event]
            }
            Command::ResolvePublicAddress { .. } => vec![self.resolve(token).await],
        }
    }

    /// Run `request` with a deadline, retrying timeouts and transport
    /// failures up to the configured budget
    async fn attempt<T, F, Fut>(&self, limit: Duration, mut request: F) -> Result<T, RequestFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut last = RequestFailure::NoResponse;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                log::debug!("retrying after {} (attempt {})", last, attempt + 1);
            }
            match run_with_limit(limit, request(attempt)).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::TimedOut => last = RequestFailure::NoResponse,
                Attempt::Failed(error) if error.is_retryable() => last = classify(error),
                Attempt::Failed(error) => return Err(classify(error)),
            }
        }
        Err(last)
    }

    async fn resolve(&self, token: RequestToken) -> Event {
        let mut last: Option<ResolverError> = None;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                log::debug!("retrying public address lookup (attempt {})", attempt + 1);
            }
            match run_with_limit(self.config.resolver_timeout, self.resolver.resolve()).await {
                Attempt::Done(address) => return Event::PublicAddress { token, address },
                Attempt::Failed(error) => {
                    log::warn!("public address lookup failed: {}", error);
                    last = Some(error);
                }
                Attempt::TimedOut => log::warn!("public address lookup timed out"),
            }
        }
        match last {
            Some(error) => Event::ResolverFailed {
                token,
                reason: error.to_string(),
            },
            None => Event::RequestFailed {
                token,
                failure: RequestFailure::NoResponse,
            },
        }
    }
}

async fn run_with_limit<T, E>(
    limit: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Attempt<T, E> {
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => Attempt::Done(value),
        Ok(Err(error)) => Attempt::Failed(error),
        Err(_) => Attempt::TimedOut,
    }
}

fn classify(error: ClientError) -> RequestFailure {
    match error {
        ClientError::Timeout(..) => RequestFailure::NoResponse,
        ClientError::Protocol(error) => RequestFailure::Protocol(error),
        ClientError::Transport(error) => RequestFailure::Transport(error.to_string()),
        other => RequestFailure::Malformed(other.to_string()),
    }
}

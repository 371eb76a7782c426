//! The provisioning state machine.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::watch;

use super::config::SessionConfig;
use super::outcome::{ProvisioningOutcome, SessionState, Transition};
use super::request::ProvisioningRequest;
use crate::channel::{Command, CommandWriter, DevicePatterns, MatchScope, PatternWaiter, patterns};
use crate::error::{Error, ErrorKind, Result, SessionError, TransportError};
use crate::registry::PortDescriptor;
use crate::transport::{ChannelHandle, LinkState, SerialChannel};

/// How an `AwaitingConfirmation` phase ended well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    /// "Credentials stored successfully" or "Configuration saved successfully".
    Direct,
    /// `provisioned=yes` after a follow-up `INFO`.
    Info,
    /// The device rebooted, which it only does after storing credentials.
    Reboot,
    /// The device was already provisioned with the requested identifier.
    Verified,
}

impl Confirmation {
    fn message(self) -> &'static str {
        match self {
            Confirmation::Direct => "Provisioning successful! Device configured.",
            Confirmation::Info => "Provisioning confirmed by INFO query.",
            Confirmation::Reboot => "Device rebooted after provisioning.",
            Confirmation::Verified => "Device is already provisioned with the correct ID.",
        }
    }
}

/// Shared with [`SessionHandle`]s so another task can close the channel.
#[derive(Debug, Default)]
struct SessionControl {
    active: Mutex<Option<ChannelHandle>>,
}

impl SessionControl {
    fn set(&self, handle: Option<ChannelHandle>) -> Option<ChannelHandle> {
        std::mem::replace(
            &mut *self.active.lock().unwrap_or_else(PoisonError::into_inner),
            handle,
        )
    }
}

/// Cloneable view of a session for other tasks: observe outcomes, or close
/// the channel to cancel the running attempt.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    control: Arc<SessionControl>,
    outcome: watch::Receiver<ProvisioningOutcome>,
}

impl SessionHandle {
    /// Latest outcome.
    pub fn outcome(&self) -> ProvisioningOutcome {
        self.outcome.borrow().clone()
    }

    /// Receiver for published outcomes.
    ///
    /// Only the latest outcome is kept, so a slow reader can skip
    /// intermediate states. The full sequence is in
    /// [`ProvisioningSession::transitions`].
    pub fn subscribe(&self) -> watch::Receiver<ProvisioningOutcome> {
        self.outcome.clone()
    }

    /// Close the channel of the running attempt.
    ///
    /// Pending waits resolve as "no match" and the attempt returns to
    /// `Idle`. Does nothing between attempts.
    pub async fn close(&self) {
        if let Some(handle) = self.control.set(None) {
            info!("closing {} on operator request", handle.port());
            handle.close().await;
        }
    }
}

/// Delivers a [`ProvisioningRequest`] to a tracker over serial and confirms
/// the device stored it.
///
/// One attempt runs at a time: [`run`](Self::run) takes `&mut self`, and a
/// finished attempt must be [`reset`](Self::reset) before the next one.
pub struct ProvisioningSession {
    channel: SerialChannel,
    config: SessionConfig,
    patterns: DevicePatterns,
    state: SessionState,
    outcome: watch::Sender<ProvisioningOutcome>,
    transitions: Vec<Transition>,
    control: Arc<SessionControl>,
}

impl ProvisioningSession {
    pub(crate) fn new(
        channel: SerialChannel,
        config: SessionConfig,
        patterns: DevicePatterns,
    ) -> Self {
        let (outcome, _) = watch::channel(ProvisioningOutcome::idle());
        Self {
            channel,
            config,
            patterns,
            state: SessionState::Idle,
            outcome,
            transitions: Vec::new(),
            control: Arc::new(SessionControl::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Latest outcome.
    pub fn outcome(&self) -> ProvisioningOutcome {
        self.outcome.borrow().clone()
    }

    /// Handle for observing or cancelling this session from another task.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            control: self.control.clone(),
            outcome: self.outcome.subscribe(),
        }
    }

    /// State changes of the current (or last) attempt, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run one provisioning attempt on `port`, or the registry's selection.
    ///
    /// Returns the `Success` outcome, or an `Idle` outcome if the channel
    /// was closed mid-attempt. Failures move the session to `Error`, publish
    /// the message with a transcript tail, and are returned as `Err`. The
    /// channel is closed on every path before this returns.
    pub async fn run(
        &mut self,
        request: &ProvisioningRequest,
        port: Option<&PortDescriptor>,
    ) -> Result<ProvisioningOutcome> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Busy {
                state: self.state.to_string(),
            }
            .into());
        }
        self.transitions.clear();
        info!("provisioning device {}", request.device_id());

        let result = self.attempt(request, port).await;

        let held = self.channel.handle();
        let cancelled = held.is_some_and(|h| h.link_state() == LinkState::Closed);
        let diagnostic = held.map(|h| h.transcript().tail(self.config.diagnostic_tail));
        self.control.set(None);
        self.channel.close().await;

        match result {
            Ok(confirmation) => {
                self.publish(ProvisioningOutcome::success(confirmation.message()));
                Ok(self.outcome())
            }
            Err(e) if cancelled || e.kind() == ErrorKind::Cancelled => {
                info!("provisioning of {} cancelled: {}", request.device_id(), e);
                self.publish(ProvisioningOutcome::progress(
                    SessionState::Idle,
                    SessionError::Cancelled.to_string(),
                ));
                Ok(self.outcome())
            }
            Err(e) => {
                warn!("provisioning of {} failed: {}", request.device_id(), e);
                self.publish(ProvisioningOutcome::failed(e.kind(), e.message(), diagnostic));
                Err(e)
            }
        }
    }

    /// Close any open channel and return to `Idle`.
    pub async fn reset(&mut self) {
        self.control.set(None);
        self.channel.close().await;
        if self.state != SessionState::Idle {
            self.publish(ProvisioningOutcome::idle());
        }
    }

    fn publish(&mut self, outcome: ProvisioningOutcome) {
        info!("session -> {}", outcome);
        self.state = outcome.status;
        self.transitions.push(Transition {
            state: outcome.status,
            message: outcome.message.clone(),
            at: tokio::time::Instant::now(),
        });
        self.outcome.send_replace(outcome);
    }

    async fn attempt(
        &mut self,
        request: &ProvisioningRequest,
        port: Option<&PortDescriptor>,
    ) -> Result<Confirmation> {
        self.publish(ProvisioningOutcome::progress(
            SessionState::Connecting,
            "Opening serial device...",
        ));
        let handle = self.channel.open(port).await?;
        self.control.set(Some(handle.clone()));

        let transcript = handle.transcript();
        transcript.reset();
        let waiter = PatternWaiter::new(
            transcript.clone(),
            handle.subscribe(),
            self.config.poll_interval,
        );
        let mut writer = CommandWriter::new(handle);

        self.publish(ProvisioningOutcome::progress(
            SessionState::WaitingForBoot,
            "Waiting for device to boot...",
        ));
        let baseline = transcript.snapshot_len();
        let boot = waiter
            .await_any(
                &[&self.patterns.needs_provisioning, &self.patterns.already_provisioned],
                baseline,
                self.config.boot_timeout,
            )
            .await;

        match boot {
            Some(0) => {
                let baseline = self.send_credentials(request, &waiter, &mut writer).await?;
                self.await_confirmation(&waiter, &mut writer, baseline).await
            }
            Some(_) => self.verify_existing(request, &waiter, &mut writer).await,
            None => {
                check_link(&waiter)?;
                Err(SessionError::BootTimeout(self.config.boot_timeout).into())
            }
        }
    }

    /// The device says it is provisioned; make sure it is provisioned as us.
    ///
    /// Never writes credentials. A device carrying another identifier may
    /// belong to another asset and has to be reset by hand.
    async fn verify_existing(
        &mut self,
        request: &ProvisioningRequest,
        waiter: &PatternWaiter,
        writer: &mut CommandWriter,
    ) -> Result<Confirmation> {
        self.publish(ProvisioningOutcome::progress(
            SessionState::VerifyingExisting,
            "Device already provisioned. Verifying...",
        ));
        let identity = patterns::identity(request.device_id())?;

        waiter.settle(self.config.verify_settle).await;
        check_link(waiter)?;
        let baseline = waiter.transcript().snapshot_len();
        writer.send(Command::Info).await?;
        waiter.settle(self.config.verify_settle).await;

        if waiter
            .await_match(&identity, baseline, self.config.identity_timeout)
            .await
        {
            info!("device already carries identifier {}", request.device_id());
            return Ok(Confirmation::Verified);
        }
        check_link(waiter)?;

        let found = waiter
            .transcript()
            .scan(baseline, |suffix, full| {
                patterns::stored_identity(suffix).or_else(|| patterns::stored_identity(full))
            })
            .unwrap_or_else(|| "unknown".to_string());
        Err(SessionError::IdentityMismatch {
            expected: request.device_id().to_string(),
            found,
        }
        .into())
    }

    /// Send `DEVICE_ID`, `TOKEN` and `PROVISION` with pacing.
    ///
    /// Returns the transcript offset taken just before the first command.
    async fn send_credentials(
        &mut self,
        request: &ProvisioningRequest,
        waiter: &PatternWaiter,
        writer: &mut CommandWriter,
    ) -> Result<usize> {
        self.publish(ProvisioningOutcome::progress(
            SessionState::SendingCredentials,
            "Sending credentials...",
        ));

        waiter.settle(self.config.pre_send_delay).await;
        check_link(waiter)?;

        let baseline = waiter.transcript().snapshot_len();
        let gap = self.config.command_gap;
        writer
            .send_sequence(
                &[
                    Command::DeviceId(request.device_id()),
                    Command::Token(request.token()),
                    Command::Provision,
                ],
                gap,
            )
            .await?;
        writer.pace(self.config.final_settle).await;
        debug!("DEVICE_ID/TOKEN/PROVISION sent");

        Ok(baseline)
    }

    /// Wait for the device to confirm, by message, by `INFO`, or by rebooting.
    async fn await_confirmation(
        &mut self,
        waiter: &PatternWaiter,
        writer: &mut CommandWriter,
        baseline: usize,
    ) -> Result<Confirmation> {
        self.publish(ProvisioningOutcome::progress(
            SessionState::AwaitingConfirmation,
            "Waiting for device to confirm...",
        ));

        let reboot = waiter.await_match_in(
            &self.patterns.reboot,
            baseline,
            self.config.confirmation_window(),
            MatchScope::Suffix,
        );
        let confirm = confirm_stored(waiter, writer, &self.patterns, &self.config, baseline);

        let confirmed = tokio::select! {
            biased;
            result = confirm => result?,
            true = reboot => Some(Confirmation::Reboot),
        };

        match confirmed {
            Some(confirmation) => Ok(confirmation),
            None => {
                check_link(waiter)?;
                Err(SessionError::ConfirmationTimeout.into())
            }
        }
    }
}

/// Direct confirmation first, then the `INFO` fallback.
async fn confirm_stored(
    waiter: &PatternWaiter,
    writer: &mut CommandWriter,
    patterns: &DevicePatterns,
    config: &SessionConfig,
    baseline: usize,
) -> Result<Option<Confirmation>> {
    if waiter
        .await_match(&patterns.credentials_stored, baseline, config.confirm_timeout)
        .await
    {
        return Ok(Some(Confirmation::Direct));
    }
    check_link(waiter)?;

    debug!("no direct confirmation, querying INFO");
    let info_baseline = waiter.transcript().snapshot_len();
    writer.send(Command::Info).await?;
    if waiter
        .await_match(&patterns.info_provisioned, info_baseline, config.info_confirm_timeout)
        .await
    {
        return Ok(Some(Confirmation::Info));
    }
    Ok(None)
}

/// Turn a stopped read side into the matching error.
fn check_link(waiter: &PatternWaiter) -> Result<()> {
    match waiter.link_state().to_error() {
        None => Ok(()),
        Some(TransportError::Closed) => Err(SessionError::Cancelled.into()),
        Some(e) => Err(Error::from(e)),
    }
}

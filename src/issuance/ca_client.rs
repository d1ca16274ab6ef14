//! Drives one ACME order from creation to a downloaded certificate.
//!
//! Every step goes through [`OrderMachine`], so the order's path is explicit
//! and illegal jumps surface as errors. Challenge records published by
//! validation plugins are removed by [`CleanupGuard`] on every exit path, and
//! an order that fails after creation is discarded from the protocol.

use std::{collections::HashMap, sync::Arc, thread};

use log::{debug, info, warn};

use super::{
    issuer::{
        AcmeProtocol, ChallengeOffer, ChallengeStatus, IssuedCertificate, IssuerError,
        OrderHandle, SigningRequest,
    },
    order_state::{OrderMachine, OrderState},
    retry::PollPolicy,
};
use crate::{
    core::{error::RenewalError, types::CancelToken},
    plugins::ValidationPlugin,
};

/// A downloaded certificate plus the states its order went through.
#[derive(Debug, Clone)]
pub struct IssuedOrder {
    pub certificate: IssuedCertificate,
    pub history: Vec<OrderState>,
}

struct PendingChallenge<'a> {
    identifier: &'a str,
    plugin: &'a dyn ValidationPlugin,
    offer: ChallengeOffer,
}

/// Calls `clean_up` for every identifier handed to a validation plugin.
struct CleanupGuard<'a> {
    prepared: Vec<(&'a str, &'a dyn ValidationPlugin)>,
}

impl<'a> CleanupGuard<'a> {
    fn new() -> Self {
        Self {
            prepared: Vec::new(),
        }
    }

    fn track(&mut self, identifier: &'a str, plugin: &'a dyn ValidationPlugin) {
        self.prepared.push((identifier, plugin));
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        for (identifier, plugin) in self.prepared.drain(..) {
            debug!("[acme] cleaning up challenge for {}", identifier);
            plugin.clean_up(identifier);
        }
    }
}

pub struct CertificateAuthorityClient {
    protocol: Arc<dyn AcmeProtocol>,
    poll: PollPolicy,
}

impl CertificateAuthorityClient {
    pub fn new(protocol: Arc<dyn AcmeProtocol>, poll: PollPolicy) -> Self {
        Self { protocol, poll }
    }

    /// Orders a certificate for `identifiers`, validating each with its plugin
    /// from `validators`. Any identifier failing validation fails the order.
    pub fn issue(
        &self,
        identifiers: &[String],
        validators: &HashMap<String, Box<dyn ValidationPlugin>>,
        request: &SigningRequest,
        cancel: &CancelToken,
    ) -> Result<IssuedOrder, RenewalError> {
        let mut machine = OrderMachine::new();
        match self.run(&mut machine, identifiers, validators, request, cancel) {
            Ok(certificate) => Ok(IssuedOrder {
                certificate,
                history: machine.history().to_vec(),
            }),
            Err(err) => {
                machine.fail(matches!(err, RenewalError::ValidationFailed { .. }));
                warn!(
                    "[acme] order for {} ended in {}: {}",
                    identifiers.join(", "),
                    machine.state(),
                    err
                );
                Err(err)
            }
        }
    }

    fn run(
        &self,
        machine: &mut OrderMachine,
        identifiers: &[String],
        validators: &HashMap<String, Box<dyn ValidationPlugin>>,
        request: &SigningRequest,
        cancel: &CancelToken,
    ) -> Result<IssuedCertificate, RenewalError> {
        cancel.checkpoint("order")?;
        let order = self.protocol.new_order(identifiers).map_err(issuance)?;
        let issued = self.drive(machine, &order, identifiers, validators, request, cancel);
        if issued.is_err() {
            self.protocol.discard(&order);
        }
        issued
    }

    fn drive(
        &self,
        machine: &mut OrderMachine,
        order: &OrderHandle,
        identifiers: &[String],
        validators: &HashMap<String, Box<dyn ValidationPlugin>>,
        request: &SigningRequest,
        cancel: &CancelToken,
    ) -> Result<IssuedCertificate, RenewalError> {
        step(machine, OrderState::OrderOpen)?;
        info!("[acme] opened order {} for {}", order.id, identifiers.join(", "));

        let pending = self.pending_challenges(order, identifiers, validators)?;
        step(machine, OrderState::Authorizing)?;
        checkpoint(machine, cancel, "validation")?;

        let mut guard = CleanupGuard::new();
        prepare_all(&pending, &mut guard)?;
        for challenge in &pending {
            self.protocol
                .submit_challenge(order, challenge.identifier, challenge.offer.kind)
                .map_err(|err| RenewalError::validation(challenge.identifier, err))?;
        }
        step(machine, OrderState::ValidationPending)?;

        let waiting: Vec<&str> = pending.iter().map(|c| c.identifier).collect();
        self.await_authorizations(order, waiting)?;
        step(machine, OrderState::Validated)?;
        drop(guard);

        checkpoint(machine, cancel, "issuance")?;
        step(machine, OrderState::Finalizing)?;
        self.protocol.finalize(order, request).map_err(issuance)?;
        let certificate = self
            .poll
            .poll("certificate", |_| match self.protocol.certificate(order) {
                Ok(certificate) => Ok(Some(certificate)),
                Err(IssuerError::NotReady(_)) => Ok(None),
                Err(err) => Err(err),
            })
            .map_err(issuance)?
            .ok_or_else(|| {
                RenewalError::IssuanceFailed(format!(
                    "certificate for order {} not available after {} attempts",
                    order.id,
                    self.poll.max_attempts()
                ))
            })?;
        step(machine, OrderState::Issued)?;
        info!("[acme] order {} issued", order.id);
        Ok(certificate)
    }

    /// Pairs each identifier still pending on the CA with its plugin and the
    /// matching challenge offer. Authorizations the CA already holds as valid are skipped.
    fn pending_challenges<'a>(
        &self,
        order: &OrderHandle,
        identifiers: &'a [String],
        validators: &'a HashMap<String, Box<dyn ValidationPlugin>>,
    ) -> Result<Vec<PendingChallenge<'a>>, RenewalError> {
        let authorizations = self.protocol.authorizations(order).map_err(issuance)?;
        let mut pending = Vec::new();
        for identifier in identifiers {
            let authorization = authorizations
                .iter()
                .find(|auth| auth.identifier == *identifier)
                .ok_or_else(|| {
                    RenewalError::validation(identifier, "CA returned no authorization")
                })?;
            match &authorization.status {
                ChallengeStatus::Valid => {
                    info!("[acme] {} already authorized, skipping challenge", identifier);
                    continue;
                }
                ChallengeStatus::Invalid(reason) => {
                    return Err(RenewalError::validation(identifier, reason));
                }
                ChallengeStatus::Pending => {}
            }
            let plugin = validators
                .get(identifier)
                .ok_or_else(|| RenewalError::validation(identifier, "no validation plugin"))?;
            let kind = plugin.challenge_kind();
            let offer = authorization.offer(kind).ok_or_else(|| {
                RenewalError::validation(
                    identifier,
                    format!("CA offered no {} challenge", kind.as_str()),
                )
            })?;
            pending.push(PendingChallenge {
                identifier: identifier.as_str(),
                plugin: plugin.as_ref(),
                offer: offer.clone(),
            });
        }
        Ok(pending)
    }

    /// One bounded backoff loop over all outstanding authorizations of the order.
    fn await_authorizations(
        &self,
        order: &OrderHandle,
        mut waiting: Vec<&str>,
    ) -> Result<(), RenewalError> {
        let done = self.poll.poll("authorization", |_| {
            let mut still_pending = Vec::new();
            for identifier in &waiting {
                match self.protocol.authorization_status(order, identifier) {
                    Ok(ChallengeStatus::Valid) => {
                        info!("[acme] {} authorized", identifier);
                    }
                    Ok(ChallengeStatus::Pending) => still_pending.push(*identifier),
                    Ok(ChallengeStatus::Invalid(reason)) => {
                        return Err(RenewalError::validation(*identifier, reason));
                    }
                    Err(err) => {
                        warn!("[acme] status check for {} failed: {}", identifier, err);
                        still_pending.push(*identifier);
                    }
                }
            }
            waiting = still_pending;
            Ok(waiting.is_empty().then_some(()))
        })?;
        match done {
            Some(()) => Ok(()),
            None => Err(RenewalError::validation(
                waiting.join(", "),
                format!(
                    "authorization still pending after {} attempts",
                    self.poll.max_attempts()
                ),
            )),
        }
    }
}

/// Prepares every challenge concurrently. Each identifier is tracked for
/// cleanup before its plugin runs, so partial publications are removed too.
fn prepare_all<'a>(
    pending: &[PendingChallenge<'a>],
    guard: &mut CleanupGuard<'a>,
) -> Result<(), RenewalError> {
    let results: Vec<Result<(), RenewalError>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(pending.len());
        for challenge in pending {
            guard.track(challenge.identifier, challenge.plugin);
            handles.push(scope.spawn(move || {
                challenge
                    .plugin
                    .prepare_challenge(challenge.identifier, &challenge.offer)
                    .map_err(|err| RenewalError::validation(challenge.identifier, format!("{err:#}")))
            }));
        }
        handles
            .into_iter()
            .zip(pending)
            .map(|(handle, challenge)| {
                handle.join().unwrap_or_else(|_| {
                    Err(RenewalError::validation(
                        challenge.identifier,
                        "challenge preparation panicked",
                    ))
                })
            })
            .collect()
    });
    results.into_iter().collect()
}

fn step(machine: &mut OrderMachine, next: OrderState) -> Result<(), RenewalError> {
    machine.advance(next).map_err(issuance)
}

/// Cancellation is honoured only until the order reaches finalization.
fn checkpoint(machine: &OrderMachine, cancel: &CancelToken, stage: &str) -> Result<(), RenewalError> {
    if machine.cancellable() {
        cancel.checkpoint(stage)
    } else {
        Ok(())
    }
}

fn issuance(err: IssuerError) -> RenewalError {
    RenewalError::IssuanceFailed(err.to_string())
}

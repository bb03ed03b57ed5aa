//! Phase-by-phase execution of one swap

use super::{AuditViolation, Request, Role, SwapContext, SwapError, Transient};
use crate::atom::{Atom, AtomError, AuditReport, ErrorClass};
use crate::network::NetworkError;
use crate::script::{Secret, SecretHash};
use crate::state::{StoreError, SwapStatus};
use crate::watchdog::Complaint;

use std::future::Future;
use tracing::{debug, error, info, warn};

/// One order's swap: this side's contract on the send chain (`personal`)
/// and the counterparty's contract on the receive chain (`foreign`)
pub struct Swap<A> {
    request: Request,
    personal: A,
    foreign: A,
    role: Role,
    ctx: SwapContext,
    tag: String,
}

/// `Satisfied` failures mean the on-chain goal already holds
fn settle(result: Result<(), AtomError>) -> Result<(), AtomError> {
    match result {
        Err(e) if e.class() == ErrorClass::Satisfied => {
            debug!("Treating as done: {}", e);
            Ok(())
        }
        other => other,
    }
}

impl<A: Atom> Swap<A> {
    pub fn new(
        request: Request,
        personal: A,
        foreign: A,
        ctx: SwapContext,
    ) -> Result<Self, SwapError> {
        let role = Role::decide(personal.priority_code(), foreign.priority_code())?;
        if let (Some(secret), Some(hash)) = (&request.secret, &request.secret_hash) {
            if secret.hash() != *hash {
                return Err(SwapError::InconsistentSecret);
            }
        }
        let tag = crate::order_tag(&request.id);

        Ok(Self {
            request,
            personal,
            foreign,
            role,
            ctx,
            tag,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Run the remaining phases until the swap is redeemed or fails
    pub async fn execute(&self) -> Result<SwapStatus, SwapError> {
        self.load_details().await?;
        info!(
            "[{}] Running as {} ({} -> {})",
            self.tag, self.role, self.request.send_currency, self.request.receive_currency
        );

        loop {
            let store = &self.ctx.store;
            let id = &self.request.id;
            let status = self.stored("load status", move || store.status(id)).await?;

            match status {
                SwapStatus::Redeemed => return Ok(status),
                SwapStatus::Complained => return Err(SwapError::AlreadyComplained),
                _ => {}
            }

            let next = self.step(status).await?;
            self.advance(status, next).await?;
        }
    }

    /// Spend this side's own contract back after its expiry
    pub async fn refund(&self) -> Result<(), SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;
        let details = self.stored("load atom details", move || store.atom_details(id)).await?;
        self.personal.deserialize(&details)?;

        match self.personal.refund().await {
            Ok(()) => info!("[{}] Refunded {}", self.tag, self.request.send_currency),
            Err(e) if e.class() == ErrorClass::Satisfied => {
                info!("[{}] Contract already spent, nothing to refund", self.tag)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn step(&self, status: SwapStatus) -> Result<SwapStatus, SwapError> {
        use SwapStatus::*;

        match (self.role, status) {
            (Role::Requestor, InfoSubmitted) => {
                self.submit_address().await?;
                self.generate_details().await
            }
            (Role::Responder, InfoSubmitted) => {
                self.submit_address().await?;
                self.receive_details(status, Complaint::DelayedRequestorInitiation)
                    .await
            }
            (Role::Requestor, InitiateDetailsAcquired) | (Role::Responder, Audited) => {
                self.initiate(status).await
            }
            (_, Initiated) => self.send_details().await,
            (Role::Requestor, SentSwapDetails) => {
                self.receive_details(status, Complaint::DelayedResponderInitiation)
                    .await
            }
            (Role::Requestor, ReceivedSwapDetails) => self.requestor_audit(status).await,
            (Role::Responder, ReceivedSwapDetails) => self.responder_audit(status).await,
            (Role::Responder, SentSwapDetails) => self.await_redemption(status).await,
            (Role::Requestor, Audited) | (Role::Responder, RedeemDetailsAcquired) => {
                self.redeem().await
            }
            (role, status) => Err(SwapError::UnexpectedStatus { role, status }),
        }
    }

    /// Resume both legs from previously stored contract details
    async fn load_details(&self) -> Result<(), SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;

        match self.stored("load atom details", move || store.atom_details(id)).await {
            Ok(bytes) => self.personal.deserialize(&bytes)?,
            Err(SwapError::Store(StoreError::Missing { .. })) => {}
            Err(e) => return Err(e),
        }
        match self
            .stored("load foreign details", move || store.foreign_details(id))
            .await
        {
            Ok(bytes) => self.foreign.deserialize(&bytes)?,
            Err(SwapError::Store(StoreError::Missing { .. })) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn submit_address(&self) -> Result<(), SwapError> {
        let network = &self.ctx.network;
        let id = self.request.id;
        let address = &self.request.receive_address;

        self.ctx
            .retry
            .run(&self.tag, "send owner address", move || {
                network.send_owner_address(id, address.clone())
            })
            .await?;
        debug!("[{}] Published owner address {}", self.tag, address);
        Ok(())
    }

    async fn generate_details(&self) -> Result<SwapStatus, SwapError> {
        let secret = self.request.secret.clone().unwrap_or_else(Secret::random);
        let secret_hash = secret.hash();
        let expiry = self
            .request
            .time_lock
            .unwrap_or_else(|| self.ctx.clock.now() + self.ctx.timing.requestor_expiry);

        let store = &self.ctx.store;
        let id = &self.request.id;
        let secret = &secret;
        self.stored("store secret", move || store.put_redeem_details(id, secret))
            .await?;
        self.stored("store initiate details", move || {
            store.put_initiate_details(id, expiry, secret_hash)
        })
        .await?;

        info!(
            "[{}] Generated secret hash {} with expiry {}",
            self.tag,
            hex::encode(secret_hash),
            expiry
        );
        Ok(SwapStatus::InitiateDetailsAcquired)
    }

    async fn initiate(&self, status: SwapStatus) -> Result<SwapStatus, SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;
        let (expiry, secret_hash) = self
            .stored("load initiate details", move || store.initiate_details(id))
            .await?;

        let network = &self.ctx.network;
        let foreign_id = self.request.foreign_id;
        let deadline = self.ctx.clock.now() + self.ctx.timing.owner_address_wait;
        let to = match self
            .ctx
            .retry
            .run(&self.tag, "receive owner address", move || {
                network.receive_owner_address(foreign_id, deadline)
            })
            .await
        {
            Ok(to) => to,
            Err(e @ NetworkError::DeadlineExceeded { .. }) => {
                return Err(self
                    .complain(status, Complaint::DelayedAddressSubmission, e.to_string())
                    .await)
            }
            Err(e) => return Err(e.into()),
        };

        let personal = &self.personal;
        let to_ref = to.as_str();
        let value = self.request.send_value;
        settle(
            self.ctx
                .retry
                .run(&self.tag, "initiate", move || {
                    personal.initiate(to_ref, secret_hash, value, expiry)
                })
                .await,
        )?;

        let details = self.personal.serialize()?;
        let details = details.as_slice();
        self.stored("store atom details", move || store.put_atom_details(id, details))
            .await?;
        self.stored("mark redeemable", move || store.put_redeemable(id))
            .await?;

        info!(
            "[{}] Locked {} {} for {} until {}",
            self.tag, value, self.request.send_currency, to, expiry
        );
        Ok(SwapStatus::Initiated)
    }

    async fn send_details(&self) -> Result<SwapStatus, SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;
        let details = self
            .stored("load atom details", move || store.atom_details(id))
            .await?;

        let network = &self.ctx.network;
        let order_id = self.request.id;
        let details = &details;
        self.ctx
            .retry
            .run(&self.tag, "send swap details", move || {
                network.send_swap_details(order_id, details.clone())
            })
            .await?;
        Ok(SwapStatus::SentSwapDetails)
    }

    async fn receive_details(
        &self,
        status: SwapStatus,
        complaint: Complaint,
    ) -> Result<SwapStatus, SwapError> {
        let network = &self.ctx.network;
        let foreign_id = self.request.foreign_id;
        let deadline = self.ctx.clock.now() + self.ctx.timing.swap_details_wait;

        let details = match self
            .ctx
            .retry
            .run(&self.tag, "receive swap details", move || {
                network.receive_swap_details(foreign_id, deadline)
            })
            .await
        {
            Ok(details) => details,
            Err(e @ NetworkError::DeadlineExceeded { .. }) => {
                return Err(self.complain(status, complaint, e.to_string()).await)
            }
            Err(e) => return Err(e.into()),
        };

        // Undecodable details are never persisted
        self.foreign.deserialize(&details)?;

        let store = &self.ctx.store;
        let id = &self.request.id;
        let details = details.as_slice();
        self.stored("store foreign details", move || {
            store.put_foreign_details(id, details)
        })
        .await?;
        Ok(SwapStatus::ReceivedSwapDetails)
    }

    /// Audit the counterparty contract. A contract that is still missing or
    /// unconfirmed once `swap_details_wait` has passed is a violation.
    async fn audit_foreign(
        &self,
        status: SwapStatus,
        complaint: Complaint,
    ) -> Result<AuditReport, SwapError> {
        let deadline = self.ctx.clock.now() + self.ctx.timing.swap_details_wait;
        let mut attempts = 0u32;

        let violation = loop {
            match self.foreign.audit().await {
                Ok(report) => return Ok(report),
                Err(e) if e.class() == ErrorClass::Violation => {
                    break AuditViolation::Malformed(e.to_string())
                }
                Err(e) if e.is_transient() => {
                    if self.ctx.clock.now() >= deadline {
                        break AuditViolation::NotFunded {
                            deadline,
                            reason: e.to_string(),
                        };
                    }
                    attempts += 1;
                    warn!(
                        "[{}] audit failed (attempt {}), retrying in {:?}: {}",
                        self.tag, attempts, self.ctx.retry.interval, e
                    );
                    crate::metrics::record_retry("audit");
                    tokio::time::sleep(self.ctx.retry.interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        Err(self.complain(status, complaint, violation.to_string()).await)
    }

    fn check(
        &self,
        report: &AuditReport,
        recipient: &[u8],
        secret_hash: Option<&SecretHash>,
    ) -> Result<(), AuditViolation> {
        if secret_hash.is_some_and(|hash| *hash != report.secret_hash) {
            return Err(AuditViolation::SecretHashMismatch);
        }
        if report.recipient != recipient {
            return Err(AuditViolation::WrongRecipient {
                expected: hex::encode(recipient),
                actual: hex::encode(&report.recipient),
            });
        }
        if report.value < self.request.receive_value {
            return Err(AuditViolation::InsufficientValue {
                expected: self.request.receive_value,
                actual: report.value,
            });
        }
        let now = self.ctx.clock.now();
        if report.expiry <= now {
            return Err(AuditViolation::Expired {
                expiry: report.expiry,
                now,
            });
        }
        Ok(())
    }

    async fn requestor_audit(&self, status: SwapStatus) -> Result<SwapStatus, SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;
        let (_, secret_hash) = self
            .stored("load initiate details", move || store.initiate_details(id))
            .await?;
        let recipient = self.foreign.recipient_id(&self.request.receive_address)?;

        let complaint = Complaint::WrongResponderInitiation;
        let report = self.audit_foreign(status, complaint).await?;
        if let Err(violation) = self.check(&report, &recipient, Some(&secret_hash)) {
            return Err(self.complain(status, complaint, violation.to_string()).await);
        }

        info!(
            "[{}] Audited counterparty contract: {} {} until {}",
            self.tag, report.value, self.request.receive_currency, report.expiry
        );
        Ok(SwapStatus::Audited)
    }

    async fn responder_audit(&self, status: SwapStatus) -> Result<SwapStatus, SwapError> {
        let recipient = self.foreign.recipient_id(&self.request.receive_address)?;

        let complaint = Complaint::WrongRequestorInitiation;
        let report = self.audit_foreign(status, complaint).await?;

        let margin = self.ctx.timing.responder_safety_margin;
        let expiry = report.expiry - margin;
        let verdict = self.check(&report, &recipient, None).and_then(|()| {
            if expiry <= self.ctx.clock.now() {
                Err(AuditViolation::NoTimeBudget {
                    expiry: report.expiry,
                    margin,
                })
            } else {
                Ok(())
            }
        });
        if let Err(violation) = verdict {
            return Err(self.complain(status, complaint, violation.to_string()).await);
        }

        let store = &self.ctx.store;
        let id = &self.request.id;
        let secret_hash = report.secret_hash;
        self.stored("store initiate details", move || {
            store.put_initiate_details(id, expiry, secret_hash)
        })
        .await?;

        info!(
            "[{}] Audited counterparty contract: {} {}, own expiry {}",
            self.tag, report.value, self.request.receive_currency, expiry
        );
        Ok(SwapStatus::Audited)
    }

    /// Wait for the counterparty to redeem this side's contract, which
    /// reveals the secret. Gives up at this side's own expiry.
    async fn await_redemption(&self, status: SwapStatus) -> Result<SwapStatus, SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;
        let (expiry, secret_hash) = self
            .stored("load initiate details", move || store.initiate_details(id))
            .await?;

        let secret = loop {
            match self.personal.audit_secret().await {
                Ok(secret) if secret.hash() == secret_hash => break secret,
                Ok(_) => return Err(AtomError::SecretMismatch.into()),
                Err(e) if e.is_transient() => {
                    if self.ctx.clock.now() >= expiry {
                        let reason = format!("no redemption before expiry {}", expiry);
                        return Err(self
                            .complain(status, Complaint::DelayedRequestorRedemption, reason)
                            .await);
                    }
                    match e {
                        AtomError::NotYetRevealed => {
                            debug!("[{}] Waiting for counterparty redemption", self.tag)
                        }
                        e => {
                            warn!("[{}] Checking for redemption failed: {}", self.tag, e);
                            crate::metrics::record_retry("audit secret");
                        }
                    }
                    tokio::time::sleep(self.ctx.retry.interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let secret = &secret;
        self.stored("store secret", move || store.put_redeem_details(id, secret))
            .await?;
        info!("[{}] Counterparty revealed the secret", self.tag);
        Ok(SwapStatus::RedeemDetailsAcquired)
    }

    async fn redeem(&self) -> Result<SwapStatus, SwapError> {
        let store = &self.ctx.store;
        let id = &self.request.id;
        let secret = self
            .stored("load secret", move || store.redeem_details(id))
            .await?;

        let foreign = &self.foreign;
        let secret = &secret;
        settle(
            self.ctx
                .retry
                .run(&self.tag, "redeem", move || foreign.redeem(secret))
                .await,
        )?;
        self.stored("clear redeemable", move || store.redeemed(id))
            .await?;

        info!(
            "[{}] Redeemed {} {}",
            self.tag, self.request.receive_value, self.request.receive_currency
        );
        Ok(SwapStatus::Redeemed)
    }

    async fn advance(&self, from: SwapStatus, to: SwapStatus) -> Result<(), SwapError> {
        if !self.role.permits(from, to) {
            return Err(SwapError::IllegalTransition {
                role: self.role,
                from,
                to,
            });
        }

        let store = &self.ctx.store;
        let id = &self.request.id;
        self.stored("store status", move || store.put_status(id, to))
            .await?;

        crate::metrics::record_transition(to);
        info!("[{}] {} -> {}", self.tag, from, to);
        Ok(())
    }

    /// Report the counterparty and stop. The returned error is what the
    /// caller sees, whether or not the complaint was delivered.
    async fn complain(&self, status: SwapStatus, complaint: Complaint, reason: String) -> SwapError {
        error!("[{}] Complaining {}: {}", self.tag, complaint, reason);

        let watchdog = &self.ctx.watchdog;
        let id = self.request.id;
        if let Err(e) = self
            .ctx
            .retry
            .run(&self.tag, "complain", move || watchdog.complain(id, complaint))
            .await
        {
            error!("[{}] Watchdog unreachable: {}", self.tag, e);
            return e.into();
        }
        crate::metrics::record_complaint(complaint);

        if let Err(e) = self.advance(status, SwapStatus::Complained).await {
            // The watchdog has it; a re-run from `status` will deliver it again
            error!(
                "[{}] Complaint {} delivered but not recorded: {}",
                self.tag, complaint, e
            );
            return e;
        }
        SwapError::Complained { complaint, reason }
    }

    async fn stored<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, SwapError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        Ok(self.ctx.retry.run(&self.tag, what, op).await?)
    }
}

//! Queue-draining delivery engine
//!
//! A single task wakes up every poll interval and works through the queue
//! head first. Each record gets exactly one processing pass and is removed
//! afterwards whatever the outcome: a failed relay is logged, never retried.
//!
//! Routing per envelope:
//! - recipient in a local domain: user inbox, else every member of the group
//! - any other recipient: relayed as addressed, but only for a local sender
//! - sender in a local domain: must have authenticated as exactly that sender

use crate::directory::Directory;
use crate::error::{RelayError, Result};
use crate::queue::{DurableQueue, Envelope};
use crate::smtp::client::MailRelay;
use crate::utils::{extract_address, Address, MxResolver};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REMOVE_ATTEMPTS: usize = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct DeliveryEngine {
    queue: Arc<dyn DurableQueue>,
    directory: Arc<dyn Directory>,
    resolver: Arc<dyn MxResolver>,
    relay: Arc<dyn MailRelay>,
    local_domains: HashSet<String>,
    poll_interval: Duration,
}

impl DeliveryEngine {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        directory: Arc<dyn Directory>,
        resolver: Arc<dyn MxResolver>,
        relay: Arc<dyn MailRelay>,
        local_domains: HashSet<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            directory,
            resolver,
            relay,
            local_domains,
            poll_interval,
        }
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Delivery engine started (poll every {:?})", self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            while !shutdown.is_cancelled() {
                match self.poll_once().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!("Queue access failed: {}", e);
                        break;
                    }
                }
            }
        }

        info!("Delivery engine stopped");
    }

    /// Process the head of the queue, if any; true if a record was consumed
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(record) = self.queue.peek_front().await? else {
            return Ok(false);
        };

        match Envelope::from_json(&record.payload) {
            Ok(envelope) => {
                if let Err(e) = self.deliver(&envelope).await {
                    warn!("Dropping envelope {} -> {}: {}", envelope.from, envelope.to, e);
                }
            }
            Err(e) => warn!("Dropping malformed queue record {}: {}", record.id, e),
        }

        self.remove_record(record.id).await?;
        Ok(true)
    }

    /// The record has already been processed, so a failed removal is retried
    /// before giving up; a record left behind is delivered again next poll.
    async fn remove_record(&self, id: i64) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.queue.remove(id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < REMOVE_ATTEMPTS => {
                    warn!("Removing queue record {} failed (attempt {}): {}", id, attempt, e);
                    attempt += 1;
                    tokio::time::sleep(REMOVE_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        "Queue record {} could not be removed and will be delivered again: {}",
                        id, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Route one envelope and relay it to every destination
    ///
    /// Returns how many destinations accepted the message. Per-destination
    /// failures are logged and skipped; an error aborts the whole envelope.
    pub async fn deliver(&self, envelope: &Envelope) -> Result<usize> {
        let recipient = extract_address(&envelope.to)?;
        let destinations = self.resolve_destinations(&recipient).await?;
        let sender = self.check_sender(envelope)?;

        // check_sender already required AUTH for a local sender
        if !recipient.host_in(&self.local_domains) && !sender.host_in(&self.local_domains) {
            warn!("Refusing to relay {} -> {}", sender, recipient);
            return Err(RelayError::RelayDenied(format!("{} -> {}", sender, recipient)));
        }

        let mut delivered = 0;
        for destination in destinations {
            match self.relay_to(&destination, &sender, envelope).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Delivery to {} failed: {}", destination, e),
            }
        }

        Ok(delivered)
    }

    async fn resolve_destinations(&self, recipient: &Address) -> Result<Vec<String>> {
        let address = recipient.to_string();
        if !recipient.host_in(&self.local_domains) {
            return Ok(vec![address]);
        }

        if let Some(inbox) = self.directory.resolve_user_inbox(&address).await? {
            debug!("{} is a user, inbox {}", address, inbox);
            return Ok(vec![inbox]);
        }

        let Some(group) = self.directory.resolve_group_members(&address).await? else {
            return Err(RelayError::InvalidAddress(format!(
                "no such user or group: {}",
                address
            )));
        };

        let mut inboxes = Vec::with_capacity(group.members.len());
        for member in &group.members {
            match self.directory.resolve_user_inbox(member).await? {
                Some(inbox) => inboxes.push(inbox),
                None => debug!("Group {}: member {} has no inbox, skipped", address, member),
            }
        }
        debug!("{} is a group, {} inboxes", address, inboxes.len());
        Ok(inboxes)
    }

    /// A local sender must have authenticated as itself
    fn check_sender(&self, envelope: &Envelope) -> Result<Address> {
        let sender = extract_address(&envelope.from)?;

        if sender.host_in(&self.local_domains) {
            let claimed = sender.to_string();
            if !envelope.authenticated || envelope.username != claimed {
                warn!(
                    "Local sender {} not authenticated (user {:?})",
                    claimed, envelope.username
                );
                return Err(RelayError::AuthenticationFailed);
            }
        }

        Ok(sender)
    }

    async fn relay_to(
        &self,
        destination: &str,
        sender: &Address,
        envelope: &Envelope,
    ) -> Result<()> {
        let target = extract_address(destination)?;
        let exchanges = self.resolver.lookup_mx(&target.host).await?;
        let exchange = exchanges
            .first()
            .ok_or_else(|| RelayError::RelayLookup(format!("no MX records for {}", target.host)))?;

        self.relay
            .relay(
                &exchange.exchange,
                &sender.to_string(),
                destination,
                &envelope.data,
            )
            .await
    }
}

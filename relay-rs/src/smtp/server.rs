use crate::config::Config;
use crate::directory::Directory;
use crate::error::{RelayError, Result};
use crate::queue::{DurableQueue, EnqueuePool};
use crate::security::{Authenticator, TlsConfig};
use crate::smtp::client::{MailRelay, SmtpClient};
use crate::smtp::delivery::DeliveryEngine;
use crate::smtp::session::{SessionContext, SmtpSession};
use crate::utils::{DnsMxResolver, MxResolver};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accept loop with a fixed number of concurrent sessions
///
/// Owns the background pipeline as well: the enqueue workers and the
/// delivery engine start when serving begins and stop with it.
pub struct SmtpServer {
    config: Arc<Config>,
    directory: Arc<dyn Directory>,
    queue: Arc<dyn DurableQueue>,
    tls: Option<TlsConfig>,
    resolver: Arc<dyn MxResolver>,
    relay: Arc<dyn MailRelay>,
}

impl SmtpServer {
    pub fn new(
        config: Config,
        directory: Arc<dyn Directory>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        let relay = SmtpClient::new(config.server.hostname.clone(), config.delivery.relay_port);
        Self {
            config: Arc::new(config),
            directory,
            queue,
            tls: None,
            resolver: Arc::new(DnsMxResolver::new()),
            relay: Arc::new(relay),
        }
    }

    /// Offer STARTTLS with this certificate
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Replace MX lookup and outbound SMTP
    pub fn with_delivery(
        mut self,
        resolver: Arc<dyn MxResolver>,
        relay: Arc<dyn MailRelay>,
    ) -> Self {
        self.resolver = resolver;
        self.relay = relay;
        self
    }

    /// Bind `smtp.listen_addr` and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.smtp.listen_addr).await?;
        info!("SMTP server listening on {}", self.config.smtp.listen_addr);
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let config = &self.config;

        let enqueue = EnqueuePool::start(
            self.queue.clone(),
            config.queue.workers,
            config.queue.handoff_capacity,
        );

        let engine = DeliveryEngine::new(
            self.queue.clone(),
            self.directory.clone(),
            self.resolver.clone(),
            self.relay.clone(),
            config.delivery.local_domain_set(),
            config.delivery.poll_interval(),
        );
        let delivery = tokio::spawn(engine.run(shutdown.child_token()));

        let limiter = Arc::new(Semaphore::new(config.smtp.max_sessions));
        let ctx = Arc::new(SessionContext {
            config: config.clone(),
            tls: self.tls.clone(),
            authenticator: Authenticator::new(self.directory.clone()),
            enqueue,
            limiter: limiter.clone(),
        });

        let mut client_id: u64 = 0;
        loop {
            let (socket, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            // The connection waits here, without a greeting, until a slot frees
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            client_id += 1;
            info!("New SMTP connection #{} from {}", client_id, addr);

            let session = SmtpSession::new(
                ctx.clone(),
                client_id,
                addr.ip().to_string(),
                shutdown.child_token(),
            );

            tokio::spawn(async move {
                let _permit = permit;
                match session.handle(socket).await {
                    Ok(()) => debug!("Session #{} finished", client_id),
                    Err(RelayError::IdleTimeout) => info!("Session #{} timed out", client_id),
                    Err(e) if e.is_fatal_to_session() => {
                        warn!("Session #{} ended: {}", client_id, e)
                    }
                    Err(e) => error!("Session #{} error: {}", client_id, e),
                }
            });
        }

        info!("SMTP server stopped accepting connections");
        if let Err(e) = delivery.await {
            error!("Delivery engine task failed: {}", e);
        }
        Ok(())
    }
}

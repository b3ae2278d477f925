use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::config::{KeepaliveConfig, PoolConfig, TargetConfig};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::metrics::metrics;
use crate::session::Session;
use crate::transport::Transport;

/// Per-target pool: transports and their sessions, plus the waiter queue
/// for saturated acquires.
pub struct TargetPool {
    target: TargetConfig,
    config: PoolConfig,
    keepalive: KeepaliveConfig,
    transports: Mutex<Vec<Arc<Transport>>>,
    /// Transports being established, counted against the cap
    connecting: AtomicUsize,
    /// Woken whenever capacity may have been freed
    released: Notify,
}

impl TargetPool {
    pub(crate) fn new(
        target: TargetConfig,
        config: PoolConfig,
        keepalive: KeepaliveConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            config,
            keepalive,
            transports: Mutex::new(Vec::new()),
            connecting: AtomicUsize::new(0),
            released: Notify::new(),
        })
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Grant a session, preferring idle reuse, then spare session capacity,
    /// then a new transport; block on the waiter queue when saturated.
    pub async fn acquire(self: &Arc<Self>) -> Result<Handle> {
        let acquire_timeout = self.config.acquire_timeout();
        let started = Instant::now();
        loop {
            if let Some((session, connect_nanos)) = self.try_acquire().await? {
                metrics().record_acquire();
                if self.config.enable_trx_leak_check {
                    session.record_acquire_stack(Some(
                        std::backtrace::Backtrace::force_capture().to_string(),
                    ));
                }
                let wait_nanos = started.elapsed().as_nanos() as u64;
                return Ok(Handle::new(
                    session,
                    self.clone(),
                    &self.config,
                    connect_nanos,
                    wait_nanos,
                ));
            }

            let elapsed = started.elapsed();
            if elapsed >= acquire_timeout {
                metrics().record_acquire_timeout();
                return Err(Error::AcquireTimeout(acquire_timeout));
            }
            let remaining = acquire_timeout - elapsed;
            let _ = tokio::time::timeout(remaining, self.released.notified()).await;
        }
    }

    /// One pass over the acquire preference order. `Ok(None)` means
    /// saturated; connect/open failures surface to the caller.
    async fn try_acquire(&self) -> Result<Option<(Arc<Session>, u64)>> {
        let spare = {
            let mut transports = self.transports.lock().await;
            transports.retain(|t| {
                if t.is_dead() {
                    t.shutdown();
                    false
                } else {
                    true
                }
            });

            if let Some(session) = transports.iter().find_map(|t| t.find_idle_session()) {
                debug!(session_id = session.id(), "reusing idle session");
                return Ok(Some((session, 0)));
            }

            match transports
                .iter()
                .find(|t| t.try_reserve_session(self.config.max_sessions_per_transport))
                .cloned()
            {
                Some(transport) => Some(transport),
                None => {
                    let open = transports.len() + self.connecting.load(Ordering::SeqCst);
                    if open >= self.config.max_transports_per_target {
                        return Ok(None);
                    }
                    self.connecting.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }
        };

        let timeout = self.config.network_timeout();
        let connect_started = Instant::now();
        match spare {
            Some(transport) => match transport.open_session(timeout).await {
                Ok(session) => {
                    session.try_claim();
                    Ok(Some((session, connect_started.elapsed().as_nanos() as u64)))
                }
                Err(e) => {
                    transport.release_session_reservation();
                    warn!(addr = %transport.addr(), error = %e, "failed to open session");
                    Err(e)
                }
            },
            None => {
                let result = async {
                    let transport = Transport::connect(
                        self.target.clone(),
                        self.keepalive.clone(),
                        timeout,
                    )
                    .await?;
                    transport.try_reserve_session(self.config.max_sessions_per_transport);
                    match transport.open_session(timeout).await {
                        Ok(session) => Ok((transport, session)),
                        Err(e) => {
                            transport.shutdown();
                            Err(e)
                        }
                    }
                }
                .await;
                self.connecting.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok((transport, session)) => {
                        session.try_claim();
                        self.transports.lock().await.push(transport);
                        Ok(Some((session, connect_started.elapsed().as_nanos() as u64)))
                    }
                    Err(e) => {
                        self.released.notify_waiters();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Hand a session back. Cleanup errors are logged and swallowed; the
    /// session is recycled when the transport agrees, dropped otherwise.
    pub(crate) async fn release(&self, session: Arc<Session>) {
        let timeout = self.config.network_timeout();
        let cleanup = self.cleanup_for_release(&session, timeout).await;

        match session.transport_ref() {
            Some(transport) => {
                let reuse = cleanup.is_ok() && transport.reuse_session(&session);
                if reuse {
                    match session.reset_for_reuse(timeout).await {
                        Ok(()) => {
                            debug!(session_id = session.id(), "session returned to pool");
                            session.release_to_idle();
                            metrics().record_release("reuse");
                        }
                        Err(e) => {
                            warn!(
                                session_id = session.id(),
                                error = %e,
                                "session reset failed, dropping"
                            );
                            transport.drop_session(&session, timeout).await;
                            metrics().record_release("drop");
                        }
                    }
                } else {
                    if let Err(e) = &cleanup {
                        warn!(
                            session_id = session.id(),
                            error = %e,
                            "session cleanup failed, dropping"
                        );
                    }
                    transport.drop_session(&session, timeout).await;
                    metrics().record_release("drop");
                }
            }
            None => {
                session.mark_dead();
                metrics().record_release("drop");
            }
        }
        self.released.notify_waiters();
    }

    async fn cleanup_for_release(&self, session: &Arc<Session>, timeout: Duration) -> Result<()> {
        if session.in_transaction() {
            if self.config.enable_trx_leak_check {
                warn!(
                    session_id = session.id(),
                    acquired_at = session.acquire_stack().as_deref().unwrap_or("<unavailable>"),
                    "session released with an open transaction"
                );
            }
            session.rollback_ignorable(timeout).await?;
        }
        session.flush_ignorable(timeout).await?;

        if let Some(last) = session.last_request().await {
            if !last.is_done() {
                if last.ignore_result() {
                    // Fire-and-forget tail; its terminal is on the way.
                    last.wait_done(timeout).await?;
                } else {
                    // Abandoned, undrained result: force it to a terminal
                    // and discard.
                    warn!(
                        session_id = session.id(),
                        statement = last.statement().as_deref().unwrap_or("<none>"),
                        "undrained result at release, cancelling"
                    );
                    let _ = session.cancel(timeout).await;
                    last.wait_done(timeout).await?;
                }
            }
        }
        Ok(())
    }

    /// Periodic upkeep: discard dead transports, reap sessions idle past the
    /// TTL, retire session-less idle transports.
    pub(crate) async fn maintain(&self) {
        let ttl = self.config.idle_session_ttl();
        let timeout = self.config.network_timeout();
        let mut expired = Vec::new();
        let mut freed = false;
        {
            let mut transports = self.transports.lock().await;
            transports.retain(|t| {
                if t.is_dead() {
                    t.shutdown();
                    freed = true;
                    false
                } else {
                    true
                }
            });
            for transport in transports.iter() {
                for session in transport.sessions() {
                    if session.is_idle_expired(ttl) && session.try_claim() {
                        expired.push((transport.clone(), session));
                    }
                }
            }
            transports.retain(|t| {
                if t.session_total() == 0 && t.idle_duration() >= ttl {
                    debug!(addr = %t.addr(), "retiring idle transport");
                    t.shutdown();
                    freed = true;
                    false
                } else {
                    true
                }
            });
        }
        for (transport, session) in expired {
            debug!(session_id = session.id(), "reaping idle session");
            transport.drop_session(&session, timeout).await;
            freed = true;
        }
        if freed {
            self.released.notify_waiters();
        }
    }

    pub(crate) async fn shutdown(&self) {
        let transports: Vec<_> = self.transports.lock().await.drain(..).collect();
        for transport in transports {
            transport.shutdown();
        }
        self.released.notify_waiters();
    }

    pub async fn transport_count(&self) -> usize {
        self.transports.lock().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.transports
            .lock()
            .await
            .iter()
            .map(|t| t.session_total())
            .sum()
    }
}

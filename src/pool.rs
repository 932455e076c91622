//! Per-authority connection pooling.
//!
//! Admission is a fair [`Semaphore`] per authority: a permit is held for as
//! long as a connection is checked out or being opened, while idle
//! connections hold none. A released connection is parked before its permit
//! is returned, so the next queued caller picks it up. Bookkeeping lives
//! behind one mutex that is never held across an await.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::connection::{Connection, ConnectionFactory, DefaultConnectionFactory};
use crate::error::{Error, TransportErrorKind};
use crate::request::Request;
use crate::stream::Stream;
use crate::timeout::cancellable;
use crate::util::{Authority, lock_unpoisoned};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Hands out single-use [`Stream`]s bound to pooled connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn get_stream(&self, request: &Request, cancellation: &CancellationToken)
    -> Result<Stream>;

    fn total_connection_attempts(&self) -> u64;

    fn total_stream_requests(&self) -> u64;

    fn open_connection_count(&self) -> usize;
}

struct IdleConnection {
    connection: Box<dyn Connection>,
    idle_since: Instant,
}

struct AuthorityState {
    slots: Arc<Semaphore>,
    /// Idle, checked-out and connecting connections.
    open: usize,
    /// Callers waiting for or holding a permit.
    users: usize,
    idle: Vec<IdleConnection>,
}

impl AuthorityState {
    fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            open: 0,
            users: 0,
            idle: Vec::new(),
        }
    }

    fn is_unused(&self) -> bool {
        self.users == 0 && self.open == 0
    }
}

pub(crate) struct PoolShared {
    factory: Arc<dyn ConnectionFactory>,
    limit: usize,
    authorities: Mutex<BTreeMap<Authority, AuthorityState>>,
    total_connection_attempts: AtomicU64,
    total_stream_requests: AtomicU64,
}

impl PoolShared {
    /// Registers a caller for `authority` and returns the semaphore it must
    /// acquire a permit from.
    fn check_out(self: &Arc<Self>, authority: &Authority) -> (Arc<Semaphore>, Checkout) {
        let mut authorities = lock_unpoisoned(&self.authorities);
        let entry = authorities
            .entry(authority.clone())
            .or_insert_with(|| AuthorityState::new(self.limit));
        entry.users += 1;
        if entry.slots.available_permits() == 0 {
            debug!(
                authority = %authority,
                open = entry.open,
                "connection limit reached; queueing request"
            );
        }
        (
            Arc::clone(&entry.slots),
            Checkout {
                pool: Arc::clone(self),
                authority: authority.clone(),
                permit: None,
            },
        )
    }

    fn check_in(&self, authority: &Authority) {
        let mut authorities = lock_unpoisoned(&self.authorities);
        let Some(entry) = authorities.get_mut(authority) else {
            return;
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.is_unused() {
            authorities.remove(authority);
        }
    }

    /// Pops the freshest usable idle connection, or reserves an open slot for
    /// a new one. Only called while holding a permit.
    fn take_idle(
        self: &Arc<Self>,
        authority: &Authority,
        idle_timeout: Duration,
    ) -> std::result::Result<Box<dyn Connection>, SlotReservation> {
        let mut authorities = lock_unpoisoned(&self.authorities);
        let entry = authorities
            .entry(authority.clone())
            .or_insert_with(|| AuthorityState::new(self.limit));

        while let Some(idle) = entry.idle.pop() {
            let mut connection = idle.connection;
            if connection.is_closed() || idle.idle_since.elapsed() > idle_timeout {
                connection.close();
                entry.open = entry.open.saturating_sub(1);
                debug!(authority = %authority, "discarding stale idle connection");
                continue;
            }
            debug!(authority = %authority, "reusing idle connection");
            return Ok(connection);
        }

        entry.open += 1;
        Err(SlotReservation {
            pool: Arc::clone(self),
            authority: authority.clone(),
            armed: true,
        })
    }

    fn release(&self, authority: &Authority, mut connection: Box<dyn Connection>, reusable: bool) {
        let mut authorities = lock_unpoisoned(&self.authorities);
        let Some(entry) = authorities.get_mut(authority) else {
            connection.close();
            return;
        };

        if reusable && !connection.is_closed() {
            entry.idle.push(IdleConnection {
                connection,
                idle_since: Instant::now(),
            });
            return;
        }

        connection.close();
        entry.open = entry.open.saturating_sub(1);
    }

    fn release_slot(&self, authority: &Authority) {
        let mut authorities = lock_unpoisoned(&self.authorities);
        if let Some(entry) = authorities.get_mut(authority) {
            entry.open = entry.open.saturating_sub(1);
        }
    }

    async fn connect(
        &self,
        mut slot: SlotReservation,
        request: &Request,
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn Connection>> {
        self.total_connection_attempts
            .fetch_add(1, Ordering::Relaxed);
        debug!(authority = %slot.authority, "opening new connection");
        match self.factory.create(request, cancellation).await {
            Ok(connection) => {
                slot.disarm();
                Ok(connection)
            }
            Err(error @ (Error::Cancelled | Error::Unprocessed { .. })) => Err(error),
            Err(error) => Err(Error::unprocessed(error)),
        }
    }

    fn open_connection_count(&self) -> usize {
        lock_unpoisoned(&self.authorities)
            .values()
            .map(|entry| entry.open)
            .sum()
    }
}

/// A caller's claim on an authority: waiting for a permit, then holding it.
/// Dropping it returns the permit and forgets the authority once unused.
struct Checkout {
    pool: Arc<PoolShared>,
    authority: Authority,
    permit: Option<OwnedSemaphorePermit>,
}

impl Checkout {
    async fn admit(
        &mut self,
        slots: Arc<Semaphore>,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let authority = &self.authority;
        let permit = cancellable(cancellation, async move {
            slots.acquire_owned().await.map_err(|source| {
                Error::unprocessed(Error::socket(
                    TransportErrorKind::Closed,
                    format!("Connection pool for '{authority}' was closed"),
                    source,
                ))
            })
        })
        .await?;
        self.permit = Some(permit);
        Ok(())
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.pool.check_in(&self.authority);
    }
}

/// An open slot counted against the authority but not yet backed by a
/// connection. Dropping it armed gives the slot back.
struct SlotReservation {
    pool: Arc<PoolShared>,
    authority: Authority,
    armed: bool,
}

impl SlotReservation {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(&self.authority);
        }
    }
}

/// Ownership of a pooled connection for the duration of one exchange.
///
/// Dropping the lease returns the connection: reusable only if it was never
/// used or its response body was read to the end.
pub(crate) struct StreamLease {
    connection: Option<Box<dyn Connection>>,
    checkout: Checkout,
    reusable: bool,
}

impl StreamLease {
    pub(crate) fn authority(&self) -> &Authority {
        &self.checkout.authority
    }

    pub(crate) fn connection(&self) -> Option<&dyn Connection> {
        self.connection.as_deref()
    }

    /// Marks the exchange as started; the connection is no longer reusable
    /// until [`StreamLease::complete`] is called.
    pub(crate) fn begin(&mut self) -> Result<&mut Box<dyn Connection>> {
        self.reusable = false;
        self.connection.as_mut().ok_or(Error::StreamConsumed)
    }

    pub(crate) fn complete(mut self) {
        self.reusable = true;
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        // The checkout field drops after this, so the connection is parked
        // before the permit goes back.
        if let Some(connection) = self.connection.take() {
            self.checkout
                .pool
                .release(&self.checkout.authority, connection, self.reusable);
        }
    }
}

/// Limits open connections per authority.
///
/// Idle connections are reused before new ones are opened; when the limit is
/// reached, callers queue in arrival order until a connection or slot is
/// released.
pub struct ConnectionLimitingPool {
    shared: Arc<PoolShared>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for ConnectionLimitingPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ConnectionLimitingPool")
            .field("limit", &self.shared.limit)
            .field("idle_timeout", &self.idle_timeout)
            .field("open", &self.shared.open_connection_count())
            .finish()
    }
}

impl ConnectionLimitingPool {
    pub fn by_authority(limit: usize, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory,
                limit: limit.clamp(1, Semaphore::MAX_PERMITS),
                authorities: Mutex::new(BTreeMap::new()),
                total_connection_attempts: AtomicU64::new(0),
                total_stream_requests: AtomicU64::new(0),
            }),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// A pool over TCP and rustls with the webpki roots.
    pub fn try_new(limit: usize) -> Result<Self> {
        Ok(Self::by_authority(
            limit,
            Arc::new(DefaultConnectionFactory::try_default()?),
        ))
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

#[async_trait]
impl ConnectionPool for ConnectionLimitingPool {
    async fn get_stream(
        &self,
        request: &Request,
        cancellation: &CancellationToken,
    ) -> Result<Stream> {
        self.shared
            .total_stream_requests
            .fetch_add(1, Ordering::Relaxed);
        cancellation.check()?;
        let authority = request.authority()?;

        let (slots, mut checkout) = self.shared.check_out(&authority);
        checkout.admit(slots, cancellation).await?;

        let connection = match self.shared.take_idle(&authority, self.idle_timeout) {
            Ok(connection) => connection,
            Err(slot) => self.shared.connect(slot, request, cancellation).await?,
        };

        Ok(Stream::new(StreamLease {
            connection: Some(connection),
            checkout,
            reusable: true,
        }))
    }

    fn total_connection_attempts(&self) -> u64 {
        self.shared.total_connection_attempts.load(Ordering::Relaxed)
    }

    fn total_stream_requests(&self) -> u64 {
        self.shared.total_stream_requests.load(Ordering::Relaxed)
    }

    fn open_connection_count(&self) -> usize {
        self.shared.open_connection_count()
    }
}

/// A pool without a practical per-authority limit.
#[derive(Debug)]
pub struct UnlimitedConnectionPool {
    inner: ConnectionLimitingPool,
}

impl UnlimitedConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: ConnectionLimitingPool::by_authority(Semaphore::MAX_PERMITS, factory),
        }
    }

    pub fn try_default() -> Result<Self> {
        Ok(Self::new(Arc::new(DefaultConnectionFactory::try_default()?)))
    }

    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            inner: self.inner.with_idle_timeout(idle_timeout),
        }
    }
}

#[async_trait]
impl ConnectionPool for UnlimitedConnectionPool {
    async fn get_stream(
        &self,
        request: &Request,
        cancellation: &CancellationToken,
    ) -> Result<Stream> {
        self.inner.get_stream(request, cancellation).await
    }

    fn total_connection_attempts(&self) -> u64 {
        self.inner.total_connection_attempts()
    }

    fn total_stream_requests(&self) -> u64 {
        self.inner.total_stream_requests()
    }

    fn open_connection_count(&self) -> usize {
        self.inner.open_connection_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use http::{StatusCode, Version};

    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::client::DelegateHttpClient;
    use crate::response::Response;

    struct MockConnection {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn send(
            &mut self,
            _request: Request,
            _cancellation: &CancellationToken,
        ) -> Result<Response> {
            Ok(Response::new(StatusCode::OK, "ok"))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn protocol_version(&self) -> Version {
            Version::HTTP_11
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: AtomicU64,
        fail: AtomicBool,
        closed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        async fn create(
            &self,
            _request: &Request,
            _cancellation: &CancellationToken,
        ) -> Result<Box<dyn Connection>> {
            tokio::task::yield_now().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::socket(
                    TransportErrorKind::Connect,
                    "Connection to 'example.com:80' failed",
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                ));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            self.closed.lock().expect("closed flags").push(Arc::clone(&closed));
            Ok(Box::new(MockConnection { closed }))
        }
    }

    fn request() -> Request {
        Request::get("http://example.com/").expect("request")
    }

    fn pool(limit: usize) -> (Arc<MockFactory>, Arc<ConnectionLimitingPool>) {
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionLimitingPool::by_authority(limit, factory.clone());
        (factory, Arc::new(pool))
    }

    async fn finish(stream: Stream) {
        let response = stream
            .request(request(), &CancellationToken::none())
            .await
            .expect("response");
        response.into_body().buffer().await.expect("body");
    }

    #[tokio::test]
    async fn limit_holds_and_next_acquirer_waits_for_release() {
        let (factory, pool) = pool(2);
        let first = pool.get_stream(&request(), &CancellationToken::none()).await.expect("first");
        let _second = pool.get_stream(&request(), &CancellationToken::none()).await.expect("second");
        assert_eq!(pool.open_connection_count(), 2);

        let waiting_pool = Arc::clone(&pool);
        let third = tokio::spawn(async move {
            waiting_pool
                .get_stream(&request(), &CancellationToken::none())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished(), "third acquirer must wait");
        assert_eq!(pool.total_connection_attempts(), 2);

        finish(first).await;
        let third = third.await.expect("task").expect("third stream");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.total_connection_attempts(), 2);
        assert_eq!(pool.total_stream_requests(), 3);
        assert_eq!(pool.open_connection_count(), 2);
        drop(third);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let (_factory, pool) = pool(1);
        let held = pool.get_stream(&request(), &CancellationToken::none()).await.expect("held");
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        for label in ["a", "b", "c"] {
            let pool = Arc::clone(&pool);
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let stream = pool
                    .get_stream(&request(), &CancellationToken::none())
                    .await
                    .expect("stream");
                order_tx.send(label).expect("order");
                finish(stream).await;
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        finish(held).await;
        for task in tasks {
            task.await.expect("task");
        }
        drop(order_tx);

        let mut order = Vec::new();
        while let Some(label) = order_rx.recv().await {
            order.push(label);
        }
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(pool.total_connection_attempts(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_the_queue() {
        let (_factory, pool) = pool(1);
        let held = pool.get_stream(&request(), &CancellationToken::none()).await.expect("held");

        let source = CancellationSource::new();
        let token = source.token();
        let waiting_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiting_pool.get_stream(&request(), &token).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();

        let error = waiter.await.expect("task").expect_err("waiter cancelled");
        assert!(error.is_cancelled());

        finish(held).await;
        assert_eq!(pool.open_connection_count(), 1);
        let reused = pool.get_stream(&request(), &CancellationToken::none()).await.expect("reuse");
        assert_eq!(pool.total_connection_attempts(), 1);
        drop(reused);
    }

    #[tokio::test]
    async fn cancelled_waiters_keep_the_limit_intact() {
        let (_factory, pool) = pool(1);
        let held = pool.get_stream(&request(), &CancellationToken::none()).await.expect("held");

        let source = CancellationSource::new();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let token = source.token();
            let waiting_pool = Arc::clone(&pool);
            waiters.push(tokio::spawn(async move {
                waiting_pool.get_stream(&request(), &token).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();
        for waiter in waiters {
            let error = waiter.await.expect("task").expect_err("waiter cancelled");
            assert!(error.is_cancelled());
        }

        drop(held);
        let next = pool.get_stream(&request(), &CancellationToken::none()).await.expect("next");
        let waiting_pool = Arc::clone(&pool);
        let blocked = tokio::spawn(async move {
            waiting_pool
                .get_stream(&request(), &CancellationToken::none())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "limit of one still holds");

        drop(next);
        let last = blocked.await.expect("task").expect("last stream");
        assert_eq!(pool.total_connection_attempts(), 1);
        assert_eq!(pool.open_connection_count(), 1);
        drop(last);
    }

    #[tokio::test]
    async fn failed_connect_is_unprocessed_and_frees_the_slot() {
        let (factory, pool) = pool(1);
        factory.fail.store(true, Ordering::SeqCst);

        let error = pool
            .get_stream(&request(), &CancellationToken::none())
            .await
            .expect_err("connect fails");
        assert!(error.is_unprocessed());
        assert_eq!(error.transport_error_kind(), Some(TransportErrorKind::Connect));
        assert_eq!(pool.open_connection_count(), 0);
        assert!(lock_unpoisoned(&pool.shared.authorities).is_empty());

        factory.fail.store(false, Ordering::SeqCst);
        let stream = pool.get_stream(&request(), &CancellationToken::none()).await.expect("stream");
        assert_eq!(pool.total_connection_attempts(), 2);
        drop(stream);
    }

    #[tokio::test]
    async fn abandoned_exchange_closes_the_connection_and_passes_the_slot_on() {
        let (factory, pool) = pool(1);
        let stream = pool.get_stream(&request(), &CancellationToken::none()).await.expect("stream");

        let waiting_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            waiting_pool
                .get_stream(&request(), &CancellationToken::none())
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let response = stream
            .request(request(), &CancellationToken::none())
            .await
            .expect("response");
        drop(response);

        let next = waiter.await.expect("task").expect("next stream");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert!(factory.closed.lock().expect("closed flags")[0].load(Ordering::SeqCst));
        assert_eq!(pool.open_connection_count(), 1);
        drop(next);
    }

    #[tokio::test]
    async fn unused_stream_returns_its_connection() {
        let (_factory, pool) = pool(1);
        let stream = pool.get_stream(&request(), &CancellationToken::none()).await.expect("stream");
        drop(stream);

        let again = pool.get_stream(&request(), &CancellationToken::none()).await.expect("again");
        assert_eq!(pool.total_connection_attempts(), 1);
        drop(again);
    }

    #[tokio::test]
    async fn stale_idle_connections_are_evicted() {
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionLimitingPool::by_authority(1, factory.clone())
            .with_idle_timeout(Duration::from_millis(1));
        finish(pool.get_stream(&request(), &CancellationToken::none()).await.expect("first")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stream = pool.get_stream(&request(), &CancellationToken::none()).await.expect("second");
        assert_eq!(pool.total_connection_attempts(), 2);
        assert_eq!(pool.open_connection_count(), 1);
        drop(stream);
    }

    #[tokio::test]
    async fn authorities_are_limited_independently() {
        let (_factory, pool) = pool(1);
        let plain = pool.get_stream(&request(), &CancellationToken::none()).await.expect("plain");
        let other = Request::get("http://other.example.com/").expect("request");
        let tls = Request::get("https://example.com/").expect("request");

        let _other = pool.get_stream(&other, &CancellationToken::none()).await.expect("other");
        let _tls = pool.get_stream(&tls, &CancellationToken::none()).await.expect("tls");
        assert_eq!(pool.open_connection_count(), 3);
        drop(plain);
    }

    #[tokio::test]
    async fn unlimited_pool_never_queues() {
        let factory = Arc::new(MockFactory::default());
        let pool = UnlimitedConnectionPool::new(factory.clone());
        let mut streams = Vec::new();
        for _ in 0..16 {
            streams.push(pool.get_stream(&request(), &CancellationToken::none()).await.expect("stream"));
        }
        assert_eq!(pool.open_connection_count(), 16);
        assert_eq!(pool.total_stream_requests(), 16);
        assert_eq!(pool.total_connection_attempts(), 16);
    }
}

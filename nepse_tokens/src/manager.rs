use std::{
    error, fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use nepse_clock::{Clock, DurationSecs, System};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::CredentialStatus, derive::derive_indices, module::DerivationFunctions,
    sources::BundleSource, AccessToken, CredentialError, Credentials, RefreshToken,
};

/// Which service endpoint an update exchanges credentials with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshStrategy {
    /// Always request a brand new bundle
    #[default]
    AlwaysProve,
    /// Present the current refresh token when one is cached
    PreferRefreshToken,
}

/// Configuration for a [`CredentialManager`]
#[derive(Clone, Debug)]
pub struct ManagerConfig<C = System> {
    validity_window: DurationSecs,
    fetch_timeout: Option<Duration>,
    refresh_strategy: RefreshStrategy,
    clock: C,
}

impl Default for ManagerConfig {
    /// Default manager configuration
    ///
    /// Credentials stay fresh for 45 seconds, bundle fetches time out after
    /// 30 seconds, every update requests a new bundle, and the system clock
    /// is used.
    fn default() -> Self {
        Self {
            validity_window: DurationSecs(45),
            fetch_timeout: Some(Duration::from_secs(30)),
            refresh_strategy: RefreshStrategy::AlwaysProve,
            clock: System,
        }
    }
}

impl ManagerConfig {
    /// Constructs a configuration with the given validity window
    pub fn new(validity_window: DurationSecs) -> Self {
        Self {
            validity_window,
            ..Self::default()
        }
    }
}

impl<C> ManagerConfig<C> {
    /// Sets the limit on a single bundle fetch, or removes it with `None`
    pub fn with_fetch_timeout(mut self, fetch_timeout: Option<Duration>) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Sets the endpoint used for updates after the first
    pub fn with_refresh_strategy(mut self, refresh_strategy: RefreshStrategy) -> Self {
        self.refresh_strategy = refresh_strategy;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ManagerConfig<D> {
        ManagerConfig {
            validity_window: self.validity_window,
            fetch_timeout: self.fetch_timeout,
            refresh_strategy: self.refresh_strategy,
            clock,
        }
    }

    /// The duration for which credentials are handed out without an update
    pub fn validity_window(&self) -> DurationSecs {
        self.validity_window
    }
}

type SharedUpdate = Shared<BoxFuture<'static, Result<(), CredentialError>>>;

#[derive(Clone)]
struct InFlight {
    generation: u64,
    forced: bool,
    update: SharedUpdate,
}

struct Inner<S, C> {
    source: S,
    functions: Box<dyn DerivationFunctions>,
    config: ManagerConfig<C>,
    state: watch::Sender<Option<Arc<Credentials>>>,
    in_flight: Mutex<Option<InFlight>>,
    generations: AtomicU64,
    closed: AtomicBool,
}

/// Vacates the in-flight slot when the update task completes, panics, or is
/// dropped by its runtime
struct InFlightGuard<S, C> {
    inner: Arc<Inner<S, C>>,
    generation: u64,
}

impl<S, C> Drop for InFlightGuard<S, C> {
    fn drop(&mut self) {
        self.inner.vacate(self.generation);
    }
}

/// Caches usable credentials and keeps them fresh
///
/// Handles are cheap to clone and share a single cache. Reading fresh
/// credentials never waits. When the cache is stale, the first caller starts
/// an update and every caller arriving before it finishes waits on that same
/// update, so at most one update runs per manager at any time.
///
/// Updates run as tasks on the current Tokio runtime, so the update-capable
/// methods must be called from within one.
pub struct CredentialManager<S, C = System> {
    inner: Arc<Inner<S, C>>,
}

impl<S> CredentialManager<S, System>
where
    S: BundleSource + 'static,
{
    /// Constructs a manager with the default configuration
    pub fn new<F>(source: S, functions: F) -> Self
    where
        F: DerivationFunctions + 'static,
    {
        Self::with_config(source, functions, ManagerConfig::default())
    }
}

impl<S, C> CredentialManager<S, C>
where
    S: BundleSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a manager with a custom configuration
    pub fn with_config<F>(source: S, functions: F, config: ManagerConfig<C>) -> Self
    where
        F: DerivationFunctions + 'static,
    {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                source,
                functions: Box::new(functions),
                config,
                state,
                in_flight: Mutex::new(None),
                generations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Gets a fresh access token, updating first if required
    pub async fn access_token(&self) -> Result<AccessToken, CredentialError> {
        let credentials = self.credentials_with(None).await?;
        Ok(credentials.access_token().to_owned())
    }

    /// Like [`access_token()`][Self::access_token()], but gives up waiting
    /// on an update once `cancel` fires
    pub async fn access_token_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        let credentials = self.credentials_with(Some(cancel)).await?;
        Ok(credentials.access_token().to_owned())
    }

    /// Gets a fresh refresh token, updating first if required
    pub async fn refresh_token(&self) -> Result<RefreshToken, CredentialError> {
        let credentials = self.credentials_with(None).await?;
        Ok(credentials.refresh_token().to_owned())
    }

    /// Like [`refresh_token()`][Self::refresh_token()], but gives up waiting
    /// on an update once `cancel` fires
    pub async fn refresh_token_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RefreshToken, CredentialError> {
        let credentials = self.credentials_with(Some(cancel)).await?;
        Ok(credentials.refresh_token().to_owned())
    }

    /// Gets both fresh tokens from the same update
    pub async fn credentials(&self) -> Result<Arc<Credentials>, CredentialError> {
        self.credentials_with(None).await
    }

    /// Like [`credentials()`][Self::credentials()], but gives up waiting on
    /// an update once `cancel` fires
    pub async fn credentials_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Credentials>, CredentialError> {
        self.credentials_with(Some(cancel)).await
    }

    /// Updates the credentials regardless of freshness
    ///
    /// Intended for callers whose request was rejected with the cached token.
    /// Concurrent forced updates collapse into one.
    pub async fn force_update(&self) -> Result<(), CredentialError> {
        self.await_update(true, None).await
    }

    /// Like [`force_update()`][Self::force_update()], but gives up waiting
    /// once `cancel` fires
    pub async fn force_update_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CredentialError> {
        self.await_update(true, Some(cancel)).await
    }

    async fn credentials_with(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Credentials>, CredentialError> {
        self.ensure_open()?;

        if let Some(credentials) = self.inner.fresh_credentials() {
            tracing::trace!("using cached credentials");
            return Ok(credentials);
        }

        self.await_update(false, cancel).await?;

        self.inner
            .state
            .borrow()
            .clone()
            .ok_or(CredentialError::UpdateAborted)
    }

    async fn await_update(
        &self,
        force: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), CredentialError> {
        loop {
            self.ensure_open()?;

            let in_flight = self.join_or_start_update(force);
            let result = match cancel {
                Some(cancel) => tokio::select! {
                    result = in_flight.update => result,
                    () = cancel.cancelled() => {
                        tracing::debug!("stopped waiting on credential update");
                        Err(CredentialError::Cancelled)
                    }
                },
                None => in_flight.update.await,
            };

            // A forced caller that joined an unforced update may have seen it
            // skip the fetch, so it follows up with one of its own.
            if !force || in_flight.forced || result.is_err() {
                return result;
            }
            tracing::trace!("joined update was not forced, starting forced update");
        }
    }

    fn join_or_start_update(&self, force: bool) -> InFlight {
        let mut slot = self.inner.in_flight.lock();
        if let Some(in_flight) = &*slot {
            tracing::trace!(
                force,
                joined_forced = in_flight.forced,
                "joining in-flight credential update"
            );
            return in_flight.clone();
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            // Dropping the guard blocks until the spawning caller has
            // published this update.
            let guard = InFlightGuard { inner, generation };
            let result = guard.inner.update(force).await;
            if let Err(err) = &result {
                tracing::warn!(
                    error = (err as &dyn error::Error),
                    "credential update failed"
                );
            }
            drop(guard);
            result
        });

        let inner = Arc::clone(&self.inner);
        let update = async move {
            task.await.unwrap_or_else(|err| {
                tracing::error!(panicked = err.is_panic(), "credential update task ended");
                inner.vacate(generation);
                Err(CredentialError::UpdateAborted)
            })
        }
        .boxed()
        .shared();

        let in_flight = InFlight {
            generation,
            forced: force,
            update,
        };
        *slot = Some(in_flight.clone());
        in_flight
    }

    fn ensure_open(&self) -> Result<(), CredentialError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(CredentialError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<S, C> Inner<S, C> {
    fn vacate(&self, generation: u64) {
        let mut slot = self.in_flight.lock();
        if slot.as_ref().map_or(false, |f| f.generation == generation) {
            *slot = None;
        }
    }
}

impl<S, C> CredentialManager<S, C> {
    /// Gets the cached credentials, fresh or not, without updating
    pub fn peek(&self) -> Option<Arc<Credentials>> {
        self.inner.state.borrow().clone()
    }

    /// Gets the bundle source backing this manager
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// Releases the derivation module
    ///
    /// Every later request fails with [`CredentialError::Closed`]. Closing an
    /// already closed manager does nothing.
    pub fn close(&self) -> Result<(), CredentialError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!("closing credential manager");
        self.inner
            .functions
            .close()
            .map_err(CredentialError::Release)
    }
}

impl<S, C> Inner<S, C>
where
    S: BundleSource,
    C: Clock,
{
    fn fresh_credentials(&self) -> Option<Arc<Credentials>> {
        let state = self.state.borrow();
        let credentials = state.as_ref()?;
        match credentials.status_at(self.config.clock.now(), self.config.validity_window) {
            CredentialStatus::Fresh => Some(Arc::clone(credentials)),
            CredentialStatus::Stale => None,
        }
    }

    async fn update(&self, force: bool) -> Result<(), CredentialError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CredentialError::Closed);
        }

        if !force && self.fresh_credentials().is_some() {
            tracing::debug!("credentials already refreshed by an earlier update");
            return Ok(());
        }

        let current = self.state.borrow().clone();
        let fetch = async {
            match (self.config.refresh_strategy, &current) {
                (RefreshStrategy::PreferRefreshToken, Some(credentials)) => {
                    tracing::debug!(force, "refreshing credentials with refresh token");
                    self.source
                        .fetch_refreshed_bundle(credentials.refresh_token())
                        .await
                }
                _ => {
                    tracing::debug!(force, "requesting new credentials");
                    self.source.fetch_initial_bundle().await
                }
            }
            .map_err(CredentialError::fetch)
        };

        let bundle = match self.config.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| CredentialError::FetchTimedOut(limit))??,
            None => fetch.await?,
        };

        let indices = derive_indices(&*self.functions, bundle.salts())?;
        let credentials = Credentials::assemble(&bundle, &indices, self.config.clock.now())?;

        tracing::info!(
            salts = ?credentials.salts(),
            obtained_at = credentials.obtained_at().0,
            access_token.len = credentials.access_token().as_str().len(),
            refresh_token.len = credentials.refresh_token().as_str().len(),
            "installed new credentials"
        );

        self.state.send_replace(Some(Arc::new(credentials)));
        Ok(())
    }
}

impl<S, C> Clone for CredentialManager<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> fmt::Debug for CredentialManager<S, C>
where
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("source", &self.inner.source)
            .field("config", &self.inner.config)
            .field("credentials", &*self.inner.state.borrow())
            .field("update_in_flight", &self.inner.in_flight.lock().is_some())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

//! A bundle source serving fixed bundles from memory

use std::{
    collections::VecDeque,
    io,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::BundleSource;
use crate::{RefreshTokenRef, TokenBundle};

/// A bundle source that hands out a queue of predetermined bundles
///
/// The last bundle is repeated once the queue drains to a single entry. An
/// empty source fails every request with [`io::ErrorKind::NotFound`].
#[derive(Debug, Default)]
pub struct StaticBundleSource {
    bundles: Mutex<VecDeque<TokenBundle>>,
    initial_fetches: AtomicUsize,
    refreshed_fetches: AtomicUsize,
}

impl StaticBundleSource {
    /// Constructs a source that always returns `bundle`
    pub fn new(bundle: TokenBundle) -> Self {
        Self::from_sequence([bundle])
    }

    /// Constructs a source that returns each bundle in turn
    pub fn from_sequence(bundles: impl IntoIterator<Item = TokenBundle>) -> Self {
        Self {
            bundles: Mutex::new(bundles.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Number of bundles requested without prior credentials
    pub fn initial_fetches(&self) -> usize {
        self.initial_fetches.load(Ordering::Acquire)
    }

    /// Number of bundles requested with a refresh token
    pub fn refreshed_fetches(&self) -> usize {
        self.refreshed_fetches.load(Ordering::Acquire)
    }

    fn next_bundle(&self) -> Result<TokenBundle, io::Error> {
        let mut bundles = self.bundles.lock();
        let bundle = if bundles.len() > 1 {
            bundles.pop_front()
        } else {
            bundles.front().cloned()
        };
        bundle.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no token bundle available"))
    }
}

#[async_trait]
impl BundleSource for StaticBundleSource {
    type Error = io::Error;

    async fn fetch_initial_bundle(&self) -> Result<TokenBundle, Self::Error> {
        self.initial_fetches.fetch_add(1, Ordering::AcqRel);
        self.next_bundle()
    }

    async fn fetch_refreshed_bundle(
        &self,
        _refresh_token: &RefreshTokenRef,
    ) -> Result<TokenBundle, Self::Error> {
        self.refreshed_fetches.fetch_add(1, Ordering::AcqRel);
        self.next_bundle()
    }
}

//! Middleware to automatically attach NEPSE credentials to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`SalterAuthMiddleware`] in the middleware stack to use the
//! current access token held by a [`CredentialManager`] for each outbound
//! request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! Should the service reject an attached token with `401 Unauthorized`, the
//! middleware forces a credential update and retries the request once with
//! the new token. Requests whose bodies cannot be cloned are not retried.
//!
//! ```
//! use nepse_reqwest::SalterAuthMiddleware;
//! use nepse_tokens::{module::DerivationModule, sources::StaticBundleSource, CredentialManager};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! #
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let module = DerivationModule::from_bytes(r#"(module
//! #   (func (export "cdx") (param i32 i32 i32 i32 i32) (result i32) local.get 0)
//! #   (func (export "rdx") (param i32 i32 i32 i32 i32) (result i32) local.get 1)
//! #   (func (export "bdx") (param i32 i32 i32 i32 i32) (result i32) local.get 2)
//! #   (func (export "ndx") (param i32 i32 i32 i32 i32) (result i32) local.get 3)
//! #   (func (export "mdx") (param i32 i32 i32 i32 i32) (result i32) local.get 4))"#).unwrap();
//! # let source = StaticBundleSource::default();
//! let manager = CredentialManager::new(source, module);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(SalterAuthMiddleware::new(manager))
//!     .build();
//!
//! let req = client
//!     .get("https://www.nepalstock.com/api/nots/nepse-data/market-open");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! By default credentials are only attached to requests bound for the
//! service's own origin, `https://www.nepalstock.com`. Other origins, such as
//! a mirror, can be admitted with a custom predicate.
//!
//! ```
//! use nepse_reqwest::{SalterAuthMiddleware, ServiceOrigin};
//! use predicates::prelude::PredicateBooleanExt;
//! # use nepse_tokens::{module::DerivationModule, sources::StaticBundleSource, CredentialManager};
//! # let module = DerivationModule::from_bytes(r#"(module
//! #   (func (export "cdx") (param i32 i32 i32 i32 i32) (result i32) local.get 0)
//! #   (func (export "rdx") (param i32 i32 i32 i32 i32) (result i32) local.get 1)
//! #   (func (export "bdx") (param i32 i32 i32 i32 i32) (result i32) local.get 2)
//! #   (func (export "ndx") (param i32 i32 i32 i32 i32) (result i32) local.get 3)
//! #   (func (export "mdx") (param i32 i32 i32 i32 i32) (result i32) local.get 4))"#).unwrap();
//! # let manager = CredentialManager::new(StaticBundleSource::default(), module);
//!
//! let mirror = "https://mirror.example.com:8443/api".parse().unwrap();
//! SalterAuthMiddleware::new(manager)
//!     .with_predicate(ServiceOrigin::default().or(ServiceOrigin::new(&mirror)));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{borrow::Cow, fmt};

use bytes::{BufMut, BytesMut};
use nepse_clock::{Clock, System};
use nepse_tokens::{sources::BundleSource, CredentialManager, AUTHORIZATION_SCHEME};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode, Url};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// A middleware that injects the `Salter` authorization into outgoing requests
pub struct SalterAuthMiddleware<S, C = System, P = ServiceOrigin> {
    manager: CredentialManager<S, C>,
    predicate: P,
}

impl<S, C> SalterAuthMiddleware<S, C, ServiceOrigin> {
    /// Construct a new middleware from a credential manager
    ///
    /// By default, this middleware will only send credentials to the
    /// service's own origin. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(manager: CredentialManager<S, C>) -> Self {
        Self {
            manager,
            predicate: ServiceOrigin::default(),
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> SalterAuthMiddleware<S, C, P> {
        SalterAuthMiddleware {
            manager: self.manager,
            predicate,
        }
    }
}

impl<S, C, P> SalterAuthMiddleware<S, C, P>
where
    S: BundleSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn authorization(&self) -> Result<header::HeaderValue> {
        let credentials = self.manager.credentials().await.map_err(Error::middleware)?;

        tracing::trace!(
            credentials.obtained_at = credentials.obtained_at().0,
            credentials.salts = ?credentials.salts(),
            "obtained credentials"
        );

        let token = credentials.access_token().as_str();
        let mut header_value = BytesMut::with_capacity(AUTHORIZATION_SCHEME.len() + 1 + token.len());
        header_value.put_slice(AUTHORIZATION_SCHEME.as_bytes());
        header_value.put_u8(b' ');
        header_value.put_slice(token.as_bytes());

        let mut value =
            header::HeaderValue::from_maybe_shared(header_value.freeze()).map_err(Error::middleware)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait::async_trait]
impl<S, C, P> Middleware for SalterAuthMiddleware<S, C, P>
where
    S: BundleSource + 'static,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let retry = req.try_clone();
        req.headers_mut()
            .insert(header::AUTHORIZATION, self.authorization().await?);

        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(mut retry) = retry else {
            tracing::debug!("credentials rejected, but request cannot be replayed");
            return Ok(resp);
        };

        tracing::debug!("credentials rejected, forcing update and retrying");
        self.manager
            .force_update()
            .await
            .map_err(Error::middleware)?;

        retry
            .headers_mut()
            .insert(header::AUTHORIZATION, self.authorization().await?);
        next.run(retry, extensions).await
    }
}

impl<S, C, P> Clone for SalterAuthMiddleware<S, C, P>
where
    P: Clone,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S, C, P> fmt::Debug for SalterAuthMiddleware<S, C, P>
where
    P: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SalterAuthMiddleware")
            .field("manager", &format_args!("CredentialManager {{ .. }}"))
            .field("predicate", &self.predicate)
            .finish()
    }
}

/// Only attach credentials to requests whose origin (scheme, host and
/// port) matches one known origin
///
/// Opaque origins, such as those of `data:` URLs, never match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceOrigin {
    origin: Option<Cow<'static, str>>,
}

impl ServiceOrigin {
    /// The origin serving the NEPSE API
    pub const NEPSE: &'static str = "https://www.nepalstock.com";

    /// Admits requests sharing the origin of `base`
    pub fn new(base: &Url) -> Self {
        let origin = base.origin();
        Self {
            origin: origin
                .is_tuple()
                .then(|| Cow::Owned(origin.ascii_serialization())),
        }
    }

    fn request_origin(req: &Request) -> String {
        req.url().origin().ascii_serialization()
    }
}

impl Default for ServiceOrigin {
    fn default() -> Self {
        Self {
            origin: Some(Cow::Borrowed(Self::NEPSE)),
        }
    }
}

impl Predicate<Request> for ServiceOrigin {
    fn eval(&self, req: &Request) -> bool {
        self.origin.as_deref() == Some(Self::request_origin(req).as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result)
                .add_product(reflection::Product::new("origin", Self::request_origin(req)))
        })
    }
}

impl reflection::PredicateReflection for ServiceOrigin {}
impl fmt::Display for ServiceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "origin == {}", origin),
            None => f.write_str("origin is opaque"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use nepse_tokens::{
        module::{DerivationFn, DerivationFunctions, ModuleError},
        sources::StaticBundleSource,
        TokenBundle,
    };
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    const SERVICE_URL: &str = "https://www.nepalstock.com/api/nots/nepse-data/market-open";
    const FIRST_AUTHORIZATION: &str = "Salter first-token";
    const SECOND_AUTHORIZATION: &str = "Salter second-token";

    /// Strips the leading byte of every raw token
    struct LeadingByte;

    impl DerivationFunctions for LeadingByte {
        fn call(&self, _: DerivationFn, _: [i32; 5]) -> std::result::Result<i32, ModuleError> {
            Ok(0)
        }
    }

    fn bundle(access: &str) -> TokenBundle {
        TokenBundle {
            salt1: 1,
            salt2: 2,
            salt3: 3,
            salt4: 4,
            salt5: 5,
            access_token: format!("X{access}"),
            refresh_token: "Xrefresh".into(),
            server_time: 0,
        }
    }

    fn prepare_middleware(
        access_tokens: &[&str],
    ) -> SalterAuthMiddleware<StaticBundleSource, System, ServiceOrigin> {
        let source = StaticBundleSource::from_sequence(access_tokens.iter().map(|t| bundle(t)));
        SalterAuthMiddleware::new(CredentialManager::new(source, LeadingByte))
    }

    struct AuthChecker {
        expected_authorization: String,
        checked: AtomicBool,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header")
                .to_str()
                .expect("authorization header was not valid UTF-8");

            assert_eq!(authorization_header, self.expected_authorization);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    /// Rejects every request not carrying the expected authorization
    struct Gatekeeper {
        accepted_authorization: &'static str,
        requests: AtomicUsize,
    }

    impl Gatekeeper {
        fn new(accepted_authorization: &'static str) -> Self {
            Self {
                accepted_authorization,
                requests: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Gatekeeper {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            self.requests.fetch_add(1, Ordering::AcqRel);

            let accepted = req
                .headers()
                .get(header::AUTHORIZATION)
                .map_or(false, |value| value == self.accepted_authorization);
            let status = if accepted {
                http::StatusCode::OK
            } else {
                http::StatusCode::UNAUTHORIZED
            };

            let resp = http::Response::builder()
                .status(status)
                .body(&b""[..])
                .expect("valid response");
            Ok(resp.into())
        }
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_for_service_origin() {
            let middleware = prepare_middleware(&["first-token"]);
            let auth_checker = Arc::new(AuthChecker::new(FIRST_AUTHORIZATION));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get(SERVICE_URL).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        async fn assert_skipped(url: &str) {
            let middleware = prepare_middleware(&["first-token"]);
            let auth_checker = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(middleware.clone())
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get(url).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
            assert_eq!(middleware.manager.source().initial_fetches(), 0);
        }

        #[tokio::test]
        async fn middleware_with_defaults_skips_plain_http_request() {
            assert_skipped("http://www.nepalstock.com/api/nots").await;
        }

        #[tokio::test]
        async fn middleware_with_defaults_skips_foreign_host() {
            assert_skipped("https://example.com/api/nots").await;
        }

        #[tokio::test]
        async fn credential_failure_fails_the_request() {
            let middleware = prepare_middleware(&[]);
            let auth_checker = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let err = client.get(SERVICE_URL).send().await.unwrap_err();

            assert!(matches!(err, Error::Middleware(_)));
            assert!(!auth_checker.checked.load(Ordering::Acquire));
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token() {
                let middleware = prepare_middleware(&["first-token"])
                    .with_predicate(predicate::never());
                let auth_checker = Arc::new(NoAuthChecker::default());

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get(SERVICE_URL).send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }
    }

    mod when_service_rejects_the_token {
        use super::*;

        #[tokio::test]
        async fn middleware_updates_credentials_and_retries_once() {
            let middleware = prepare_middleware(&["first-token", "second-token"]);
            let gatekeeper = Arc::new(Gatekeeper::new(SECOND_AUTHORIZATION));

            let client = ClientBuilder::new(Client::default())
                .with(middleware.clone())
                .with_arc(gatekeeper.clone())
                .build();

            let resp = client.get(SERVICE_URL).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(gatekeeper.requests.load(Ordering::Acquire), 2);
            assert_eq!(middleware.manager.source().initial_fetches(), 2);
        }

        #[tokio::test]
        async fn middleware_gives_up_after_one_retry() {
            let middleware = prepare_middleware(&["first-token", "still-wrong"]);
            let gatekeeper = Arc::new(Gatekeeper::new("Salter never-issued"));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(gatekeeper.clone())
                .build();

            let resp = client.get(SERVICE_URL).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            assert_eq!(gatekeeper.requests.load(Ordering::Acquire), 2);
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            const OVERRIDE_TOKEN: &str = "overridden!";
            // Reqwest uses a capital `B` bearer
            const BEARER_OVERRIDE_TOKEN: &str = "Bearer overridden!";

            let middleware = prepare_middleware(&["first-token"]);
            let auth_checker = Arc::new(AuthChecker::new(BEARER_OVERRIDE_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(middleware.clone())
                .with_arc(auth_checker.clone())
                .build();

            let resp = client
                .get(SERVICE_URL)
                .bearer_auth(OVERRIDE_TOKEN)
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
            assert_eq!(middleware.manager.source().initial_fetches(), 0);
        }
    }

    mod service_origin_predicate {
        use super::*;

        fn request(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        #[test]
        fn default_matches_service_paths() {
            let origin = ServiceOrigin::default();
            let result = dbg!(origin.find_case(true, &request(SERVICE_URL)));
            assert!(result.is_none())
        }

        #[test]
        fn default_port_is_the_same_origin() {
            let req = request("https://www.nepalstock.com:443/api");
            assert!(ServiceOrigin::default().eval(&req));
        }

        #[test]
        fn rejects_other_scheme_host_or_port() {
            let predicate = ServiceOrigin::default();
            for url in [
                "http://www.nepalstock.com/api",
                "https://nepalstock.com/api",
                "https://www.nepalstock.com:8443/api",
            ] {
                let case = predicate.find_case(true, &request(url));
                let case = dbg!(case).expect("origin should not match");
                let origin = case.products().next().expect("origin product");
                assert_eq!(origin.name(), "origin");
            }
        }

        #[test]
        fn custom_origin_ignores_path_of_base() {
            let base = "https://mirror.example.com:8443/deep/path".parse().unwrap();
            let predicate = ServiceOrigin::new(&base);
            assert!(predicate.eval(&request("https://mirror.example.com:8443/api")));
            assert!(!predicate.eval(&request(SERVICE_URL)));
            assert_eq!(predicate.to_string(), "origin == https://mirror.example.com:8443");
        }

        #[test]
        fn opaque_origin_never_matches() {
            let base = "data:text/plain,hello".parse().unwrap();
            let predicate = ServiceOrigin::new(&base);
            assert!(!predicate.eval(&request("data:text/plain,hello")));
            assert_eq!(predicate.to_string(), "origin is opaque");
        }

        #[test]
        fn composes_with_other_predicates() {
            let mirror = "https://mirror.example.com".parse().unwrap();
            let predicate = ServiceOrigin::default().or(ServiceOrigin::new(&mirror));
            assert!(predicate.eval(&request(SERVICE_URL)));
            assert!(predicate.eval(&request("https://mirror.example.com/api")));
            assert!(!predicate.eval(&request("https://example.com/api")));
        }
    }
}

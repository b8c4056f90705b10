//! A bundle source that speaks to the service over HTTP

use std::future::Future;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use thiserror::Error;

use super::BundleSource;
use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler},
    RefreshTokenRef, TokenBundle,
};

/// The service's public base URL
pub const DEFAULT_BASE_URL: &str = "https://www.nepalstock.com";

const PROVE_PATH: &str = "/api/authenticate/prove";
const REFRESH_PATH: &str = "/api/authenticate/refresh-token";

/// Fetches token bundles from the service's authentication endpoints
#[derive(Debug, Clone)]
pub struct HttpBundleSource {
    client: reqwest::Client,
    base_url: reqwest::Url,
    prove_url: reqwest::Url,
    refresh_url: reqwest::Url,
    backoff: ErrorBackoffConfig,
}

impl HttpBundleSource {
    /// Constructs a new source against `base_url`
    pub fn new(client: reqwest::Client, base_url: reqwest::Url) -> Result<Self, url::ParseError> {
        Ok(Self {
            prove_url: base_url.join(PROVE_PATH)?,
            refresh_url: base_url.join(REFRESH_PATH)?,
            base_url,
            client,
            backoff: ErrorBackoffConfig::default(),
        })
    }

    /// Constructs a new source against the service's public address
    pub fn with_default_base_url(client: reqwest::Client) -> Result<Self, url::ParseError> {
        Self::new(client, reqwest::Url::parse(DEFAULT_BASE_URL)?)
    }

    /// Replaces the retry policy applied to connection failures, server
    /// errors, and rate limiting
    pub fn with_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// The configured base URL
    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    fn request(&self, url: &reqwest::Url) -> reqwest::RequestBuilder {
        let origin = self.base_url.origin().ascii_serialization();
        self.client
            .get(url.clone())
            .header(header::ACCEPT, "application/json, text/plain, */*")
            .header(header::ORIGIN, origin.as_str())
            .header(header::REFERER, format!("{}/", origin))
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-origin")
    }

    #[tracing::instrument(err, skip(self, url, authorization), fields(url = %url))]
    async fn request_bundle(
        &self,
        url: &reqwest::Url,
        authorization: Option<header::HeaderValue>,
    ) -> Result<TokenBundle, BundleRequestError> {
        tracing::trace!("requesting token bundle");

        let resp = send_with_backoff(&self.backoff, || {
            let req = match &authorization {
                Some(value) => self.request(url).header(header::AUTHORIZATION, value.clone()),
                None => self.request(url),
            };
            req.send()
        })
        .await?;
        read_bundle(resp).await
    }
}

/// Sends a request built by `send`, resending it after connection failures,
/// timeouts, server errors, and rate limiting until the budget is spent
async fn send_with_backoff<F, Fut>(
    backoff: &ErrorBackoffConfig,
    mut send: F,
) -> Result<reqwest::Response, BundleRequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut handler = ErrorBackoffHandler::new(backoff.clone());
    loop {
        let result = send().await;

        let retry_reason = match &result {
            Ok(resp) if is_retryable_status(resp.status()) => {
                Some(format!("status {}", resp.status().as_u16()))
            }
            Ok(_) => None,
            Err(error) if error.is_connect() || error.is_timeout() => Some(error.to_string()),
            Err(_) => None,
        };

        let Some(reason) = retry_reason else {
            return result.map_err(BundleRequestError::RequestSend);
        };

        let Some(delay) = handler.error() else {
            tracing::debug!(%reason, "bundle request retries exhausted");
            return result.map_err(BundleRequestError::RequestSend);
        };

        tracing::warn!(
            %reason,
            delay_ms = delay.as_millis() as u64,
            "bundle request failed, will retry"
        );
        tokio::time::sleep(delay).await;
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// The `Authorization` value presenting a refresh token to the service
fn refresh_authorization(
    refresh_token: &RefreshTokenRef,
) -> Result<header::HeaderValue, header::InvalidHeaderValue> {
    let mut value = header::HeaderValue::from_str(&refresh_token.to_authorization())?;
    value.set_sensitive(true);
    Ok(value)
}

/// An error while attempting to request a bundle from the service
#[derive(Debug, Error)]
pub enum BundleRequestError {
    /// The service answered with an error status
    #[error("error requesting token bundle: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the bundle
    #[error("error deserializing token bundle")]
    BundleBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send the request
    #[error("error sending request to service")]
    RequestSend(#[source] reqwest::Error),
    /// The refresh token cannot be expressed as a header value
    #[error("refresh token is not a valid header value")]
    InvalidCredential(#[from] header::InvalidHeaderValue),
}

async fn read_bundle(resp: reqwest::Response) -> Result<TokenBundle, BundleRequestError> {
    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token bundle response"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(BundleRequestError::BodyReadError)?;
        return Err(BundleRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(BundleRequestError::BodyReadError)?;
    let bundle: TokenBundle = serde_json::from_slice(&body)?;

    tracing::debug!(?bundle, "decoded token bundle");
    Ok(bundle)
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    type Error = BundleRequestError;

    async fn fetch_initial_bundle(&self) -> Result<TokenBundle, Self::Error> {
        self.request_bundle(&self.prove_url, None).await
    }

    async fn fetch_refreshed_bundle(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<TokenBundle, Self::Error> {
        let authorization = refresh_authorization(refresh_token)?;
        self.request_bundle(&self.refresh_url, Some(authorization))
            .await
    }
}

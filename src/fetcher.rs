use std::time::Duration;

use futures::{StreamExt, stream};
use rand::Rng;
use reqwest::{Client, StatusCode, header};

use crate::config::Config;
use crate::debug_sink::DebugSink;
use crate::types::Currency;

/// Browser user agents rotated per request so the source site does not
/// throttle a single identity.
const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:95.0) Gecko/20100101 Firefox/95.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/94.0.4606.81 Safari/537.36",
];

const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,uk;q=0.8,ru;q=0.7";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Request for {currency} failed: {source}")]
    Http {
        currency: Currency,
        #[source]
        source: reqwest::Error,
    },
    #[error("Giving up on {currency} after {attempts} attempts: {source}")]
    RetriesExhausted {
        currency: Currency,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    base_url: String,
    city: String,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    max_concurrency: usize,
}

impl Fetcher {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            city: config.city.clone(),
            max_retries: config.max_retries.max(1),
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            max_concurrency: config.max_concurrency.max(1),
        })
    }

    pub fn target_url(&self, currency: Currency) -> String {
        format!("{}{}/{}/", self.base_url, self.city, currency.slug())
    }

    /// Fetch all targets with bounded parallelism. Each target resolves to
    /// its own result; one slow or failing currency never blocks or aborts
    /// the others.
    pub async fn fetch_all(
        &self,
        currencies: &[Currency],
        sink: &DebugSink,
    ) -> Vec<(Currency, Result<String, FetchError>)> {
        stream::iter(currencies.iter().copied())
            .map(|currency| async move { (currency, self.fetch_one(currency, sink).await) })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }

    async fn fetch_one(
        &self,
        currency: Currency,
        sink: &DebugSink,
    ) -> Result<String, FetchError> {
        let url = self.target_url(currency);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            log::info!(
                "Fetching {} (attempt {}/{})...",
                url,
                attempt,
                self.max_retries
            );
            match self.get_html(&url).await {
                Ok(body) => {
                    sink.write(&format!("{}_page.html", currency.slug()), &body);
                    return Ok(body);
                }
                Err(e) if !is_transient(&e) => {
                    log::error!("Permanent failure for {}: {}", currency, e);
                    return Err(FetchError::Http {
                        currency,
                        source: e,
                    });
                }
                Err(e) if attempt >= self.max_retries => {
                    log::error!(
                        "Failed to fetch {} after {} attempts: {}",
                        currency,
                        attempt,
                        e
                    );
                    return Err(FetchError::RetriesExhausted {
                        currency,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt - 1);
                    log::warn!(
                        "Request for {} failed: {}. Retrying in {:?} (attempt {}/{})",
                        currency,
                        e,
                        delay,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn get_html(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .header(header::USER_AGENT, random_user_agent())
            .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())]
}

/// Exponential backoff: `base * 2^attempt`, capped.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() || err.is_body() {
        return true;
    }
    err.status().is_some_and(transient_status)
}

fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, cap, 10), cap);
        assert_eq!(backoff_delay(base, cap, 31), cap);
        // Overflowing shift saturates instead of wrapping back down.
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(transient_status(StatusCode::BAD_GATEWAY));
        assert!(transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(transient_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!transient_status(StatusCode::BAD_REQUEST));
        assert!(!transient_status(StatusCode::FORBIDDEN));
        assert!(!transient_status(StatusCode::NOT_FOUND));
        assert!(!transient_status(StatusCode::GONE));
    }

    #[test]
    fn target_url_follows_site_scheme() {
        let config = Config {
            base_url: "https://minfin.com.ua/currency/banks/".to_string(),
            city: "kiev".to_string(),
            ..Config::default()
        };
        let fetcher = Fetcher::new(&config).expect("client should build");
        assert_eq!(
            fetcher.target_url(Currency::Usd),
            "https://minfin.com.ua/currency/banks/kiev/usd/"
        );
        assert_eq!(
            fetcher.target_url(Currency::Eur),
            "https://minfin.com.ua/currency/banks/kiev/eur/"
        );
    }
}

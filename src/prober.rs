use log::debug;
use regex::Regex;
use reqwest::Client;
use std::{error::Error as _, fmt::Write as _, time::Duration};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::Result;
use crate::model::ProbeResult;

/// What a single GET produced, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpOutcome {
    Response { status: u16, body: String },
    Failure(String),
}

/// Turns an HTTP outcome into a [`ProbeResult`].
pub fn classify(
    url: &str,
    elapsed_ms: u64,
    outcome: HttpOutcome,
    pattern: &Regex,
) -> ProbeResult {
    match outcome {
        HttpOutcome::Response { status, body } => {
            ProbeResult::response(url, elapsed_ms, status, &body, pattern)
        }
        HttpOutcome::Failure(error) => ProbeResult::network_error(url, elapsed_ms, error),
    }
}

/// Checks one site: a single GET, timed, with the body matched against the
/// content pattern.
#[derive(Debug, Clone)]
pub struct SiteProber {
    url: String,
    pattern: Regex,
    timeout: Duration,
}

impl SiteProber {
    pub fn new(config: &Config) -> Self {
        Self::with_target(&config.site_url, config.content_regex.clone(), config.timeout())
    }

    pub fn with_target(url: &str, pattern: Regex, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            pattern,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs the check. Network failures are reported inside the result;
    /// only failing to build the HTTP client is an error.
    pub async fn check(&self) -> Result<ProbeResult> {
        // A new client without idle pooling opens a new connection every
        // time, so a check never rides on a connection that already worked.
        let client = Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        debug!("Checking site: GET {}", self.url);
        let start = Instant::now();
        let outcome = fetch(&client, &self.url).await;
        let elapsed_ms = round_millis(start.elapsed());

        Ok(classify(&self.url, elapsed_ms, outcome, &self.pattern))
    }
}

async fn fetch(client: &Client, url: &str) -> HttpOutcome {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(err) => return HttpOutcome::Failure(report(&err)),
    };
    let status = response.status().as_u16();

    // The body is part of the fetch: failing to read it is a network failure.
    match response.text().await {
        Ok(body) => HttpOutcome::Response { status, body },
        Err(err) => HttpOutcome::Failure(report(&err)),
    }
}

/// Error message with its whole source chain, which is where reqwest keeps
/// the interesting part (connection refused, DNS failure, ...).
fn report(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    message
}

fn round_millis(elapsed: Duration) -> u64 {
    let micros = elapsed.as_micros();
    u64::try_from((micros + 500) / 1000).unwrap_or(u64::MAX)
}

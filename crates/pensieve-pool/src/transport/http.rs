//! NIP-11 document retrieval over HTTP.

use std::time::Duration;

use pensieve_core::RelayInformationDocument;
use pensieve_core::nip11::NIP11_ACCEPT;
use reqwest::header::ACCEPT;

use super::{BoxedFuture, InfoFetcher};
use crate::relay::info_document_url;
use crate::{Error, Result};

/// Fetches relay information documents with reqwest.
#[derive(Debug, Clone)]
pub struct HttpInfoFetcher {
    client: reqwest::Client,
}

impl HttpInfoFetcher {
    /// Build a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pensieve-pool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InfoFetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl InfoFetcher for HttpInfoFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxedFuture<'a, Result<RelayInformationDocument>> {
        Box::pin(async move {
            let http_url = info_document_url(url)?;

            let resp = self
                .client
                .get(&http_url)
                .header(ACCEPT, NIP11_ACCEPT)
                .send()
                .await
                .map_err(|e| Error::InfoFetch(format!("{url}: {e}")))?;

            if !resp.status().is_success() {
                return Err(Error::InfoFetch(format!(
                    "{url}: HTTP {}",
                    resp.status().as_u16()
                )));
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| Error::InfoFetch(format!("{url}: {e}")))?;
            Ok(serde_json::from_slice(&body)?)
        })
    }
}

//! Archive retrieval
//!
//! The installer only talks to the [`Fetcher`] trait; [`HttpFetcher`] is the
//! production implementation (HTTP(S) via reqwest, `file://` from disk).

use crate::error::FetchError;
use chrono::{NaiveDateTime, Utc};
use reqwest::{StatusCode, Url};

/// Timestamp layout of the `X-Amz-Date` query parameter
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Source of archive bytes
///
/// Deadlines are enforced by the caller, so implementations may block on
/// network I/O for as long as the future is polled.
#[allow(async_fn_in_trait)]
pub trait Fetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches over HTTP(S) or from the local filesystem
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::NetworkUnavailable(format!("cannot build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    async fn fetch_http(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let presigned = presigned_expiry(&url);
        if let Some(expires_at) = presigned {
            if Utc::now().timestamp() >= expires_at {
                tracing::debug!("Pre-signed URL expired at unix:{}", expires_at);
                return Err(FetchError::Expired);
            }
        }

        let response = self.client.get(url).send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, presigned.is_some()));
        }

        let bytes = response.bytes().await.map_err(classify_reqwest)?;
        Ok(bytes.to_vec())
    }

    async fn fetch_file(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::NetworkUnavailable(format!("invalid file URL: {url}")))?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound),
            Err(e) => Err(FetchError::NetworkUnavailable(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url)
            .map_err(|e| FetchError::NetworkUnavailable(format!("invalid URL {url:?}: {e}")))?;

        match parsed.scheme() {
            "file" => self.fetch_file(&parsed).await,
            "http" | "https" => self.fetch_http(parsed).await,
            other => Err(FetchError::NetworkUnavailable(format!(
                "unsupported URL scheme {other:?}"
            ))),
        }
    }
}

/// Map a non-success HTTP status to a fetch failure
pub fn classify_status(status: StatusCode, presigned: bool) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound,
        // S3 answers 403 once a pre-signed URL's window has closed
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED if presigned => FetchError::Expired,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => FetchError::NotFound,
        other => FetchError::NetworkUnavailable(format!("server answered {other}")),
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_connect() {
        FetchError::NetworkUnavailable(format!("cannot connect: {err}"))
    } else {
        FetchError::NetworkUnavailable(err.to_string())
    }
}

/// Expiry (unix seconds) of an AWS SigV4 pre-signed URL, if it is one
///
/// Reads `X-Amz-Date` (`YYYYMMDDTHHMMSSZ`) and `X-Amz-Expires` (seconds).
/// A lifetime too large to represent is treated as never expiring.
pub fn presigned_expiry(url: &Url) -> Option<i64> {
    let mut signed_at = None;
    let mut lifetime = None;

    for (key, value) in url.query_pairs() {
        if key.eq_ignore_ascii_case("X-Amz-Date") {
            signed_at = parse_amz_date(&value);
        } else if key.eq_ignore_ascii_case("X-Amz-Expires") {
            lifetime = value.parse::<u64>().ok().and_then(|secs| i64::try_from(secs).ok());
        }
    }

    signed_at?.checked_add(lifetime?)
}

/// Parse `20251023T140226Z` into unix seconds
fn parse_amz_date(value: &str) -> Option<i64> {
    let signed = NaiveDateTime::parse_from_str(value, AMZ_DATE_FORMAT).ok()?;
    Some(signed.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMET_URL: &str = "https://www.perplexity.ai/rest/browser/binaries/141.0.7390.23964/comet_latest.dmg?X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Date=20251023T140226Z&X-Amz-Expires=300&X-Amz-SignedHeaders=host";

    #[test]
    fn test_parse_amz_date() {
        assert_eq!(parse_amz_date("19700101T000000Z"), Some(0));
        assert_eq!(parse_amz_date("20000301T000000Z"), Some(951_868_800));
        assert_eq!(parse_amz_date("20251023T140226Z"), Some(1_761_228_146));
        assert_eq!(parse_amz_date("2025-10-23"), None);
        assert_eq!(parse_amz_date("20251323T140226Z"), None);
    }

    #[test]
    fn test_presigned_expiry() {
        let url = Url::parse(COMET_URL).unwrap();
        assert_eq!(presigned_expiry(&url), Some(1_761_228_146 + 300));

        let plain = Url::parse("https://example.com/comet_latest.dmg").unwrap();
        assert_eq!(presigned_expiry(&plain), None);
    }

    #[test]
    fn test_oversized_lifetime_never_expires() {
        for lifetime in ["18446744073709551615", "9223372036854775807", "99999999999999999999"] {
            let url = Url::parse(&format!(
                "https://example.com/comet_latest.dmg?X-Amz-Date=20251023T140226Z&X-Amz-Expires={lifetime}"
            ))
            .unwrap();
            assert_eq!(presigned_expiry(&url), None);
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND, false), FetchError::NotFound);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, true), FetchError::Expired);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, false), FetchError::NotFound);
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, false),
            FetchError::NetworkUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_presigned_url_fails_without_request() {
        let fetcher = HttpFetcher::new("appdrop-test").unwrap();
        assert_eq!(fetcher.fetch(COMET_URL).await, Err(FetchError::Expired));
    }

    #[tokio::test]
    async fn test_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("comet.tar");
        std::fs::write(&archive, b"payload").unwrap();

        let fetcher = HttpFetcher::new("appdrop-test").unwrap();
        let url = Url::from_file_path(&archive).unwrap();
        assert_eq!(fetcher.fetch(url.as_str()).await.unwrap(), b"payload");

        let missing = Url::from_file_path(dir.path().join("missing.tar")).unwrap();
        assert_eq!(fetcher.fetch(missing.as_str()).await, Err(FetchError::NotFound));
    }
}

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{
    Method, Url,
    header::{ACCEPT_ENCODING, RANGE},
    redirect::Policy,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::RetryTransientMiddleware;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::credentials::Credentials;
use crate::descriptor::Mirror;
use crate::error::{MetadlError, TransportError};
use crate::response_info::ResponseInfo;
use crate::transport::{
    ContentEncoding, FetchRequest, FetchStream, ResourceInfo, TransportAdapter,
};

pub const MAX_REDIRECTS: usize = 20;

const WANT_DIGEST: &str = "sha-512;q=1, sha-384;q=0.9, sha-256;q=0.8, sha;q=0.2, md5;q=0.1";
const WANT_REPR_DIGEST: &str = "sha-512=9, sha-384=8, sha-256=7, sha-1=1, md5=1";

/// HTTP and HTTPS over a shared reqwest client with retry middleware.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ClientWithMiddleware,
    allow_gzip: bool,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, MetadlError> {
        let mut client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(proxy) = &config.proxy {
            client = client.proxy(proxy.clone());
        }
        if let Some(headers) = &config.headers {
            client = client.default_headers(headers.clone());
        }
        let client = client.build().map_err(|e| MetadlError::Config {
            message: format!("Failed to build HTTP client: {}", e),
        })?;

        Ok(Self {
            client: ClientBuilder::new(client)
                .with(RetryTransientMiddleware::new_with_policy(
                    config.http_retry_policy(),
                ))
                .build(),
            allow_gzip: config.allow_gzip,
        })
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url.clone())
            // servers implementing either digest RFC tell us the whole-file hash
            .header("Want-Digest", WANT_DIGEST)
            .header("Want-Repr-Digest", WANT_REPR_DIGEST);
        if let Some(creds) = Credentials::from_url(url) {
            req = req.basic_auth(creds.username(), creds.password());
        }
        req
    }

    fn resource_info(info: &ResponseInfo, encoding: ContentEncoding) -> ResourceInfo {
        ResourceInfo {
            total_size: if info.content_encoding().is_some() {
                None
            } else {
                info.total_length()
            },
            final_url: Some(info.url().clone()),
            instance_digests: info.instance_digests(),
            mirrors: info.duplicate_links(),
            last_modified: info.parse_last_modified(),
            supports_range: info.accepts_ranges() || info.is_partial(),
            encoding,
        }
    }

    /// Rejects responses whose byte window or total size disagrees with
    /// what was asked for.
    fn check_response(info: &ResponseInfo, request: &FetchRequest) -> Result<(), TransportError> {
        let url = info.url().as_str();
        let range = request.range;
        if !range.is_full() {
            if info.is_partial() {
                if let Some(cr) = info.content_range() {
                    if cr.start != range.start {
                        return Err(TransportError::size_mismatch(format!(
                            "{} returned bytes from {} instead of {}",
                            url, cr.start, range.start
                        )));
                    }
                    if let (Some(total), Some(expected)) = (cr.total, request.expected_size) {
                        if total != expected {
                            return Err(TransportError::size_mismatch(format!(
                                "{} reports {} bytes, expected {}",
                                url, total, expected
                            )));
                        }
                    }
                }
                return Ok(());
            }
            if range.start > 0 {
                return Err(TransportError::size_mismatch(format!(
                    "{} ignored the range request",
                    url
                )));
            }
        }
        if info.content_encoding().is_none() {
            if let (Some(total), Some(expected)) = (info.total_length(), request.expected_size) {
                if total != expected {
                    return Err(TransportError::size_mismatch(format!(
                        "{} reports {} bytes, expected {}",
                        url, total, expected
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports_range(&self) -> bool {
        true
    }

    fn negotiate_encoding(&self, request: &FetchRequest) -> ContentEncoding {
        if self.allow_gzip && request.single_segment && request.range.is_full() {
            ContentEncoding::Gzip
        } else {
            ContentEncoding::Identity
        }
    }

    async fn resolve_redirect(&self, url: &Url) -> Result<Url, TransportError> {
        let resp = self.request(Method::HEAD, url).send().await?;
        let info = ResponseInfo::from(&resp);
        if let Some(err) = info.status_error() {
            return Err(err);
        }
        Ok(info.url().clone())
    }

    async fn probe(&self, mirror: &Mirror) -> Result<ResourceInfo, TransportError> {
        let resp = self.request(Method::HEAD, &mirror.url).send().await?;
        let info = ResponseInfo::from(&resp);
        if let Some(err) = info.status_error() {
            return Err(err);
        }
        debug!(url = %info.url(), size = ?info.total_length(), "Probed HTTP mirror");
        Ok(Self::resource_info(&info, ContentEncoding::Identity))
    }

    async fn open(&self, request: &FetchRequest) -> Result<FetchStream, TransportError> {
        let encoding = self.negotiate_encoding(request);
        let mut req = self.request(Method::GET, &request.mirror.url);
        if !request.range.is_full() {
            req = req.header(RANGE, request.range.header_value());
        }
        if encoding == ContentEncoding::Identity {
            req = req.header(ACCEPT_ENCODING, "identity");
        }
        trace!(url = %request.mirror.url, range = %request.range.header_value(), "Opening HTTP stream");

        let resp = req.send().await?;
        let info = ResponseInfo::from(&resp);
        if let Some(err) = info.status_error() {
            return Err(err);
        }
        Self::check_response(&info, request)?;

        let body = resp.bytes_stream().map_err(TransportError::from);
        Ok(FetchStream {
            info: Self::resource_info(&info, encoding),
            body: Box::pin(body),
        })
    }
}

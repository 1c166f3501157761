use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{
    Response, Url,
    header::{
        ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, LAST_MODIFIED,
        LINK,
    },
};

use crate::descriptor::{DEFAULT_PREFERENCE, Mirror};
use crate::error::TransportError;
use crate::hash::{HashAlgorithm, HashDigest};

/// Status, final URL and headers of an HTTP response, detached from its body.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    status_code: u16,
    request_url: Url,
    response_headers: HeaderMap,
}

impl ResponseInfo {
    pub fn new(status_code: u16, request_url: Url, response_headers: HeaderMap) -> Self {
        Self {
            status_code,
            request_url,
            response_headers,
        }
    }

    pub fn is_successful(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn url(&self) -> &Url {
        &self.request_url
    }

    /// Maps a non-success status to a transport error.
    pub fn status_error(&self) -> Option<TransportError> {
        TransportError::from_status(self.status_code, self.request_url.as_str())
    }

    fn header_str(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.response_headers
            .get(name)
            .and_then(|val| val.to_str().ok())
    }

    /// Retrieve the content_length of the response.
    ///
    /// Returns None if the "content-length" header is missing or if its value
    /// is not a u64.
    pub fn content_length(&self) -> Option<u64> {
        self.header_str(CONTENT_LENGTH)
            .and_then(|s| s.trim().parse::<u64>().ok())
    }

    /// Returns the total length of the resource, even if this is a partial response.
    pub fn total_length(&self) -> Option<u64> {
        if let Some(total) = self.content_range().and_then(|cr| cr.total) {
            return Some(total);
        }
        if self.is_partial() {
            return None;
        }
        self.content_length()
    }

    /// Extracts content range value from response headers
    pub fn content_range(&self) -> Option<ContentRange> {
        self.header_str(CONTENT_RANGE).and_then(|header| {
            CONTENT_RANGE_RE.captures(header.trim()).and_then(|caps| {
                let start = caps.get(1)?.as_str().parse().ok()?;
                let end = caps.get(2)?.as_str().parse().ok()?;
                let total = match caps.get(3)?.as_str() {
                    "*" => None,
                    n => n.parse().ok(),
                };
                Some(ContentRange { start, end, total })
            })
        })
    }

    /// Checks whether server indicates that it accepts ranges
    pub fn accepts_ranges(&self) -> bool {
        self.header_str(ACCEPT_RANGES)
            .map(|s| !s.trim().eq_ignore_ascii_case("none"))
            .unwrap_or(false)
    }

    pub fn is_partial(&self) -> bool {
        self.status_code == 206
    }

    /// Lowercased `Content-Encoding`, ignoring `identity`.
    pub fn content_encoding(&self) -> Option<String> {
        self.header_str(CONTENT_ENCODING)
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty() && s != "identity")
    }

    /// Parses the "Last-Modified" header from the response into a unix timestamp.
    ///
    /// Returns None if the header is missing or cannot be parsed.
    pub fn parse_last_modified(&self) -> Option<i64> {
        self.header_str(LAST_MODIFIED).and_then(|date_str| {
            DateTime::parse_from_rfc2822(date_str)
                .map(|dt| dt.with_timezone(&Utc).timestamp())
                .ok()
        })
    }

    /// Collects every whole-file digest the server advertised.
    ///
    /// Sources: `Digest` (RFC 3230), `Content-Digest` and `Repr-Digest`
    /// (RFC 9530), `X-Checksum-*`, `Content-SHA256` and `Content-MD5`. Body
    /// digests are skipped on partial responses.
    /// Values that do not decode to the algorithm's length are dropped. The
    /// first value seen for an algorithm wins; result is strongest first.
    pub fn instance_digests(&self) -> Vec<HashDigest> {
        let mut hashes: Vec<HashDigest> = Vec::new();
        let mut push = |digest: Option<HashDigest>| {
            if let Some(digest) = digest {
                if !hashes.iter().any(|h| h.algorithm() == digest.algorithm()) {
                    hashes.push(digest);
                }
            }
        };

        for header in ["Digest", "Content-Digest", "Repr-Digest"] {
            // Content-Digest of a 206 covers only the returned range
            if header == "Content-Digest" && self.is_partial() {
                continue;
            }
            for value in self.response_headers.get_all(header) {
                let Ok(s) = value.to_str() else { continue };
                for (alg, digest) in parse_digest_list(s) {
                    push(alg.and_then(|a| HashDigest::parse(a, &digest)));
                }
            }
        }

        for (name, value) in self.response_headers.iter() {
            let name_str = name.as_str().to_ascii_lowercase();
            let Some(suffix) = name_str.strip_prefix("x-checksum-") else {
                continue;
            };
            let Ok(val_str) = value.to_str() else { continue };
            push(HashAlgorithm::parse(suffix).and_then(|a| HashDigest::parse(a, val_str)));
        }

        if let Some(s) = self.header_str("Content-SHA256") {
            push(HashDigest::parse(HashAlgorithm::SHA256, s));
        }
        // rfc1864, body digest
        if !self.is_partial() {
            if let Some(s) = self.header_str("Content-MD5") {
                push(HashDigest::parse(HashAlgorithm::MD5, s));
            }
        }

        hashes.sort_by_key(|h| h.algorithm());
        hashes
    }

    /// Mirrors advertised through RFC 6249 `Link: <url>; rel=duplicate`
    /// headers. `pri` maps to preference and `geo` to location.
    pub fn duplicate_links(&self) -> Vec<Mirror> {
        let mut mirrors = Vec::new();
        for value in self.response_headers.get_all(LINK) {
            let Ok(s) = value.to_str() else { continue };
            for caps in LINK_RE.captures_iter(s) {
                let (Some(target), Some(params)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };
                let mut is_duplicate = false;
                let mut preference = DEFAULT_PREFERENCE;
                let mut location = None;
                for param in params.as_str().split(';') {
                    let Some((key, val)) = param.split_once('=') else {
                        continue;
                    };
                    let val = val.trim().trim_matches('"');
                    match key.trim().to_ascii_lowercase().as_str() {
                        "rel" => {
                            is_duplicate = val
                                .split_whitespace()
                                .any(|r| r.eq_ignore_ascii_case("duplicate"))
                        }
                        "pri" => preference = val.parse().unwrap_or(DEFAULT_PREFERENCE),
                        "geo" => location = Some(val.to_ascii_lowercase()),
                        _ => {}
                    }
                }
                if !is_duplicate {
                    continue;
                }
                let Ok(url) = self.request_url.join(target.as_str().trim()) else {
                    continue;
                };
                let mut mirror = Mirror::new(url, preference);
                mirror.location = location;
                mirrors.push(mirror);
            }
        }
        mirrors
    }
}

/// Splits `alg=value, alg=:value:` lists. Unknown algorithms yield None.
fn parse_digest_list(s: &str) -> Vec<(Option<HashAlgorithm>, String)> {
    s.split(',')
        .filter_map(|part| part.trim().split_once('='))
        .map(|(alg, value)| {
            (
                HashAlgorithm::parse(alg),
                value.trim().trim_matches(':').to_string(),
            )
        })
        .collect()
}

impl From<&Response> for ResponseInfo {
    fn from(value: &Response) -> Self {
        Self {
            status_code: value.status().as_u16(),
            request_url: value.url().to_owned(),
            response_headers: value.headers().to_owned(),
        }
    }
}

static CONTENT_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").unwrap());

static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]*)>((?:\s*;[^;,<]*)*)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// inclusive
    pub end: u64,
    pub total: Option<u64>,
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::hash::HashEncoding;

    fn make_response_info_with_headers(url: &str, headers: HeaderMap) -> ResponseInfo {
        ResponseInfo::new(200, Url::parse(url).unwrap(), headers)
    }

    #[test]
    fn test_accepts_ranges() {
        let mut headers = HeaderMap::new();
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        assert!(!resp.accepts_ranges());
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        assert!(resp.accepts_ranges());
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        let resp = make_response_info_with_headers("http://example.com", headers);
        assert!(!resp.accepts_ranges());
    }

    #[test]
    fn test_parse_last_modified() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        let dt = DateTime::from_timestamp(resp.parse_last_modified().unwrap(), 0).unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2015, 10, 21));

        headers.insert(LAST_MODIFIED, HeaderValue::from_static("invalid-date"));
        let resp = make_response_info_with_headers("http://example.com", headers);
        assert!(resp.parse_last_modified().is_none());
    }

    #[test]
    fn test_content_range() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/250"));
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        assert_eq!(
            resp.content_range(),
            Some(ContentRange {
                start: 100,
                end: 199,
                total: Some(250)
            })
        );

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-499/*"));
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        assert_eq!(resp.content_range().unwrap().total, None);

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("invalid"));
        let resp = make_response_info_with_headers("http://example.com", headers);
        assert!(resp.content_range().is_none());
    }

    #[test]
    fn test_total_length_prefers_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        assert_eq!(resp.total_length(), Some(100));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-99/250"));
        let resp = ResponseInfo::new(206, Url::parse("http://example.com").unwrap(), headers.clone());
        assert_eq!(resp.total_length(), Some(250));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-99/*"));
        let resp = ResponseInfo::new(206, Url::parse("http://example.com").unwrap(), headers);
        assert_eq!(resp.total_length(), None);
    }

    #[test]
    fn test_status_error() {
        let url = Url::parse("http://example.com").unwrap();
        assert!(ResponseInfo::new(206, url.clone(), HeaderMap::new()).status_error().is_none());
        assert!(ResponseInfo::new(404, url, HeaderMap::new()).status_error().is_some());
    }

    #[test]
    fn test_instance_digests_from_all_sources() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Digest",
            HeaderValue::from_static("md5=XrY7u+Ae7tCTyyK7j1rNww==, unixsum=30637"),
        );
        headers.insert(
            "X-Checksum-Sha1",
            HeaderValue::from_static("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"),
        );
        headers.insert(
            "Content-Digest",
            HeaderValue::from_static("sha-256=:uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=:"),
        );
        let resp = make_response_info_with_headers("http://example.com", headers);
        let digests = resp.instance_digests();
        let algos: Vec<_> = digests.iter().map(|d| d.algorithm()).collect();
        assert_eq!(
            algos,
            vec![HashAlgorithm::SHA256, HashAlgorithm::SHA1, HashAlgorithm::MD5]
        );
        assert_eq!(digests[0].encoding(), HashEncoding::Base64);
        assert_eq!(digests[1].encoding(), HashEncoding::Hex);
        assert_eq!(digests[2].to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_instance_digests_drop_malformed_values() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-MD5", HeaderValue::from_static("tooshort"));
        headers.insert("Content-SHA256", HeaderValue::from_static("xyz"));
        let resp = make_response_info_with_headers("http://example.com", headers);
        assert!(resp.instance_digests().is_empty());
    }

    #[test]
    fn test_duplicate_links() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<http://ftp.example.com/example.ext>; rel=duplicate; pri=1; geo=gb, \
                 <http://example.com/style.css>; rel=stylesheet, \
                 </mirror/example.ext>; rel=\"duplicate\"",
            ),
        );
        let resp = make_response_info_with_headers("http://example.com/example.ext", headers);
        let mirrors = resp.duplicate_links();
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[0].url.as_str(), "http://ftp.example.com/example.ext");
        assert_eq!(mirrors[0].preference, 1);
        assert_eq!(mirrors[0].location.as_deref(), Some("gb"));
        assert_eq!(mirrors[1].url.as_str(), "http://example.com/mirror/example.ext");
        assert_eq!(mirrors[1].preference, DEFAULT_PREFERENCE);
    }

    #[test]
    fn test_content_encoding() {
        let mut headers = HeaderMap::new();
        let resp = make_response_info_with_headers("http://example.com", headers.clone());
        assert_eq!(resp.content_encoding(), None);
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("GZIP"));
        let resp = make_response_info_with_headers("http://example.com", headers);
        assert_eq!(resp.content_encoding().as_deref(), Some("gzip"));
    }
}

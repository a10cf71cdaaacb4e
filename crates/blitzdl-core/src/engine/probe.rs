//! Sizing probe - one ranged request that decides how a download runs
//!
//! The probe issues a single `Range: bytes=1-<chunk>` GET and derives
//! everything the scheduler needs from it: the media-type gate, the total
//! content length, the filename, whether the server honors ranges, and the
//! initial fan-out picked from a timed read of the first chunk.

use crate::engine::{download_time, DEF_USER_AGENT, KB, MB};
use crate::error::BlitzError;
use blitzdl_types::ContentLength;
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, RANGE, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use std::time::Instant;
use url::Url;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

pub(crate) struct ProbeReport {
    pub(crate) file_name: String,
    pub(crate) content_length: ContentLength,
    pub(crate) range_supported: bool,
    pub(crate) base_segments: usize,
}

/// Union of the default User-Agent and the download's custom headers.
/// Caller headers override the defaults.
pub(crate) fn request_headers(custom: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEF_USER_AGENT));
    for (name, value) in custom {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

pub(crate) async fn probe(
    client: &Client,
    url: &str,
    custom_headers: &HeaderMap,
    chunk_size: usize,
    force_parts: bool,
    explicit_name: Option<&str>,
) -> Result<ProbeReport, BlitzError> {
    let mut headers = request_headers(custom_headers);
    headers.insert(
        RANGE,
        HeaderValue::from_str(&format!("bytes=1-{chunk_size}"))
            .expect("range header is always ascii"),
    );

    let resp = client
        .get(url)
        .headers(headers)
        .send()
        .await?
        .error_for_status()?;

    check_content_type(resp.headers().get(CONTENT_TYPE))?;

    // A 200 to a ranged request means the server ignored the range; treat
    // it exactly like a missing Accept-Ranges header.
    let range_supported = resp.status() == StatusCode::PARTIAL_CONTENT
        || header_str(resp.headers().get(ACCEPT_RANGES)) == Some("bytes");

    let total = if resp.status() == StatusCode::PARTIAL_CONTENT {
        content_range_total(header_str(resp.headers().get(CONTENT_RANGE)))
    } else {
        header_str(resp.headers().get(CONTENT_LENGTH))
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1)
    };
    let content_length = match total {
        0 => return Err(BlitzError::InvalidContentLength),
        -1 => return Err(BlitzError::UnknownContentLength),
        v => ContentLength::new(v),
    };

    let file_name = match explicit_name {
        Some(name) => name.to_string(),
        None => parse_file_name(
            header_str(resp.headers().get(CONTENT_DISPOSITION)),
            resp.url(),
        ),
    };

    // Fan-out: time the first chunk, unless the file is too small to split
    // or the server cannot serve ranges anyway.
    let mut base_segments = 1;
    if (range_supported || force_parts) && content_length.get() >= chunk_size as i64 {
        let started = Instant::now();
        let mut reader = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        base_segments = pick_base_segments(started.elapsed(), filled as i64);
    }

    tracing::debug!(
        %file_name,
        length = content_length.get(),
        range_supported,
        base_segments,
        "probe complete"
    );

    Ok(ProbeReport {
        file_name,
        content_length,
        range_supported,
        base_segments,
    })
}

fn header_str(v: Option<&HeaderValue>) -> Option<&str> {
    v.and_then(|v| v.to_str().ok())
}

fn check_content_type(v: Option<&HeaderValue>) -> Result<(), BlitzError> {
    let Some(ct) = header_str(v) else {
        return Ok(());
    };
    let media_type = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match media_type.as_str() {
        "text/html" | "text/css" => Err(BlitzError::UnsupportedContent(media_type)),
        _ => Ok(()),
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header; `-1` when the
/// header is absent or the total is `*`.
fn content_range_total(v: Option<&str>) -> i64 {
    v.and_then(|s| s.rsplit('/').next())
        .filter(|total| *total != "*")
        .and_then(|total| total.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

/// Filename from `Content-Disposition`, falling back to the last path
/// component of the final (post-redirect) URL.
pub(crate) fn parse_file_name(content_disposition: Option<&str>, url: &Url) -> String {
    if let Some(name) = content_disposition
        .and_then(|v| v.split("filename=").nth(1))
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().trim_matches('"'))
        .filter(|v| !v.is_empty())
    {
        return name.to_string();
    }
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Initial fan-out from the probe's elapsed time over `n` bytes. The slow
/// tests run before the fast tests; the middle tier (1-5 MiB/s) gets 11 to
/// keep the table monotone.
pub(crate) fn pick_base_segments(te: std::time::Duration, n: i64) -> usize {
    if te > download_time(100 * KB, n) {
        14
    } else if te > download_time(MB, n) {
        12
    } else if te < download_time(10 * MB, n) {
        8
    } else if te < download_time(5 * MB, n) {
        10
    } else {
        11
    }
}

//! Prometheus text exposition scraping.
//!
//! Fetches a metrics page over plain HTTP/1 and sums samples by metric
//! name. Labels are kept so a caller can scope a metric to one queue.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};

/// One parsed sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl MetricSample {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// All samples of a scraped page.
#[derive(Debug, Clone, Default)]
pub struct MetricValues {
    samples: Vec<MetricSample>,
}

impl MetricValues {
    /// Parse exposition text. Comment lines and lines that don't parse
    /// are skipped.
    pub fn parse(text: &str) -> Self {
        let samples = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_line)
            .collect();
        Self { samples }
    }

    /// Sum of every sample named `name`, labels ignored.
    pub fn sum(&self, name: &str) -> f64 {
        self.samples
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .sum()
    }

    /// Sum of `name` restricted to samples whose `label` equals `value`.
    /// When no sample of `name` carries `label` at all, the metric is
    /// unscoped and the plain sum is returned.
    pub fn sum_scoped(&self, name: &str, label: &str, value: &str) -> f64 {
        let scoped = self
            .samples
            .iter()
            .any(|s| s.name == name && s.label(label).is_some());
        if !scoped {
            return self.sum(name);
        }
        self.samples
            .iter()
            .filter(|s| s.name == name && s.label(label) == Some(value))
            .map(|s| s.value)
            .sum()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.samples.iter().any(|s| s.name == name)
    }
}

fn parse_line(line: &str) -> Option<MetricSample> {
    let (name, labels, rest) = match line.find(['{', ' ', '\t']) {
        Some(idx) if line[idx..].starts_with('{') => {
            let close = find_closing_brace(line, idx)?;
            (
                &line[..idx],
                parse_labels(&line[idx + 1..close]),
                &line[close + 1..],
            )
        }
        Some(idx) => (&line[..idx], Vec::new(), &line[idx..]),
        None => return None,
    };

    // A trailing timestamp may follow the value; it is ignored.
    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    if name.is_empty() || !value.is_finite() {
        return None;
    }
    Some(MetricSample {
        name: name.to_string(),
        labels,
        value,
    })
}

fn find_closing_brace(line: &str, open: usize) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line[open..].char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some(open + i),
            _ => {}
        }
    }
    None
}

fn parse_labels(body: &str) -> Vec<(String, String)> {
    let mut labels = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut in_quotes = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_quotes {
            match c {
                _ if escaped => {
                    value.push(c);
                    escaped = false;
                }
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => value.push(c),
            }
            continue;
        }
        match c {
            '=' if !in_value => in_value = true,
            '"' if in_value => in_quotes = true,
            ',' => {
                if !key.trim().is_empty() {
                    labels.push((key.trim().to_string(), std::mem::take(&mut value)));
                }
                key.clear();
                value.clear();
                in_value = false;
            }
            _ if !in_value => key.push(c),
            _ => {}
        }
    }
    if !key.trim().is_empty() {
        labels.push((key.trim().to_string(), value));
    }
    labels
}

/// GET `url` and return the body as text.
pub async fn fetch_text(url: &str, timeout: Duration) -> ProbeResult<String> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProbeError::Malformed(e.to_string()))?;
    let authority = uri
        .authority()
        .ok_or_else(|| ProbeError::Malformed(format!("no host in {url}")))?
        .clone();
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let fetch = async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| ProbeError::Unreachable(format!("{address}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Unreachable(format!("{address}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path.as_str())
            .header("host", authority.as_str())
            .header("user-agent", "farmscale/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Malformed(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Unreachable(format!("{address}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProbeError::Unreachable(format!("{address}: {e}")))?
            .to_bytes();
        String::from_utf8(body.to_vec()).map_err(|e| ProbeError::Malformed(e.to_string()))
    };

    match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%url, "metrics scrape timed out");
            Err(ProbeError::Timeout)
        }
    }
}

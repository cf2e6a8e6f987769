//! Re-sending an edited copy of a recorded request.

use bytes::Bytes;
use tracing::info;

use crate::error::ReplayError;
use crate::exchange::{Header, ObservedResponse, RelayExchange, gen_id, now_rfc3339};
use crate::inspector::FlowRecorder;
use crate::proxy::Forwarder;

/// Parses raw request text into an exchange aimed at the template's origin.
///
/// The text is a request line, `Name: value` header lines, a blank line and
/// the body. `\r\n` and `\n` line endings are both accepted; a missing
/// version means HTTP/1.1.
pub fn parse_raw_request(text: &str, template: &RelayExchange) -> Result<RelayExchange, ReplayError> {
    let normalized = text.replace("\r\n", "\n");
    let (head, body) = normalized
        .split_once("\n\n")
        .unwrap_or((normalized.as_str(), ""));
    let mut lines = head.lines();

    let request_line = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ReplayError::MalformedRequest("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m, p),
        _ => {
            return Err(ReplayError::MalformedRequest(format!(
                "bad request line {request_line:?}"
            )));
        }
    };
    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ReplayError::MalformedRequest(format!("bad method {method:?}")));
    }
    let version = parts
        .next()
        .map(|v| v.trim_start_matches("HTTP/").to_string())
        .unwrap_or_else(|| "1.1".to_string());

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| Header::new(name.trim(), value.trim()))
        .collect();

    Ok(RelayExchange {
        id: gen_id(),
        timestamp: now_rfc3339(),
        peer: template.peer,
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        version,
        headers,
        body: Bytes::from(body.to_string()),
        target_host: template.target_host.clone(),
        target_port: template.target_port,
        scheme: template.scheme,
    })
}

/// Re-sends flow `id` with its request replaced by `text` and returns the full response.
pub async fn replay(
    forwarder: &Forwarder,
    recorder: &FlowRecorder,
    id: &str,
    text: &str,
) -> Result<ObservedResponse, ReplayError> {
    let original = recorder
        .get(id)
        .ok_or_else(|| ReplayError::UnknownFlow(id.to_string()))?;
    let exchange = parse_raw_request(text, &original.exchange)?;
    info!(flow = %id, method = %exchange.method, url = %exchange.url(), "replaying request");
    Ok(forwarder.send_buffered(&exchange).await?)
}

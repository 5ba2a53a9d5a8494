//! Tracker client logic.
//!
//! Implements the HTTP announce exchange: building the query string with
//! the raw-byte percent encoding the protocol wants, pacing announces by
//! the tracker-supplied interval, and parsing both the compact and the
//! dictionary peer list forms out of the bencoded response.
use crate::torrent::Metainfo;
use anyhow::Result;
use rand::Rng;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Re-announce cadence used until a tracker supplies its own.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Floor for the failure-retry window.
pub const MIN_BACKOFF: Duration = Duration::from_secs(15);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle markers sent with an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Paused,
    Stopped,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Paused => "paused",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// A successful announce: the tracker's requested re-announce interval and
/// the complete peer list it returned.
#[derive(Debug)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: Option<Peers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    /// 6 bytes per peer: IPv4 octets then a big-endian port.
    Compact(ByteBuf),
    /// The legacy non-compact form: one dictionary per peer.
    NonCompact(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// One announce endpoint and its pacing state.
#[derive(Debug)]
pub struct Tracker {
    url: String,
    http: reqwest::Client,
    interval: Duration,
    backoff: Duration,
    last_request: Option<Instant>,
    last_success: Option<Instant>,
}

/// Whether a `started` announce must be skipped.
///
/// Inside the interval since the last success the answer is yes, with one
/// exception: when the most recent attempt failed (it is newer than the
/// last success) and is at least `backoff` old, a retry goes through.
/// Other events never pass through this check.
fn suppress_started(
    now: Instant,
    last_request: Option<Instant>,
    last_success: Option<Instant>,
    interval: Duration,
    backoff: Duration,
) -> bool {
    let Some(success) = last_success else {
        return false;
    };
    if now >= success + interval {
        return false;
    }
    match last_request {
        Some(request) if request > success => now < request + backoff,
        _ => true,
    }
}

impl Tracker {
    pub fn new(url: String) -> Result<Tracker> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Tracker {
            url,
            http,
            interval: DEFAULT_INTERVAL,
            backoff: MIN_BACKOFF,
            last_request: None,
            last_success: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current re-announce interval (tracker-supplied after first success).
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Announces our state and asks for peers.
    ///
    /// Returns `Ok(None)` when the announce was suppressed by the rate
    /// rule, when the tracker answered non-2xx, or when the response did
    /// not parse; pacing state is only updated by an actual attempt, and
    /// interval/backoff only by a successful one.
    #[tracing::instrument(skip_all, fields(tracker = %self.url, ?event), level = "debug")]
    pub async fn announce(
        &mut self,
        meta: &Metainfo,
        event: AnnounceEvent,
        peer_id: &[u8; 20],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<Option<Announce>> {
        let now = Instant::now();
        if event == AnnounceEvent::Started
            && suppress_started(
                now,
                self.last_request,
                self.last_success,
                self.interval,
                self.backoff,
            )
        {
            debug!("announce suppressed by interval");
            return Ok(None);
        }

        // The infohash and peer id are raw bytes; Url's own query encoder
        // would re-encode the percent escapes, so the query is assembled by
        // hand and installed wholesale.
        let mut url = Url::parse(&self.url)?;
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&event={}&compact=1",
            url_encode(&meta.info_hash),
            url_encode(peer_id),
            port,
            uploaded,
            downloaded,
            left,
            event.as_str(),
        );
        if let Some(existing) = url.query() {
            query = format!("{existing}&{query}");
        }
        url.set_query(Some(&query));

        self.last_request = Some(now);
        debug!(%url, "announcing");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "tracker answered non-success");
            return Ok(None);
        }
        let body = response.bytes().await?;
        let announce = match parse_announce_response(&body) {
            Ok(announce) => announce,
            Err(e) => {
                warn!(error = %e, "unusable tracker response");
                return Ok(None);
            }
        };
        self.last_success = Some(Instant::now());
        self.interval = announce.interval;
        self.backoff = announce.interval.max(MIN_BACKOFF);
        Ok(Some(announce))
    }
}

fn parse_announce_response(bytes: &[u8]) -> Result<Announce> {
    let response: TrackerResponse = serde_bencode::from_bytes(bytes)?;
    if let Some(reason) = response.failure_reason {
        anyhow::bail!("tracker failure: {reason}");
    }
    let peers = match response.peers {
        Some(Peers::Compact(buf)) => {
            if buf.len() % 6 != 0 {
                anyhow::bail!("compact peer list of {} bytes", buf.len());
            }
            buf.chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::V4(SocketAddrV4::new(ip, port))
                })
                .collect()
        }
        Some(Peers::NonCompact(dicts)) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, dict.port))
            })
            .collect(),
        None => Vec::new(),
    };
    let interval = response
        .interval
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(DEFAULT_INTERVAL);
    Ok(Announce { interval, peers })
}

/// Generates our 20-byte peer id: the `-RB0001-` client prefix followed by
/// random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RB0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes raw bytes per RFC 3986: unreserved characters pass
/// through, everything else becomes `%XX`.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix_and_full_width() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RB0001-");
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn url_encoding_keeps_unreserved_and_escapes_the_rest() {
        assert_eq!(url_encode(b"AZaz09-._~"), "AZaz09-._~");
        assert_eq!(url_encode(&[0x00, 0xff, b' ']), "%00%FF%20");
    }

    #[test]
    fn started_announces_inside_the_interval_are_suppressed() {
        let base = Instant::now();
        let interval = Duration::from_secs(1800);
        let backoff = Duration::from_secs(15);

        // Nothing has succeeded yet: always allowed.
        assert!(!suppress_started(base, None, None, interval, backoff));
        assert!(!suppress_started(
            base + Duration::from_secs(5),
            Some(base),
            None,
            interval,
            backoff
        ));

        // A success at `base`; an immediate re-announce is suppressed,
        // one after the interval is not.
        let success = Some(base);
        let request = Some(base);
        assert!(suppress_started(
            base + Duration::from_secs(1),
            request,
            success,
            interval,
            backoff
        ));
        assert!(!suppress_started(
            base + interval,
            request,
            success,
            interval,
            backoff
        ));
    }

    #[test]
    fn failure_retry_window_reopens_after_backoff() {
        let base = Instant::now();
        let interval = Duration::from_secs(1800);
        let backoff = Duration::from_secs(15);
        let success = Some(base);
        // A failed attempt 20s after the success.
        let failed = Some(base + Duration::from_secs(20));

        // Within backoff of the failure: still suppressed.
        assert!(suppress_started(
            base + Duration::from_secs(25),
            failed,
            success,
            interval,
            backoff
        ));
        // Backoff elapsed: the retry goes through even inside the interval.
        assert!(!suppress_started(
            base + Duration::from_secs(40),
            failed,
            success,
            interval,
            backoff
        ));
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x00, 0x50]);
        body.push(b'e');
        let announce = parse_announce_response(&body).unwrap();
        assert_eq!(announce.interval, Duration::from_secs(1800));
        assert_eq!(
            announce.peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let body =
            b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip3:bad4:porti1eeee";
        let announce = parse_announce_response(body).unwrap();
        assert_eq!(announce.interval, Duration::from_secs(900));
        assert_eq!(
            announce.peers,
            vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason9:not found8:intervali0ee";
        assert!(parse_announce_response(body).is_err());
    }

    #[test]
    fn ragged_compact_list_is_rejected() {
        let body = b"d8:intervali60e5:peers5:abcdee";
        assert!(parse_announce_response(body).is_err());
    }
}

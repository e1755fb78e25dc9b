//! HTTP client for peer discovery via a tracker (spec §4.4, §6).
//!
//! The tracker itself is an external collaborator: a best-effort address
//! hint cache keyed by peering id, aged on an ~1 hour lifetime server-side.
//! This module only speaks its wire contract.
//!
//! Mirrors `AddressBook::publish`/`AddressBook::query` in the original
//! implementation: publish posts one `(host, port)` pair per locally known
//! address and succeeds if any of them is accepted; query fetches and
//! parses the YAML address list for an identifier.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use reqwest::Client;

use crate::address::Address;
use crate::error::{Result, SessionError};
use crate::identifier::Identifier;

/// Instance name used when a caller doesn't supply one (spec supplement
/// B.1, `src/tracker.cpp`: an unnamed announce is filed under `"default"`).
pub const DEFAULT_INSTANCE: &str = "default";

/// A thin wrapper over [`reqwest::Client`] scoped to one tracker host.
pub struct TrackerClient {
    http: Client,
    host: String,
}

impl TrackerClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            host: host.into(),
        }
    }

    fn url_for(&self, peering: &Identifier) -> String {
        format!("http://{}/tracker/{}", self.host, hex::encode(peering.digest()))
    }

    /// Announces `addresses` under `peering`, one POST per address so a
    /// single unreachable candidate doesn't sink the others (spec
    /// supplement B.2: `AddressBook::publish`'s per-address loop). Returns
    /// whether at least one POST was accepted with HTTP 200.
    pub async fn publish(&self, peering: &Identifier, addresses: &[Address], instance: Option<&str>) -> Result<bool> {
        if addresses.is_empty() {
            return Ok(false);
        }
        let url = self.url_for(peering);
        let instance = instance.unwrap_or(DEFAULT_INSTANCE);
        let all_addrs = addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(",");

        let mut accepted = false;
        for addr in addresses {
            let socket = match addr.socket_addr() {
                Some(s) => s,
                None => continue,
            };
            let form = [
                ("host", socket.ip().to_string()),
                ("port", socket.port().to_string()),
                ("addresses", all_addrs.clone()),
                ("instance", instance.to_string()),
            ];
            let response = self
                .http
                .post(&url)
                .form(&form)
                .send()
                .await
                .map_err(|e| SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            accepted |= response.status().as_u16() == 200;
        }
        Ok(accepted)
    }

    /// Queries known addresses for `peering`, returning the server's
    /// `instance -> addresses` mapping. `alternate` asks for fallback/relay
    /// addresses instead of primary ones (spec §4.4). Addresses the server
    /// returns that don't parse as `host:port` are silently dropped, per
    /// "clients treat the response as a best-effort hint" (spec §4.4).
    pub async fn query(&self, peering: &Identifier, alternate: bool) -> Result<HashMap<String, Vec<Address>>> {
        let mut url = self.url_for(peering);
        if alternate {
            url.push_str("?alternate=1");
        }
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        if response.status().as_u16() != 200 {
            return Ok(HashMap::new());
        }
        let body = response
            .text()
            .await
            .map_err(|e| SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        if body.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let raw: RawResponse = serde_yaml::from_str(&body)
            .map_err(|e| SessionError::MalformedCommand(format!("invalid tracker response: {}", e)))?;

        let mut out = HashMap::new();
        for (instance, addrs) in raw {
            let parsed = addrs.iter().filter_map(|s| Address::parse(s)).collect();
            out.insert(instance, parsed);
        }
        Ok(out)
    }

    /// Like [`Self::query`], but consults `cache` first and populates it
    /// on a miss. Only primary (`alternate == false`) lookups are cached,
    /// since alternates are already a fallback path taken rarely enough
    /// that caching them buys little.
    pub async fn query_cached(
        &self,
        cache: &Cache,
        peering: &Identifier,
        alternate: bool,
    ) -> Result<HashMap<String, Vec<Address>>> {
        if !alternate {
            if let Some(hit) = cache.get(peering) {
                return Ok(hit);
            }
        }
        let result = self.query(peering, alternate).await?;
        if !alternate {
            cache.insert(peering.clone(), result.clone());
        }
        Ok(result)
    }
}

/// The tracker's YAML body is a bare mapping, so a type alias is enough to
/// drive `serde_yaml`'s deserializer without a wrapper struct.
type RawResponse = HashMap<String, Vec<String>>;

/// A bounded, age-limited client-side cache of primary (non-`alternate`)
/// [`TrackerClient::query`] responses, keyed by peering id.
///
/// The server itself ages entries with a rotating cleaner cursor that
/// amortizes expiry across inserts rather than running a sweep thread
/// (spec supplement B.3, `Tracker::insert`). We mirror that shape on the
/// client: there is no background eviction task, a stale entry is simply
/// dropped the next time it's looked up.
pub struct Cache {
    entries: Mutex<LruCache<Identifier, CacheEntry>>,
    ttl: Duration,
}

struct CacheEntry {
    addresses: HashMap<String, Vec<Address>>,
    inserted_at: Instant,
}

impl Cache {
    /// `capacity` bounds memory use; `ttl` is the hint lifetime, mirroring
    /// the tracker server's ~1 hour entry aging.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns a cached response for `peering` if present and not yet
    /// aged out. An expired entry is evicted on the way out, so cleanup
    /// happens incidentally as lookups occur.
    pub fn get(&self, peering: &Identifier) -> Option<HashMap<String, Vec<Address>>> {
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.peek(peering) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            entries.pop(peering);
            return None;
        }
        entries.get(peering).map(|entry| entry.addresses.clone())
    }

    pub fn insert(&self, peering: Identifier, addresses: HashMap<String, Vec<Address>>) {
        self.entries.lock().unwrap().put(
            peering,
            CacheEntry {
                addresses,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peering(fill: u8) -> Identifier {
        Identifier::peering([fill; 64])
    }

    #[tokio::test]
    async fn publish_succeeds_if_any_post_is_accepted() {
        let id = peering(1);
        let path = format!("/tracker/{}", hex::encode(id.digest()));

        let _m1 = mockito::mock("POST", path.as_str()).with_status(400).create();
        let _m2 = mockito::mock("POST", path.as_str()).with_status(200).create();

        let host = mockito::server_url();
        let client = TrackerClient::new(host.trim_start_matches("http://").to_string());
        let addrs = vec![
            Address::new("10.0.0.1", 1).unwrap(),
            Address::new("10.0.0.2", 2).unwrap(),
        ];
        assert!(client.publish(&id, &addrs, None).await.unwrap());
    }

    #[tokio::test]
    async fn publish_with_no_addresses_is_a_no_op_failure() {
        let client = TrackerClient::new("tracker.invalid".to_string());
        let id = peering(2);
        assert!(!client.publish(&id, &[], None).await.unwrap());
    }

    #[tokio::test]
    async fn query_parses_yaml_instance_mapping() {
        let id = peering(3);
        let path = format!("/tracker/{}", hex::encode(id.digest()));
        let body = "default:\n  - 203.0.113.5:6969\n  - \"[::1]:6969\"\n";
        let _m = mockito::mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body(body)
            .create();

        let host = mockito::server_url();
        let client = TrackerClient::new(host.trim_start_matches("http://").to_string());
        let result = client.query(&id, false).await.unwrap();
        let addrs = result.get(DEFAULT_INSTANCE).unwrap();
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn query_with_empty_body_means_unknown() {
        let id = peering(4);
        let path = format!("/tracker/{}", hex::encode(id.digest()));
        let _m = mockito::mock("GET", path.as_str()).with_status(200).with_body("").create();

        let host = mockito::server_url();
        let client = TrackerClient::new(host.trim_start_matches("http://").to_string());
        let result = client.query(&id, false).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn cache_returns_none_before_any_insert() {
        let cache = Cache::new(4, Duration::from_secs(3600));
        assert!(cache.get(&peering(5)).is_none());
    }

    #[test]
    fn cache_hit_after_insert() {
        let cache = Cache::new(4, Duration::from_secs(3600));
        let mut addrs = HashMap::new();
        addrs.insert(DEFAULT_INSTANCE.to_string(), vec![Address::new("10.0.0.1", 1).unwrap()]);
        cache.insert(peering(5), addrs.clone());
        assert_eq!(cache.get(&peering(5)), Some(addrs));
    }

    #[test]
    fn cache_entry_expires_after_ttl() {
        let cache = Cache::new(4, Duration::from_millis(1));
        cache.insert(peering(6), HashMap::new());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&peering(6)).is_none());
    }

    #[tokio::test]
    async fn query_cached_populates_cache_on_miss_then_hits_without_a_second_request() {
        let id = peering(7);
        let path = format!("/tracker/{}", hex::encode(id.digest()));
        let body = "default:\n  - 203.0.113.5:6969\n";
        let m = mockito::mock("GET", path.as_str())
            .with_status(200)
            .with_body(body)
            .expect(1)
            .create();

        let host = mockito::server_url();
        let client = TrackerClient::new(host.trim_start_matches("http://").to_string());
        let cache = Cache::new(4, Duration::from_secs(3600));

        let first = client.query_cached(&cache, &id, false).await.unwrap();
        let second = client.query_cached(&cache, &id, false).await.unwrap();
        assert_eq!(first, second);
        m.assert();
    }
}

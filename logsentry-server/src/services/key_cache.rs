use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use logsentry_auth::{ApiKey, CacheKey, CacheKeyer, KeyHasher};
use logsentry_protocol::AppId;
use logsentry_system::{
    BroadcastChannel, BroadcastResponse, BroadcastSender, FromMessage, Interface, NoResponse,
    Receiver, Service,
};
use tokio::sync::mpsc;

use crate::statsd::ServerTimers;
use crate::store::Store;

/// The authoritative key lookup failed, e.g. because the store is down.
///
/// Distinct from an unknown key: lookup faults must surface as a service
/// error, not as a `401`.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("API key lookup failed")]
pub struct KeyLookupFailed;

type LookupResult = Result<Option<AppId>, KeyLookupFailed>;

/// Resolves a plaintext API key to its app.
#[derive(Debug)]
pub struct LookupKey(pub ApiKey);

/// Drops all cached lookup results.
///
/// Sent by the device-authorization flow when a new key is minted, so that
/// negative entries for the fresh key cannot outlive its creation.
#[derive(Debug)]
pub struct InvalidateKeys;

/// Service interface of the API key registry cache.
#[derive(Debug)]
pub enum KeyCache {
    /// Resolves a key to an app.
    Lookup(LookupKey, BroadcastSender<LookupResult>),
    /// Drops all cached results.
    Invalidate(InvalidateKeys),
}

impl Interface for KeyCache {}

impl FromMessage<LookupKey> for KeyCache {
    type Response = BroadcastResponse<LookupResult>;

    fn from_message(message: LookupKey, sender: BroadcastSender<LookupResult>) -> Self {
        Self::Lookup(message, sender)
    }
}

impl FromMessage<InvalidateKeys> for KeyCache {
    type Response = NoResponse;

    fn from_message(message: InvalidateKeys, _: ()) -> Self {
        Self::Invalidate(message)
    }
}

struct CacheEntry {
    result: Option<AppId>,
    inserted: Instant,
}

/// Service implementing the [`KeyCache`] interface.
///
/// The hot ingest path must not pay the Argon2 cost per request, so results
/// are cached under a process-local HMAC of the plaintext key. Hits resolve
/// immediately; concurrent misses for the same key are debounced onto a
/// single in-flight authoritative check against the store. Negative results
/// expire after a short TTL, positive results live until an invalidation.
pub struct KeyCacheService {
    store: Arc<dyn Store>,
    hasher: Arc<KeyHasher>,
    keyer: CacheKeyer,
    negative_ttl: Duration,
    cache: HashMap<CacheKey, CacheEntry>,
    channels: HashMap<CacheKey, BroadcastChannel<LookupResult>>,
}

impl KeyCacheService {
    /// Creates the service.
    pub fn new(store: Arc<dyn Store>, hasher: Arc<KeyHasher>, negative_ttl: Duration) -> Self {
        Self {
            store,
            hasher,
            keyer: CacheKeyer::random(),
            negative_ttl,
            cache: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    fn cached(&mut self, cache_key: &CacheKey) -> Option<Option<AppId>> {
        let entry = self.cache.get(cache_key)?;

        // Positive entries live until invalidation, negative ones for the
        // configured TTL.
        if entry.result.is_none() && entry.inserted.elapsed() >= self.negative_ttl {
            self.cache.remove(cache_key);
            return None;
        }

        Some(entry.result)
    }

    fn handle_lookup(
        &mut self,
        message: LookupKey,
        sender: BroadcastSender<LookupResult>,
        done_tx: &mpsc::UnboundedSender<(CacheKey, LookupResult)>,
    ) {
        let LookupKey(key) = message;
        let cache_key = self.keyer.cache_key(&key);

        if let Some(result) = self.cached(&cache_key) {
            sender.send(Ok(result));
            return;
        }

        if let Some(channel) = self.channels.get_mut(&cache_key) {
            channel.attach(sender);
            return;
        }

        self.channels.insert(cache_key, sender.into_channel());

        let hasher = self.hasher.clone();
        let store = self.store.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();

            let hash = tokio::task::spawn_blocking(move || hasher.hash(&key)).await;
            let result = match hash {
                Ok(Ok(hash)) => store
                    .lookup_api_key(&hash)
                    .await
                    .map_err(|_| KeyLookupFailed),
                _ => Err(KeyLookupFailed),
            };

            logsentry_statsd::metric!(
                timer(ServerTimers::KeyLookupDuration) = started.elapsed()
            );
            done_tx.send((cache_key, result)).ok();
        });
    }

    fn handle_resolved(&mut self, cache_key: CacheKey, result: LookupResult) {
        if let Some(channel) = self.channels.remove(&cache_key) {
            channel.send(result);
        }

        // Faults are not cached; the next request retries the store.
        if let Ok(result) = result {
            self.cache.insert(
                cache_key,
                CacheEntry {
                    result,
                    inserted: Instant::now(),
                },
            );
        }
    }

    fn handle_message(
        &mut self,
        message: KeyCache,
        done_tx: &mpsc::UnboundedSender<(CacheKey, LookupResult)>,
    ) {
        match message {
            KeyCache::Lookup(message, sender) => self.handle_lookup(message, sender, done_tx),
            KeyCache::Invalidate(_) => self.cache.clear(),
        }
    }
}

impl Service for KeyCacheService {
    type Interface = KeyCache;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let (done_tx, mut done_rx) = mpsc::unbounded_channel();

            loop {
                tokio::select! {
                    biased;

                    Some((cache_key, result)) = done_rx.recv() => {
                        self.handle_resolved(cache_key, result)
                    }
                    message = rx.recv() => match message {
                        Some(message) => self.handle_message(message, &done_tx),
                        None => break,
                    },
                }
            }
        });
    }

    fn name() -> &'static str {
        "key_cache"
    }
}

#[cfg(test)]
mod tests {
    use logsentry_auth::KeyHash;
    use logsentry_system::Addr;

    use super::*;
    use crate::store::MemoryStore;

    async fn setup(negative_ttl: Duration) -> (Addr<KeyCache>, Arc<MemoryStore>, Arc<KeyHasher>) {
        let store = Arc::new(MemoryStore::new());
        let hasher = Arc::new(KeyHasher::new(b"test-pepper"));
        let service =
            KeyCacheService::new(store.clone() as Arc<dyn Store>, hasher.clone(), negative_ttl);
        (service.start(), store, hasher)
    }

    async fn bind_key(store: &MemoryStore, hasher: &KeyHasher) -> (ApiKey, AppId, KeyHash) {
        let app = store.create_app("user-1", "svc-a").await.unwrap();
        let key = ApiKey::generate();
        let hash = hasher.hash(&key).unwrap();
        store.insert_api_key(app.id, &hash).await.unwrap();
        (key, app.id, hash)
    }

    #[tokio::test]
    async fn test_lookup_known_key() {
        let (addr, store, hasher) = setup(Duration::from_secs(5)).await;
        let (key, app_id, _) = bind_key(&store, &hasher).await;

        let result = addr.send(LookupKey(key)).await.unwrap();
        assert_eq!(result.unwrap(), Some(app_id));
    }

    #[tokio::test]
    async fn test_unknown_key_is_negative_cached() {
        let (addr, store, hasher) = setup(Duration::from_secs(60)).await;
        let key = ApiKey::generate();

        assert_eq!(addr.send(LookupKey(key.clone())).await.unwrap().unwrap(), None);

        // Bind the key afterwards; the stale negative entry still wins until
        // the TTL elapses or an invalidation arrives.
        let app = store.create_app("user-1", "svc-a").await.unwrap();
        let hash = hasher.hash(&key).unwrap();
        store.insert_api_key(app.id, &hash).await.unwrap();

        assert_eq!(addr.send(LookupKey(key.clone())).await.unwrap().unwrap(), None);

        addr.send(InvalidateKeys);
        // The invalidation is processed before the next lookup message.
        let result = addr.send(LookupKey(key)).await.unwrap();
        assert_eq!(result.unwrap(), Some(app.id));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_check() {
        let (addr, store, hasher) = setup(Duration::from_secs(5)).await;
        let (key, app_id, _) = bind_key(&store, &hasher).await;

        let first = addr.send(LookupKey(key.clone()));
        let second = addr.send(LookupKey(key.clone()));
        let third = addr.send(LookupKey(key));

        let (a, b, c) = tokio::join!(first, second, third);
        for result in [a, b, c] {
            assert_eq!(result.unwrap().unwrap(), Some(app_id));
        }
    }
}

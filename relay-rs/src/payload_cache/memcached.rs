use super::{CacheBackend, Error};
use async_trait::async_trait;
use memcache::Client;
use std::time::Duration;
use tokio::task;
use tracing::info;

const URL_SCHEME: &str = "memcache://";

fn server_url(server: &str) -> String {
    if server.starts_with(URL_SCHEME) {
        server.to_string()
    } else {
        format!("{URL_SCHEME}{server}")
    }
}

// expirations are whole seconds on the wire
fn expiration_secs(ttl: Duration) -> u32 {
    u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX)
}

/// A [`CacheBackend`] shared by every relay pointed at the same memcached servers.
///
/// The client is blocking, so each call runs on the blocking thread pool.
#[derive(Clone)]
pub struct MemcachedCache {
    client: Client,
}

impl MemcachedCache {
    /// Connect to `servers` (`host:port`, optionally prefixed with `memcache://`) and check
    /// that they answer before handing out the backend.
    pub async fn connect(servers: &[String], timeout: Duration) -> Result<Self, Error> {
        if servers.is_empty() {
            return Err(Error::Backend("no memcached servers provided".to_string()))
        }
        let urls = servers.iter().map(|server| server_url(server)).collect::<Vec<_>>();
        let client = run_blocking(move || {
            let client = Client::connect(urls)?;
            client.set_read_timeout(Some(timeout))?;
            client.set_write_timeout(Some(timeout))?;
            client.version()?;
            Ok(client)
        })
        .await?;
        info!(servers = servers.len(), "connected to memcached");
        Ok(Self { client })
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, memcache::MemcacheError> + Send + 'static,
{
    let result = task::spawn_blocking(f).await.map_err(|err| Error::Backend(err.to_string()))?;
    result.map_err(From::from)
}

#[async_trait]
impl CacheBackend for MemcachedCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let client = self.client.clone();
        let key = key.to_string();
        run_blocking(move || client.set(&key, value.as_slice(), expiration_secs(ttl))).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let client = self.client.clone();
        let key = key.to_string();
        run_blocking(move || client.get::<Vec<u8>>(&key)).await
    }
}

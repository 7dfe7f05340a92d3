//! Fixed-window rate limiter for the small non-WS HTTP surface (§6). Grounded in
//! `redis_rate_limiter.py`; Redis-backed when `redis.url` is configured, otherwise an
//! in-process sharded counter map. WS endpoints are explicitly excluded — a long-lived
//! connection is rate-limited at accept time only.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::error::AppError;
use crate::model::now_ms;

pub struct RateLimiter {
    backend: Backend,
    limit: u32,
    window_secs: u64,
}

enum Backend {
    InProcess(DashMap<IpAddr, WindowCounter>),
    Redis(redis::Client),
}

struct WindowCounter {
    window_start_ms: i64,
    count: u32,
}

impl RateLimiter {
    pub fn in_process(limit: u32, window_secs: u64) -> Self {
        Self {
            backend: Backend::InProcess(DashMap::new()),
            limit,
            window_secs,
        }
    }

    pub fn redis(client: redis::Client, limit: u32, window_secs: u64) -> Self {
        Self {
            backend: Backend::Redis(client),
            limit,
            window_secs,
        }
    }

    pub async fn allow(&self, ip: IpAddr) -> bool {
        match &self.backend {
            Backend::InProcess(map) => self.allow_in_process(map, ip),
            Backend::Redis(client) => self.allow_redis(client, ip).await,
        }
    }

    fn allow_in_process(&self, map: &DashMap<IpAddr, WindowCounter>, ip: IpAddr) -> bool {
        let now = now_ms();
        let window_ms = self.window_secs as i64 * 1000;
        let mut entry = map.entry(ip).or_insert_with(|| WindowCounter {
            window_start_ms: now,
            count: 0,
        });
        if now - entry.window_start_ms >= window_ms {
            entry.window_start_ms = now;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.limit
    }

    async fn allow_redis(&self, client: &redis::Client, ip: IpAddr) -> bool {
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            // upstream-transient: if Redis is unreachable, fail open rather than
            // blocking the whole HTTP surface on a rate-limiter outage.
            return true;
        };
        let key = format!("rate_limit:{ip}:{}", now_ms() / (self.window_secs as i64 * 1000));
        let result: redis::RedisResult<i64> = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.window_secs)
            .ignore()
            .query_async(&mut conn)
            .await;
        match result {
            Ok(count) => count <= self.limit as i64,
            Err(_) => true,
        }
    }
}

pub async fn rate_limit_layer(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    if limiter.allow(addr.ip()).await {
        Ok(next.run(request).await)
    } else {
        Err(AppError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_configured_limit_then_rejects() {
        let limiter = RateLimiter::in_process(2, 60);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip).await);
        assert!(limiter.allow(ip).await);
        assert!(!limiter.allow(ip).await);
    }

    #[tokio::test]
    async fn distinct_ips_have_independent_windows() {
        let limiter = RateLimiter::in_process(1, 60);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.allow(a).await);
        assert!(limiter.allow(b).await);
    }
}

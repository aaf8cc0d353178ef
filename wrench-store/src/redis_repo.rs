use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{info, warn};
use wrench_core::repository::{GuardOutcome, InFlightGuard, StoreResult};
use wrench_core::StoreError;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    fn inflight_key(customer_key: &str) -> String {
        format!("checkout:inflight:{}", customer_key)
    }
}

#[async_trait]
impl InFlightGuard for RedisClient {
    async fn try_acquire(&self, customer_key: &str, session_id: &str, ttl_seconds: u64) -> StoreResult<GuardOutcome> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        let key = Self::inflight_key(customer_key);

        // SET NX: only the first checkout for this customer takes the marker
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(session_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if result.is_some() {
            return Ok(GuardOutcome::Acquired);
        }

        let holder: Option<String> = conn.get(&key).await.map_err(unavailable)?;
        match holder {
            Some(h) if h == session_id => Ok(GuardOutcome::HeldBySame),
            Some(h) => {
                info!("Checkout {} waiting on in-flight session {}", session_id, h);
                Ok(GuardOutcome::HeldByOther(h))
            }
            // Expired between SET and GET; the next attempt will take it
            None => {
                warn!("In-flight marker for {} vanished during acquire", session_id);
                Ok(GuardOutcome::HeldByOther(String::new()))
            }
        }
    }

    async fn release(&self, customer_key: &str, session_id: &str) -> StoreResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        // Compare-and-delete so a slow request never clears a newer holder
        let script = redis::Script::new(r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#);

        let _: i64 = script
            .key(Self::inflight_key(customer_key))
            .arg(session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

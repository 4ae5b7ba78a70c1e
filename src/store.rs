//! Access to the shared submission store.
//!
//! The store holds one JSON record per submission, keyed by submission id. The worker
//! reads the record once, executes it and writes the finished report back under the same
//! key with a TTL, after which the judge picks it up.

use crate::config::StoreSettings;
use crate::processor::{ExecutionReport, SubmissionRecord};
use crate::retry::RetryPolicy;
use log::info;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{Commands, RedisConnectionInfo};

/// Seconds a finished record stays readable in the store.
pub const RECORD_TTL_SECONDS: u64 = 600;

/// Error talking to the submission store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record is missing or already expired.
    #[error("submission {0} is not in the store")]
    MissingSubmission(String),
    /// The record exists but does not parse as a submission.
    #[error("malformed submission record: {0}")]
    MalformedRecord(#[source] serde_json::Error),
    /// The store could not be reached or the command failed.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Durable state shared with the rest of the judging pipeline.
pub trait SubmissionStore {
    /// Read the record for `submission_id`.
    fn fetch(&mut self, submission_id: &str) -> Result<SubmissionRecord, StoreError>;

    /// Write the finished report under `submission_id` with the standard TTL.
    fn persist(
        &mut self,
        submission_id: &str,
        report: &ExecutionReport,
    ) -> Result<(), StoreError>;
}

enum Client {
    Direct(redis::Client),
    Sentinel(Box<SentinelClient>),
}

impl Client {
    fn connection(&mut self) -> redis::RedisResult<redis::Connection> {
        match self {
            Client::Direct(client) => client.get_connection(),
            Client::Sentinel(client) => client.get_connection(),
        }
    }
}

/// Redis-backed [`SubmissionStore`].
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Connect according to the configured wiring.
    pub fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let client = match settings {
            StoreSettings::Direct { host } => {
                info!("using the store at {host} directly");
                Client::Direct(redis::Client::open(format!("redis://{host}:6379"))?)
            }
            StoreSettings::Sentinel {
                sentinels,
                master_name,
                password,
            } => {
                info!("discovering the store master {master_name} through sentinel {sentinels}");
                let node = SentinelNodeConnectionInfo {
                    tls_mode: None,
                    redis_connection_info: Some(RedisConnectionInfo {
                        password: Some(password.clone()),
                        ..RedisConnectionInfo::default()
                    }),
                };
                Client::Sentinel(Box::new(SentinelClient::build(
                    vec![format!("redis://{sentinels}:5000")],
                    master_name.clone(),
                    Some(node),
                    SentinelServerType::Master,
                )?))
            }
        };
        Ok(RedisStore { client })
    }

    fn command<T>(
        &mut self,
        op: impl Fn(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, redis::RedisError> {
        // A fresh connection per attempt: a retry after a dropped connection must not
        // reuse the dead socket.
        RetryPolicy::STORE.retry(is_transient, || {
            let mut connection = self.client.connection()?;
            op(&mut connection)
        })
    }
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_io_error()
}

impl SubmissionStore for RedisStore {
    fn fetch(&mut self, submission_id: &str) -> Result<SubmissionRecord, StoreError> {
        let raw: Option<String> = self.command(|connection| connection.get(submission_id))?;
        let raw = raw.ok_or_else(|| StoreError::MissingSubmission(submission_id.to_string()))?;
        serde_json::from_str(&raw).map_err(StoreError::MalformedRecord)
    }

    fn persist(
        &mut self,
        submission_id: &str,
        report: &ExecutionReport,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(report).map_err(StoreError::MalformedRecord)?;
        self.command(|connection| {
            connection.set_ex::<_, _, ()>(submission_id, payload.as_str(), RECORD_TTL_SECONDS)
        })?;
        Ok(())
    }
}

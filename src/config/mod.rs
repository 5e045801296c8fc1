use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// S3-compatible bucket for images and derived artifacts. When the S3
    /// settings are absent the local filesystem backend is used instead.
    pub s3_bucket: Option<String>,

    /// S3-compatible endpoint URL (R2, MinIO, AWS)
    pub s3_endpoint: Option<String>,

    /// S3 access key ID
    pub s3_access_key: Option<String>,

    /// S3 secret access key
    pub s3_secret_key: Option<String>,

    /// Public base URL under which uploaded objects are reachable
    pub s3_public_url: Option<String>,

    /// Root directory for the local storage backend
    #[serde(default = "default_local_storage_dir")]
    pub local_storage_dir: String,

    /// Base URL prefixed onto references returned by the local backend
    #[serde(default = "default_local_storage_url")]
    pub local_storage_url: String,

    /// Model server base URL. When absent the inference adapter starts in
    /// degraded mode and serves synthetic results.
    pub inference_url: Option<String>,

    /// Maximum number of analysis jobs executing concurrently
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Upper bound on a single background execution, in seconds
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_local_storage_dir() -> String {
    "./storage".to_string()
}

fn default_local_storage_url() -> String {
    "http://localhost:8000/storage".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_job_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// True when a complete set of S3 credentials is configured.
    pub fn has_s3(&self) -> bool {
        self.s3_bucket.is_some()
            && self.s3_endpoint.is_some()
            && self.s3_access_key.is_some()
            && self.s3_secret_key.is_some()
    }
}

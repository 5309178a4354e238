pub mod app_service_client;
pub mod retry;
pub mod sync_client;

pub use retry::RetryPolicy;
pub use sync_client::{ClientError, ClientEvent, SyncClient, SyncClientOptions};

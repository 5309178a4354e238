use reqwest::Client;
use tokio::sync::OnceCell;
use std::sync::Arc;
use jsonwebtoken::{encode, Header, EncodingKey};
use serde::{Serialize, Deserialize};
use chrono::{Utc, Duration};

use crate::models::Permission;

static APP_SERVICE_CLIENT: OnceCell<Arc<AppServiceClient>> = OnceCell::const_new();

#[derive(Debug)]
pub struct AppServiceClient {
    client: Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "type")]
    type_: String,
    exp: usize,
}

#[derive(Debug, Deserialize)]
struct DocPermissionResponse {
    permission: String,
}

impl AppServiceClient {
    pub fn new(base_url: String, jwt_secret: String, service_name: String) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| format!("Failed to build reqwest client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jwt_secret,
            service_name,
        })
    }

    fn generate_token(&self) -> Result<String, String> {
        let expiration = Utc::now() + Duration::seconds(60); // 1 minute expiration

        let claims = Claims {
            sub: self.service_name.clone(),
            type_: "service".to_string(),
            exp: expiration.timestamp() as usize,
        };

        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.jwt_secret.as_bytes()))
            .map_err(|e| format!("Failed to generate JWT: {}", e))
    }

    /// Principals of a user
    pub async fn get_prpls(&self, uid: &str) -> Result<serde_json::Value, String> {
        let token = self.generate_token()?;
        let url = format!("{}/auth/prpls/{}", self.base_url, uid);
        self.client.get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send().await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?
            .json().await
            .map_err(|e| e.to_string())
    }

    /// Permission of a user on a document
    pub async fn get_doc_permission(&self, uid: &str, doc_id: &str) -> Result<Permission, String> {
        let token = self.generate_token()?;
        let url = format!("{}/auth/docs/{}/permission/{}", self.base_url, doc_id, uid);
        let response = self.client.get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send().await
            .map_err(|e| e.to_string())?;

        if response.status() == reqwest::StatusCode::NOT_FOUND || response.status() == reqwest::StatusCode::FORBIDDEN {
            return Ok(Permission::None);
        }
        let body: DocPermissionResponse = response
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json().await
            .map_err(|e| e.to_string())?;
        Ok(Permission::from_app_service(&body.permission))
    }
}

/// Initialize the global AppServiceClient
pub fn init_app_service_client(base_url: String, jwt_secret: String, service_name: String) -> Result<(), String> {
    let client = AppServiceClient::new(base_url, jwt_secret, service_name)?;
    APP_SERVICE_CLIENT.set(Arc::new(client))
        .map_err(|_| "AppServiceClient already initialized".to_string())
}

/// Get the global AppServiceClient instance
pub fn get_app_service_client() -> Option<Arc<AppServiceClient>> {
    APP_SERVICE_CLIENT.get().cloned()
}

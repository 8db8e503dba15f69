use anyhow::{Result, anyhow};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

use crate::query::RowQuery;

/// Non-success answer from PostgREST, kept typed so callers can react to
/// specific statuses (e.g. 409 on a uniqueness violation).
#[derive(Debug, Error)]
#[error("API error ({status}): {body}")]
pub struct SupabaseApiError {
    pub status: u16,
    pub body: String,
}

impl SupabaseApiError {
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>, prefer: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        if let Some(prefer) = prefer {
            headers.insert("Prefer", HeaderValue::from_str(prefer)?);
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T>
    where T: DeserializeOwned {
        self.request_with_prefer(method, path, auth_token, body, None).await
    }

    pub async fn request_with_prefer<T>(&self, method: Method, path: &str,
                                        auth_token: Option<&str>, body: Option<Value>,
                                        prefer: Option<&str>)
                                        -> Result<T>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let headers = self.get_headers(auth_token, prefer)?;

        let mut req = self.client.request(method, &url)
            .headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(SupabaseApiError {
                status: status.as_u16(),
                body: error_text,
            }.into());
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// `GET` the rows matched by `query`.
    pub async fn select<T>(&self, query: &RowQuery, auth_token: Option<&str>) -> Result<Vec<T>>
    where T: DeserializeOwned {
        self.request(Method::GET, &query.to_path(), auth_token, None).await
    }

    /// Insert one row and return the stored representation.
    pub async fn insert<T>(&self, table: &str, row: Value, auth_token: Option<&str>) -> Result<T>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/{}", table);
        let mut rows: Vec<T> = self.request_with_prefer(
            Method::POST,
            &path,
            auth_token,
            Some(row),
            Some("return=representation"),
        ).await?;

        if rows.is_empty() {
            return Err(anyhow!("Insert into {} returned no rows", table));
        }
        Ok(rows.swap_remove(0))
    }

    /// `PATCH` the rows matched by `query`; returns the rows that were
    /// actually updated, so an empty result means no row matched the filters.
    pub async fn update<T>(&self, query: &RowQuery, changes: Value, auth_token: Option<&str>) -> Result<Vec<T>>
    where T: DeserializeOwned {
        self.request_with_prefer(
            Method::PATCH,
            &query.to_path(),
            auth_token,
            Some(changes),
            Some("return=representation"),
        ).await
    }

    /// Call a Postgres function exposed through PostgREST.
    pub async fn rpc<T>(&self, function: &str, args: Value, auth_token: Option<&str>) -> Result<T>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, auth_token, Some(args)).await
    }
}

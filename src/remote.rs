use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RemoteSettings;
use crate::domain::{CompletionRecord, StopId, TourDefinition, TourId, UserId};
use crate::error::TourError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The uniqueness constraint on `(user_id, stop_id)` rejected the row.
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCompletion {
    pub user_id: UserId,
    pub stop_id: StopId,
    pub completed_at: DateTime<Utc>,
}

impl From<&CompletionRecord> for RemoteCompletion {
    fn from(record: &CompletionRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            stop_id: record.stop_id.clone(),
            completed_at: record.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRow {
    #[serde(rename = "id")]
    pub stop_id: StopId,
    pub tour_id: TourId,
}

/// The stop-completion and stops tables of the remote backend.
pub trait ProgressBackend: Send + Sync {
    fn completion_exists(&self, user: &UserId, stop: &StopId) -> Result<bool, TourError>;
    fn insert_completion(&self, record: &CompletionRecord) -> Result<InsertOutcome, TourError>;
    fn list_completions(&self, user: &UserId) -> Result<Vec<RemoteCompletion>, TourError>;
    fn count_completions(&self, user: &UserId) -> Result<u64, TourError>;
    fn delete_completions(&self, user: &UserId) -> Result<(), TourError>;
    fn list_stops(&self) -> Result<Vec<StopRow>, TourError>;
}

pub trait TourSource: Send + Sync {
    fn fetch_tour(&self, id: &TourId) -> Result<Option<TourDefinition>, TourError>;
}

impl<T: ProgressBackend + ?Sized> ProgressBackend for Arc<T> {
    fn completion_exists(&self, user: &UserId, stop: &StopId) -> Result<bool, TourError> {
        (**self).completion_exists(user, stop)
    }

    fn insert_completion(&self, record: &CompletionRecord) -> Result<InsertOutcome, TourError> {
        (**self).insert_completion(record)
    }

    fn list_completions(&self, user: &UserId) -> Result<Vec<RemoteCompletion>, TourError> {
        (**self).list_completions(user)
    }

    fn count_completions(&self, user: &UserId) -> Result<u64, TourError> {
        (**self).count_completions(user)
    }

    fn delete_completions(&self, user: &UserId) -> Result<(), TourError> {
        (**self).delete_completions(user)
    }

    fn list_stops(&self) -> Result<Vec<StopRow>, TourError> {
        (**self).list_stops()
    }
}

impl<T: TourSource + ?Sized> TourSource for Arc<T> {
    fn fetch_tour(&self, id: &TourId) -> Result<Option<TourDefinition>, TourError> {
        (**self).fetch_tour(id)
    }
}

/// Stand-in used when no backend is configured; every call fails as a remote error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl ProgressBackend for Unconfigured {
    fn completion_exists(&self, _user: &UserId, _stop: &StopId) -> Result<bool, TourError> {
        Err(TourError::RemoteNotConfigured)
    }

    fn insert_completion(&self, _record: &CompletionRecord) -> Result<InsertOutcome, TourError> {
        Err(TourError::RemoteNotConfigured)
    }

    fn list_completions(&self, _user: &UserId) -> Result<Vec<RemoteCompletion>, TourError> {
        Err(TourError::RemoteNotConfigured)
    }

    fn count_completions(&self, _user: &UserId) -> Result<u64, TourError> {
        Err(TourError::RemoteNotConfigured)
    }

    fn delete_completions(&self, _user: &UserId) -> Result<(), TourError> {
        Err(TourError::RemoteNotConfigured)
    }

    fn list_stops(&self) -> Result<Vec<StopRow>, TourError> {
        Err(TourError::RemoteNotConfigured)
    }
}

impl TourSource for Unconfigured {
    fn fetch_tour(&self, _id: &TourId) -> Result<Option<TourDefinition>, TourError> {
        Err(TourError::RemoteNotConfigured)
    }
}

/// Blocking client for a PostgREST-style backend.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(settings: &RemoteSettings) -> Result<Self, TourError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("offline-tours/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| TourError::RemoteHttp(err.to_string()))?,
        );
        if let Some(key) = &settings.api_key {
            headers.insert(
                "apikey",
                HeaderValue::from_str(key).map_err(|err| TourError::RemoteHttp(err.to_string()))?,
            );
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|err| TourError::RemoteHttp(err.to_string()))?,
            );
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| TourError::RemoteHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.base_url)
    }

    fn handle_status(response: Response) -> Result<Response, TourError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "remote request failed".to_string());
        Err(TourError::RemoteStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, TourError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 2;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    if attempt < MAX_RETRIES && is_retryable_status(resp.status().as_u16()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(TourError::RemoteHttp(err.to_string()));
                }
            }
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<T, TourError> {
        let url = self.table_url(table);
        let response = self.send_with_retries(|| self.client.get(&url).query(query))?;
        Self::handle_status(response)?
            .json()
            .map_err(|err| TourError::RemoteHttp(err.to_string()))
    }
}

impl ProgressBackend for RestClient {
    fn completion_exists(&self, user: &UserId, stop: &StopId) -> Result<bool, TourError> {
        let rows: Vec<Value> = self.get_json(
            "stop_completions",
            &[
                ("user_id", format!("eq.{user}")),
                ("stop_id", format!("eq.{stop}")),
                ("select", "stop_id".to_string()),
                ("limit", "1".to_string()),
            ],
        )?;
        Ok(!rows.is_empty())
    }

    fn insert_completion(&self, record: &CompletionRecord) -> Result<InsertOutcome, TourError> {
        let url = self.table_url("stop_completions");
        let body = RemoteCompletion::from(record);
        let response = self.send_with_retries(|| {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(&body)
        })?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(InsertOutcome::AlreadyExists);
        }
        Self::handle_status(response)?;
        Ok(InsertOutcome::Inserted)
    }

    fn list_completions(&self, user: &UserId) -> Result<Vec<RemoteCompletion>, TourError> {
        self.get_json(
            "stop_completions",
            &[
                ("user_id", format!("eq.{user}")),
                ("select", "user_id,stop_id,completed_at".to_string()),
                ("order", "completed_at.asc".to_string()),
            ],
        )
    }

    fn count_completions(&self, user: &UserId) -> Result<u64, TourError> {
        let url = self.table_url("stop_completions");
        let query = [
            ("user_id", format!("eq.{user}")),
            ("select", "stop_id".to_string()),
        ];
        let response = self.send_with_retries(|| {
            self.client
                .head(&url)
                .query(&query)
                .header("Prefer", "count=exact")
        })?;
        let response = Self::handle_status(response)?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| TourError::RemoteHttp("missing exact count in response".to_string()))
    }

    fn delete_completions(&self, user: &UserId) -> Result<(), TourError> {
        let url = self.table_url("stop_completions");
        let query = [("user_id", format!("eq.{user}"))];
        let response = self.send_with_retries(|| self.client.delete(&url).query(&query))?;
        Self::handle_status(response)?;
        Ok(())
    }

    fn list_stops(&self) -> Result<Vec<StopRow>, TourError> {
        self.get_json("stops", &[("select", "id,tour_id".to_string())])
    }
}

impl TourSource for RestClient {
    fn fetch_tour(&self, id: &TourId) -> Result<Option<TourDefinition>, TourError> {
        let rows: Vec<TourDefinition> = self.get_json(
            "tours",
            &[
                ("id", format!("eq.{id}")),
                ("select", "*,stops(*)".to_string()),
            ],
        )?;
        Ok(rows.into_iter().next().map(|mut tour| {
            tour.stops
                .sort_by_key(|stop| stop.position.unwrap_or(u32::MAX));
            tour
        }))
    }
}

/// Total from a `Content-Range` header such as `0-24/57` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

//! Google Sheets (REST v4) backed collection store.

use std::collections::BTreeMap;
use std::time::Duration;

use amiibo_core::{
    parse_status_cell, status_cell, CollectionStateRow, UserContext, UserPreferences,
    COLLECTION_HEADER,
};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::collection::{CollectionStore, StoreError};

const DARK_MODE_HEADER: &str = "DarkMode";

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub api_base: String,
    pub collection_worksheet: String,
    pub config_worksheet: String,
    pub timeout: Duration,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://sheets.googleapis.com/v4".to_string(),
            collection_worksheet: "AmiiboCollection".to_string(),
            config_worksheet: "AmiiboCollectionConfigManager".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Collection store over a user's spreadsheet. `UserContext::user_id` is the
/// spreadsheet id and `UserContext::credential` the OAuth bearer token.
#[derive(Debug, Clone)]
pub struct SheetsCollectionStore {
    client: reqwest::Client,
    config: SheetsConfig,
}

impl SheetsCollectionStore {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building sheets client")?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|e| StoreError::Malformed(format!("invalid sheets api base: {e}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::Malformed("sheets api base cannot be a base".into()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        user: &UserContext,
        worksheet: &str,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, StoreError> {
        let token = user
            .credential
            .as_deref()
            .ok_or(StoreError::MissingCredential)?;
        debug!(%method, %url, "sheets request");
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let text = resp.text().await.unwrap_or_default();
        Err(classify_sheets_status(
            status,
            retry_after,
            &text,
            &user.user_id,
            worksheet,
        ))
    }

    async fn get_values(
        &self,
        user: &UserContext,
        worksheet: &str,
        cells: &str,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let range = format!("{worksheet}!{cells}");
        let url = self.endpoint(&["spreadsheets", &user.user_id, "values", &range])?;
        let resp = self.send(user, worksheet, Method::GET, url, None).await?;
        let parsed: ValueRange = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(parsed.values)
    }

    async fn update_values(
        &self,
        user: &UserContext,
        worksheet: &str,
        cells: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), StoreError> {
        let range = format!("{worksheet}!{cells}");
        let mut url = self.endpoint(&["spreadsheets", &user.user_id, "values", &range])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");
        let body = json!({ "range": range, "majorDimension": "ROWS", "values": rows });
        self.send(user, worksheet, Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn append_values(
        &self,
        user: &UserContext,
        worksheet: &str,
        cells: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), StoreError> {
        let range = format!("{worksheet}!{cells}");
        let append = format!("{range}:append");
        let mut url = self.endpoint(&["spreadsheets", &user.user_id, "values", &append])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let body = json!({ "majorDimension": "ROWS", "values": rows });
        self.send(user, worksheet, Method::POST, url, Some(body)).await?;
        Ok(())
    }

    async fn add_worksheet(&self, user: &UserContext, worksheet: &str) -> Result<(), StoreError> {
        info!(spreadsheet = %user.user_id, worksheet, "creating missing worksheet");
        let batch = format!("{}:batchUpdate", user.user_id);
        let url = self.endpoint(&["spreadsheets", &batch])?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": worksheet,
                        "gridProperties": { "rowCount": 500, "columnCount": 3 }
                    }
                }
            }]
        });
        self.send(user, worksheet, Method::POST, url, Some(body)).await?;
        Ok(())
    }

    /// Collection rows, creating the worksheet when the spreadsheet lacks it.
    async fn collection_values(&self, user: &UserContext) -> Result<Vec<Vec<String>>, StoreError> {
        let worksheet = &self.config.collection_worksheet;
        match self.get_values(user, worksheet, "A:C").await {
            Ok(values) => Ok(values),
            Err(StoreError::MissingWorksheet(_)) => {
                self.add_worksheet(user, worksheet).await?;
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl CollectionStore for SheetsCollectionStore {
    async fn read_all(&self, user: &UserContext) -> Result<BTreeMap<String, bool>, StoreError> {
        let values = self.collection_values(user).await?;
        let mut out = BTreeMap::new();
        for row in parse_collection_rows(&values) {
            out.entry(row.amiibo_id).or_insert(row.collected);
        }
        Ok(out)
    }

    async fn write(
        &self,
        user: &UserContext,
        amiibo_id: &str,
        amiibo_name: &str,
        collected: bool,
    ) -> Result<(), StoreError> {
        let worksheet = &self.config.collection_worksheet;
        let values = self.collection_values(user).await?;
        let row = vec![
            amiibo_id.to_string(),
            amiibo_name.to_string(),
            status_cell(collected).to_string(),
        ];

        match locate_row(&values, amiibo_id) {
            Some(n) => {
                self.update_values(user, worksheet, &format!("A{n}:C{n}"), vec![row])
                    .await
            }
            None => {
                let mut rows = Vec::with_capacity(2);
                if values.is_empty() {
                    rows.push(COLLECTION_HEADER.iter().map(|h| h.to_string()).collect());
                }
                rows.push(row);
                self.append_values(user, worksheet, "A:C", rows).await
            }
        }
    }

    async fn read_preferences(&self, user: &UserContext) -> Result<UserPreferences, StoreError> {
        let worksheet = &self.config.config_worksheet;
        let values = match self.get_values(user, worksheet, "A1:A2").await {
            Ok(values) => values,
            Err(StoreError::MissingWorksheet(_)) => {
                self.add_worksheet(user, worksheet).await?;
                let defaults = UserPreferences::default();
                self.write_preferences(user, defaults).await?;
                return Ok(defaults);
            }
            Err(err) => return Err(err),
        };
        let dark_mode = values
            .get(1)
            .and_then(|row| row.first())
            .map(|cell| parse_status_cell(cell))
            .unwrap_or(false);
        Ok(UserPreferences { dark_mode })
    }

    async fn write_preferences(
        &self,
        user: &UserContext,
        preferences: UserPreferences,
    ) -> Result<(), StoreError> {
        let worksheet = &self.config.config_worksheet;
        let rows = vec![
            vec![DARK_MODE_HEADER.to_string()],
            vec![status_cell(preferences.dark_mode).to_string()],
        ];
        self.update_values(user, worksheet, "A1:A2", rows).await
    }
}

/// Map a non-success Sheets API response onto the store error taxonomy.
pub fn classify_sheets_status(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: &str,
    spreadsheet_id: &str,
    worksheet: &str,
) -> StoreError {
    let lower = body.to_ascii_lowercase();
    match status {
        StatusCode::UNAUTHORIZED => StoreError::InvalidCredentials,
        StatusCode::FORBIDDEN if lower.contains("quota") || lower.contains("dailylimitexceeded") => {
            StoreError::QuotaExceeded
        }
        StatusCode::FORBIDDEN => StoreError::PermissionDenied(spreadsheet_id.to_string()),
        StatusCode::NOT_FOUND => StoreError::NotFound(spreadsheet_id.to_string()),
        StatusCode::BAD_REQUEST if lower.contains("unable to parse range") => {
            StoreError::MissingWorksheet(worksheet.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS if lower.contains("per day") => StoreError::QuotaExceeded,
        StatusCode::TOO_MANY_REQUESTS => StoreError::RateLimited { retry_after_secs },
        s if s.is_server_error() => StoreError::Unavailable(s.as_u16()),
        s => StoreError::Http {
            status: s.as_u16(),
            body: body.chars().take(200).collect(),
        },
    }
}

/// 1-based sheet row number of the first row whose id cell equals `amiibo_id`.
pub fn locate_row(values: &[Vec<String>], amiibo_id: &str) -> Option<usize> {
    values
        .iter()
        .position(|row| row.first().map(String::as_str) == Some(amiibo_id))
        .map(|idx| idx + 1)
}

pub fn parse_collection_rows(values: &[Vec<String>]) -> Vec<CollectionStateRow> {
    values
        .iter()
        .filter_map(|row| {
            let id = row.first()?.trim();
            if id.is_empty() || id == COLLECTION_HEADER[0] {
                return None;
            }
            Some(CollectionStateRow {
                amiibo_id: id.to_string(),
                amiibo_name: row.get(1).cloned().unwrap_or_default(),
                collected: row.get(2).map(|c| parse_status_cell(c)).unwrap_or(false),
            })
        })
        .collect()
}

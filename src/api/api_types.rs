//! Serde-deserializable types matching the story API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::types::Story;

// ============================================================================
// Story payload - shared by the list and detail endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStory {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub photo_url: String,
  pub lat: Option<f64>,
  pub lon: Option<f64>,
  pub created_at: DateTime<Utc>,
}

impl From<ApiStory> for Story {
  fn from(api: ApiStory) -> Self {
    Story {
      id: api.id,
      name: api.name,
      description: api.description,
      photo_url: api.photo_url,
      lat: api.lat,
      lon: api.lon,
      created_at: api.created_at,
    }
  }
}

// ============================================================================
// Endpoint responses
// ============================================================================

/// `GET /stories`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStoriesResponse {
  pub error: bool,
  pub message: Option<String>,
  #[serde(default)]
  pub list_story: Vec<ApiStory>,
}

/// `GET /stories/{id}`
#[derive(Debug, Deserialize)]
pub struct ApiStoryDetailResponse {
  pub error: bool,
  pub message: Option<String>,
  pub story: Option<ApiStory>,
}

/// `POST /stories`
#[derive(Debug, Deserialize)]
pub struct ApiMessageResponse {
  pub error: bool,
  pub message: Option<String>,
}

/// Body of a failed request
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
  message: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Extract a user-facing message from a failed response body.
///
/// Falls back to the HTTP status text when the body is not the API's JSON
/// error shape.
pub fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
  serde_json::from_str::<ApiErrorResponse>(body)
    .ok()
    .and_then(|r| r.message)
    .filter(|m| !m.trim().is_empty())
    .unwrap_or_else(|| {
      status
        .canonical_reason()
        .map(String::from)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
    })
}

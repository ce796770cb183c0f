use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

/// One story in the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
  pub id: String,
  /// Author display name
  pub name: String,
  pub description: String,
  pub photo_url: String,
  pub lat: Option<f64>,
  pub lon: Option<f64>,
  pub created_at: DateTime<Utc>,
}

impl Story {
  /// Coordinates, when the story was posted with a location
  pub fn location(&self) -> Option<(f64, f64)> {
    Some((self.lat?, self.lon?))
  }
}

/// Largest photo the API accepts
pub const MAX_PHOTO_BYTES: usize = 1_000_000;

/// A story to upload
#[derive(Debug, Clone, PartialEq)]
pub struct NewStory {
  pub description: String,
  /// File name sent with the photo part
  pub photo_name: String,
  pub photo: Vec<u8>,
  pub lat: Option<f64>,
  pub lon: Option<f64>,
}

impl NewStory {
  pub fn new(description: impl Into<String>, photo_name: impl Into<String>, photo: Vec<u8>) -> Self {
    Self {
      description: description.into(),
      photo_name: photo_name.into(),
      photo,
      lat: None,
      lon: None,
    }
  }

  pub fn with_location(mut self, lat: f64, lon: f64) -> Self {
    self.lat = Some(lat);
    self.lon = Some(lon);
    self
  }

  pub fn location(&self) -> Option<(f64, f64)> {
    Some((self.lat?, self.lon?))
  }

  /// Check what the server would reject before spending an upload on it.
  pub fn validate(&self) -> Result<()> {
    if self.description.trim().is_empty() {
      return Err(eyre!("Description must not be empty"));
    }
    if self.photo.is_empty() {
      return Err(eyre!("Photo {} is empty", self.photo_name));
    }
    if self.photo.len() > MAX_PHOTO_BYTES {
      return Err(eyre!(
        "Photo {} is {} bytes; the limit is {}",
        self.photo_name,
        self.photo.len(),
        MAX_PHOTO_BYTES
      ));
    }
    if let Some((lat, lon)) = self.location() {
      if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(eyre!("Location {}, {} is out of range", lat, lon));
      }
    }
    Ok(())
  }
}

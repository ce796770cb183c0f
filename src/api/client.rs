use crate::api::api_types::{
  parse_error_message, ApiMessageResponse, ApiStoriesResponse, ApiStoryDetailResponse,
};
use crate::api::types::{NewStory, Story};
use crate::cache::FetchError;
use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Request, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Story API client wrapper
#[derive(Clone)]
pub struct StoryClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl StoryClient {
  pub fn new(config: &Config, token: Option<String>) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: base_url(&config.api.url)?,
      token,
    })
  }

  /// Get one page of stories, newest first
  pub async fn list_stories(
    &self,
    page: u32,
    size: u32,
    with_location: bool,
  ) -> Result<Vec<Story>, FetchError> {
    let mut url = self.endpoint(&["stories"])?;
    url
      .query_pairs_mut()
      .append_pair("page", &page.to_string())
      .append_pair("size", &size.to_string())
      .append_pair("location", if with_location { "1" } else { "0" });

    let response: ApiStoriesResponse = self.send(self.http.get(url)).await?;
    if response.error {
      return Err(rejected(response.message, "An unknown error occurred"));
    }

    Ok(response.list_story.into_iter().map(Story::from).collect())
  }

  /// Get a single story by id
  pub async fn get_story(&self, id: &str) -> Result<Story, FetchError> {
    let url = self.endpoint(&["stories", id])?;

    let response: ApiStoryDetailResponse = self.send(self.http.get(url)).await?;
    match response.story {
      Some(story) if !response.error => Ok(story.into()),
      _ => Err(rejected(response.message, &format!("Story {} not found", id))),
    }
  }

  /// Upload a new story as a multipart form
  pub async fn add_story(&self, story: &NewStory) -> Result<(), FetchError> {
    let request = self.add_story_request(story)?;

    let response: ApiMessageResponse = self.send(request).await?;
    if response.error {
      return Err(rejected(response.message, "Story was not accepted"));
    }

    tracing::info!(photo = %story.photo_name, bytes = story.photo.len(), "story uploaded");
    Ok(())
  }

  fn add_story_request(&self, story: &NewStory) -> Result<RequestBuilder, FetchError> {
    let url = self.endpoint(&["stories"])?;

    let photo = Part::bytes(story.photo.clone())
      .file_name(story.photo_name.clone())
      .mime_str(photo_mime(&story.photo_name))
      .map_err(|e| FetchError::Network(format!("Invalid photo type: {}", e)))?;

    let form = upload_fields(story)
      .into_iter()
      .fold(Form::new(), |form, (name, value)| form.text(name, value))
      .part("photo", photo);

    Ok(self.http.post(url).multipart(form))
  }

  /// Build a URL under the API root. Each segment is percent-encoded, so ids
  /// can never add path segments, a query or a fragment.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
    if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
      return Err(FetchError::Network(format!("Invalid path segment {:?}", bad)));
    }

    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| FetchError::Network(format!("API url {} cannot take a path", self.base_url)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn build(&self, request: RequestBuilder) -> Result<Request, FetchError> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };
    request
      .build()
      .map_err(|e| FetchError::Network(format!("Invalid request: {}", e)))
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, FetchError> {
    let request = self.build(request)?;
    tracing::debug!(method = %request.method(), url = %request.url(), "request");

    let response = self.http.execute(request).await.map_err(transport_error)?;
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    decode(status, &body)
  }
}

/// Parse the configured API root.
fn base_url(raw: &str) -> Result<Url> {
  let url = Url::parse(raw).map_err(|e| eyre!("Invalid API url {}: {}", raw, e))?;
  if url.cannot_be_a_base() {
    return Err(eyre!("Invalid API url {}: not a hierarchical url", raw));
  }
  Ok(url)
}

/// Map a finished response to its payload or a classified error.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, FetchError> {
  if !status.is_success() {
    return Err(FetchError::Server {
      status: Some(status.as_u16()),
      message: parse_error_message(status, body),
    });
  }

  // The server answered but broke the response contract.
  serde_json::from_str(body).map_err(|e| FetchError::Server {
    status: Some(status.as_u16()),
    message: format!("Unexpected response body: {}", e),
  })
}

/// A success status whose body carries `error: true`.
fn rejected(message: Option<String>, fallback: &str) -> FetchError {
  FetchError::Server {
    status: None,
    message: message.unwrap_or_else(|| fallback.to_string()),
  }
}

/// Text parts of an upload, in the order they are sent.
fn upload_fields(story: &NewStory) -> Vec<(&'static str, String)> {
  let mut fields = vec![("description", story.description.clone())];
  if let Some((lat, lon)) = story.location() {
    fields.push(("lat", lat.to_string()));
    fields.push(("lon", lon.to_string()));
  }
  fields
}

fn photo_mime(file_name: &str) -> &'static str {
  let extension = Path::new(file_name)
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase);

  match extension.as_deref() {
    Some("jpg" | "jpeg") => "image/jpeg",
    Some("png") => "image/png",
    Some("gif") => "image/gif",
    Some("webp") => "image/webp",
    _ => "application/octet-stream",
  }
}

fn transport_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Network("Request timed out".to_string())
  } else {
    FetchError::Network(e.to_string())
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};
  use tokio::task::JoinHandle;

  fn client(url: &str, token: Option<&str>) -> StoryClient {
    let mut config = Config::default();
    config.api.url = url.to_string();
    config.api.timeout_secs = 2;
    StoryClient::new(&config, token.map(String::from)).unwrap()
  }

  fn new_story() -> NewStory {
    NewStory::new("Sunset at the beach", "sunset.jpg", b"fake-jpeg-bytes".to_vec())
  }

  /// Answer one connection per response, in order, and hand back the raw
  /// requests.
  pub(crate) async fn serve(
    responses: Vec<(&'static str, String)>,
  ) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/v1", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
      let mut requests = Vec::new();
      for (status, body) in responses {
        let (mut socket, _) = listener.accept().await.unwrap();
        requests.push(read_request(&mut socket).await);

        let response = format!(
          "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          status,
          body.len(),
          body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
      }
      requests
    });

    (url, handle)
  }

  async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<Vec<String>>) {
    serve(vec![(status, body.to_string())]).await
  }

  async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
      let n = socket.read(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);

      if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let length = head
          .lines()
          .find_map(|l| l.strip_prefix("content-length:"))
          .and_then(|v| v.trim().parse::<usize>().ok())
          .unwrap_or(0);
        if buf.len() >= end + 4 + length {
          break;
        }
      }
    }

    String::from_utf8_lossy(&buf).into_owned()
  }

  #[test]
  fn test_endpoint_keeps_version_segment() {
    for root in ["https://story-api.dicoding.dev/v1", "https://story-api.dicoding.dev/v1/"] {
      let url = client(root, None).endpoint(&["stories"]).unwrap();
      assert_eq!(url.as_str(), "https://story-api.dicoding.dev/v1/stories");
    }

    let url = client("http://localhost:8080", None)
      .endpoint(&["stories", "story-1"])
      .unwrap();
    assert_eq!(url.as_str(), "http://localhost:8080/stories/story-1");
  }

  #[test]
  fn test_story_id_cannot_escape_its_segment() {
    let client = client("https://story-api.dicoding.dev/v1", None);

    let url = client.endpoint(&["stories", "a/../b?x#y"]).unwrap();
    assert_eq!(
      url.as_str(),
      "https://story-api.dicoding.dev/v1/stories/a%2F..%2Fb%3Fx%23y"
    );
    assert!(url.query().is_none() && url.fragment().is_none());

    assert!(client.endpoint(&["stories", ".."]).is_err());
    assert!(client.endpoint(&["stories", ""]).is_err());
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(base_url("not a url").is_err());
    assert!(base_url("mailto:someone@example.com").is_err());
  }

  #[test]
  fn test_decode_classifies_failures() {
    let err = decode::<ApiMessageResponse>(
      StatusCode::PAYLOAD_TOO_LARGE,
      r#"{"error": true, "message": "Payload content length greater than maximum allowed: 1000000"}"#,
    )
    .unwrap_err();
    assert_eq!(
      err,
      FetchError::Server {
        status: Some(413),
        message: "Payload content length greater than maximum allowed: 1000000".to_string(),
      }
    );

    // A success status with a body that is not the API's shape is the
    // server's fault, not the network's.
    let err = decode::<ApiStoriesResponse>(StatusCode::OK, "<html>maintenance</html>").unwrap_err();
    assert!(matches!(err, FetchError::Server { status: Some(200), .. }));

    let ok: ApiMessageResponse =
      decode(StatusCode::CREATED, r#"{"error": false, "message": "Story created successfully"}"#)
        .unwrap();
    assert!(!ok.error);
  }

  #[test]
  fn test_upload_fields() {
    let fields = upload_fields(&new_story());
    assert_eq!(fields, vec![("description", "Sunset at the beach".to_string())]);

    let fields = upload_fields(&new_story().with_location(-6.2, 106.8));
    assert_eq!(
      fields,
      vec![
        ("description", "Sunset at the beach".to_string()),
        ("lat", "-6.2".to_string()),
        ("lon", "106.8".to_string()),
      ]
    );
  }

  #[test]
  fn test_photo_mime() {
    assert_eq!(photo_mime("a.JPG"), "image/jpeg");
    assert_eq!(photo_mime("a.png"), "image/png");
    assert_eq!(photo_mime("photo"), "application/octet-stream");
  }

  #[tokio::test]
  async fn test_add_story_request() {
    let client = client("https://story-api.dicoding.dev/v1", Some("secret"));
    let request = client
      .build(client.add_story_request(&new_story()).unwrap())
      .unwrap();

    assert_eq!(request.method(), reqwest::Method::POST);
    assert_eq!(request.url().as_str(), "https://story-api.dicoding.dev/v1/stories");

    let headers = request.headers();
    assert_eq!(headers["authorization"], "Bearer secret");
    assert!(headers["content-type"]
      .to_str()
      .unwrap()
      .starts_with("multipart/form-data; boundary="));
    assert!(headers.contains_key("content-length"));
  }

  #[tokio::test]
  async fn test_add_story_sends_multipart_form() {
    let (url, server) =
      serve_once("201 Created", r#"{"error": false, "message": "Story created successfully"}"#).await;
    let client = client(&url, Some("secret"));

    client
      .add_story(&new_story().with_location(-6.2, 106.8))
      .await
      .unwrap();

    let request = server.await.unwrap().remove(0);
    assert!(request.starts_with("POST /v1/stories HTTP/1.1"));

    let lower = request.to_ascii_lowercase();
    assert!(lower.contains("authorization: bearer secret"));
    assert!(request.contains(r#"name="description""#));
    assert!(request.contains("Sunset at the beach"));
    assert!(request.contains(r#"name="photo"; filename="sunset.jpg""#));
    assert!(lower.contains("content-type: image/jpeg"));
    assert!(request.contains("fake-jpeg-bytes"));
    assert!(request.contains(r#"name="lat""#));
    assert!(request.contains("106.8"));
  }

  #[tokio::test]
  async fn test_add_story_server_error() {
    let (url, server) = serve_once(
      "400 Bad Request",
      r#"{"error": true, "message": "\"photo\" is required"}"#,
    )
    .await;

    let err = client(&url, None).add_story(&new_story()).await.unwrap_err();
    assert_eq!(
      err,
      FetchError::Server {
        status: Some(400),
        message: "\"photo\" is required".to_string(),
      }
    );
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_add_story_rejected_in_body() {
    let (url, server) =
      serve_once("200 OK", r#"{"error": true, "message": "Missing authentication"}"#).await;

    let err = client(&url, None).add_story(&new_story()).await.unwrap_err();
    assert_eq!(
      err,
      FetchError::Server {
        status: None,
        message: "Missing authentication".to_string(),
      }
    );
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let client = client("http://127.0.0.1:9/v1", None);
    let err = client.list_stories(1, 20, false).await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
  }
}

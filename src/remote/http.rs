// HTTP backend: a small blocking client for the JSON gateway that fronts the
// storage service. Each call is one request; failures carry the status code
// and response body so the user sees what the gateway said.
//
// Endpoints used:
//   GET  /folders?page_size=N[&page_token=T]   -> FolderListResponse
//   GET  /folders/{id}/files                   -> FileListResponse
//   GET  /folders/{id}/content?path=P          -> raw bytes
//   HEAD /folders/{id}/content?path=P          -> 200 / 404
//   POST /folders/{id}/upload  (multipart: path, file)

use anyhow::{Context, Result};
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ByteSink, FolderPage, RemoteFile, RemoteFolder, RemoteStorage, Transfer};
use crate::config::BackendSettings;
use crate::error::{self, Error};

/// Blocking client holding the reqwest client, the gateway base URL and an
/// optional bearer token.
#[derive(Clone)]
pub struct HttpDrive {
    client: Client,
    base_url: String,
    token: Option<String>,
    page_size: usize,
}

/// Folder entry as the gateway returns it.
#[derive(Serialize, Deserialize, Debug)]
pub struct FolderEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct FolderListResponse {
    pub folders: Vec<FolderEntry>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct FileListResponse {
    pub files: Vec<RemoteFile>,
}

impl HttpDrive {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        // Uploads of large files can take a while; only bound the connect.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(None)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpDrive {
            client,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            token: settings.api_token.clone(),
            page_size: settings.page_size.max(1),
        })
    }

    /// Helper to build the Authorization header map when a token is set.
    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(t) = &self.token {
            let val = HeaderValue::from_str(&format!("Bearer {t}"))
                .context("API token is not a valid header value")?;
            headers.insert(AUTHORIZATION, val);
        }
        Ok(headers)
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        let res = req
            .headers(self.auth_headers()?)
            .send()
            .with_context(|| format!("Failed to send {what} request"))?;
        if !res.status().is_success() {
            let status = res.status();
            let txt = res.text().unwrap_or_default();
            anyhow::bail!("{what} failed: {status} - {txt}");
        }
        Ok(res)
    }

    /// `<base>/folders/<id>/<tail>` with the id percent-encoded as a single
    /// path segment.
    fn folder_url(&self, folder: &RemoteFolder, tail: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid gateway URL '{}'", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Gateway URL '{}' cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(["folders", folder.id.as_str(), tail]);
        Ok(url)
    }

    fn fetch_page(&self, page_token: Option<&str>) -> Result<FolderListResponse> {
        let mut req = self
            .client
            .get(format!("{}/folders", self.base_url))
            .query(&[("page_size", self.page_size.to_string())]);
        if let Some(t) = page_token {
            req = req.query(&[("page_token", t)]);
        }
        let res = self.send(req, "Folder listing")?;
        res.json().context("Parsing folder listing json")
    }

    fn fetch_files(&self, folder: &RemoteFolder) -> Result<Vec<RemoteFile>> {
        let res = self.send(self.client.get(self.folder_url(folder, "files")?), "File listing")?;
        let mut body: FileListResponse = res.json().context("Parsing file listing json")?;
        body.files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(body.files)
    }

    fn fetch_content(&self, folder: &RemoteFolder, path: &str, dest: &mut dyn Write) -> Result<u64> {
        let req = self
            .client
            .get(self.folder_url(folder, "content")?)
            .query(&[("path", path)]);
        let mut res = self.send(req, "Download")?;
        res.copy_to(dest)
            .with_context(|| format!("Failed to read '{path}' from response"))
    }

    fn head_content(&self, folder: &RemoteFolder, path: &str) -> Result<bool> {
        let res = self
            .client
            .head(self.folder_url(folder, "content")?)
            .query(&[("path", path)])
            .headers(self.auth_headers()?)
            .send()
            .context("Failed to send existence check")?;
        match res.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => anyhow::bail!("Existence check for '{path}' failed: {s}"),
        }
    }

    fn post_file(
        &self,
        folder: &RemoteFolder,
        path: &str,
        source: &Path,
        on_bytes: ByteSink,
    ) -> Result<Transfer> {
        let file = File::open(source)
            .with_context(|| format!("Failed to open {}", source.display()))?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let file_name = source
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("upload.bin")
            .to_string();

        let aborted = Arc::new(AtomicBool::new(false));
        let reader = ProgressReader {
            inner: file,
            on_bytes,
            aborted: aborted.clone(),
        };
        let part = multipart::Part::reader_with_length(reader, len)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .context("Invalid mime type")?;
        let form = multipart::Form::new()
            .text("path", path.to_string())
            .part("file", part);

        let req = self.client.post(self.folder_url(folder, "upload")?).multipart(form);
        match self.send(req, "Upload") {
            Ok(_) => Ok(Transfer::Completed),
            Err(_) if aborted.load(Ordering::SeqCst) => Ok(Transfer::Aborted),
            Err(e) => Err(e),
        }
    }
}

/// Wraps the upload body and reports every chunk reqwest pulls out of it.
struct ProgressReader {
    inner: File,
    on_bytes: ByteSink,
    aborted: Arc<AtomicBool>,
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 && !(self.on_bytes)(n as u64) {
            self.aborted.store(true, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "upload cancelled"));
        }
        Ok(n)
    }
}

// Gateway failures flatten into the crate taxonomy with the whole context
// chain in the message.
fn unavailable(e: anyhow::Error) -> Error {
    Error::remote(format!("{e:#}"))
}

impl RemoteStorage for HttpDrive {
    fn location(&self) -> String {
        self.base_url.clone()
    }

    fn list_folders_page(&self, page_token: Option<&str>) -> error::Result<FolderPage> {
        let body = self.fetch_page(page_token).map_err(unavailable)?;
        debug!(count = body.folders.len(), more = body.next_page_token.is_some(), "folder page");
        Ok(FolderPage {
            folders: body
                .folders
                .into_iter()
                .map(|f| RemoteFolder {
                    id: f.id,
                    display_name: f.name,
                    parent_id: f.parent_id,
                })
                .collect(),
            next_page: body.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn list_files(&self, folder: &RemoteFolder) -> error::Result<Vec<RemoteFile>> {
        self.fetch_files(folder).map_err(unavailable)
    }

    fn download(&self, folder: &RemoteFolder, path: &str, dest: &mut dyn Write) -> error::Result<u64> {
        self.fetch_content(folder, path, dest).map_err(unavailable)
    }

    fn exists(&self, folder: &RemoteFolder, path: &str) -> error::Result<bool> {
        self.head_content(folder, path).map_err(unavailable)
    }

    fn upload(
        &self,
        folder: &RemoteFolder,
        path: &str,
        source: &Path,
        on_bytes: ByteSink,
    ) -> error::Result<Transfer> {
        self.post_file(folder, path, source, on_bytes)
            .map_err(unavailable)
    }
}

use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::Result;
use crate::files::FileEntry;
use crate::track::BatchResult;

/// Thin, synchronous HTTP client mirroring the local backend's operations
/// against a remote Dreamlake service. Only the RPCs the core needs are
/// modeled; response/request shapes beyond that are opaque to this crate.
pub struct RemoteBackend {
    base_url: String,
    api_key: String,
    client: Client,
    session_id: std::sync::OnceLock<String>,
}

impl RemoteBackend {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), api_key, client, session_id: std::sync::OnceLock::new() })
    }

    fn auth(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }

    fn session_id(&self) -> &str {
        self.session_id.get().map(String::as_str).unwrap_or("")
    }

    pub fn create_or_update_session(
        &self,
        prefix: &str,
        readme: Option<&str>,
        tags: &[String],
        metadata: &serde_json::Map<String, Value>,
        write_protected: bool,
    ) -> Result<()> {
        let body = serde_json::json!({
            "prefix": prefix,
            "readme": readme,
            "tags": tags,
            "metadata": metadata,
            "writeProtected": write_protected,
        });
        let resp = self
            .auth(self.client.post(format!("{}/sessions", self.base_url)))
            .json(&body)
            .send()?
            .error_for_status()?;
        let parsed: Value = resp.json()?;
        if let Some(id) = parsed.pointer("/session/id").and_then(Value::as_str) {
            let _ = self.session_id.set(id.to_string());
        }
        Ok(())
    }

    pub fn logs_append(&self, message: &str, level: &str, metadata: Option<&Value>) -> Result<()> {
        let body = serde_json::json!({
            "sessionId": self.session_id(),
            "records": [{ "message": message, "level": level, "metadata": metadata }],
        });
        self.auth(self.client.post(format!("{}/logs/append", self.base_url)))
            .json(&body)
            .send()?
            .error_for_status()?;
        Ok(())
    }

    pub fn params_set(&self, flat: &Value) -> Result<()> {
        let body = serde_json::json!({ "sessionId": self.session_id(), "data": flat });
        self.auth(self.client.put(format!("{}/params", self.base_url)))
            .json(&body)
            .send()?
            .error_for_status()?;
        Ok(())
    }

    pub fn params_get(&self) -> Result<Option<Value>> {
        let resp = self
            .auth(self.client.get(format!("{}/params", self.base_url)))
            .query(&[("sessionId", self.session_id())])
            .send()?
            .error_for_status()?;
        Ok(resp.json::<Value>()?.get("data").cloned())
    }

    pub fn track_append_batch(&self, track: &str, points: &[Value]) -> Result<BatchResult> {
        let body = serde_json::json!({ "sessionId": self.session_id(), "dataPoints": points });
        let resp = self
            .auth(self.client.post(format!("{}/tracks/{}/append_batch", self.base_url, track)))
            .json(&body)
            .send()?
            .error_for_status()?;
        let parsed: Value = resp.json()?;
        Ok(BatchResult {
            start_index: parsed["startIndex"].as_u64().unwrap_or(0),
            end_index: parsed["endIndex"].as_u64().unwrap_or(0),
            count: parsed["count"].as_u64().unwrap_or(0),
        })
    }

    pub fn track_read(&self, track: &str, start_index: u64, limit: u64) -> Result<Value> {
        let resp = self
            .auth(self.client.get(format!("{}/tracks/{}/read", self.base_url, track)))
            .query(&[
                ("sessionId", self.session_id().to_string()),
                ("startIndex", start_index.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()?
            .error_for_status()?;
        Ok(resp.json()?)
    }

    pub fn files_upload(&self, path_prefix: &str, entry_hint: &Value) -> Result<FileEntry> {
        let body = serde_json::json!({ "sessionId": self.session_id(), "path": path_prefix, "file": entry_hint });
        let resp = self
            .auth(self.client.post(format!("{}/files", self.base_url)))
            .json(&body)
            .send()?
            .error_for_status()?;
        Ok(resp.json()?)
    }

    pub fn files_list(&self, path: Option<&str>, tags: Option<&[String]>) -> Result<Vec<FileEntry>> {
        let mut query = vec![("sessionId", self.session_id().to_string())];
        if let Some(p) = path {
            query.push(("path", p.to_string()));
        }
        if let Some(t) = tags {
            query.push(("tags", t.join(",")));
        }
        let resp = self.auth(self.client.get(format!("{}/files", self.base_url))).query(&query).send()?.error_for_status()?;
        Ok(resp.json()?)
    }
}

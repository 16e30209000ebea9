//! Firestore REST client implementing [`DocumentClient`].
const BASE_DELAY: u64 = 500;
const MAX_RETRIES: u32 = 3;
const PAGE_SIZE: &str = "300";
// Firestore rejects commits with more writes than this.
const MAX_WRITES_PER_COMMIT: usize = 500;
const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com";

use super::document::{Document, DocumentClient, DocumentError, DocumentWrite};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value, json};
use tokio::time::{Duration, sleep};

pub struct FirestoreDocuments {
    client: reqwest::Client,
    endpoint: Url,
    project_id: String,
    database: String,
    token: Option<String>,
}

impl FirestoreDocuments {
    pub fn new(
        project_id: &str,
        database: &str,
        endpoint: Option<Url>,
        token: Option<String>,
    ) -> Result<Self, DocumentError> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => Url::parse(DEFAULT_ENDPOINT)
                .map_err(|e| DocumentError::Malformed(e.to_string()))?,
        };

        Ok(FirestoreDocuments {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            endpoint,
            project_id: project_id.to_string(),
            database: database.to_string(),
            token,
        })
    }

    /// Resource name of the documents root, as used inside request bodies.
    fn root_name(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database
        )
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.root_name())
    }

    /// REST URL for `tail` below the database, e.g. `["documents:commit"]`.
    fn url(&self, tail: &[&str]) -> Result<Url, DocumentError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                DocumentError::Malformed(format!("invalid endpoint: {}", self.endpoint))
            })?;
            segments.pop_if_empty().extend([
                "v1",
                "projects",
                self.project_id.as_str(),
                "databases",
                self.database.as_str(),
            ]);
            segments.extend(tail);
        }
        Ok(url)
    }

    /// Sends a request, retrying transient failures with backoff. Returns
    /// None for 404 when `allow_missing` is set.
    async fn send<F>(&self, build: F, allow_missing: bool) -> Result<Option<Value>, DocumentError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let mut retries = 0;
        loop {
            let mut request = build();
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(Some(response.json::<Value>().await?));
            }
            if status == StatusCode::NOT_FOUND && allow_missing {
                return Ok(None);
            }
            if RETRIABLE_STATUS_CODES.contains(&status) && retries < MAX_RETRIES {
                let retry_millis = BASE_DELAY * 2_u64.pow(retries);
                tracing::warn!(%status, retries, "firestore request failed, retrying");
                sleep(Duration::from_millis(retry_millis)).await;
                retries += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(DocumentError::Status { status, body });
        }
    }
}

#[async_trait]
impl DocumentClient for FirestoreDocuments {
    fn name(&self) -> &'static str {
        "firestore"
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DocumentError> {
        let url = self.url(&["documents", collection, id])?;
        match self.send(|| self.client.get(url.clone()), true).await? {
            Some(value) => Ok(Some(decode_document(&value)?.1)),
            None => Ok(None),
        }
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, DocumentError> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&["documents", collection])?;
            url.query_pairs_mut().append_pair("pageSize", PAGE_SIZE);
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let Some(page) = self.send(|| self.client.get(url.clone()), true).await? else {
                break;
            };
            if let Some(docs) = page.get("documents").and_then(Value::as_array) {
                for doc in docs {
                    documents.push(decode_document(doc)?);
                }
            }

            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(String::from);
            if page_token.is_none() {
                break;
            }
        }

        Ok(documents)
    }

    async fn find(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Document)>, DocumentError> {
        let url = self.url(&["documents:runQuery"])?;
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": field },
                        "op": "EQUAL",
                        "value": encode_value(value),
                    }
                }
            }
        });

        let response = self
            .send(|| self.client.post(url.clone()).json(&body), false)
            .await?
            .unwrap_or(Value::Null);

        let results = response
            .as_array()
            .ok_or_else(|| DocumentError::Malformed("runQuery response is not a list".into()))?;

        // Entries without a document only carry read metadata
        results
            .iter()
            .filter_map(|entry| entry.get("document"))
            .map(decode_document)
            .collect()
    }

    async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<(), DocumentError> {
        let url = self.url(&["documents:commit"])?;

        for chunk in writes.chunks(MAX_WRITES_PER_COMMIT) {
            let writes: Vec<Value> = chunk
                .iter()
                .map(|write| match write {
                    DocumentWrite::Set {
                        collection,
                        id,
                        document,
                    } => json!({
                        "update": {
                            "name": self.document_name(collection, id),
                            "fields": encode_fields(document),
                        }
                    }),
                    DocumentWrite::Update {
                        collection,
                        id,
                        fields,
                    } => json!({
                        "update": {
                            "name": self.document_name(collection, id),
                            "fields": encode_fields(fields),
                        },
                        "updateMask": { "fieldPaths": fields.keys().collect::<Vec<_>>() },
                        "currentDocument": { "exists": true },
                    }),
                    DocumentWrite::Delete { collection, id } => json!({
                        "delete": self.document_name(collection, id),
                    }),
                })
                .collect();
            let body = json!({ "writes": writes });

            self.send(|| self.client.post(url.clone()).json(&body), false)
                .await?;
        }

        Ok(())
    }
}

fn encode_fields(document: &Document) -> Value {
    Value::Object(
        document
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

/// Converts plain JSON into Firestore's typed value representation.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) if n.is_f64() => json!({ "doubleValue": n }),
        Value::Number(n) => json!({ "integerValue": n.to_string() }),
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(values) => json!({
            "arrayValue": { "values": values.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(fields) => json!({ "mapValue": { "fields": encode_fields(fields) } }),
    }
}

pub fn decode_value(value: &Value) -> Result<Value, DocumentError> {
    let malformed = || DocumentError::Malformed(format!("unsupported value: {value}"));
    let object = value.as_object().ok_or_else(malformed)?;
    let (kind, inner) = object.iter().next().ok_or_else(malformed)?;

    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().ok_or_else(malformed)?),
        // 64-bit integers are transported as strings
        "integerValue" => match inner {
            Value::String(s) => json!(s.parse::<i64>().map_err(|_| malformed())?),
            Value::Number(n) => Value::Number(n.clone()),
            _ => return Err(malformed()),
        },
        "doubleValue" => inner.clone(),
        "stringValue" | "timestampValue" | "referenceValue" => {
            Value::String(inner.as_str().ok_or_else(malformed)?.to_string())
        }
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .map(decode_fields)
                .transpose()?
                .unwrap_or_default(),
        ),
        _ => return Err(malformed()),
    })
}

fn decode_fields(fields: &Value) -> Result<Map<String, Value>, DocumentError> {
    fields
        .as_object()
        .ok_or_else(|| DocumentError::Malformed(format!("fields is not a map: {fields}")))?
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

/// Returns the document id (last segment of its resource name) and fields.
fn decode_document(document: &Value) -> Result<(String, Document), DocumentError> {
    let name = document
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| DocumentError::Malformed("document without a name".into()))?;
    let id = name.rsplit('/').next().unwrap_or(name).to_string();

    let fields = match document.get("fields") {
        Some(fields) => decode_fields(fields)?,
        None => Map::new(),
    };
    Ok((id, fields))
}

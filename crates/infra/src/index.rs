use std::time::Duration;

use parley_domain::ports::BoxFuture;
use parley_domain::ports::index::{IndexError, MessageIndex};
use parley_domain::search::{IndexedMessage, SearchRequest, SearchResults};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

pub const INDEX_NAME: &str = "messages";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const BULK_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: usize = 30;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Elasticsearch over its JSON HTTP API.
#[derive(Clone)]
pub struct EsMessageIndex {
    base_url: String,
    client: reqwest::Client,
}

impl EsMessageIndex {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Block until the cluster answers health checks, up to 30 attempts
    /// two seconds apart. The worker proceeds either way; bulk writes
    /// keep failing (and requeueing) until the index comes up.
    pub async fn wait_until_available(&self) {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.ping_once().await {
                Ok(()) => {
                    info!("connected to the search index");
                    return;
                }
                Err(err) => {
                    if attempt < CONNECT_ATTEMPTS {
                        info!(
                            attempt,
                            max_attempts = CONNECT_ATTEMPTS,
                            error = %err,
                            "search index not ready, retrying"
                        );
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        warn!(
            attempts = CONNECT_ATTEMPTS,
            "search index unreachable; indexing will fail until it recovers"
        );
    }

    async fn ping_once(&self) -> Result<(), IndexError> {
        let response = self
            .client
            .get(format!("{}/_cluster/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| IndexError::Unavailable(err.to_string()))?;
        if response.status().as_u16() != 200 {
            return Err(IndexError::Rejected {
                status: response.status().as_u16(),
                body: "cluster unhealthy".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings and mapping for the `messages` index: three shards so chat
/// routing spreads tenants, edge-ngram sub-field for prefix matches and
/// a lowercased sub-field for fuzzy matches.
fn index_definition() -> Value {
    json!({
        "settings": {
            "number_of_shards": 3,
            "number_of_replicas": 1,
            "analysis": {
                "analyzer": {
                    "partial_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "edge_ngram_filter"]
                    },
                    "standard_lowercase": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase"]
                    }
                },
                "filter": {
                    "edge_ngram_filter": {
                        "type": "edge_ngram",
                        "min_gram": 2,
                        "max_gram": 20
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "application_token": {"type": "keyword"},
                "application_name": {"type": "text"},
                "chat_number": {"type": "integer"},
                "message_number": {"type": "integer"},
                "content": {
                    "type": "text",
                    "fields": {
                        "partial": {
                            "type": "text",
                            "analyzer": "partial_analyzer",
                            "search_analyzer": "standard"
                        },
                        "fuzzy": {
                            "type": "text",
                            "analyzer": "standard_lowercase"
                        }
                    }
                },
                "created_at": {"type": "date"}
            }
        }
    })
}

/// Bool/must query over one chat: exact tenant/chat filters plus a
/// multi-match across the prefix (boosted) and fuzzy sub-fields.
fn search_body(request: &SearchRequest) -> Value {
    json!({
        "query": {
            "bool": {
                "must": [
                    {"term": {"application_token": &request.app_token}},
                    {"term": {"chat_number": request.chat_number}},
                    {
                        "multi_match": {
                            "query": &request.query,
                            "fields": ["content.partial^2", "content.fuzzy"],
                            "operator": "and",
                            "fuzziness": "AUTO"
                        }
                    }
                ]
            }
        },
        "sort": [{"message_number": "asc"}],
        "from": request.from_offset(),
        "size": request.per_page
    })
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    total: TotalHits,
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct TotalHits {
    value: i64,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: Value,
}

impl MessageIndex for EsMessageIndex {
    fn ensure_index(&self) -> BoxFuture<'_, Result<(), IndexError>> {
        Box::pin(async move {
            let url = format!("{}/{INDEX_NAME}", self.base_url);
            let head = self
                .client
                .head(&url)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await
                .map_err(|err| IndexError::Unavailable(err.to_string()))?;
            if head.status().as_u16() == 200 {
                info!(index = INDEX_NAME, "index already exists");
                return Ok(());
            }

            let response = self
                .client
                .put(&url)
                .timeout(SEARCH_TIMEOUT)
                .json(&index_definition())
                .send()
                .await
                .map_err(|err| IndexError::Unavailable(err.to_string()))?;
            let status = response.status().as_u16();
            if status >= 400 {
                let body = response.text().await.unwrap_or_default();
                return Err(IndexError::Rejected { status, body });
            }
            info!(index = INDEX_NAME, "created index");
            Ok(())
        })
    }

    fn bulk_write(&self, body: String) -> BoxFuture<'_, Result<(), IndexError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/{INDEX_NAME}/_bulk", self.base_url))
                .timeout(BULK_TIMEOUT)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body)
                .send()
                .await
                .map_err(|err| IndexError::Unavailable(err.to_string()))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|err| IndexError::Request(err.to_string()))?;
            if status >= 400 {
                return Err(IndexError::Rejected { status, body });
            }

            // Per-item failures don't fail the call; the row store is the
            // source of truth and a reindex recovers the documents.
            if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
                if parsed["errors"].as_bool() == Some(true) {
                    warn!(index = INDEX_NAME, "bulk response reported item errors");
                }
            }
            Ok(())
        })
    }

    fn search(
        &self,
        request: &SearchRequest,
    ) -> BoxFuture<'_, Result<SearchResults, IndexError>> {
        let routing = request.routing();
        let body = search_body(request);
        Box::pin(async move {
            let response = self
                .client
                .post(format!(
                    "{}/{INDEX_NAME}/_search?routing={routing}",
                    self.base_url
                ))
                .timeout(SEARCH_TIMEOUT)
                .json(&body)
                .send()
                .await
                .map_err(|err| IndexError::Unavailable(err.to_string()))?;

            let status = response.status().as_u16();
            if status >= 400 {
                let body = response.text().await.unwrap_or_default();
                return Err(IndexError::Rejected { status, body });
            }

            let parsed: SearchResponse = response
                .json()
                .await
                .map_err(|err| IndexError::Request(err.to_string()))?;

            let mut messages = Vec::with_capacity(parsed.hits.hits.len());
            for hit in parsed.hits.hits {
                match serde_json::from_value::<IndexedMessage>(hit.source) {
                    Ok(message) => messages.push(message),
                    Err(err) => warn!(error = %err, "skipping unparseable hit"),
                }
            }

            Ok(SearchResults {
                messages,
                total: parsed.hits.total.value,
            })
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), IndexError>> {
        Box::pin(async move { self.ping_once().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_body_matches_both_content_fields() {
        let request = SearchRequest::new(
            "tok1".to_string(),
            4,
            "hel".to_string(),
            Some(2),
            Some(10),
        );
        let body = search_body(&request);

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["term"]["application_token"], "tok1");
        assert_eq!(must[1]["term"]["chat_number"], 4);
        assert_eq!(must[2]["multi_match"]["query"], "hel");
        assert_eq!(
            must[2]["multi_match"]["fields"],
            json!(["content.partial^2", "content.fuzzy"])
        );
        assert_eq!(must[2]["multi_match"]["operator"], "and");
        assert_eq!(must[2]["multi_match"]["fuzziness"], "AUTO");

        assert_eq!(body["sort"][0]["message_number"], "asc");
        assert_eq!(body["from"], 10);
        assert_eq!(body["size"], 10);
    }

    #[test]
    fn index_definition_declares_shards_and_analyzers() {
        let definition = index_definition();
        assert_eq!(definition["settings"]["number_of_shards"], 3);
        assert_eq!(definition["settings"]["number_of_replicas"], 1);

        let filter = &definition["settings"]["analysis"]["filter"]["edge_ngram_filter"];
        assert_eq!(filter["min_gram"], 2);
        assert_eq!(filter["max_gram"], 20);

        let content = &definition["mappings"]["properties"]["content"];
        assert_eq!(content["fields"]["partial"]["analyzer"], "partial_analyzer");
        assert_eq!(content["fields"]["fuzzy"]["analyzer"], "standard_lowercase");
    }
}

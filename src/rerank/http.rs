/// Remote reranker speaking the common `/rerank` JSON protocol
/// (`{model, query, documents}` -> `{results: [{index, relevance_score}]}`).

use async_trait::async_trait;

use super::{RelevanceModel, RerankError};

#[derive(serde::Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(serde::Deserialize)]
struct RerankResponse {
    results: Vec<RerankHit>,
}

#[derive(serde::Deserialize)]
struct RerankHit {
    index: usize,
    relevance_score: f64,
}

pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpReranker {
    pub fn new(base_url: &str, api_key: Option<String>, model: String) -> Result<Self, RerankError> {
        if base_url.trim().is_empty() {
            return Err(RerankError::NotConfigured(
                "reranker.http_base_url is required when using the http reranker".to_string(),
            ));
        }
        Ok(HttpReranker {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model,
        })
    }
}

#[async_trait]
impl RelevanceModel for HttpReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: passages,
        };

        let mut builder = self.client.post(format!("{}/rerank", self.base_url)).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RerankError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(RerankError::Api { status, message: body });
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| RerankError::Inference(format!("Failed to parse rerank response: {}", e)))?;

        scores_in_passage_order(parsed.results, passages.len())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn scores_in_passage_order(hits: Vec<RerankHit>, count: usize) -> Result<Vec<f64>, RerankError> {
    let mut scores = vec![None; count];
    for hit in hits {
        match scores.get_mut(hit.index) {
            Some(slot) => *slot = Some(hit.relevance_score),
            None => {
                return Err(RerankError::Inference(format!(
                    "rerank result index {} out of range for {} documents",
                    hit.index, count
                )))
            }
        }
    }
    scores
        .into_iter()
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| RerankError::Inference("rerank response did not score every document".to_string()))
}

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Enricher, EnrichmentResult};
use crate::catalog::{ListingAttributes, RawListing};
use crate::llm::{LlmClient, LlmError, LlmMessage};

const SYSTEM_PROMPT: &str = r#"
You are a product catalog normalization assistant for used and new smartphones.
For each input product extract:
- "modelName": normalized model name (e.g. "iPhone 14 Pro Max").
- "storageGb": storage capacity with unit (e.g. "128 GB").
- "color": short color description.
- "warranty": short warranty description if present, else "".
- "batteryHealth": battery health if stated (e.g. "89%"), else "".
Return a STRICT JSON array with one element per input product, in the SAME ORDER, with keys
["id","modelName","storageGb","color","warranty","batteryHealth"]. Output JSON only.
"#;

#[derive(Debug, Error)]
enum EnrichError {
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("unable to parse enrichment json: {0}")]
    Parse(String),
    #[error("enrichment output is not an array")]
    NotArray,
}

pub struct LlmEnricher {
    client: LlmClient,
    batch_size: usize,
}

impl LlmEnricher {
    pub fn new(client: LlmClient, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
        }
    }

    async fn enrich_batch(&self, batch: &[RawListing]) -> Result<Vec<EnrichmentResult>, EnrichError> {
        let payload: Vec<Value> = batch
            .iter()
            .map(|listing| {
                json!({
                    "id": listing.id,
                    "name": listing.name.as_deref().unwrap_or_default(),
                    "description": listing.description.as_deref().unwrap_or_default(),
                    "priceRaw": listing.price_raw,
                    "currency": listing.currency,
                    "availability": listing.availability,
                })
            })
            .collect();
        let messages = vec![
            LlmMessage::system(SYSTEM_PROMPT.trim()),
            LlmMessage::user(json!({ "products": payload }).to_string()),
        ];

        let response = self.client.chat(&messages).await?;
        parse_enrichment(&response.text, batch)
    }
}

#[async_trait]
impl Enricher for LlmEnricher {
    async fn enrich(&self, listings: &[RawListing]) -> Vec<EnrichmentResult> {
        let mut results = Vec::with_capacity(listings.len());
        for (idx, batch) in listings.chunks(self.batch_size).enumerate() {
            match self.enrich_batch(batch).await {
                Ok(enriched) => {
                    debug!(target = "catalog.enrich", batch = idx, size = batch.len(), "enrichment_batch_done");
                    results.extend(enriched);
                }
                Err(err) => {
                    warn!(target = "catalog.enrich", batch = idx, size = batch.len(), error = %err, "enrichment_fallback");
                    results.extend(batch.iter().map(|listing| EnrichmentResult::empty(&listing.id)));
                }
            }
        }
        results
    }
}

/// Maps a model reply onto `batch` by position. Ids always come from the input.
fn parse_enrichment(text: &str, batch: &[RawListing]) -> Result<Vec<EnrichmentResult>, EnrichError> {
    let value = extract_json_array(text)?;
    let Value::Array(items) = value else {
        return Err(EnrichError::NotArray);
    };

    Ok(batch
        .iter()
        .enumerate()
        .map(|(idx, listing)| match items.get(idx) {
            Some(Value::Object(item)) => EnrichmentResult {
                id: listing.id.clone(),
                attributes: ListingAttributes {
                    model_name: text_field(item.get("modelName")),
                    storage_gb: text_field(item.get("storageGb")),
                    color: text_field(item.get("color")),
                    warranty: text_field(item.get("warranty")),
                    battery_health: text_field(item.get("batteryHealth")),
                },
            },
            _ => EnrichmentResult::empty(&listing.id),
        })
        .collect())
}

fn text_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_json_array(input: &str) -> Result<Value, EnrichError> {
    let cleaned = strip_markdown_fence(input);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Ok(value);
    }
    // models sometimes wrap the array in prose
    let start = cleaned.find('[');
    let end = cleaned.rfind(']');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&cleaned[start..=end])
            .map_err(|err| EnrichError::Parse(err.to_string())),
        _ => Err(EnrichError::Parse("no json array in reply".into())),
    }
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;
    use testresult::TestResult;

    fn batch() -> Vec<RawListing> {
        ["a", "b"]
            .iter()
            .map(|id| RawListing {
                id: id.to_string(),
                seller_phone: "1".into(),
                ..RawListing::default()
            })
            .collect()
    }

    #[test]
    fn parses_fenced_array_by_position() {
        let reply = "```json\n[{\"id\":\"x\",\"modelName\":\"iPhone 12\",\"storageGb\":\"64 GB\",\"color\":\" \",\"warranty\":\"\"},{\"modelName\":\"Galaxy S21\",\"batteryHealth\":\"91%\"}]\n```";
        let results = parse_enrichment(reply, &batch()).unwrap();
        assert_eq!(results[0].id, "a", "ids come from the input, not the model");
        assert_eq!(results[0].attributes.model_name.as_deref(), Some("iPhone 12"));
        assert_eq!(results[0].attributes.storage_gb.as_deref(), Some("64 GB"));
        assert_eq!(results[0].attributes.color, None);
        assert_eq!(results[0].attributes.warranty, None);
        assert_eq!(results[1].attributes.battery_health.as_deref(), Some("91%"));
    }

    #[test]
    fn extracts_array_wrapped_in_prose() {
        let reply = "Here you go: [{\"modelName\":\"Pixel 7\"}] hope this helps";
        let results = parse_enrichment(reply, &batch()).unwrap();
        assert_eq!(results[0].attributes.model_name.as_deref(), Some("Pixel 7"));
        assert_eq!(results[1], EnrichmentResult::empty("b"));
    }

    #[test]
    fn non_array_reply_is_an_error() {
        assert!(matches!(
            parse_enrichment("{\"modelName\":\"x\"}", &batch()),
            Err(EnrichError::NotArray)
        ));
        assert!(parse_enrichment("sorry, I cannot help", &batch()).is_err());
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_empty_results() -> TestResult {
        let client = LlmClient::new(LlmConfig::from_lookup(|key| {
            (key == "TENSORZERO_GATEWAY_URL").then(String::new)
        }))?;
        let enricher = LlmEnricher::new(client, 1);
        let results = enricher.enrich(&batch()).await;
        assert_eq!(results, vec![EnrichmentResult::empty("a"), EnrichmentResult::empty("b")]);
        Ok(())
    }
}

//! Document Store: versioned on-disk vector indexes over field definitions
//! and supplemental markdown, with a "smart query" mode that expands
//! conversational context into search terms before retrieval.
//!
//! Grounded on `original_source/geo_assistant/doc_stores/_base.py`
//! (`DocumentStore`, FAISS `IndexFlatIP` + `documents.json` pair, `add`/
//! `query`/`smart_query`). The FAISS `IndexFlatIP` is an exact,
//! brute-force nearest-neighbour search over normalised vectors; this
//! crate's flat `Vec<(i64, Vec<f32>)>` linear scan is the faithful
//! idiomatic-Rust equivalent at this data scale (see SPEC_FULL.md §A) and
//! avoids a dependency on a crate that needs a system FAISS/BLAS install.

mod fields;

pub use fields::{FieldDefinition, FieldFormat, SupplementalInfoSection};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::utils::unique_ordered_by;

#[derive(Debug, Error)]
pub enum DocStoreError {
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("io error writing {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to (de)serialize document store state: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A document's text content and the metadata to persist alongside it.
/// Implemented by `FieldDefinition` and `SupplementalInfoSection`.
pub trait DocumentMetadata: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The text embedded to place this document in the vector index.
    fn embedding_text(&self) -> &str;

    /// The key `smart_query` unions results by (e.g. a field's `name`, a
    /// section's `title`).
    fn dedup_key(&self) -> &str;
}

/// One document queued for `add`: a stable id (see [`stable_document_id`])
/// plus its metadata.
#[derive(Debug, Clone)]
pub struct Document<T> {
    pub id: i64,
    pub metadata: T,
}

/// A single retrieval hit: the stored metadata plus cosine distance to the
/// query vector (both sides L2-normalised, so distance is a plain dot
/// product).
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit<T> {
    pub metadata: T,
    pub distance: f32,
}

/// Derives a stable integer document id from `(owning_table, source_document,
/// ordinal)` so re-ingesting the same document is idempotent. Uses
/// `DefaultHasher`, which (unlike `HashMap`'s `RandomState`) is seeded
/// deterministically, so the same inputs always hash to the same id across
/// runs and processes.
pub fn stable_document_id(owning_table: &str, source_document: &str, ordinal: usize) -> i64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    owning_table.hash(&mut hasher);
    source_document.hash(&mut hasher);
    ordinal.hash(&mut hasher);
    (hasher.finish() & 0x7fff_ffff_ffff_ffff) as i64
}

#[derive(Serialize, Deserialize)]
struct SearchTerms {
    terms: Vec<String>,
}

const KEY_TERMS_SYSTEM_MESSAGE: &str = "You are an expert at querying large databases for \
relevant information. You will be given a conversation currently in progress, and using that \
as context, you must return search terms that will yield the most relevant information for \
that conversation. Respond with a JSON object of the shape {\"terms\": [\"...\"]}.\n\n\
Additional context:\n{context}";

struct IndexState {
    vectors: Vec<(i64, Vec<f32>)>,
}

/// A versioned vector index over one kind of document metadata, persisted
/// to `{root}/{name}/{version}/index.bin` + `documents.json`.
pub struct DocumentStore<T: DocumentMetadata> {
    name: String,
    version: String,
    dir: PathBuf,
    dim: usize,
    index: RwLock<IndexState>,
    documents: RwLock<HashMap<i64, T>>,
}

impl<T: DocumentMetadata> DocumentStore<T> {
    /// Opens (or creates) the store at `{root}/{name}/{version}/`. If the
    /// index and metadata files disagree on their id set — an id present
    /// in the index but absent from metadata — the store is treated as
    /// corrupted and re-initialised empty, with a warning logged, per
    /// spec §4.5's invariant.
    pub async fn open(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        version: impl Into<String>,
        dim: usize,
    ) -> Result<Self, DocStoreError> {
        let name = name.into();
        let version = version.into();
        let dir = root.into().join(&name).join(&version);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DocStoreError::Io(dir.display().to_string(), e))?;

        let index_path = dir.join("index.bin");
        let docs_path = dir.join("documents.json");

        let vectors: Vec<(i64, Vec<f32>)> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DocStoreError::Io(index_path.display().to_string(), e)),
        };
        let documents: HashMap<i64, T> = match tokio::fs::read(&docs_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(DocStoreError::Io(docs_path.display().to_string(), e)),
        };

        let corrupted = vectors.iter().any(|(id, _)| !documents.contains_key(id));
        let (vectors, documents) = if corrupted {
            tracing::warn!(
                store = %name, version = %version,
                "document store index/metadata id sets disagree; re-initialising empty"
            );
            (Vec::new(), HashMap::new())
        } else {
            (vectors, documents)
        };

        Ok(Self {
            name,
            version,
            dir,
            dim,
            index: RwLock::new(IndexState { vectors }),
            documents: RwLock::new(documents),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Embeds and L2-normalises `documents`' text, inserts them into the
    /// index and metadata map, and persists both atomically (write to a
    /// temp file, then rename).
    pub async fn add(&self, llm: &LlmClient, documents: Vec<Document<T>>) -> Result<(), DocStoreError> {
        if documents.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> =
            documents.iter().map(|d| d.metadata.embedding_text().to_string()).collect();
        let embeddings = llm.embed(&texts).await?;

        {
            let mut index = self.index.write().unwrap();
            let mut meta = self.documents.write().unwrap();
            for (doc, mut embedding) in documents.into_iter().zip(embeddings) {
                normalize_l2(&mut embedding);
                index.vectors.retain(|(id, _)| *id != doc.id);
                index.vectors.push((doc.id, embedding));
                meta.insert(doc.id, doc.metadata);
            }
        }

        self.persist().await
    }

    async fn persist(&self) -> Result<(), DocStoreError> {
        let (vectors_json, docs_json) = {
            let index = self.index.read().unwrap();
            let docs = self.documents.read().unwrap();
            (serde_json::to_vec(&index.vectors)?, serde_json::to_vec_pretty(&*docs)?)
        };
        write_atomic(&self.dir.join("index.bin"), &vectors_json).await?;
        write_atomic(&self.dir.join("documents.json"), &docs_json).await?;
        Ok(())
    }

    /// Embeds and normalises `text`, returns the top-`k` nearest documents
    /// by cosine similarity (a plain dot product, since both sides are
    /// L2-normalised), each joined back to its stored metadata.
    pub async fn query(&self, llm: &LlmClient, text: &str, k: usize) -> Result<Vec<QueryHit<T>>, DocStoreError> {
        let mut embeddings = llm.embed(std::slice::from_ref(&text.to_string())).await?;
        let mut query_vec = embeddings.remove(0);
        normalize_l2(&mut query_vec);
        Ok(self.search(&query_vec, k))
    }

    fn search(&self, query_vec: &[f32], k: usize) -> Vec<QueryHit<T>> {
        let index = self.index.read().unwrap();
        let docs = self.documents.read().unwrap();

        let mut scored: Vec<(i64, f32)> = index
            .vectors
            .iter()
            .map(|(id, vec)| (*id, dot(query_vec, vec)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .filter_map(|(id, distance)| {
                docs.get(&id).map(|metadata| QueryHit { metadata: metadata.clone(), distance })
            })
            .collect()
    }

    /// Expands `user_text` into search terms via `llm` (using conversation
    /// history and optional domain context to steer the expansion), then
    /// runs `query` for each term independently, unioning hits by
    /// [`DocumentMetadata::dedup_key`] in first-seen order.
    pub async fn smart_query(
        &self,
        llm: &LlmClient,
        parsing_model: &str,
        user_text: &str,
        conversation: &[ChatMessage],
        domain_context: Option<&str>,
        k: usize,
    ) -> Result<Vec<QueryHit<T>>, DocStoreError> {
        let system_prompt =
            KEY_TERMS_SYSTEM_MESSAGE.replace("{context}", domain_context.unwrap_or(""));
        let transcript: String = conversation
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let user_content =
            serde_json::json!({ "conversation": transcript, "query": user_text }).to_string();

        let parsed: SearchTerms =
            llm.parse_structured(parsing_model, &system_prompt, &user_content).await?;

        let mut all_hits = Vec::new();
        for term in &parsed.terms {
            all_hits.extend(self.query(llm, term, k).await?);
        }
        Ok(unique_ordered_by(all_hits, |hit| hit.metadata.dedup_key().to_string()))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

fn normalize_l2(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

async fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> Result<(), DocStoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(|e| DocStoreError::Io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| DocStoreError::Io(path.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_l2_yields_unit_vector() {
        let mut v = vec![3.0_f32, 4.0];
        normalize_l2(&mut v);
        let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn stable_document_id_is_deterministic() {
        let a = stable_document_id("base.parcels", "doc.pdf", 3);
        let b = stable_document_id("base.parcels", "doc.pdf", 3);
        let c = stable_document_id("base.parcels", "doc.pdf", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn smart_query_union_is_order_stable() {
        #[derive(Clone, Serialize, Deserialize)]
        struct Meta {
            name: String,
        }
        impl DocumentMetadata for Meta {
            fn embedding_text(&self) -> &str {
                &self.name
            }
            fn dedup_key(&self) -> &str {
                &self.name
            }
        }

        let first_term_hits = vec![
            QueryHit { metadata: Meta { name: "BldgArea".into() }, distance: 0.9 },
            QueryHit { metadata: Meta { name: "LotArea".into() }, distance: 0.8 },
        ];
        let second_term_hits = vec![
            QueryHit { metadata: Meta { name: "LotArea".into() }, distance: 0.95 },
            QueryHit { metadata: Meta { name: "ResidFAR".into() }, distance: 0.7 },
        ];
        let combined = unique_ordered_by(
            first_term_hits.into_iter().chain(second_term_hits).collect(),
            |hit: &QueryHit<Meta>| hit.metadata.dedup_key().to_string(),
        );
        let names: Vec<&str> = combined.iter().map(|h| h.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["BldgArea", "LotArea", "ResidFAR"]);
    }
}

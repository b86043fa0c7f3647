//! Tile server HTTP client.
//!
//! Read-only client over a `pg_tileserv`-shaped index/detail API, used by
//! the Table Registry to discover published tables. Grounded on the
//! `requests.get` calls in `original_source/geo_assistant/table_registry.py`
//! (`_extract_table_from_tileserv`, `load_from_tileserv`).

use serde::Deserialize;
use thiserror::Error;

use crate::registry::Bounds;

#[derive(Debug, Error)]
pub enum TileServerError {
    #[error("request to tile server failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tile server returned unexpected payload: {0}")]
    UnexpectedPayload(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TileIndexEntry {
    pub id: String,
    #[serde(rename = "self")]
    pub self_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TileDetailRaw {
    #[serde(default)]
    properties: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    bounds: Option<[f64; 4]>,
    #[serde(default)]
    tileurl: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TileDetail {
    pub columns: Vec<String>,
    pub tile_url: String,
    pub bounds: Option<Bounds>,
}

pub struct TileServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl TileServerClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }

    pub async fn list_tables(&self) -> Result<Vec<TileIndexEntry>, TileServerError> {
        let url = format!("{}/index.json", self.base_url.trim_end_matches('/'));
        let entries = self.client.get(url).send().await?.error_for_status()?.json().await?;
        Ok(entries)
    }

    pub async fn table_detail(&self, id: &str) -> Result<TileDetail, TileServerError> {
        let url = format!("{}/{id}.json", self.base_url.trim_end_matches('/'));
        let raw: TileDetailRaw = self.client.get(url).send().await?.error_for_status()?.json().await?;

        let columns = raw.properties.keys().cloned().collect();
        let tile_url = raw.tileurl.unwrap_or_default();
        let bounds = raw.bounds.map(|[minx, miny, maxx, maxy]| Bounds {
            west: minx,
            south: miny,
            east: maxx,
            north: maxy,
        });
        Ok(TileDetail { columns, tile_url, bounds })
    }
}

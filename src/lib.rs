//! # MVT Forge
//!
//! Tools for rendering Mapbox Vector Tiles from PostGIS.
//!
//! ## Current features
//!
//! Given a layer SQL template and an XYZ tile address, this crate scopes
//! the query to the tile's web-mercator extent, resolves the layer's
//! substitution tokens, wraps the result in an `ST_AsMVT` encoding query,
//! and hands the final SQL to an executor. Slow or failing queries come
//! back as classified errors, and an optional error strategy can substitute
//! a fallback payload (for example a pre-rendered image) instead of
//! propagating the failure.
//!
//! ## Known limitations
//!
//! The current focus is rendering a single layer per query from a single
//! PostGIS database; compositing multiple layers into one tile is up to
//! the calling application. Your geometry column is assumed to be in
//! EPSG:3857 web mercator unless the layer spec says otherwise, and the
//! render time budget is enforced by the executor (via
//! `statement_timeout`), not by wall-clock cancellation in this crate.
//!
//! The trait-based design allows for further extensibility, so additional
//! executors and tile source formats can be added in the future.

#![deny(warnings)]

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

use serde::Deserialize;

pub mod error;
pub mod extent;
pub mod postgres;
pub mod renderer;
pub mod substitution;
pub mod timer;

pub use error::{ExecutorError, RenderError};
pub use extent::{ExtentCalculator, GeoExtent};
pub use renderer::{
    LayerSpec, PgMvtRenderer, RenderAttrs, RenderConfig, TileBody, TileContent, TileErrorStrategy,
    MVT_CONTENT_TYPE,
};
pub use timer::Timer;

/// A single row returned by the tile query. The wrapping query yields one
/// row whose only column is the encoded tile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileRow {
    pub mvt: Vec<u8>,
}

/// Render limit configuration, threaded through to the executor and the
/// enclosing cache layer.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct RenderLimits {
    /// Query time budget in milliseconds; `0` means no limit.
    #[serde(default)]
    pub render: u64,
    /// Whether the enclosing cache layer should cache a tile produced after
    /// a timeout. Opaque to this crate.
    #[serde(default)]
    pub cache_on_timeout: bool,
}

/// The abstract boundary to the database layer: takes a final SQL string,
/// resolves to rows or a failure. Implementations own the connection and
/// the enforcement of the render time budget.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        limits: &RenderLimits,
    ) -> Result<Vec<TileRow>, ExecutorError>;
}

/// This is the main trait exported by this crate: anything that can render
/// the Mapbox vector tile for a slippy map tile in XYZ format.
#[async_trait]
pub trait TileRenderer {
    async fn render_mvt(&self, zoom: u8, x: i32, y: i32)
        -> Result<TileContent, RenderError>;
}

//! The PostGIS MVT renderer: extent math, query composition, and the
//! timed, classified executor round trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

use crate::error::{classify, LayerSpecError, RenderError, SubstitutionError, RENDERER_TAG};
use crate::extent::ExtentCalculator;
use crate::substitution::{format_named, replace_tokens, TokenValues};
use crate::timer::Timer;
use crate::{QueryExecutor, RenderLimits, TileRenderer, TileRow};

/// Content type of an encoded vector tile.
pub const MVT_CONTENT_TYPE: &str = "application/x-protobuf";

/// Nominal pixel size in meters (0.28mm), the standard conversion between
/// ground resolution and map scale denominator.
const STANDARD_PIXEL_SIZE: f64 = 0.00028;

const QUERY_PHASE: &str = "query";

/// Wrapping query: embeds the resolved layer SQL as a subquery, keeps the
/// geometry column and the stable row identifier, filters by intersection
/// with the buffered tile envelope, and encodes the survivors.
const TILE_SQL: &str = "SELECT ST_AsMVT(q, '{layer}', 4096, 'mvt_geom') \
     FROM (SELECT \"{gcol}\" AS mvt_geom, \"{fid}\" FROM ({_sql}) AS layer_q \
     WHERE \"{gcol}\" && ST_MakeEnvelope({b_xmin}, {b_ymin}, {b_xmax}, {b_ymax}, {srid})) AS q;";

fn default_geom_column() -> String {
    String::from("the_geom_webmercator")
}

fn default_srid() -> i32 {
    3857
}

fn default_layer_id() -> String {
    String::from("clayer")
}

fn default_fid_column() -> String {
    String::from("cartodb_id")
}

/// A single tile layer: the SQL template it is rendered from, plus the
/// columns and projection the wrapping query needs. Read-only once built.
#[derive(Clone, Debug, Deserialize)]
pub struct LayerSpec {
    /// Layer SQL template; may use the `!bbox!`, `!scale_denominator!`,
    /// `!pixel_width!` and `!pixel_height!` tokens.
    pub sql: String,
    #[serde(default = "default_geom_column")]
    pub geom_column: String,
    #[serde(default = "default_srid")]
    pub srid: i32,
    /// Layer name embedded in the encoded tile.
    #[serde(default = "default_layer_id")]
    pub id: String,
    /// Stable row identifier column kept alongside the geometry.
    #[serde(default = "default_fid_column")]
    pub fid_column: String,
}

impl LayerSpec {
    /// Constructs a new LayerSpec from a YAML definition.
    pub fn from_yaml(data: &str) -> Result<LayerSpec, LayerSpecError> {
        Ok(serde_yaml::from_str(data)?)
    }
}

fn default_tile_size() -> u32 {
    256
}

fn default_tile_max_geosize() -> f64 {
    40075017.0 // earth circumference in webmercator 3857
}

/// Tile grid configuration. Immutable per renderer instance.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    #[serde(default = "default_tile_max_geosize")]
    pub tile_max_geosize: f64,
    /// Buffer around each tile, in pixels.
    #[serde(default)]
    pub buffer_size: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            tile_max_geosize: default_tile_max_geosize(),
            buffer_size: 0,
        }
    }
}

/// Caller-supplied render attributes: the resolution factor used to scale
/// the screen-space buffer size, plus extra values for the wrapping query.
#[derive(Clone, Debug)]
pub struct RenderAttrs {
    pub resolution: f64,
    pub extra: HashMap<String, String>,
}

impl Default for RenderAttrs {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            extra: HashMap::new(),
        }
    }
}

/// Body of a rendered tile: the raw rows from the tile query, or a
/// substitute payload produced by an error strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TileBody {
    Rows(Vec<TileRow>),
    Payload(Vec<u8>),
}

impl TileBody {
    /// Flattens the body into the tile bytes, concatenating row columns in
    /// order for the rows case.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            TileBody::Rows(rows) => {
                let mut bytes = Vec::new();
                for row in rows {
                    bytes.extend_from_slice(&row.mvt);
                }
                bytes
            }
            TileBody::Payload(bytes) => bytes,
        }
    }
}

/// A successfully rendered tile: body, response headers, and per-phase
/// timing stats.
#[derive(Clone, Debug, PartialEq)]
pub struct TileContent {
    pub body: TileBody,
    pub headers: HashMap<String, String>,
    pub stats: HashMap<String, Duration>,
}

/// Recovery hook for failed renders.
///
/// Invoked at most once per failed render with the classified error.
/// Returning `Ok` supersedes the failure entirely, so the caller sees a
/// success; returning `Err` propagates (typically the same error).
#[async_trait]
pub trait TileErrorStrategy: Send + Sync {
    async fn on_tile_error(&self, error: RenderError) -> Result<TileContent, RenderError>;
}

/// Renders MVT tiles for one layer through an abstract query executor.
///
/// Holds only immutable configuration, so concurrent renders can share one
/// instance. Each render issues exactly one query; there is no caching and
/// no retry at this layer.
pub struct PgMvtRenderer<E> {
    executor: E,
    layer: LayerSpec,
    config: RenderConfig,
    limits: RenderLimits,
    attrs: RenderAttrs,
    error_strategy: Option<Arc<dyn TileErrorStrategy>>,
}

impl<E: QueryExecutor> PgMvtRenderer<E> {
    pub fn new(executor: E, layer: LayerSpec) -> Self {
        Self {
            executor,
            layer,
            config: RenderConfig::default(),
            limits: RenderLimits::default(),
            attrs: RenderAttrs::default(),
            error_strategy: None,
        }
    }

    pub fn with_config(mut self, config: RenderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_limits(mut self, limits: RenderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_attrs(mut self, attrs: RenderAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_error_strategy(mut self, strategy: Arc<dyn TileErrorStrategy>) -> Self {
        self.error_strategy = Some(strategy);
        self
    }

    /// Composes the final SQL for a tile without executing it.
    ///
    /// Pass 1 resolves the layer template's tokens against the tile's
    /// buffered extent; pass 2 embeds the result into the wrapping
    /// `ST_AsMVT` query.
    pub fn build_query(&self, zoom: u8, x: i32, y: i32) -> Result<String, SubstitutionError> {
        let calc = ExtentCalculator::new(self.config.tile_size, self.config.tile_max_geosize);
        let extent = calc.extent(zoom, x, y, self.config.buffer_size, self.attrs.resolution);
        let xyz_resolution = calc.resolution(zoom);

        let tokens = TokenValues {
            bbox: format!(
                "ST_MakeEnvelope({},{},{},{},{})",
                extent.b_xmin, extent.b_ymin, extent.b_xmax, extent.b_ymax, self.layer.srid
            ),
            // https://github.com/mapnik/mapnik/wiki/ScaleAndPpi#scale-denominator
            scale_denominator: (xyz_resolution / STANDARD_PIXEL_SIZE).to_string(),
            pixel_size: xyz_resolution.to_string(),
        };
        let layer_sql = replace_tokens(&self.layer.sql, &tokens);

        // later inserts win: caller attrs may not shadow computed values
        let mut values: HashMap<String, String> = HashMap::new();
        values.insert(String::from("_sql"), layer_sql);
        for (name, value) in &self.attrs.extra {
            values.insert(name.clone(), value.clone());
        }
        values.insert(String::from("zoom"), zoom.to_string());
        values.insert(String::from("x"), x.to_string());
        values.insert(String::from("y"), y.to_string());
        values.insert(String::from("xyz_resolution"), xyz_resolution.to_string());
        values.insert(String::from("srid"), self.layer.srid.to_string());
        values.insert(String::from("gcol"), self.layer.geom_column.clone());
        values.insert(String::from("fid"), self.layer.fid_column.clone());
        values.insert(String::from("layer"), self.layer.id.clone());
        values.insert(String::from("xmin"), extent.xmin.to_string());
        values.insert(String::from("ymin"), extent.ymin.to_string());
        values.insert(String::from("xmax"), extent.xmax.to_string());
        values.insert(String::from("ymax"), extent.ymax.to_string());
        values.insert(String::from("b_xmin"), extent.b_xmin.to_string());
        values.insert(String::from("b_ymin"), extent.b_ymin.to_string());
        values.insert(String::from("b_xmax"), extent.b_xmax.to_string());
        values.insert(String::from("b_ymax"), extent.b_ymax.to_string());
        values.insert(String::from("b_size"), extent.b_size.to_string());

        format_named(TILE_SQL, &values)
    }

    async fn render_once(&self, zoom: u8, x: i32, y: i32) -> Result<TileContent, RenderError> {
        let query = self
            .build_query(zoom, x, y)
            .map_err(|error| RenderError::Query(format!("{}: {}", RENDERER_TAG, error)))?;
        trace!(zoom, x, y, query = %query, "composed tile query");

        let mut timer = Timer::new();
        timer.start(QUERY_PHASE);
        let result = self.executor.execute(&query, &self.limits).await;
        timer.end(QUERY_PHASE);

        match result {
            Ok(rows) => Ok(TileContent {
                body: TileBody::Rows(rows),
                headers: HashMap::from([(
                    String::from("Content-Type"),
                    String::from(MVT_CONTENT_TYPE),
                )]),
                stats: timer.into_times(),
            }),
            Err(error) => {
                debug!(query = %query, error = %error, "error running pg_mvt query");
                Err(classify(error))
            }
        }
    }
}

#[async_trait]
impl<E: QueryExecutor> TileRenderer for PgMvtRenderer<E> {
    /// Renders the Mapbox vector tile for a slippy map tile in XYZ format.
    ///
    /// Issues exactly one query. On failure the classified error is given
    /// to the registered error strategy, if any; its successful result
    /// supersedes the failure.
    async fn render_mvt(&self, zoom: u8, x: i32, y: i32) -> Result<TileContent, RenderError> {
        match self.render_once(zoom, x, y).await {
            Ok(tile) => Ok(tile),
            Err(error) => match &self.error_strategy {
                Some(strategy) => strategy.on_tile_error(error).await,
                None => Err(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ExecutorError;

    const FIXTURE_IMAGE: &str = "test_data/fallback.png";

    struct MockExecutor {
        outcome: Result<Vec<TileRow>, ExecutorError>,
        calls: AtomicUsize,
    }

    impl MockExecutor {
        fn ok(rows: Vec<TileRow>) -> Self {
            Self {
                outcome: Ok(rows),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(error: ExecutorError) -> Self {
            Self {
                outcome: Err(error),
                calls: AtomicUsize::new(0),
            }
        }

        fn timing_out() -> Self {
            Self::failing(ExecutorError::with_code(
                "canceling statement due to statement timeout",
                "57014",
            ))
        }
    }

    #[async_trait]
    impl QueryExecutor for MockExecutor {
        async fn execute(
            &self,
            _sql: &str,
            _limits: &RenderLimits,
        ) -> Result<Vec<TileRow>, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    struct PassThrough;

    #[async_trait]
    impl TileErrorStrategy for PassThrough {
        async fn on_tile_error(&self, error: RenderError) -> Result<TileContent, RenderError> {
            Err(error)
        }
    }

    /// Serves a pre-rendered image instead of the failed tile, the way a
    /// frontend would fall back on timeout.
    struct FallbackImage;

    #[async_trait]
    impl TileErrorStrategy for FallbackImage {
        async fn on_tile_error(&self, _error: RenderError) -> Result<TileContent, RenderError> {
            let mut payload = Vec::new();
            let mut file = File::open(FIXTURE_IMAGE)
                .map_err(|e| RenderError::Query(e.to_string()))?;
            file.read_to_end(&mut payload)
                .map_err(|e| RenderError::Query(e.to_string()))?;
            Ok(TileContent {
                body: TileBody::Payload(payload),
                headers: HashMap::from([(
                    String::from("Content-Type"),
                    String::from("image/png"),
                )]),
                stats: HashMap::new(),
            })
        }
    }

    fn test_layer() -> LayerSpec {
        LayerSpec {
            sql: String::from("SELECT * FROM test_table WHERE the_geom_webmercator && !bbox!"),
            geom_column: default_geom_column(),
            srid: default_srid(),
            id: default_layer_id(),
            fid_column: default_fid_column(),
        }
    }

    fn slow_query_layer() -> LayerSpec {
        LayerSpec {
            sql: String::from("select pg_sleep(1), * from test_table limit 2"),
            ..test_layer()
        }
    }

    fn tight_limits() -> RenderLimits {
        RenderLimits {
            render: 50,
            cache_on_timeout: false,
        }
    }

    #[test]
    fn test_parse_layer_yaml() {
        let mut file =
            File::open("test_data/layer.yml").expect("Unable to open the test yml file.");
        let mut data = String::new();
        file.read_to_string(&mut data)
            .expect("Unable to read the file");

        let layer = LayerSpec::from_yaml(data.as_str()).expect("Unable to parse the layer spec.");
        assert_eq!("water", layer.id);
        assert!(layer.sql.contains("!bbox!"));
        // defaults fill the omitted fields
        assert_eq!("the_geom_webmercator", layer.geom_column);
        assert_eq!(3857, layer.srid);
        assert_eq!("cartodb_id", layer.fid_column);
    }

    #[test]
    fn test_build_query_substitution() {
        let renderer = PgMvtRenderer::new(MockExecutor::ok(vec![]), test_layer());
        let sql = renderer.build_query(0, 0, 0).unwrap();

        assert!(sql.contains("ST_AsMVT(q, 'clayer', 4096, 'mvt_geom')"));
        assert!(sql.contains("\"the_geom_webmercator\" AS mvt_geom"));
        assert!(sql.contains("\"cartodb_id\""));
        // the layer token resolved to an envelope over the tile extent
        assert!(sql.contains("SELECT * FROM test_table WHERE the_geom_webmercator && ST_MakeEnvelope(-20037508.5,20037508.5,20037508.5,-20037508.5,3857)"));
        // the outer filter uses the same buffered bounds
        assert!(sql.contains(
            "ST_MakeEnvelope(-20037508.5, 20037508.5, 20037508.5, -20037508.5, 3857)"
        ));
        assert!(!sql.contains('!'));
        assert!(!sql.contains('{'));
    }

    #[test]
    fn test_build_query_buffered_envelope() {
        let config = RenderConfig {
            buffer_size: 64,
            ..RenderConfig::default()
        };
        let renderer =
            PgMvtRenderer::new(MockExecutor::ok(vec![]), test_layer()).with_config(config);
        let sql = renderer.build_query(0, 0, 0).unwrap();

        // half the buffer in pixels, times resolution(0)
        let expansion = (40075017.0 / 256.0) * 32.0;
        let b_xmin = -20037508.5 - expansion;
        assert!(sql.contains(&format!("ST_MakeEnvelope({}", b_xmin)));
    }

    #[tokio::test]
    async fn test_successful_render_carries_rows_headers_and_stats() {
        let rows = vec![TileRow {
            mvt: vec![0x1a, 0x05, 0x74, 0x69, 0x6c, 0x65, 0x00],
        }];
        let renderer = PgMvtRenderer::new(MockExecutor::ok(rows.clone()), test_layer());

        let tile = renderer.render_mvt(2, 1, 1).await.unwrap();
        assert_eq!(tile.body, TileBody::Rows(rows));
        assert_eq!(
            tile.headers.get("Content-Type").map(String::as_str),
            Some(MVT_CONTENT_TYPE)
        );
        assert!(tile.stats.contains_key("query"));
    }

    #[tokio::test]
    async fn test_slow_query_times_out_without_a_strategy() {
        let renderer = PgMvtRenderer::new(MockExecutor::timing_out(), slow_query_layer())
            .with_limits(tight_limits());

        let error = renderer.render_mvt(0, 0, 0).await.unwrap_err();
        assert_eq!(error, RenderError::Timeout);
        assert_eq!(error.to_string(), "Render timed out");
    }

    #[tokio::test]
    async fn test_query_errors_surface_with_the_renderer_tag() {
        let executor = MockExecutor::failing(ExecutorError::with_code(
            "syntax error at or near \"FROM\"",
            "42601",
        ));
        let renderer = PgMvtRenderer::new(executor, test_layer());

        let error = renderer.render_mvt(0, 0, 0).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "PgMvtRenderer: syntax error at or near \"FROM\""
        );
    }

    #[tokio::test]
    async fn test_pass_through_strategy_propagates_the_error() {
        let renderer = PgMvtRenderer::new(MockExecutor::timing_out(), slow_query_layer())
            .with_limits(tight_limits())
            .with_error_strategy(Arc::new(PassThrough));

        let error = renderer.render_mvt(0, 0, 0).await.unwrap_err();
        assert_eq!(error, RenderError::Timeout);
    }

    #[tokio::test]
    async fn test_fallback_strategy_supersedes_the_timeout() {
        let renderer = PgMvtRenderer::new(MockExecutor::timing_out(), slow_query_layer())
            .with_limits(tight_limits())
            .with_error_strategy(Arc::new(FallbackImage));

        let tile = renderer.render_mvt(0, 0, 0).await.unwrap();
        let expected = std::fs::read(FIXTURE_IMAGE).unwrap();
        assert_eq!(tile.body.into_bytes(), expected);
        assert_eq!(
            tile.headers.get("Content-Type").map(String::as_str),
            Some("image/png")
        );
        assert!(tile.stats.is_empty());
    }

    #[tokio::test]
    async fn test_executor_is_invoked_exactly_once_per_render() {
        let executor = MockExecutor::timing_out();
        let renderer = PgMvtRenderer::new(executor, slow_query_layer())
            .with_limits(tight_limits())
            .with_error_strategy(Arc::new(FallbackImage));

        renderer.render_mvt(5, 10, 20).await.unwrap();
        assert_eq!(renderer.executor.calls.load(Ordering::SeqCst), 1);
    }
}

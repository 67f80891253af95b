//! Requests for velocity rasters and colour legends.
//!
//! The crate does not ship an HTTP client. Hosts implement
//! [`RasterFetcher::get`] on top of their transport and get URL building,
//! request transformation, cancellation and decoding from the provided
//! methods.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bbox::BoundingBox;
use crate::colormap::{ColorMap, ColorScaleRange};
use crate::error::FetchError;
use crate::velocity::{LinearDecode, VelocityImage};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(FetchError::Aborted)` once aborted.
    pub fn check(&self) -> Result<(), FetchError> {
        if self.is_aborted() {
            Err(FetchError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Rewrites a request URL before it is sent, e.g. to add credentials or a proxy.
pub struct RequestTransform(Box<dyn Fn(String) -> String + Send + Sync>);

impl RequestTransform {
    pub fn new(f: impl Fn(String) -> String + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn apply(&self, url: String) -> String {
        (self.0)(url)
    }
}

impl fmt::Debug for RequestTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestTransform")
    }
}

/// A `GetMap` request for a two-component velocity raster.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityRequest {
    pub base_url: String,
    pub layer: String,
    /// ISO 8601 timestamp, omitted when `None`.
    pub time: Option<String>,
    pub bbox: BoundingBox,
    pub width: u32,
    pub height: u32,
    pub style: Option<String>,
    pub elevation: Option<f64>,
}

impl VelocityRequest {
    pub fn to_url(&self) -> String {
        let mut url = format!(
            "{}{}SERVICE=WMS&REQUEST=GetMap&VERSION=1.3&FORMAT=image/png&TRANSPARENT=true\
             &LAYERS={}&STYLES={}&CRS=EPSG:3857&BBOX={}&WIDTH={}&HEIGHT={}",
            self.base_url,
            query_separator(&self.base_url),
            encode_component(&self.layer),
            encode_component(self.style.as_deref().unwrap_or("")),
            self.bbox.to_query(),
            self.width,
            self.height,
        );
        if let Some(time) = &self.time {
            url.push_str("&TIME=");
            url.push_str(&encode_component(time));
        }
        if let Some(elevation) = self.elevation {
            url.push_str(&format!("&ELEVATION={elevation}"));
        }
        url
    }
}

/// A `GetLegendGraphic` request returning breakpoints as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct LegendRequest {
    pub base_url: String,
    pub layer: String,
    pub range: Option<ColorScaleRange>,
}

impl LegendRequest {
    pub fn to_url(&self) -> String {
        let mut url = format!(
            "{}{}SERVICE=WMS&REQUEST=GetLegendGraphic&VERSION=1.3&FORMAT=application/json&LAYERS={}",
            self.base_url,
            query_separator(&self.base_url),
            encode_component(&self.layer),
        );
        if let Some(range) = &self.range {
            url.push_str(&format!("&COLORSCALERANGE={},{}", range.start, range.end));
        }
        url
    }
}

/// Transport for raster and legend requests.
pub trait RasterFetcher {
    /// Fetch the body at `url`. Implementations should return
    /// [`FetchError::Aborted`] promptly once `signal` is aborted.
    fn get(&self, url: &str, signal: &AbortSignal) -> Result<Vec<u8>, FetchError>;

    /// Hook applied to every URL before [`get`](Self::get).
    fn transform(&self) -> Option<&RequestTransform> {
        None
    }

    fn fetch_velocity(
        &self,
        request: &VelocityRequest,
        decode: LinearDecode,
        signal: &AbortSignal,
    ) -> Result<VelocityImage, FetchError> {
        let body = self.fetch(request.to_url(), signal)?;
        let image = VelocityImage::from_png_bytes(&body, decode)?;
        log::debug!("Fetched velocity raster {}x{}", image.width(), image.height());
        Ok(image)
    }

    fn fetch_legend(&self, request: &LegendRequest, signal: &AbortSignal) -> Result<ColorMap, FetchError> {
        let body = self.fetch(request.to_url(), signal)?;
        let json = String::from_utf8_lossy(&body);
        Ok(ColorMap::from_legend_json(&json)?)
    }

    #[doc(hidden)]
    fn fetch(&self, url: String, signal: &AbortSignal) -> Result<Vec<u8>, FetchError> {
        signal.check()?;
        let url = match self.transform() {
            Some(transform) => transform.apply(url),
            None => url,
        };
        log::debug!("GET {url}");
        let body = self.get(&url, signal)?;
        // A response that lands after cancellation is dropped.
        signal.check()?;
        Ok(body)
    }
}

fn query_separator(base_url: &str) -> &'static str {
    if !base_url.contains('?') {
        "?"
    } else if base_url.ends_with('?') || base_url.ends_with('&') {
        ""
    } else {
        "&"
    }
}

/// Percent-encode everything outside the unreserved set.
fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StaticFetcher {
        body: Vec<u8>,
        requested: RefCell<Vec<String>>,
        transform: Option<RequestTransform>,
        abort_during_get: bool,
    }

    impl StaticFetcher {
        fn new(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                requested: RefCell::new(Vec::new()),
                transform: None,
                abort_during_get: false,
            }
        }
    }

    impl RasterFetcher for StaticFetcher {
        fn get(&self, url: &str, signal: &AbortSignal) -> Result<Vec<u8>, FetchError> {
            self.requested.borrow_mut().push(url.to_string());
            if self.abort_during_get {
                signal.abort();
            }
            Ok(self.body.clone())
        }

        fn transform(&self) -> Option<&RequestTransform> {
            self.transform.as_ref()
        }
    }

    fn velocity_request() -> VelocityRequest {
        VelocityRequest {
            base_url: "https://example.org/wms".to_string(),
            layer: "ocean:velocity".to_string(),
            time: Some("2024-01-01T00:00:00Z".to_string()),
            bbox: BoundingBox::new(0.0, 10.0, 100.0, 60.0),
            width: 256,
            height: 128,
            style: None,
            elevation: Some(-5.0),
        }
    }

    #[test]
    fn test_velocity_url() {
        let url = velocity_request().to_url();
        assert!(url.starts_with("https://example.org/wms?SERVICE=WMS&REQUEST=GetMap"));
        assert!(url.contains("&LAYERS=ocean%3Avelocity"));
        assert!(url.contains("&BBOX=0,10,100,60"));
        assert!(url.contains("&WIDTH=256&HEIGHT=128"));
        assert!(url.contains("&TIME=2024-01-01T00%3A00%3A00Z"));
        assert!(url.ends_with("&ELEVATION=-5"));
    }

    #[test]
    fn test_optional_parameters_are_omitted() {
        let mut request = velocity_request();
        request.time = None;
        request.elevation = None;
        let url = request.to_url();
        assert!(!url.contains("TIME="));
        assert!(!url.contains("ELEVATION="));
    }

    #[test]
    fn test_base_url_with_query() {
        let mut request = velocity_request();
        request.base_url = "https://example.org/wms?token=abc".to_string();
        assert!(request.to_url().starts_with("https://example.org/wms?token=abc&SERVICE=WMS"));
    }

    #[test]
    fn test_legend_url() {
        let request = LegendRequest {
            base_url: "https://example.org/wms".to_string(),
            layer: "speed".to_string(),
            range: Some(ColorScaleRange { start: 0.0, end: 2.5 }),
        };
        let url = request.to_url();
        assert!(url.contains("REQUEST=GetLegendGraphic"));
        assert!(url.contains("&LAYERS=speed"));
        assert!(url.ends_with("&COLORSCALERANGE=0,2.5"));
    }

    #[test]
    fn test_fetch_legend_applies_transform() {
        let json = br##"{"colourMap":[{"lowerValue":0.0,"color":"#000000"},{"lowerValue":1.0,"color":"#ffffff"}]}"##;
        let mut fetcher = StaticFetcher::new(json);
        fetcher.transform = Some(RequestTransform::new(|url| format!("{url}&key=secret")));
        let request = LegendRequest {
            base_url: "https://example.org/wms".to_string(),
            layer: "speed".to_string(),
            range: None,
        };

        let map = fetcher.fetch_legend(&request, &AbortSignal::new()).unwrap();
        assert_eq!(map.range().end, 1.0);
        assert!(fetcher.requested.borrow()[0].ends_with("&key=secret"));
    }

    #[test]
    fn test_aborted_before_request() {
        let fetcher = StaticFetcher::new(b"");
        let signal = AbortSignal::new();
        signal.clone().abort();
        let result = fetcher.fetch_velocity(&velocity_request(), LinearDecode::new(1.0, 0.0, 1.0, 0.0), &signal);
        assert!(result.unwrap_err().is_abort());
        assert!(fetcher.requested.borrow().is_empty());
    }

    #[test]
    fn test_response_after_abort_is_dropped() {
        let mut fetcher = StaticFetcher::new(b"not a png");
        fetcher.abort_during_get = true;
        let result = fetcher.fetch_velocity(
            &velocity_request(),
            LinearDecode::new(1.0, 0.0, 1.0, 0.0),
            &AbortSignal::new(),
        );
        assert!(result.unwrap_err().is_abort());
    }

    #[test]
    fn test_undecodable_body() {
        let fetcher = StaticFetcher::new(b"not a png");
        let result = fetcher.fetch_velocity(
            &velocity_request(),
            LinearDecode::new(1.0, 0.0, 1.0, 0.0),
            &AbortSignal::new(),
        );
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }
}

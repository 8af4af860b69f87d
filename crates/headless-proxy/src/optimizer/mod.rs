//! Post-render content optimizer.
//!
//! Runs on the document extracted from a session before it is cached or
//! returned. Every step is best-effort: a failing step leaves its input as is,
//! and a non-empty document is never optimized into an empty one.

pub mod minify;
mod prune;

use crate::metrics::Metrics;
use crate::session::{EngineError, RenderSession};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use prune::{prune, PruneOptions};

/// Rendered `(width, height)` of each image, keyed by its `src` attribute.
pub type ImageDimensions = HashMap<String, (u32, u32)>;

const IMAGE_DIMENSIONS_SCRIPT: &str = "Array.from(document.images).map(img => [img.getAttribute('src'), img.width, img.height])";

#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizeOptions {
    pub compress_images: bool,
    pub minify_content: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedDocument {
    pub html: String,
    pub original_size: usize,
    pub optimized_size: usize,
    /// Elements, attributes and blocks removed or rewritten.
    pub removed: usize,
}

impl OptimizedDocument {
    pub fn savings(&self) -> usize {
        self.original_size.saturating_sub(self.optimized_size)
    }
}

pub struct ContentOptimizer {
    options: OptimizeOptions,
    metrics: Arc<Metrics>,
}

impl ContentOptimizer {
    pub fn new(options: OptimizeOptions, metrics: Arc<Metrics>) -> Self {
        Self { options, metrics }
    }

    pub fn options(&self) -> OptimizeOptions {
        self.options
    }

    /// Extract the session's document and optimize it.
    ///
    /// Only extraction failures are errors; image dimension collection is
    /// skipped with a warning if the script fails.
    pub async fn optimize_session(
        &self,
        session: &dyn RenderSession,
    ) -> Result<OptimizedDocument, EngineError> {
        let dimensions = if self.options.compress_images {
            match session.evaluate_script(IMAGE_DIMENSIONS_SCRIPT).await {
                Ok(value) => parse_image_dimensions(&value),
                Err(e) => {
                    warn!(session_id = session.id(), "Failed to collect image dimensions: {}", e);
                    ImageDimensions::new()
                }
            }
        } else {
            ImageDimensions::new()
        };

        let html = session.document_html().await?;
        Ok(self.optimize(&html, &dimensions))
    }

    pub fn optimize(&self, html: &str, dimensions: &ImageDimensions) -> OptimizedDocument {
        let started = Instant::now();
        let original_size = html.len();

        let (mut output, mut removed) = match prune(
            html,
            &PruneOptions {
                compress_images: self.options.compress_images,
                image_dimensions: dimensions,
            },
        ) {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("HTML pruning failed, keeping document as is: {}", e);
                (html.to_string(), 0)
            }
        };

        if self.options.minify_content {
            let minified = minify::minify("text/html", &output);
            if minified.len() < output.len() {
                removed += 1;
            }
            if !minified.is_empty() {
                output = minified;
            }
        }

        if output.trim().is_empty() && !html.trim().is_empty() {
            warn!("Optimization produced an empty document, returning original");
            output = html.to_string();
            removed = 0;
        }

        let document = OptimizedDocument {
            optimized_size: output.len(),
            html: output,
            original_size,
            removed,
        };

        let savings = document.savings();
        if savings > 0 {
            self.metrics.record_optimization_savings(savings);
            info!(
                original_size,
                optimized_size = document.optimized_size,
                savings,
                savings_percent = savings as f64 / original_size as f64 * 100.0,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Page optimized"
            );
        }
        document
    }
}

/// Parse `[[src, width, height], ...]` as returned by the dimension script.
fn parse_image_dimensions(value: &Value) -> ImageDimensions {
    let Some(entries) = value.as_array() else {
        return ImageDimensions::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.as_array()?;
            let src = entry.first()?.as_str()?;
            let width = entry.get(1)?.as_u64()?;
            let height = entry.get(2)?.as_u64()?;
            Some((
                src.to_string(),
                (
                    u32::try_from(width).unwrap_or(u32::MAX),
                    u32::try_from(height).unwrap_or(u32::MAX),
                ),
            ))
        })
        .collect()
}

//! Page composition
//!
//! A [`PageRenderer`] turns a [`PageJob`] into PNG bytes. Each item goes
//! through the cache tiers (scaled → disk → raw → decode), is fitted into its
//! cell and composited centered. An item that cannot be produced gets a
//! placeholder; only canvas allocation and final encoding fail a page.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use card_export_cache::{
    CacheKey, CacheTier, DiskCacheStore, MemoryCacheTier, PixelBuffer, PixelFormat,
};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use serde::Serialize;

use crate::color::ColorCorrector;
use crate::error::{RenderError, RenderResult};
use crate::layout::{CellPosition, GridGeometry, PageConfig};
use crate::source::{load_source, SourceLimits};

const PLACEHOLDER_FILL: Rgba<u8> = Rgba([236, 236, 236, 255]);
const PLACEHOLDER_MARK: Rgba<u8> = Rgba([200, 40, 40, 255]);

/// One page of work: the grid it uses and the sources for its cells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageJob {
    /// 0-based page index
    pub page_index: u32,
    pub geometry: GridGeometry,
    /// Cells in row-major order
    pub items: Vec<(CellPosition, PathBuf)>,
}

/// An item that was replaced by a placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Substitution {
    pub page_index: u32,
    pub position: CellPosition,
    pub source: PathBuf,
    pub reason: String,
}

/// A fully composed and encoded page
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_index: u32,
    pub width: u32,
    pub height: u32,
    /// PNG bytes
    pub png: Vec<u8>,
    pub substitutions: Vec<Substitution>,
}

/// Result of [`PageRenderer::render_until`]
#[derive(Debug)]
pub enum PageOutcome {
    Rendered(RenderedPage),
    /// Stopped before the page was complete; nothing was encoded
    Interrupted { page_index: u32, items_done: usize },
}

/// Cache tiers consulted while rendering
#[derive(Clone)]
pub struct RenderCaches {
    /// Decoded sources at native resolution
    pub raw: MemoryCacheTier<CacheKey, Arc<PixelBuffer>>,
    /// Fitted and corrected images, keyed by cell size and corrector
    pub scaled: MemoryCacheTier<CacheKey, Arc<PixelBuffer>>,
    pub disk: Option<DiskCacheStore>,
}

impl RenderCaches {
    pub fn new(raw_capacity: usize, scaled_capacity: usize) -> Self {
        Self {
            raw: MemoryCacheTier::new(raw_capacity),
            scaled: MemoryCacheTier::new(scaled_capacity),
            disk: None,
        }
    }

    pub fn with_disk(mut self, disk: DiskCacheStore) -> Self {
        self.disk = Some(disk);
        self
    }
}

/// Composes pages from source images
pub struct PageRenderer {
    page: PageConfig,
    corrector: Arc<ColorCorrector>,
    caches: RenderCaches,
    limits: SourceLimits,
}

impl PageRenderer {
    pub fn new(
        page: PageConfig,
        corrector: Arc<ColorCorrector>,
        caches: RenderCaches,
        limits: SourceLimits,
    ) -> Self {
        Self {
            page,
            corrector,
            caches,
            limits,
        }
    }

    pub fn page_config(&self) -> &PageConfig {
        &self.page
    }

    pub fn caches(&self) -> &RenderCaches {
        &self.caches
    }

    /// Render every item of `job` and encode the page
    pub fn render(&self, job: &PageJob) -> RenderResult<RenderedPage> {
        let mut canvas = self.allocate_canvas()?;
        let substitutions = job
            .items
            .iter()
            .filter_map(|(position, source)| self.draw_item(&mut canvas, job, *position, source))
            .collect();
        self.encode(job, canvas, substitutions)
    }

    /// Like [`render`](Self::render), but consults `should_stop` before each
    /// item and abandons the page when it returns true.
    #[tracing::instrument(skip_all, fields(page = job.page_index, items = job.items.len()))]
    pub fn render_until<F>(&self, job: &PageJob, mut should_stop: F) -> RenderResult<PageOutcome>
    where
        F: FnMut() -> bool,
    {
        let mut canvas = self.allocate_canvas()?;
        let mut substitutions = Vec::new();

        for (done, (position, source)) in job.items.iter().enumerate() {
            if should_stop() {
                tracing::debug!(items_done = done, "page interrupted");
                return Ok(PageOutcome::Interrupted {
                    page_index: job.page_index,
                    items_done: done,
                });
            }
            if let Some(substitution) = self.draw_item(&mut canvas, job, *position, source) {
                substitutions.push(substitution);
            }
        }

        self.encode(job, canvas, substitutions)
            .map(PageOutcome::Rendered)
    }

    fn allocate_canvas(&self) -> RenderResult<RgbaImage> {
        let (width, height) = (self.page.width, self.page.height);
        let failed = || RenderError::CanvasAllocation { width, height };

        let len = PixelBuffer::expected_len(width, height, PixelFormat::Rgba8)
            .filter(|&len| len > 0)
            .ok_or_else(failed)?;

        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|_| failed())?;
        let background = self.page.background;
        for _ in 0..len / 4 {
            bytes.extend_from_slice(&background);
        }

        RgbaImage::from_raw(width, height, bytes).ok_or_else(failed)
    }

    fn encode(
        &self,
        job: &PageJob,
        canvas: RgbaImage,
        substitutions: Vec<Substitution>,
    ) -> RenderResult<RenderedPage> {
        let (width, height) = canvas.dimensions();
        let png = PixelBuffer::from_rgba_image(canvas)
            .encode_png(self.page.compression)
            .map_err(|e| RenderError::Encode(e.to_string()))?;

        tracing::debug!(
            page = job.page_index,
            bytes = png.len(),
            substitutions = substitutions.len(),
            "encoded page"
        );

        Ok(RenderedPage {
            page_index: job.page_index,
            width,
            height,
            png,
            substitutions,
        })
    }

    /// Composite one item; returns a substitution when the source could not
    /// be shown in its cell
    fn draw_item(
        &self,
        canvas: &mut RgbaImage,
        job: &PageJob,
        position: CellPosition,
        source: &Path,
    ) -> Option<Substitution> {
        let geometry = &job.geometry;
        if !geometry.contains(position) {
            return Some(substitution(job, position, source, "outside grid"));
        }
        let (cell_w, cell_h) = geometry.cell_size();
        if cell_w == 0 || cell_h == 0 {
            return Some(substitution(job, position, source, "cell has no area"));
        }
        let (cell_x, cell_y) = geometry.cell_origin(position);

        match self.cell_image(source, cell_w, cell_h) {
            Ok(image) => {
                let x = cell_x + cell_w.saturating_sub(image.width()) / 2;
                let y = cell_y + cell_h.saturating_sub(image.height()) / 2;
                composite_over(canvas, &image, x, y);
                None
            }
            Err(err) => {
                if !err.is_item_recoverable() {
                    tracing::error!(error = %err, "unexpected item failure");
                }
                draw_placeholder(canvas, cell_x, cell_y, cell_w, cell_h);
                Some(substitution(job, position, source, &err.to_string()))
            }
        }
    }

    /// Fitted, corrected image for `source` in a `cell_w` x `cell_h` cell.
    ///
    /// Memory keys carry the source mtime so an edited file is never served
    /// from a tier filled by an earlier run.
    fn cell_image(
        &self,
        source: &Path,
        cell_w: u32,
        cell_h: u32,
    ) -> RenderResult<Arc<PixelBuffer>> {
        let mtime = source_mtime_ms(source);
        let key = CacheKey::new(source.to_string_lossy().into_owned(), (cell_w, cell_h))
            .with_param(mtime)
            .with_param(self.corrector.fingerprint());

        if let Some(hit) = self.caches.scaled.get(&key) {
            tracing::trace!(source = %source.display(), "scaled tier hit");
            return Ok(hit);
        }

        if let Some(disk) = &self.caches.disk {
            if let Some(buffer) = disk.get(&key) {
                tracing::trace!(source = %source.display(), "disk tier hit");
                let buffer = Arc::new(buffer);
                self.caches.scaled.put(key, Arc::clone(&buffer));
                return Ok(buffer);
            }
        }

        let raw = self.raw_image(source, mtime)?;
        let prepared = Arc::new(self.fit_and_correct(source, &raw, cell_w, cell_h)?);

        self.caches.scaled.put(key.clone(), Arc::clone(&prepared));
        if let Some(disk) = &self.caches.disk {
            disk.put(&key, &prepared);
        }
        Ok(prepared)
    }

    fn raw_image(&self, source: &Path, mtime: u64) -> RenderResult<Arc<PixelBuffer>> {
        let key = CacheKey::for_source(source).with_param(mtime);
        if let Some(hit) = self.caches.raw.get(&key) {
            return Ok(hit);
        }

        let decoded = Arc::new(load_source(source, &self.limits)?);
        self.caches.raw.put(key, Arc::clone(&decoded));
        Ok(decoded)
    }

    /// Scale to fit the cell and color-correct, doing the correction at
    /// whichever resolution is smaller.
    fn fit_and_correct(
        &self,
        source: &Path,
        raw: &PixelBuffer,
        cell_w: u32,
        cell_h: u32,
    ) -> RenderResult<PixelBuffer> {
        let (src_w, src_h) = raw.dimensions();
        if raw.is_empty() {
            return Err(RenderError::invalid_image(source, "zero dimension"));
        }
        let (target_w, target_h) = fit_within(src_w, src_h, cell_w, cell_h);
        let correct = |buffer: &PixelBuffer| {
            self.corrector
                .correct(buffer)
                .map_err(|e| RenderError::invalid_image(source, e))
        };

        if (target_w, target_h) == (src_w, src_h) {
            correct(raw)
        } else if target_w < src_w {
            let scaled = resize(source, raw, target_w, target_h)?;
            correct(&scaled)
        } else {
            let corrected = correct(raw)?;
            resize(source, &corrected, target_w, target_h)
        }
    }
}

/// Largest size with the source aspect ratio that fits the cell
pub fn fit_within(src_w: u32, src_h: u32, cell_w: u32, cell_h: u32) -> (u32, u32) {
    let scale = f64::min(
        f64::from(cell_w) / f64::from(src_w),
        f64::from(cell_h) / f64::from(src_h),
    );
    let w = (f64::from(src_w) * scale).round() as u32;
    let h = (f64::from(src_h) * scale).round() as u32;
    (w.clamp(1, cell_w.max(1)), h.clamp(1, cell_h.max(1)))
}

/// Substitution record for an item that is not shown; logged as a warning
fn substitution(
    job: &PageJob,
    position: CellPosition,
    source: &Path,
    reason: &str,
) -> Substitution {
    tracing::warn!(
        page = job.page_index,
        %position,
        source = %source.display(),
        reason,
        "substituting placeholder"
    );
    Substitution {
        page_index: job.page_index,
        position,
        source: source.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Modification time in ms since the epoch; 0 when it cannot be read
fn source_mtime_ms(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

fn resize(
    source: &Path,
    buffer: &PixelBuffer,
    width: u32,
    height: u32,
) -> RenderResult<PixelBuffer> {
    let rgba = buffer
        .to_rgba_image()
        .map_err(|e| RenderError::invalid_image(source, e))?;
    let resized = imageops::resize(&rgba, width, height, FilterType::CatmullRom);
    Ok(PixelBuffer::from_rgba_image(resized))
}

/// Source-over blend of a buffer onto the canvas at (x0, y0)
fn composite_over(canvas: &mut RgbaImage, image: &PixelBuffer, x0: u32, y0: u32) {
    let width = image.width() as usize;
    let bpp = image.format().bytes_per_pixel();
    for (i, src) in image.bytes().chunks_exact(bpp).enumerate() {
        let x = x0 + (i % width) as u32;
        let y = y0 + (i / width) as u32;
        if x >= canvas.width() || y >= canvas.height() {
            continue;
        }
        let dst = canvas.get_pixel_mut(x, y);
        let alpha = if bpp == 4 { src[3] } else { 255 };
        *dst = Rgba(blend_over([src[0], src[1], src[2], alpha], dst.0));
    }
}

fn blend_over(src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    match src[3] {
        255 => src,
        0 => dst,
        sa => {
            let sa = u32::from(sa);
            let da = u32::from(dst[3]) * (255 - sa) / 255;
            let out_a = sa + da;
            let mut out = [0u8; 4];
            for c in 0..3 {
                let value = u32::from(src[c]) * sa + u32::from(dst[c]) * da;
                out[c] = ((value + out_a / 2) / out_a) as u8;
            }
            out[3] = out_a as u8;
            out
        }
    }
}

/// Fill, border and a diagonal cross marking a missing item
fn draw_placeholder(canvas: &mut RgbaImage, x0: u32, y0: u32, w: u32, h: u32) {
    let stroke = (w.min(h) / 40).max(1);
    let (wf, hf) = (f64::from(w), f64::from(h));
    let half_band = f64::from(stroke) * wf.hypot(hf) / 2.0;

    for dy in 0..h {
        for dx in 0..w {
            let (px, py) = (x0 + dx, y0 + dy);
            if px >= canvas.width() || py >= canvas.height() {
                continue;
            }
            let border = dx < stroke || dy < stroke || dx >= w - stroke || dy >= h - stroke;
            let (fx, fy) = (f64::from(dx), f64::from(dy));
            let diagonal = (fx * hf - fy * wf).abs() <= half_band
                || ((wf - 1.0 - fx) * hf - fy * wf).abs() <= half_band;

            let color = if border || diagonal {
                PLACEHOLDER_MARK
            } else {
                PLACEHOLDER_FILL
            };
            canvas.put_pixel(px, py, color);
        }
    }
}

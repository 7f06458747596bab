//! Page configuration and grid layout
//!
//! Maps an item count and an optional sequence length to a grid of cells on a
//! fixed-size page. Everything here is pure: the same inputs always give the
//! same geometry.

use card_export_cache::PngCompression;
use serde::{Deserialize, Serialize};

/// Standard paper sizes (portrait)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperSize {
    /// 8.5 x 11 in
    Letter,
    /// 210 x 297 mm
    A4,
}

impl PaperSize {
    /// Width and height in thousandths of an inch
    fn mils(self) -> (u64, u64) {
        match self {
            PaperSize::Letter => (8500, 11000),
            PaperSize::A4 => (8268, 11693),
        }
    }
}

/// Page margins in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Margins {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl Margins {
    pub const fn uniform(px: u32) -> Self {
        Self {
            top: px,
            right: px,
            bottom: px,
            left: px,
        }
    }
}

/// Fixed output page settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    /// Page width in pixels
    pub width: u32,
    /// Page height in pixels
    pub height: u32,
    pub margins: Margins,
    /// Gap between adjacent cells in pixels
    pub cell_spacing: u32,
    /// Canvas fill color (RGBA)
    pub background: [u8; 4],
    pub compression: PngCompression,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self::for_paper(PaperSize::Letter, 300)
    }
}

impl PageConfig {
    /// Portrait page of a standard paper size at `dpi`, with quarter-inch
    /// margins and a twelfth-inch cell gap.
    pub fn for_paper(paper: PaperSize, dpi: u32) -> Self {
        let (w_mils, h_mils) = paper.mils();
        let to_px = |mils: u64| ((mils * u64::from(dpi) + 500) / 1000) as u32;

        Self {
            width: to_px(w_mils),
            height: to_px(h_mils),
            margins: Margins::uniform(dpi / 4),
            cell_spacing: dpi / 12,
            background: [255, 255, 255, 255],
            compression: PngCompression::Default,
        }
    }

    /// Swap width and height
    pub fn landscape(mut self) -> Self {
        std::mem::swap(&mut self.width, &mut self.height);
        self
    }

    /// Width and height of the area inside the margins
    pub fn content_size(&self) -> (u32, u32) {
        let m = &self.margins;
        (
            self.width.saturating_sub(m.left.saturating_add(m.right)),
            self.height.saturating_sub(m.top.saturating_add(m.bottom)),
        )
    }
}

/// Grid cell coordinates (0-based, row-major)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPosition {
    pub row: u32,
    pub col: u32,
}

impl CellPosition {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Position of the `index`-th cell in row-major order
    pub fn from_index(index: u32, cols: u32) -> Self {
        let cols = cols.max(1);
        Self::new(index / cols, index % cols)
    }

    /// Row-major index of this cell
    pub fn index(&self, cols: u32) -> u32 {
        self.row * cols + self.col
    }
}

impl std::fmt::Display for CellPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}c{}", self.row, self.col)
    }
}

/// Rows, columns and cell pixel geometry of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub rows: u32,
    pub cols: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    /// Top-left corner of the content area
    pub origin: (u32, u32),
    pub spacing: u32,
}

impl GridGeometry {
    /// Cells per page
    pub fn capacity(&self) -> u32 {
        self.rows * self.cols
    }

    pub fn cell_size(&self) -> (u32, u32) {
        (self.cell_width, self.cell_height)
    }

    pub fn contains(&self, position: CellPosition) -> bool {
        position.row < self.rows && position.col < self.cols
    }

    /// Top-left pixel of a cell on the page
    pub fn cell_origin(&self, position: CellPosition) -> (u32, u32) {
        let step_x = self.cell_width + self.spacing;
        let step_y = self.cell_height + self.spacing;
        (
            self.origin.0 + position.col * step_x,
            self.origin.1 + position.row * step_y,
        )
    }

    /// All cell positions in row-major order
    pub fn cells(&self) -> impl Iterator<Item = CellPosition> + '_ {
        (0..self.capacity()).map(move |index| CellPosition::from_index(index, self.cols))
    }
}

/// Known-good (rows, cols) per sequence length
const GRID_TABLE: [(u32, (u32, u32)); 7] = [
    (2, (2, 3)),
    (3, (2, 3)),
    (4, (3, 4)),
    (6, (2, 3)),
    (8, (3, 3)),
    (12, (3, 4)),
    (16, (4, 4)),
];

/// Computes [`GridGeometry`] for a fixed page
#[derive(Debug, Clone)]
pub struct GridLayoutCalculator {
    page: PageConfig,
}

impl GridLayoutCalculator {
    pub fn new(page: PageConfig) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &PageConfig {
        &self.page
    }

    /// (rows, cols) for a sequence.
    ///
    /// Table lengths use their known-good grid; anything else falls back by
    /// size: fewer than 8 → 2×3, 8 to 12 → 3×3, more than 12 → 4×4.
    pub fn dimensions_for(item_count: u32, sequence_length: Option<u32>) -> (u32, u32) {
        let length = sequence_length.unwrap_or(item_count);
        if let Some((_, dims)) = GRID_TABLE.iter().find(|(len, _)| *len == length) {
            return *dims;
        }
        match length {
            0..=7 => (2, 3),
            8..=12 => (3, 3),
            _ => (4, 4),
        }
    }

    pub fn calculate(&self, item_count: u32, sequence_length: Option<u32>) -> GridGeometry {
        let (rows, cols) = Self::dimensions_for(item_count, sequence_length);
        let (content_width, content_height) = self.page.content_size();
        let spacing = self.page.cell_spacing;

        let available_w = content_width.saturating_sub(spacing.saturating_mul(cols - 1));
        let available_h = content_height.saturating_sub(spacing.saturating_mul(rows - 1));

        GridGeometry {
            rows,
            cols,
            cell_width: available_w / cols,
            cell_height: available_h / rows,
            origin: (self.page.margins.left, self.page.margins.top),
            spacing,
        }
    }

    /// Number of pages needed for `item_count` items
    pub fn page_count(&self, item_count: u32, sequence_length: Option<u32>) -> u32 {
        let (rows, cols) = Self::dimensions_for(item_count, sequence_length);
        item_count.div_ceil(rows * cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(width: u32, height: u32, margin: u32, spacing: u32) -> PageConfig {
        PageConfig {
            width,
            height,
            margins: Margins::uniform(margin),
            cell_spacing: spacing,
            ..PageConfig::default()
        }
    }

    #[test]
    fn test_table_lengths() {
        let dims = GridLayoutCalculator::dimensions_for;
        assert_eq!(dims(0, Some(4)), (3, 4));
        assert_eq!(dims(0, Some(8)), (3, 3));
        assert_eq!(dims(0, Some(16)), (4, 4));
        assert_eq!(dims(0, Some(2)), (2, 3));
        assert_eq!(dims(0, Some(3)), (2, 3));
        assert_eq!(dims(0, Some(6)), (2, 3));
        assert_eq!(dims(0, Some(12)), (3, 4));
    }

    #[test]
    fn test_fallback_by_size() {
        let dims = GridLayoutCalculator::dimensions_for;
        assert_eq!(dims(50, Some(20)), (4, 4));
        assert_eq!(dims(5, Some(5)), (2, 3));
        assert_eq!(dims(9, Some(10)), (3, 3));
        assert_eq!(dims(13, Some(13)), (4, 4));
    }

    #[test]
    fn test_item_count_used_without_sequence_length() {
        let dims = GridLayoutCalculator::dimensions_for;
        assert_eq!(dims(4, None), (3, 4));
        assert_eq!(dims(11, None), (3, 3));
        assert_eq!(dims(0, None), (2, 3));
    }

    #[test]
    fn test_cell_geometry() {
        let calc = GridLayoutCalculator::new(page(1000, 800, 50, 10));
        let grid = calc.calculate(9, Some(8));

        // content 900x700; minus 2 gaps of 10 → 880x680; /3
        assert_eq!((grid.rows, grid.cols), (3, 3));
        assert_eq!(grid.cell_size(), (293, 226));
        assert_eq!(grid.cell_origin(CellPosition::new(0, 0)), (50, 50));
        assert_eq!(grid.cell_origin(CellPosition::new(1, 2)), (50 + 2 * 303, 50 + 236));

        let (right, bottom) = grid.cell_origin(CellPosition::new(2, 2));
        assert!(right + grid.cell_width <= 950);
        assert!(bottom + grid.cell_height <= 750);
    }

    #[test]
    fn test_tiny_page_saturates() {
        let calc = GridLayoutCalculator::new(page(40, 40, 30, 10));
        let grid = calc.calculate(16, Some(16));
        assert_eq!(grid.cell_size(), (0, 0));
    }

    #[test]
    fn test_cells_are_row_major() {
        let grid = GridLayoutCalculator::new(PageConfig::default()).calculate(6, Some(6));
        let cells: Vec<CellPosition> = grid.cells().collect();

        assert_eq!(cells.len(), 6);
        assert_eq!(cells[0], CellPosition::new(0, 0));
        assert_eq!(cells[2], CellPosition::new(0, 2));
        assert_eq!(cells[3], CellPosition::new(1, 0));
        assert!(cells.iter().enumerate().all(|(i, c)| c.index(grid.cols) == i as u32));
    }

    #[test]
    fn test_page_count() {
        let calc = GridLayoutCalculator::new(PageConfig::default());
        assert_eq!(calc.page_count(9, Some(8)), 1);
        assert_eq!(calc.page_count(10, Some(8)), 2);
        assert_eq!(calc.page_count(0, Some(8)), 0);
    }

    #[test]
    fn test_paper_sizes() {
        let letter = PageConfig::for_paper(PaperSize::Letter, 300);
        assert_eq!((letter.width, letter.height), (2550, 3300));
        assert_eq!(letter.margins, Margins::uniform(75));
        assert_eq!(letter.cell_spacing, 25);

        let a4 = PageConfig::for_paper(PaperSize::A4, 150).landscape();
        assert_eq!((a4.width, a4.height), (1754, 1240));
    }
}

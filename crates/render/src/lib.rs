//! Card Export Render Library
//!
//! Color correction, grid layout and page composition for sequence card
//! exports.

pub mod color;
pub mod error;
pub mod layout;
pub mod page;
pub mod source;

pub use color::{ColorConfig, ColorCorrector, ColorRule, HueGuard, Rgb, ToleranceIndex};
pub use error::{ColorError, RenderError, RenderResult};
pub use layout::{CellPosition, GridGeometry, GridLayoutCalculator, Margins, PageConfig, PaperSize};
pub use page::{PageJob, PageOutcome, PageRenderer, RenderCaches, RenderedPage, Substitution};
pub use source::{is_supported_extension, load_source, SourceLimits, SUPPORTED_EXTENSIONS};

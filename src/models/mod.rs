mod bill;
mod catalog;
mod estimate;
mod preview;

pub use bill::{BillSheetDescriptor, SheetFailure};
pub use catalog::CatalogRef;
pub use estimate::{ColumnKey, EstimateItem, HeaderMatch, ItemBlock};
pub use preview::{
    base_key, normalize_row_key, supplemental_key, ExecutionMap, PremiumKind, PreviewRow,
    RowType, TenderPremium, Totals, UnmeasuredPolicy, SUPPLEMENTAL_HEADING_KEY,
    SUPPLEMENTAL_HEADING_TEXT,
};
pub(crate) use preview::trim_float;

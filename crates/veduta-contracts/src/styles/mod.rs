mod catalog;
mod selection;

pub use catalog::{display_label, LoadTicket, LoadTracker, StyleCatalog, StyleRecord};
pub use selection::{GalleryCommand, RebindOutcome, SelectedStyle, SelectionSync, UPLOAD_SLOT};

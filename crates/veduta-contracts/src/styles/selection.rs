use super::catalog::{StyleCatalog, StyleRecord};

/// Gallery position reserved for the "upload your own style" card. Styles
/// occupy positions `1..=catalog.len()`, so style index `i` sits at `i + 1`.
pub const UPLOAD_SLOT: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedStyle {
    pub name: String,
    pub index: usize,
}

/// Instruction for the gallery surface. Selection changes made outside the
/// gallery produce at most one of these; gallery movement never does, which
/// is what keeps the two surfaces from ping-ponging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalleryCommand {
    ScrollTo(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebindOutcome {
    /// The previously selected style survived the reload, possibly at a
    /// different position.
    Kept {
        selected: SelectedStyle,
        command: Option<GalleryCommand>,
    },
    /// Selection fell back to the catalog default (first style, or nothing
    /// when the catalog is empty).
    Reset {
        selected: Option<SelectedStyle>,
        command: Option<GalleryCommand>,
    },
}

/// Keeps the gallery rail and the active style selection agreed on one
/// state without either surface echoing updates back at the other.
#[derive(Debug, Default)]
pub struct SelectionSync {
    position: usize,
    selected: Option<SelectedStyle>,
}

impl SelectionSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn selected(&self) -> Option<&SelectedStyle> {
        self.selected.as_ref()
    }

    pub fn selected_name(&self) -> Option<&str> {
        self.selected.as_ref().map(|style| style.name.as_str())
    }

    /// The operator moved the rail. Updates the selection to match and
    /// returns it; never issues a command back at the gallery.
    pub fn gallery_moved(
        &mut self,
        position: usize,
        catalog: &StyleCatalog,
    ) -> Option<&SelectedStyle> {
        let clamped = position.min(catalog.len());
        self.position = clamped;
        self.selected = if clamped == UPLOAD_SLOT {
            None
        } else {
            catalog.by_index(clamped - 1).map(|record| SelectedStyle {
                name: record.name.clone(),
                index: record.index,
            })
        };
        self.selected.as_ref()
    }

    /// The operator picked a style outside the gallery. Scrolls the rail to
    /// the style only when it is not already there.
    pub fn select_style(&mut self, record: &StyleRecord) -> Option<GalleryCommand> {
        let target = record.index + 1;
        self.selected = Some(SelectedStyle {
            name: record.name.clone(),
            index: record.index,
        });
        if self.position == target {
            return None;
        }
        self.position = target;
        Some(GalleryCommand::ScrollTo(target))
    }

    /// Re-evaluates the selection against a freshly installed catalog. A
    /// surviving name keeps its selection under its new index; anything else
    /// falls back to the first style.
    pub fn rebind(&mut self, catalog: &StyleCatalog) -> RebindOutcome {
        if let Some(previous) = self.selected.as_ref() {
            if let Some(record) = catalog.by_name(&previous.name) {
                let selected = SelectedStyle {
                    name: record.name.clone(),
                    index: record.index,
                };
                self.selected = Some(selected.clone());
                let command = self.move_to(record.index + 1);
                return RebindOutcome::Kept { selected, command };
            }
        }

        match catalog.by_index(0) {
            Some(record) => {
                let selected = SelectedStyle {
                    name: record.name.clone(),
                    index: record.index,
                };
                self.selected = Some(selected.clone());
                let command = self.move_to(1);
                RebindOutcome::Reset {
                    selected: Some(selected),
                    command,
                }
            }
            None => {
                self.selected = None;
                let command = self.move_to(UPLOAD_SLOT);
                RebindOutcome::Reset {
                    selected: None,
                    command,
                }
            }
        }
    }

    fn move_to(&mut self, target: usize) -> Option<GalleryCommand> {
        if self.position == target {
            return None;
        }
        self.position = target;
        Some(GalleryCommand::ScrollTo(target))
    }
}

#[cfg(test)]
mod tests {
    use crate::handles::{HandleOrigin, HandleRegistry};
    use crate::styles::StyleCatalog;

    use super::{GalleryCommand, RebindOutcome, SelectionSync, UPLOAD_SLOT};

    fn catalog_of(names: &[&str]) -> StyleCatalog {
        let mut registry = HandleRegistry::new();
        StyleCatalog::new(
            names
                .iter()
                .map(|name| {
                    (
                        (*name).to_string(),
                        registry.create(vec![0], HandleOrigin::StyleThumbnail),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn starts_on_upload_slot_with_no_selection() {
        let sync = SelectionSync::new();
        assert_eq!(sync.position(), UPLOAD_SLOT);
        assert_eq!(sync.selected(), None);
    }

    #[test]
    fn gallery_move_selects_the_style_behind_the_position() {
        let catalog = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();

        let selected = sync.gallery_moved(2, &catalog).cloned();
        assert_eq!(selected.as_ref().map(|s| s.name.as_str()), Some("bauhaus.png"));
        assert_eq!(selected.map(|s| s.index), Some(1));
        assert_eq!(sync.position(), 2);
    }

    #[test]
    fn gallery_move_to_upload_slot_clears_selection() {
        let catalog = catalog_of(&["gothic.png"]);
        let mut sync = SelectionSync::new();

        sync.gallery_moved(1, &catalog);
        assert!(sync.selected().is_some());

        assert_eq!(sync.gallery_moved(UPLOAD_SLOT, &catalog), None);
        assert_eq!(sync.selected(), None);
    }

    #[test]
    fn gallery_move_past_the_rail_clamps_to_last_style() {
        let catalog = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();

        let selected = sync.gallery_moved(9, &catalog).cloned();
        assert_eq!(sync.position(), 2);
        assert_eq!(selected.map(|s| s.name), Some("bauhaus.png".to_string()));
    }

    #[test]
    fn select_style_scrolls_only_when_out_of_sync() {
        let catalog = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();
        let record = catalog.by_name("bauhaus.png").unwrap();

        assert_eq!(
            sync.select_style(record),
            Some(GalleryCommand::ScrollTo(2))
        );
        // Same pick again: the rail is already there, nothing to echo.
        assert_eq!(sync.select_style(record), None);
        assert_eq!(sync.position(), 2);
    }

    #[test]
    fn select_after_gallery_move_to_same_style_is_silent() {
        let catalog = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();

        sync.gallery_moved(1, &catalog);
        let record = catalog.by_name("gothic.png").unwrap();
        assert_eq!(sync.select_style(record), None);
    }

    #[test]
    fn rebind_keeps_surviving_selection_under_new_index() {
        let before = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();
        sync.select_style(before.by_name("bauhaus.png").unwrap());

        let after = catalog_of(&["bauhaus.png", "brutal.png"]);
        match sync.rebind(&after) {
            RebindOutcome::Kept { selected, command } => {
                assert_eq!(selected.name, "bauhaus.png");
                assert_eq!(selected.index, 0);
                assert_eq!(command, Some(GalleryCommand::ScrollTo(1)));
            }
            other => panic!("expected Kept, got {other:?}"),
        }
    }

    #[test]
    fn rebind_resets_to_first_style_when_name_is_gone() {
        let before = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();
        sync.select_style(before.by_name("bauhaus.png").unwrap());

        let after = catalog_of(&["brutal.png"]);
        match sync.rebind(&after) {
            RebindOutcome::Reset { selected, command } => {
                assert_eq!(selected.map(|s| s.name), Some("brutal.png".to_string()));
                assert_eq!(command, Some(GalleryCommand::ScrollTo(1)));
            }
            other => panic!("expected Reset, got {other:?}"),
        }
    }

    #[test]
    fn rebind_against_empty_catalog_returns_to_upload_slot() {
        let before = catalog_of(&["gothic.png"]);
        let mut sync = SelectionSync::new();
        sync.select_style(before.by_name("gothic.png").unwrap());

        let after = catalog_of(&[]);
        match sync.rebind(&after) {
            RebindOutcome::Reset { selected, command } => {
                assert_eq!(selected, None);
                assert_eq!(command, Some(GalleryCommand::ScrollTo(UPLOAD_SLOT)));
                assert_eq!(sync.position(), UPLOAD_SLOT);
            }
            other => panic!("expected Reset, got {other:?}"),
        }
    }

    #[test]
    fn rebind_with_unchanged_position_issues_no_command() {
        let catalog = catalog_of(&["gothic.png", "bauhaus.png"]);
        let mut sync = SelectionSync::new();
        sync.select_style(catalog.by_name("gothic.png").unwrap());

        let reloaded = catalog_of(&["gothic.png", "brutal.png"]);
        match sync.rebind(&reloaded) {
            RebindOutcome::Kept { selected, command } => {
                assert_eq!(selected.index, 0);
                assert_eq!(command, None);
            }
            other => panic!("expected Kept, got {other:?}"),
        }
    }
}

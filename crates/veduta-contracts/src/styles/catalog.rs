use indexmap::IndexMap;

use crate::handles::ResourceHandle;

/// One installed style: the server-side `name` is the generation API key,
/// `label` is what operators see, `image` is the thumbnail handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleRecord {
    pub name: String,
    pub label: String,
    pub index: usize,
    pub image: ResourceHandle,
}

/// Styles in server order, keyed by name.
///
/// A repeated name replaces the earlier record and positions are renumbered,
/// so `index` always matches iteration order. Callers that mint thumbnail
/// handles should deduplicate names before creating them.
#[derive(Debug, Default)]
pub struct StyleCatalog {
    records: IndexMap<String, StyleRecord>,
}

impl StyleCatalog {
    pub fn new(entries: Vec<(String, ResourceHandle)>) -> Self {
        let mut records: IndexMap<String, StyleRecord> = IndexMap::new();
        for (name, image) in entries {
            let label = display_label(&name);
            records.insert(
                name.clone(),
                StyleRecord {
                    name,
                    label,
                    index: 0,
                    image,
                },
            );
        }
        for (position, (_, record)) in records.iter_mut().enumerate() {
            record.index = position;
        }
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&StyleRecord> {
        self.records.get(name)
    }

    pub fn by_index(&self, index: usize) -> Option<&StyleRecord> {
        self.records.get_index(index).map(|(_, record)| record)
    }

    pub fn by_label(&self, label: &str) -> Option<&StyleRecord> {
        self.records
            .values()
            .find(|record| record.label.eq_ignore_ascii_case(label))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StyleRecord> {
        self.records.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Thumbnail handles in catalog order. The reload path revokes these
    /// before the replacement catalog is installed.
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.records.values().map(|record| record.image).collect()
    }
}

/// Human label for a style name: the file extension is dropped, nothing else.
pub fn display_label(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Ticket for one catalog load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(u64);

impl LoadTicket {
    pub fn epoch(&self) -> u64 {
        self.0
    }
}

/// Issues load tickets and remembers the newest one. Overlapping loads race
/// last-write-wins: only the outcome carrying the current ticket may be
/// installed, every earlier ticket is superseded the moment a newer one is
/// issued.
#[derive(Debug, Default)]
pub struct LoadTracker {
    issued: u64,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> LoadTicket {
        self.issued += 1;
        LoadTicket(self.issued)
    }

    pub fn is_current(&self, ticket: LoadTicket) -> bool {
        ticket.0 == self.issued
    }
}
